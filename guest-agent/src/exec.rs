//! Exec, ExecStream, and ExecPipe handlers for the control port.
//!
//! All three spawn the workload through the sandbox wrapper with a shell in
//! front, own its process group for the lifetime of the request, and treat
//! the host closing the stream as cancellation: SIGTERM to the group, a
//! grace period, then SIGKILL. A per-request [`ChildGate`] stops any signal
//! from reaching a recycled PID once `waitpid` has returned.

use std::io::Read;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;

use matchlock_protocol::{
    encode_exit, wipe, ExecRequest, ExecResult, Frame, FrameType, STREAM_CHUNK_SIZE,
};

use crate::kmsg;
use crate::sandbox::{self, ChildGate, ChildStdio, SpawnSpec, SpawnedChild};
use crate::wire::{shutdown_read, FdStream, FrameWriter};

/// Shell used to run request command lines.
const SHELL: &str = "/bin/sh";

/// Delay after the final Exit frame before the connection closes, giving
/// vsock muxers that ignore half-close a chance to flush.
const EXIT_DRAIN: std::time::Duration = std::time::Duration::from_millis(50);

/// One end of a pipe created for child stdio.
struct Pipe {
    read: RawFd,
    write: RawFd,
}

fn make_pipe() -> Result<Pipe, String> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(format!("pipe2: {}", std::io::Error::last_os_error()));
    }
    Ok(Pipe {
        read: fds[0],
        write: fds[1],
    })
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub(crate) fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> Result<(), String> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(format!("write: {}", err));
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// The shell command line for a request: `args` are appended to `command`.
fn shell_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        let mut full = String::from(command);
        for arg in args {
            full.push(' ');
            full.push_str(arg);
        }
        full
    }
}

/// Reap the child, retrying on EINTR, and translate the wait status into an
/// exit code (`128 + signo` for signal deaths, the shell convention).
pub(crate) fn wait_for_exit(pid: libc::pid_t, gate: &ChildGate) -> i32 {
    let mut status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            gate.mark_done();
            return -1;
        }
        break;
    }
    gate.mark_done();

    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        -1
    }
}

fn spawn_shell(req: &ExecRequest, stdio: ChildStdio) -> Result<SpawnedChild, String> {
    let argv = vec![
        SHELL.to_string(),
        "-c".to_string(),
        shell_command(&req.command, &req.args),
    ];
    let spec = SpawnSpec {
        argv: &argv,
        user: req.user.as_deref(),
        working_dir: req.working_dir.as_deref(),
        env: &req.env,
    };
    sandbox::spawn(&spec, stdio)
}

/// Watch the control stream for host-side cancellation while a batch or
/// stream request runs. Any zero-byte read or error means the host went
/// away; the workload group gets the SIGTERM→SIGKILL treatment.
fn spawn_cancel_watcher(fd: RawFd, gate: Arc<ChildGate>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("cancel-watch".into())
        .spawn(move || {
            let mut stream = FdStream::new(fd);
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => {
                        if !gate.is_done() {
                            gate.terminate_group();
                        }
                        return;
                    }
                    // The host sends nothing after the request on these
                    // modes; drain and keep watching.
                    Ok(_) => continue,
                }
            }
        })
        .expect("spawn cancel watcher")
}

fn decode_request(frame: &mut Frame) -> Result<ExecRequest, String> {
    let req: ExecRequest = frame
        .parse_json()
        .map_err(|e| format!("decode request: {}", e))?;
    wipe(&mut frame.payload);
    Ok(req)
}

pub(crate) fn send_result_frame(writer: &FrameWriter, result: &ExecResult) {
    match Frame::json(FrameType::ExecResult, result) {
        Ok(frame) => {
            if let Err(e) = writer.send(&frame) {
                kmsg(&format!("send ExecResult: {}", e));
            }
        }
        Err(e) => kmsg(&format!("encode ExecResult: {}", e)),
    }
}

/// Batched execution: run to completion, reply with one ExecResult carrying
/// the full stdout/stderr.
pub fn handle_exec(fd: RawFd, mut first: Frame) {
    let writer = FrameWriter::new(fd);

    let mut req = match decode_request(&mut first) {
        Ok(req) => req,
        Err(e) => {
            send_result_frame(&writer, &ExecResult::failure(e));
            return;
        }
    };

    let stdout_pipe = match make_pipe() {
        Ok(p) => p,
        Err(e) => {
            send_result_frame(&writer, &ExecResult::failure(e));
            return;
        }
    };
    let stderr_pipe = match make_pipe() {
        Ok(p) => p,
        Err(e) => {
            close_fd(stdout_pipe.read);
            close_fd(stdout_pipe.write);
            send_result_frame(&writer, &ExecResult::failure(e));
            return;
        }
    };
    let stdin_pipe = if req.stdin.is_some() {
        match make_pipe() {
            Ok(p) => Some(p),
            Err(e) => {
                for fd in [
                    stdout_pipe.read,
                    stdout_pipe.write,
                    stderr_pipe.read,
                    stderr_pipe.write,
                ] {
                    close_fd(fd);
                }
                send_result_frame(&writer, &ExecResult::failure(e));
                return;
            }
        }
    } else {
        None
    };

    let child = match spawn_shell(
        &req,
        ChildStdio::Pipes {
            stdin: stdin_pipe.as_ref().map(|p| p.read),
            stdout: Some(stdout_pipe.write),
            stderr: Some(stderr_pipe.write),
        },
    ) {
        Ok(child) => child,
        Err(e) => {
            close_fd(stdout_pipe.read);
            close_fd(stderr_pipe.read);
            if let Some(p) = &stdin_pipe {
                close_fd(p.write);
            }
            req.wipe();
            send_result_frame(&writer, &ExecResult::failure(format!("launch: {}", e)));
            return;
        }
    };

    let gate = ChildGate::new(child.pgid());
    let watcher = spawn_cancel_watcher(fd, gate.clone());

    // Feed and close stdin before collecting output; the buffer is wiped as
    // soon as it has been handed to the child.
    if let Some(pipe) = &stdin_pipe {
        if let Some(stdin) = req.stdin.take() {
            let mut bytes = stdin.into_bytes();
            if let Err(e) = write_all_fd(pipe.write, &bytes) {
                kmsg(&format!("stdin write: {}", e));
            }
            wipe(&mut bytes);
        }
        close_fd(pipe.write);
    }
    req.wipe();

    let stdout_reader = spawn_collector(stdout_pipe.read);
    let stderr_reader = spawn_collector(stderr_pipe.read);

    let exit_code = wait_for_exit(child.pid, &gate);

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    send_result_frame(
        &writer,
        &ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            error: String::new(),
        },
    );

    shutdown_read(fd);
    let _ = watcher.join();
}

fn spawn_collector(fd: RawFd) -> thread::JoinHandle<Vec<u8>> {
    thread::Builder::new()
        .name("collect".into())
        .spawn(move || {
            let mut out = Vec::new();
            let mut stream = FdStream::new(fd);
            let mut buf = [0u8; STREAM_CHUNK_SIZE];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                }
            }
            close_fd(fd);
            out
        })
        .expect("spawn collector")
}

/// Forward one stdio pipe as framed chunks until EOF.
fn spawn_streamer(
    fd: RawFd,
    frame_type: FrameType,
    writer: Arc<FrameWriter>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("stream".into())
        .spawn(move || {
            let mut stream = FdStream::new(fd);
            let mut buf = [0u8; STREAM_CHUNK_SIZE];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = Frame::new(frame_type, buf[..n].to_vec());
                        if writer.send(&frame).is_err() {
                            break;
                        }
                    }
                }
            }
            close_fd(fd);
        })
        .expect("spawn streamer")
}

/// Streaming execution: stdout/stderr go out as chunked frames while the
/// workload runs; the final ExecResult carries only the exit code.
pub fn handle_exec_stream(fd: RawFd, mut first: Frame) {
    let writer = Arc::new(FrameWriter::new(fd));

    let mut req = match decode_request(&mut first) {
        Ok(req) => req,
        Err(e) => {
            send_result_frame(&writer, &ExecResult::failure(e));
            return;
        }
    };

    let (stdout_pipe, stderr_pipe) = match (make_pipe(), make_pipe()) {
        (Ok(a), Ok(b)) => (a, b),
        (a, b) => {
            for pipe in [a.ok(), b.ok()].into_iter().flatten() {
                close_fd(pipe.read);
                close_fd(pipe.write);
            }
            send_result_frame(&writer, &ExecResult::failure("pipe allocation failed"));
            return;
        }
    };

    let child = match spawn_shell(
        &req,
        ChildStdio::Pipes {
            stdin: None,
            stdout: Some(stdout_pipe.write),
            stderr: Some(stderr_pipe.write),
        },
    ) {
        Ok(child) => child,
        Err(e) => {
            close_fd(stdout_pipe.read);
            close_fd(stderr_pipe.read);
            req.wipe();
            send_result_frame(&writer, &ExecResult::failure(format!("launch: {}", e)));
            return;
        }
    };
    req.wipe();

    let gate = ChildGate::new(child.pgid());
    let watcher = spawn_cancel_watcher(fd, gate.clone());

    let out_streamer = spawn_streamer(stdout_pipe.read, FrameType::Stdout, writer.clone());
    let err_streamer = spawn_streamer(stderr_pipe.read, FrameType::Stderr, writer.clone());

    let exit_code = wait_for_exit(child.pid, &gate);

    let _ = out_streamer.join();
    let _ = err_streamer.join();

    send_result_frame(
        &writer,
        &ExecResult {
            exit_code,
            ..ExecResult::default()
        },
    );

    shutdown_read(fd);
    let _ = watcher.join();
}

/// Piped execution: like ExecStream plus host-driven stdin and signals.
///
/// The stdin-reader thread owns the read side of the connection, so it is
/// also the one that notices host-side cancellation and runs the
/// SIGTERM→SIGKILL sequence.
pub fn handle_exec_pipe(fd: RawFd, mut first: Frame) {
    let writer = Arc::new(FrameWriter::new(fd));

    let mut req = match decode_request(&mut first) {
        Ok(req) => req,
        Err(e) => {
            send_result_frame(&writer, &ExecResult::failure(e));
            return;
        }
    };

    let (stdin_pipe, stdout_pipe, stderr_pipe) = match (make_pipe(), make_pipe(), make_pipe()) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        (a, b, c) => {
            for pipe in [a.ok(), b.ok(), c.ok()].into_iter().flatten() {
                close_fd(pipe.read);
                close_fd(pipe.write);
            }
            send_result_frame(&writer, &ExecResult::failure("pipe allocation failed"));
            return;
        }
    };

    let child = match spawn_shell(
        &req,
        ChildStdio::Pipes {
            stdin: Some(stdin_pipe.read),
            stdout: Some(stdout_pipe.write),
            stderr: Some(stderr_pipe.write),
        },
    ) {
        Ok(child) => child,
        Err(e) => {
            for fd in [stdin_pipe.write, stdout_pipe.read, stderr_pipe.read] {
                close_fd(fd);
            }
            req.wipe();
            send_result_frame(&writer, &ExecResult::failure(format!("launch: {}", e)));
            return;
        }
    };
    req.wipe();

    let gate = ChildGate::new(child.pgid());

    let stdin_reader = spawn_stdin_reader(fd, stdin_pipe.write, gate.clone());

    let out_streamer = spawn_streamer(stdout_pipe.read, FrameType::Stdout, writer.clone());
    let err_streamer = spawn_streamer(stderr_pipe.read, FrameType::Stderr, writer.clone());

    let exit_code = wait_for_exit(child.pid, &gate);

    let _ = out_streamer.join();
    let _ = err_streamer.join();

    let exit_frame = Frame::new(FrameType::Exit, encode_exit(exit_code).to_vec());
    if let Err(e) = writer.send(&exit_frame) {
        kmsg(&format!("send Exit: {}", e));
    }
    writer.shutdown_write();
    std::thread::sleep(EXIT_DRAIN);

    shutdown_read(fd);
    let _ = stdin_reader.join();
}

/// Inbound frame pump for ExecPipe: Stdin frames feed the child, an empty
/// Stdin closes its stdin, Signal frames hit the process group, and a dead
/// stream cancels the workload.
fn spawn_stdin_reader(
    fd: RawFd,
    stdin_fd: RawFd,
    gate: Arc<ChildGate>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("stdin-pump".into())
        .spawn(move || {
            let mut stream = FdStream::new(fd);
            let mut stdin_open = true;
            loop {
                let mut frame = match Frame::read_from(&mut stream) {
                    Ok(frame) => frame,
                    Err(_) => {
                        if !gate.is_done() {
                            gate.terminate_group();
                        }
                        break;
                    }
                };
                match frame.frame_type {
                    FrameType::Stdin => {
                        if frame.payload.is_empty() {
                            if stdin_open {
                                close_fd(stdin_fd);
                                stdin_open = false;
                            }
                        } else if stdin_open {
                            if let Err(e) = write_all_fd(stdin_fd, &frame.payload) {
                                kmsg(&format!("child stdin: {}", e));
                            }
                            wipe(&mut frame.payload);
                        }
                    }
                    FrameType::Signal => {
                        if let Some(&sig) = frame.payload.first() {
                            gate.signal_group(sig as libc::c_int);
                        }
                    }
                    other => {
                        kmsg(&format!("unexpected frame {:?} on pipe stream", other));
                    }
                }
            }
            if stdin_open {
                close_fd(stdin_fd);
            }
        })
        .expect("spawn stdin pump")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_command_appends_args() {
        assert_eq!(shell_command("echo hi", &[]), "echo hi");
        assert_eq!(
            shell_command("ls", &["-l".to_string(), "/tmp".to_string()]),
            "ls -l /tmp"
        );
    }

    #[test]
    fn pipes_allocate_and_close() {
        let pipe = make_pipe().unwrap();
        write_all_fd(pipe.write, b"ping").unwrap();
        let mut buf = [0u8; 8];
        let n = FdStream::new(pipe.read).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        close_fd(pipe.read);
        close_fd(pipe.write);
    }

    #[test]
    fn decode_request_wipes_payload() {
        let req = ExecRequest {
            command: "id".to_string(),
            ..Default::default()
        };
        let mut frame = Frame::json(FrameType::Exec, &req).unwrap();
        let decoded = decode_request(&mut frame).unwrap();
        assert_eq!(decoded.command, "id");
        assert!(frame.payload.iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_request_reports_bad_json() {
        let mut frame = Frame::new(FrameType::Exec, b"not json".to_vec());
        let err = decode_request(&mut frame).unwrap_err();
        assert!(err.contains("decode request"), "{}", err);
    }

    #[test]
    fn stdin_pump_feeds_and_closes_the_pipe() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (host, conn) = UnixStream::pair().unwrap();
        let pipe = make_pipe().unwrap();
        let gate = ChildGate::new(i32::MAX - 1);
        // No real process behind the fake pgid; the gate must swallow all
        // signal attempts.
        gate.mark_done();

        let pump = spawn_stdin_reader(conn.as_raw_fd(), pipe.write, gate);

        Frame::new(FrameType::Stdin, b"line one\n".to_vec())
            .write_to(&mut &host)
            .unwrap();
        // Signals pass through the gate without reaching anything.
        Frame::new(FrameType::Signal, vec![libc::SIGTERM as u8])
            .write_to(&mut &host)
            .unwrap();
        // Empty Stdin closes the child's pipe.
        Frame::new(FrameType::Stdin, vec![])
            .write_to(&mut &host)
            .unwrap();

        let mut buf = [0u8; 64];
        let n = FdStream::new(pipe.read).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"line one\n");
        // Write end closed: EOF.
        let n = FdStream::new(pipe.read).read(&mut buf).unwrap();
        assert_eq!(n, 0);

        drop(host);
        pump.join().unwrap();
        close_fd(pipe.read);
    }
}
