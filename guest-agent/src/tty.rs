//! ExecTty handler: interactive sessions on a pseudo-terminal.
//!
//! The workload gets the PTY slave as stdin/stdout/stderr and controlling
//! terminal. Master output goes to the host as Stdout frames; inbound
//! Stdin frames feed the master, Resize frames update the window, Signal
//! frames go to the child. On exit the agent emits an Exit frame, then
//! half-closes and drains before the connection goes away.

use std::io::Read;
use std::os::fd::IntoRawFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;

use nix::pty::{openpty, Winsize};

use matchlock_protocol::{
    decode_resize, encode_exit, wipe, ExecResult, ExecTtyRequest, Frame, FrameType,
    STREAM_CHUNK_SIZE,
};

use crate::exec::{send_result_frame, wait_for_exit, write_all_fd};
use crate::kmsg;
use crate::sandbox::{self, ChildGate, ChildStdio, SpawnSpec};
use crate::wire::{shutdown_read, FdStream, FrameWriter};

const SHELL: &str = "/bin/sh";
const EXIT_DRAIN: std::time::Duration = std::time::Duration::from_millis(50);

pub fn handle_exec_tty(fd: RawFd, mut first: Frame) {
    let writer = Arc::new(FrameWriter::new(fd));

    let mut req: ExecTtyRequest = match first.parse_json() {
        Ok(req) => req,
        Err(e) => {
            send_result_frame(
                &writer,
                &ExecResult::failure(format!("decode request: {}", e)),
            );
            return;
        }
    };
    wipe(&mut first.payload);

    let winsize = Winsize {
        ws_row: req.rows,
        ws_col: req.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let pty = match openpty(Some(&winsize), None) {
        Ok(pty) => pty,
        Err(e) => {
            req.wipe();
            send_result_frame(&writer, &ExecResult::failure(format!("openpty: {}", e)));
            return;
        }
    };
    let master = pty.master.into_raw_fd();
    let slave = pty.slave.into_raw_fd();

    let argv = vec![
        SHELL.to_string(),
        "-c".to_string(),
        if req.args.is_empty() {
            req.command.clone()
        } else {
            let mut full = req.command.clone();
            for arg in &req.args {
                full.push(' ');
                full.push_str(arg);
            }
            full
        },
    ];
    let spec = SpawnSpec {
        argv: &argv,
        user: req.user.as_deref(),
        working_dir: req.working_dir.as_deref(),
        env: &req.env,
    };

    let child = match sandbox::spawn(&spec, ChildStdio::Tty { slave }) {
        Ok(child) => child,
        Err(e) => {
            unsafe {
                libc::close(master);
            }
            req.wipe();
            send_result_frame(&writer, &ExecResult::failure(format!("launch: {}", e)));
            return;
        }
    };
    req.wipe();

    let gate = ChildGate::new(child.pgid());

    // Master → host. Ends with EIO once the child is gone and the slave has
    // no more openers.
    let out_writer = writer.clone();
    let out_reader = thread::Builder::new()
        .name("tty-out".into())
        .spawn(move || {
            let mut stream = FdStream::new(master);
            let mut buf = [0u8; STREAM_CHUNK_SIZE];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = Frame::new(FrameType::Stdout, buf[..n].to_vec());
                        if out_writer.send(&frame).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .expect("spawn tty reader");

    // Reap, drain, announce.
    let waiter_gate = gate.clone();
    let waiter_writer = writer.clone();
    let child_pid = child.pid;
    let waiter = thread::Builder::new()
        .name("tty-wait".into())
        .spawn(move || {
            let exit_code = wait_for_exit(child_pid, &waiter_gate);
            let _ = out_reader.join();

            let exit_frame = Frame::new(FrameType::Exit, encode_exit(exit_code).to_vec());
            if let Err(e) = waiter_writer.send(&exit_frame) {
                kmsg(&format!("send Exit: {}", e));
            }
            waiter_writer.shutdown_write();
            std::thread::sleep(EXIT_DRAIN);
            shutdown_read(fd);
        })
        .expect("spawn tty waiter");

    // Inbound pump: runs until the host goes away or the waiter shuts the
    // read side down.
    let mut stream = FdStream::new(fd);
    loop {
        let mut frame = match Frame::read_from(&mut stream) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        match frame.frame_type {
            FrameType::Stdin => {
                if !frame.payload.is_empty() {
                    if let Err(e) = write_all_fd(master, &frame.payload) {
                        kmsg(&format!("pty stdin: {}", e));
                    }
                    wipe(&mut frame.payload);
                }
            }
            FrameType::Resize => match decode_resize(&frame.payload) {
                Ok((rows, cols)) => resize_pty(master, rows, cols),
                Err(e) => kmsg(&format!("bad resize frame: {}", e)),
            },
            FrameType::Signal => {
                if let Some(&sig) = frame.payload.first() {
                    gate.signal_pid(sig as libc::c_int);
                }
            }
            other => {
                kmsg(&format!("unexpected frame {:?} on tty stream", other));
            }
        }
    }

    // Host-side cancel: the child is still alive only if the inbound loop
    // ended before the waiter reaped it.
    if !gate.is_done() {
        gate.terminate_group();
    }

    let _ = waiter.join();
    unsafe {
        libc::close(master);
    }
}

fn resize_pty(master: RawFd, rows: u16, cols: u16) {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(master, libc::TIOCSWINSZ, &winsize as *const Winsize) };
    if ret != 0 {
        kmsg(&format!(
            "TIOCSWINSZ: {}",
            std::io::Error::last_os_error()
        ));
    }
}
