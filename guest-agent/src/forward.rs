//! PortForward handler: turn a control connection into a TCP tunnel.
//!
//! After a Ready frame the vsock stream carries raw bytes in both
//! directions; closing either half propagates a half-close to the other,
//! and the stream is only torn down once both directions have drained.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::RawFd;
use std::thread;

use matchlock_protocol::{Frame, FrameType, PortForwardRequest};

use crate::kmsg;
use crate::wire::{FdStream, FrameWriter};

const COPY_BUF_SIZE: usize = 16 * 1024;

pub fn handle_port_forward(fd: RawFd, mut first: Frame) {
    let writer = FrameWriter::new(fd);

    let req: PortForwardRequest = match first.parse_json() {
        Ok(req) => req,
        Err(e) => {
            send_stderr(&writer, &format!("decode request: {}", e));
            return;
        }
    };
    matchlock_protocol::wipe(&mut first.payload);

    if req.port == 0 {
        send_stderr(&writer, "invalid remote port 0");
        return;
    }

    let target = format!("{}:{}", req.host, req.port);
    let tcp = match TcpStream::connect(&target) {
        Ok(stream) => stream,
        Err(e) => {
            send_stderr(&writer, &format!("connect {}: {}", target, e));
            return;
        }
    };

    if writer.send(&Frame::new(FrameType::Ready, vec![])).is_err() {
        return;
    }

    // From here on the stream is a transparent byte pipe.
    let tcp_out = match tcp.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            kmsg(&format!("port-forward clone: {}", e));
            return;
        }
    };

    // Host → guest TCP.
    let inbound = thread::Builder::new()
        .name("fwd-in".into())
        .spawn(move || {
            let mut src = FdStream::new(fd);
            let mut dst = tcp_out;
            copy_until_eof(&mut src, &mut dst);
            let _ = dst.shutdown(Shutdown::Write);
        })
        .expect("spawn forward inbound");

    // Guest TCP → host.
    let mut src = tcp;
    let mut dst = FdStream::new(fd);
    copy_until_eof(&mut src, &mut dst);
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }

    // Both directions must finish before the accept loop closes the fd.
    let _ = inbound.join();
}

fn copy_until_eof<R: Read, W: Write>(src: &mut R, dst: &mut W) {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        match src.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if dst.write_all(&buf[..n]).is_err() {
                    return;
                }
            }
        }
    }
}

fn send_stderr(writer: &FrameWriter, message: &str) {
    let frame = Frame::new(FrameType::Stderr, message.as_bytes().to_vec());
    if let Err(e) = writer.send(&frame) {
        kmsg(&format!("send Stderr: {}", e));
    }
}
