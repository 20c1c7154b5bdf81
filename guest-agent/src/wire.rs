//! Raw-fd stream adapters for the control protocol.
//!
//! Connections arrive as raw vsock descriptors; these wrappers give the
//! framing codec `Read`/`Write` views without taking ownership of the fd,
//! and serialise frame writes from concurrent producer threads.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use matchlock_protocol::{Frame, ProtocolError};

/// Non-owning `Read`/`Write` view of a raw descriptor. The accept loop
/// owns the fd and closes it after the handler returns.
pub struct FdStream {
    fd: RawFd,
}

impl FdStream {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialised frame writer shared by the threads of one connection.
///
/// The codec never interleaves frames; this mutex is the external
/// serialisation it requires.
pub struct FrameWriter {
    fd: RawFd,
    lock: Mutex<()>,
}

impl FrameWriter {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            lock: Mutex::new(()),
        }
    }

    pub fn send(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let _guard = self.lock.lock().unwrap();
        frame.write_to(&mut FdStream::new(self.fd))
    }

    /// Half-close the write side so the peer observes EOF after the final
    /// frame.
    pub fn shutdown_write(&self) {
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_WR);
        }
    }
}

/// Wake any reader blocked on this fd.
pub fn shutdown_read(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RD);
    }
}
