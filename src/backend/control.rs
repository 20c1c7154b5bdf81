//! Host-side control client for the guest agent.
//!
//! Connections go through the hypervisor's vsock UDS multiplexer: the
//! client dials the Unix socket, issues the text handshake
//! (`CONNECT <port>\n` → `OK <assigned>\n`), and from then on the stream
//! carries control frames. Frame loops are synchronous and run under
//! `spawn_blocking`; cancellation is expressed by closing the underlying
//! connection, which the guest treats as the cancel signal. Time-outs are
//! a context property; the protocol itself has no timers, so deadlines
//! are applied as socket read time-outs that end with the connection
//! dropped.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use matchlock_protocol::{
    decode_exit, encode_resize, ExecRequest, ExecResult, ExecTtyRequest, Frame, FrameType,
    PortForwardRequest, ProtocolError, CONTROL_PORT,
};

use crate::error::{Error, Result};

/// One chunk of workload output during streaming execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Host → guest traffic during an ExecPipe session.
#[derive(Debug, Clone)]
pub enum PipeInput {
    Stdin(Vec<u8>),
    /// Close the child's stdin.
    CloseStdin,
    Signal(u8),
}

/// Host → guest traffic during an ExecTty session.
#[derive(Debug, Clone)]
pub enum TtyInput {
    Stdin(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    Signal(u8),
}

/// Dial a guest port through the hypervisor's vsock UDS.
pub(crate) fn vsock_connect(uds_path: &Path, port: u32) -> Result<UnixStream> {
    let stream = UnixStream::connect(uds_path)
        .map_err(|e| Error::VsockConnect(format!("{}: {}", uds_path.display(), e)))?;

    let mut writer = stream
        .try_clone()
        .map_err(|e| Error::VsockConnect(format!("clone stream: {}", e)))?;
    writer
        .write_all(format!("CONNECT {}\n", port).as_bytes())
        .map_err(|e| Error::VsockConnect(format!("send CONNECT {}: {}", port, e)))?;

    let mut reply = String::new();
    let mut reader = BufReader::new(LimitedReader {
        inner: &stream,
        remaining: 64,
    });
    reader
        .read_line(&mut reply)
        .map_err(|e| Error::VsockConnect(format!("read CONNECT reply: {}", e)))?;

    if !reply.starts_with("OK ") {
        return Err(Error::VsockConnect(format!(
            "port {}: unexpected handshake reply {:?}",
            port,
            reply.trim_end()
        )));
    }
    debug!(port, reply = reply.trim_end(), "vsock handshake complete");
    Ok(stream)
}

/// Caps the handshake read so a garbage peer cannot feed an unbounded line.
struct LimitedReader<'a> {
    inner: &'a UnixStream,
    remaining: usize,
}

impl Read for LimitedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = self.remaining.min(buf.len());
        let n = self.inner.read(&mut buf[..cap])?;
        self.remaining -= n;
        Ok(n)
    }
}

/// Probe a guest port: connect, handshake, drop.
pub(crate) fn vsock_probe(uds_path: &Path, port: u32) -> Result<()> {
    vsock_connect(uds_path, port).map(|_| ())
}

/// Client for the control protocol of one VM.
#[derive(Debug, Clone)]
pub struct ControlClient {
    uds_path: PathBuf,
}

impl ControlClient {
    pub fn new(uds_path: impl Into<PathBuf>) -> Self {
        Self {
            uds_path: uds_path.into(),
        }
    }

    /// Batched execution: send the request, wait for the single ExecResult.
    ///
    /// A non-empty `error` in the reply surfaces as [`Error::RemoteExec`];
    /// nonzero exit codes are not errors.
    pub async fn exec(
        &self,
        request: &ExecRequest,
        timeout: Option<Duration>,
    ) -> Result<ExecResult> {
        let uds_path = self.uds_path.clone();
        let request = request.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<ExecResult> {
            let mut stream = vsock_connect(&uds_path, CONTROL_PORT)?;
            let _ = stream.set_read_timeout(timeout);
            Frame::json(FrameType::Exec, &request)?.write_to(&mut stream)?;

            loop {
                let frame = Frame::read_from(&mut stream)?;
                match frame.frame_type {
                    FrameType::ExecResult => return Ok(frame.parse_json()?),
                    other => {
                        return Err(Error::Guest(format!(
                            "unexpected frame {:?} awaiting ExecResult",
                            other
                        )))
                    }
                }
            }
        })
        .await
        .map_err(|e| Error::Guest(format!("exec task panicked: {}", e)))??;

        if !result.error.is_empty() {
            return Err(Error::RemoteExec(result.error));
        }
        Ok(result)
    }

    /// Streaming execution: chunks arrive on `chunk_tx` as the workload
    /// produces them; the returned result carries only the exit code.
    pub async fn exec_stream(
        &self,
        request: &ExecRequest,
        chunk_tx: mpsc::Sender<OutputChunk>,
    ) -> Result<ExecResult> {
        let uds_path = self.uds_path.clone();
        let request = request.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<ExecResult> {
            let mut stream = vsock_connect(&uds_path, CONTROL_PORT)?;
            Frame::json(FrameType::ExecStream, &request)?.write_to(&mut stream)?;

            loop {
                let frame = Frame::read_from(&mut stream)?;
                match frame.frame_type {
                    FrameType::Stdout => {
                        let _ = chunk_tx.blocking_send(OutputChunk::Stdout(frame.payload));
                    }
                    FrameType::Stderr => {
                        let _ = chunk_tx.blocking_send(OutputChunk::Stderr(frame.payload));
                    }
                    FrameType::ExecResult => return Ok(frame.parse_json()?),
                    other => {
                        warn!(?other, "unexpected frame during streaming exec");
                    }
                }
            }
        })
        .await
        .map_err(|e| Error::Guest(format!("exec task panicked: {}", e)))??;

        if !result.error.is_empty() {
            return Err(Error::RemoteExec(result.error));
        }
        Ok(result)
    }

    /// Piped execution: `input_rx` drives the child's stdin and signals,
    /// `output_tx` receives chunks, and the returned value is the exit
    /// code from the terminal Exit frame.
    ///
    /// Close the input channel (and send [`PipeInput::CloseStdin`] first if
    /// the child reads stdin to EOF) to finish the session; dropping the
    /// future closes the connection, which the guest treats as cancel.
    pub async fn exec_pipe(
        &self,
        request: &ExecRequest,
        mut input_rx: mpsc::Receiver<PipeInput>,
        output_tx: mpsc::Sender<OutputChunk>,
    ) -> Result<i32> {
        let uds_path = self.uds_path.clone();
        let request = request.clone();

        let stream = tokio::task::spawn_blocking(move || -> Result<UnixStream> {
            let mut stream = vsock_connect(&uds_path, CONTROL_PORT)?;
            Frame::json(FrameType::ExecPipe, &request)?.write_to(&mut stream)?;
            Ok(stream)
        })
        .await
        .map_err(|e| Error::Guest(format!("exec task panicked: {}", e)))??;

        let mut write_half = stream
            .try_clone()
            .map_err(|e| Error::Guest(format!("clone stream: {}", e)))?;

        // Writer drains the input channel into frames; it ends when the
        // caller closes the channel.
        let writer = tokio::task::spawn_blocking(move || {
            while let Some(input) = input_rx.blocking_recv() {
                let frame = match input {
                    PipeInput::Stdin(data) => Frame::new(FrameType::Stdin, data),
                    PipeInput::CloseStdin => Frame::new(FrameType::Stdin, vec![]),
                    PipeInput::Signal(sig) => Frame::new(FrameType::Signal, vec![sig]),
                };
                if frame.write_to(&mut write_half).is_err() {
                    break;
                }
            }
        });

        let reader = tokio::task::spawn_blocking(move || -> Result<i32> {
            let mut stream = stream;
            loop {
                let frame = Frame::read_from(&mut stream)?;
                match frame.frame_type {
                    FrameType::Stdout => {
                        let _ = output_tx.blocking_send(OutputChunk::Stdout(frame.payload));
                    }
                    FrameType::Stderr => {
                        let _ = output_tx.blocking_send(OutputChunk::Stderr(frame.payload));
                    }
                    FrameType::Exit => return Ok(decode_exit(&frame.payload)?),
                    FrameType::ExecResult => {
                        // Failure before the workload ran.
                        let result: ExecResult = frame.parse_json()?;
                        return Err(Error::RemoteExec(result.error));
                    }
                    other => {
                        warn!(?other, "unexpected frame during piped exec");
                    }
                }
            }
        });

        let exit = reader
            .await
            .map_err(|e| Error::Guest(format!("exec task panicked: {}", e)))?;
        let _ = writer.await;
        exit
    }

    /// PTY session. Same channel discipline as [`Self::exec_pipe`]; output
    /// is a single stream of terminal bytes.
    pub async fn exec_tty(
        &self,
        request: &ExecTtyRequest,
        mut input_rx: mpsc::Receiver<TtyInput>,
        output_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<i32> {
        let uds_path = self.uds_path.clone();
        let request = request.clone();

        let stream = tokio::task::spawn_blocking(move || -> Result<UnixStream> {
            let mut stream = vsock_connect(&uds_path, CONTROL_PORT)?;
            Frame::json(FrameType::ExecTty, &request)?.write_to(&mut stream)?;
            Ok(stream)
        })
        .await
        .map_err(|e| Error::Guest(format!("exec task panicked: {}", e)))??;

        let mut write_half = stream
            .try_clone()
            .map_err(|e| Error::Guest(format!("clone stream: {}", e)))?;

        let writer = tokio::task::spawn_blocking(move || {
            while let Some(input) = input_rx.blocking_recv() {
                let frame = match input {
                    TtyInput::Stdin(data) => Frame::new(FrameType::Stdin, data),
                    TtyInput::Resize { rows, cols } => {
                        Frame::new(FrameType::Resize, encode_resize(rows, cols).to_vec())
                    }
                    TtyInput::Signal(sig) => Frame::new(FrameType::Signal, vec![sig]),
                };
                if frame.write_to(&mut write_half).is_err() {
                    break;
                }
            }
        });

        let reader = tokio::task::spawn_blocking(move || -> Result<i32> {
            let mut stream = stream;
            loop {
                let frame = Frame::read_from(&mut stream)?;
                match frame.frame_type {
                    FrameType::Stdout => {
                        let _ = output_tx.blocking_send(frame.payload);
                    }
                    FrameType::Exit => return Ok(decode_exit(&frame.payload)?),
                    FrameType::ExecResult => {
                        let result: ExecResult = frame.parse_json()?;
                        return Err(Error::RemoteExec(result.error));
                    }
                    other => {
                        warn!(?other, "unexpected frame during tty exec");
                    }
                }
            }
        });

        let exit = reader
            .await
            .map_err(|e| Error::Guest(format!("exec task panicked: {}", e)))?;
        let _ = writer.await;
        exit
    }

    /// Accept connections on `listener` and bridge each one to
    /// `host:port` inside the guest through its own tunnel. Runs until the
    /// task is dropped or the listener fails.
    pub async fn forward_listener(
        &self,
        listener: tokio::net::TcpListener,
        host: Option<String>,
        port: u16,
    ) -> Result<()> {
        loop {
            let (local, peer) = listener.accept().await?;
            debug!(%peer, port, "bridging local connection into guest");

            let client = self.clone();
            let host = host.clone();
            tokio::spawn(async move {
                let tunnel = match client.port_forward(host.as_deref(), port).await {
                    Ok(tunnel) => tunnel,
                    Err(e) => {
                        warn!(%peer, error = %e, "guest tunnel failed");
                        return;
                    }
                };
                if let Err(e) = bridge_streams(local, tunnel).await {
                    debug!(%peer, error = %e, "tunnel ended");
                }
            });
        }
    }

    /// Open a TCP tunnel to `host:port` inside the guest. On success the
    /// returned stream is a transparent byte pipe; the caller bridges it
    /// to its local endpoint.
    pub async fn port_forward(&self, host: Option<&str>, port: u16) -> Result<UnixStream> {
        if port == 0 {
            return Err(Error::InvalidRequest("remote port must be nonzero".into()));
        }
        let request = PortForwardRequest {
            host: host.unwrap_or("127.0.0.1").to_string(),
            port,
        };
        let uds_path = self.uds_path.clone();

        tokio::task::spawn_blocking(move || -> Result<UnixStream> {
            let mut stream = vsock_connect(&uds_path, CONTROL_PORT)?;
            Frame::json(FrameType::PortForward, &request)?.write_to(&mut stream)?;

            let frame = Frame::read_from(&mut stream).map_err(|e| match e {
                ProtocolError::Closed => {
                    Error::PortForwardRejected("connection closed before Ready".into())
                }
                other => Error::from(other),
            })?;
            match frame.frame_type {
                FrameType::Ready => Ok(stream),
                FrameType::Stderr => Err(Error::PortForwardRejected(
                    String::from_utf8_lossy(&frame.payload).into_owned(),
                )),
                other => Err(Error::Guest(format!(
                    "unexpected frame {:?} awaiting Ready",
                    other
                ))),
            }
        })
        .await
        .map_err(|e| Error::Guest(format!("forward task panicked: {}", e)))?
    }
}

/// Pump bytes both ways between a local TCP connection and a guest tunnel,
/// propagating half-closes, until both directions are drained.
async fn bridge_streams(local: tokio::net::TcpStream, tunnel: UnixStream) -> std::io::Result<()> {
    tunnel.set_nonblocking(true)?;
    let tunnel = tokio::net::UnixStream::from_std(tunnel)?;

    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);
    let (mut local_read, mut local_write) = local.into_split();

    let to_guest = async {
        let n = tokio::io::copy(&mut local_read, &mut tunnel_write).await?;
        tokio::io::AsyncWriteExt::shutdown(&mut tunnel_write).await?;
        Ok::<u64, std::io::Error>(n)
    };
    let from_guest = async {
        let n = tokio::io::copy(&mut tunnel_read, &mut local_write).await?;
        tokio::io::AsyncWriteExt::shutdown(&mut local_write).await?;
        Ok::<u64, std::io::Error>(n)
    };

    let (sent, received) = tokio::try_join!(to_guest, from_guest)?;
    debug!(sent, received, "tunnel drained");
    Ok(())
}
