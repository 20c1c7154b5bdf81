//! Shared wire-format types for matchlock host ↔ guest communication.
//!
//! This crate is the single source of truth for the control protocol used
//! between the host runtime (`matchlock`) and the guest agent
//! (`guest-agent`). Both crates depend on this to avoid struct duplication.
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌───────────┬──────────────┬───────────────────┐
//! │ type (1B) │ length (4 B) │ payload (N bytes) │
//! └───────────┴──────────────┴───────────────────┘
//! ```
//!
//! - **type**: one byte mapping to [`FrameType`].
//! - **length**: `u32` big-endian, size of the payload only (not including
//!   the 5-byte header).
//! - **payload**: JSON for the request/response frames, raw bytes for
//!   Stdout/Stderr/Stdin, fixed-width binary for Exit/Resize/Signal,
//!   empty for Ready.

use std::fmt;
use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during protocol message parsing.
#[derive(Debug)]
pub enum ProtocolError {
    /// Message buffer too short or incomplete.
    InvalidFrame(String),
    /// The type byte does not map to a known [`FrameType`].
    UnknownFrameType(u8),
    /// The peer closed the stream cleanly (zero bytes before any header byte).
    Closed,
    /// The stream ended mid-frame.
    UnexpectedEof,
    /// Payload length exceeds [`MAX_FRAME_SIZE`].
    Oversized(usize),
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidFrame(msg) => write!(f, "invalid frame: {}", msg),
            ProtocolError::UnknownFrameType(b) => write!(f, "unknown frame type: {}", b),
            ProtocolError::Closed => write!(f, "stream closed"),
            ProtocolError::UnexpectedEof => write!(f, "unexpected end of stream"),
            ProtocolError::Oversized(n) => {
                write!(f, "frame payload too large: {} bytes (max {})", n, MAX_FRAME_SIZE)
            }
            ProtocolError::Io(e) => write!(f, "io error: {}", e),
            ProtocolError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

impl ProtocolError {
    /// Whether this error means the peer went away (clean close or reset),
    /// as opposed to a malformed frame.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProtocolError::Closed | ProtocolError::UnexpectedEof | ProtocolError::Io(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 1 (type) + 4 (length).
pub const HEADER_SIZE: usize = 5;

/// Upper bound on a single frame payload. Large transfers are chunked by the
/// sender; anything beyond this is a protocol violation, rejected before
/// allocation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Chunk size used by streaming handlers for Stdout/Stderr frames.
pub const STREAM_CHUNK_SIZE: usize = 4096;

/// Fixed vsock port for the control protocol (Exec variants + PortForward).
pub const CONTROL_PORT: u32 = 5000;

/// Fixed vsock port for the filesystem protocol (served by the VFS
/// collaborator when one is compiled in).
pub const FS_PORT: u32 = 5001;

/// Fixed vsock port for the readiness probe (accept-and-close).
pub const READY_PORT: u32 = 5002;

// ---------------------------------------------------------------------------
// FrameType
// ---------------------------------------------------------------------------

/// Frame types for host-guest communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Batched command execution request (JSON [`ExecRequest`])
    Exec = 1,
    /// Final result of an Exec/ExecStream (JSON [`ExecResult`])
    ExecResult = 2,
    /// Raw stdout bytes
    Stdout = 3,
    /// Raw stderr bytes
    Stderr = 4,
    /// Signal delivery, single byte payload
    Signal = 5,
    /// Readiness marker, empty payload
    Ready = 6,
    /// Raw stdin bytes; an empty payload closes the child's stdin
    Stdin = 7,
    /// PTY window change, `rows:u16 be, cols:u16 be`
    Resize = 8,
    /// PTY session request (JSON [`ExecTtyRequest`])
    ExecTty = 9,
    /// Terminal exit code, `u32` big-endian
    Exit = 10,
    /// Streaming command execution request (JSON [`ExecRequest`])
    ExecStream = 11,
    /// Streaming execution with stdin piping (JSON [`ExecRequest`])
    ExecPipe = 12,
    /// TCP tunnel request (JSON [`PortForwardRequest`])
    PortForward = 13,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(FrameType::Exec),
            2 => Ok(FrameType::ExecResult),
            3 => Ok(FrameType::Stdout),
            4 => Ok(FrameType::Stderr),
            5 => Ok(FrameType::Signal),
            6 => Ok(FrameType::Ready),
            7 => Ok(FrameType::Stdin),
            8 => Ok(FrameType::Resize),
            9 => Ok(FrameType::ExecTty),
            10 => Ok(FrameType::Exit),
            11 => Ok(FrameType::ExecStream),
            12 => Ok(FrameType::ExecPipe),
            13 => Ok(FrameType::PortForward),
            _ => Err(ProtocolError::UnknownFrameType(byte)),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A framed protocol message consisting of a type tag and a payload.
///
/// Use [`Frame::encode`] / [`Frame::decode`] for in-memory conversion and
/// [`Frame::read_from`] / [`Frame::write_to`] for streaming.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Type of frame.
    pub frame_type: FrameType,
    /// Frame payload.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// A frame whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(frame_type: FrameType, value: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_type,
            payload: serde_json::to_vec(value)?,
        })
    }

    /// Serialize this frame into a byte buffer (header + payload).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, self.payload.len() as u32);
        buf.extend_from_slice(&len);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a frame from a contiguous byte slice.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidFrame("frame too short".into()));
        }

        let frame_type = FrameType::try_from(data[0])?;
        let length = BigEndian::read_u32(&data[1..5]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::Oversized(length));
        }
        if data.len() < HEADER_SIZE + length {
            return Err(ProtocolError::InvalidFrame("incomplete frame".into()));
        }

        let payload = data[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        Ok(Self {
            frame_type,
            payload,
        })
    }

    /// Read a complete frame from a [`std::io::Read`] stream.
    ///
    /// Zero bytes before the first header byte is a clean close
    /// ([`ProtocolError::Closed`]); a short read after that is
    /// [`ProtocolError::UnexpectedEof`] and is fatal for the connection.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0usize;
        while filled < HEADER_SIZE {
            let n = reader.read(&mut header[filled..])?;
            if n == 0 {
                return if filled == 0 {
                    Err(ProtocolError::Closed)
                } else {
                    Err(ProtocolError::UnexpectedEof)
                };
            }
            filled += n;
        }

        let frame_type = FrameType::try_from(header[0])?;
        let length = BigEndian::read_u32(&header[1..5]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::Oversized(length));
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            reader
                .read_exact(&mut payload)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => ProtocolError::UnexpectedEof,
                    _ => ProtocolError::Io(e),
                })?;
        }

        Ok(Self {
            frame_type,
            payload,
        })
    }

    /// Write the full frame to a [`std::io::Write`] stream.
    ///
    /// `write_all` retries partial writes until the whole frame is on the
    /// wire. Frames from concurrent writers must be serialised externally.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Decode the payload as JSON.
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

// ---------------------------------------------------------------------------
// Fixed-width payload helpers
// ---------------------------------------------------------------------------

/// Encode an exit code as the 4-byte big-endian Exit payload.
pub fn encode_exit(code: i32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, code as u32);
    buf
}

/// Decode the 4-byte big-endian Exit payload.
pub fn decode_exit(payload: &[u8]) -> Result<i32, ProtocolError> {
    if payload.len() != 4 {
        return Err(ProtocolError::InvalidFrame(format!(
            "exit payload must be 4 bytes, got {}",
            payload.len()
        )));
    }
    Ok(BigEndian::read_u32(payload) as i32)
}

/// Encode a PTY window size as the 4-byte Resize payload.
pub fn encode_resize(rows: u16, cols: u16) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u16(&mut buf[0..2], rows);
    BigEndian::write_u16(&mut buf[2..4], cols);
    buf
}

/// Decode the 4-byte Resize payload into `(rows, cols)`.
pub fn decode_resize(payload: &[u8]) -> Result<(u16, u16), ProtocolError> {
    if payload.len() != 4 {
        return Err(ProtocolError::InvalidFrame(format!(
            "resize payload must be 4 bytes, got {}",
            payload.len()
        )));
    }
    Ok((
        BigEndian::read_u16(&payload[0..2]),
        BigEndian::read_u16(&payload[2..4]),
    ))
}

/// Overwrite a buffer with zeros. Applied to any buffer that carried
/// request JSON, env values, or stdin bytes as soon as it is consumed.
pub fn wipe(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = 0;
    }
}

// ---------------------------------------------------------------------------
// Data types: Exec
// ---------------------------------------------------------------------------

/// Request to execute a command in the guest.
///
/// Payload of `Exec`, `ExecStream`, and `ExecPipe` frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Command line, run through a shell.
    pub command: String,
    /// Extra arguments appended after the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Working directory (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub env: std::collections::HashMap<String, String>,
    /// Standard input data (batched Exec only; ExecPipe streams Stdin frames).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// User to run as: `name`, `uid`, or `uid:gid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ExecRequest {
    /// Overwrite every secret-bearing field with zeros and drain the env map.
    pub fn wipe(&mut self) {
        // SAFETY-free zeroing: String contents are overwritten in place via
        // the underlying Vec before truncation.
        unsafe {
            wipe(self.command.as_bytes_mut());
        }
        self.command.clear();
        for arg in self.args.iter_mut() {
            unsafe {
                wipe(arg.as_bytes_mut());
            }
        }
        self.args.clear();
        if let Some(stdin) = self.stdin.as_mut() {
            unsafe {
                wipe(stdin.as_bytes_mut());
            }
        }
        self.stdin = None;
        for (_, v) in self.env.iter_mut() {
            unsafe {
                wipe(v.as_bytes_mut());
            }
        }
        self.env.clear();
    }
}

/// Request to run a command on a PTY.
///
/// Payload of `ExecTty` frames. Same fields as [`ExecRequest`] plus the
/// initial window size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecTtyRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Initial PTY rows.
    pub rows: u16,
    /// Initial PTY columns.
    pub cols: u16,
}

impl ExecTtyRequest {
    pub fn wipe(&mut self) {
        unsafe {
            wipe(self.command.as_bytes_mut());
        }
        self.command.clear();
        for arg in self.args.iter_mut() {
            unsafe {
                wipe(arg.as_bytes_mut());
            }
        }
        self.args.clear();
        for (_, v) in self.env.iter_mut() {
            unsafe {
                wipe(v.as_bytes_mut());
            }
        }
        self.env.clear();
    }
}

/// Request to open a TCP tunnel from the control stream to a guest-local
/// endpoint. Payload of `PortForward` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForwardRequest {
    /// Target host inside the guest; defaults to loopback.
    #[serde(default = "default_forward_host")]
    pub host: String,
    /// Target port; zero is rejected.
    pub port: u16,
}

fn default_forward_host() -> String {
    "127.0.0.1".to_string()
}

/// Final result of a batched or streaming execution.
///
/// Payload of `ExecResult` frames. Streaming modes leave `stdout`/`stderr`
/// empty (the chunks already went out as Stdout/Stderr frames).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Non-empty when the request failed before or outside the workload.
    #[serde(default)]
    pub error: String,
}

impl ExecResult {
    /// Result for a request that failed before the workload ran.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            error: message.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
