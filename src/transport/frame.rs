//! C8 FrameCodec: the 21-byte frame header, read/write, and tunnel-ID
//! string conversions.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::{Error, Result};

pub const HEADER_SIZE: usize = 21;
pub const MAX_FRAME_SIZE: u32 = 65536;

/// 16-byte opaque identifier disambiguating concurrent tunnels multiplexed
/// over one shared conn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(pub [u8; 16]);

impl TunnelId {
    /// Truncates or zero-pads `s` to 16 bytes.
    pub fn from_string(s: &str) -> Self {
        let mut buf = [0u8; 16];
        let bytes = s.as_bytes();
        let n = bytes.len().min(16);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self(buf)
    }

    /// Stops at the first zero byte, returning everything before it as a
    /// lossy UTF-8 string.
    pub fn to_string_trimmed(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

/// Frame type tag occupying byte 16 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x01,
    TargetReady = 0x02,
    Close = 0x03,
    Ack = 0x04,
    HttpProxy = 0x05,
    HttpResponse = 0x06,
    Eof = 0x09,
    Command = 0x10,
    CommandResponse = 0x11,
}

impl FrameType {
    pub fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0x01 => FrameType::Data,
            0x02 => FrameType::TargetReady,
            0x03 => FrameType::Close,
            0x04 => FrameType::Ack,
            0x05 => FrameType::HttpProxy,
            0x06 => FrameType::HttpResponse,
            0x09 => FrameType::Eof,
            0x10 => FrameType::Command,
            0x11 => FrameType::CommandResponse,
            other => return Err(Error::InvalidPacket(format!("unknown frame type {other:#x}"))),
        })
    }
}

/// Writes one frame: 16-byte tunnel ID, 1-byte type, 4-byte big-endian
/// length, then the payload. Uses a vectored write so header and payload
/// go out in a single syscall where the destination supports it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tunnel_id: TunnelId,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::InvalidPacket(format!(
            "payload length {} exceeds max frame size {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut header = [0u8; HEADER_SIZE];
    header[..16].copy_from_slice(&tunnel_id.0);
    header[16] = frame_type as u8;
    header[17..21].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    // Single vectored write per call when the kernel accepts the whole
    // thing at once; fall back to resuming from byte offsets otherwise
    // (no unsafe slice surgery needed since the offsets index the original
    // `header`/`payload` buffers directly).
    let total = header.len() + payload.len();
    let mut written = 0usize;
    while written < total {
        let header_remaining = header.len().saturating_sub(written);
        let (header_slice, payload_offset) = if header_remaining > 0 {
            (&header[header.len() - header_remaining..], 0)
        } else {
            (&header[0..0], written - header.len())
        };
        let payload_slice = &payload[payload_offset..];
        let slices = [
            tokio::io::IoSlice::new(header_slice),
            tokio::io::IoSlice::new(payload_slice),
        ];
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored wrote 0 bytes",
            )));
        }
        written += n;
    }
    Ok(())
}

/// Reads exactly one frame. EOF at the very start of a header is surfaced
/// as `Ok(None)`, not an error; any other failure (including EOF mid-header
/// or mid-payload) is a real error. Length is validated against
/// `MAX_FRAME_SIZE` before the payload is allocated, defensively, since a
/// hostile peer could otherwise claim a huge length to force a large
/// allocation before the real bytes ever arrive.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(TunnelId, FrameType, Vec<u8>)>> {
    let mut header = [0u8; HEADER_SIZE];
    match read_exact_or_eof(reader, &mut header).await? {
        false => return Ok(None),
        true => {}
    }
    let mut tunnel_id = [0u8; 16];
    tunnel_id.copy_from_slice(&header[..16]);
    let frame_type = FrameType::from_u8(header[16])?;
    let length = u32::from_be_bytes([header[17], header[18], header[19], header[20]]);
    if length > MAX_FRAME_SIZE {
        return Err(Error::InvalidPacket(format!(
            "frame length {length} exceeds max frame size {MAX_FRAME_SIZE}"
        )));
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some((TunnelId(tunnel_id), frame_type, payload)))
}

/// Like `AsyncReadExt::read_exact`, but returns `Ok(false)` instead of an
/// error when zero bytes were read before EOF (a clean stream end), and a
/// real error for any other outcome, including a partial header.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF mid-header",
            )));
        }
        read += n;
    }
    Ok(true)
}

/// `TargetReady` control payload: `"<tunnelID>|<targetNodeID>"` ASCII.
pub fn encode_target_ready(tunnel_id: &str, target_node_id: &str) -> Vec<u8> {
    format!("{tunnel_id}|{target_node_id}").into_bytes()
}

pub fn decode_target_ready(payload: &[u8]) -> Result<(String, String)> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::InvalidPacket(format!("target_ready not utf8: {e}")))?;
    text.split_once('|')
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| Error::InvalidPacket("target_ready missing '|' separator".to_string()))
}

/// JSON-encoded structured payload shared by `Command`/`CommandResponse`
/// frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command_id: String,
    pub command_type: String,
    pub target_client_id: String,
    pub source_node_id: String,
    pub source_conn_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidPacket(format!("command encode: {e}")))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::InvalidPacket(format!("command decode: {e}")))
    }
}
