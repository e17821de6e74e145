//! Minimal RFC 6455 WebSocket upgrade, used inside a CONNECT tunnel when
//! the inner app asks to hand the connection off rather than speak plain
//! HTTP framing. `rama-ws` exists as a crate name in the teacher's
//! workspace but ships no retrievable handshake source in this pack; the
//! handshake below is written directly from RFC 6455 using `sha1` and
//! `base64`, both already workspace dependencies of `rama` itself.

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The GUID RFC 6455 §1.3 defines for computing `Sec-WebSocket-Accept`.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Write the `101 Switching Protocols` response completing the upgrade.
pub async fn write_handshake_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    client_key: &str,
    protocol: Option<&str>,
) -> std::io::Result<()> {
    let accept = accept_key(client_key);
    let mut resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = protocol {
        resp.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    resp.push_str("\r\n");
    stream.write_all(resp.as_bytes()).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Read one client-to-server frame, unmasking it per RFC 6455 §5.3
/// (client frames are always masked).
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Frame> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;

    let opcode = Opcode::from_u8(head[0] & 0x0F)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "unsupported websocket opcode"))?;
    let masked = head[1] & 0x80 != 0;
    let mut len = (head[1] & 0x7F) as u64;

    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await?;
        len = u64::from_be_bytes(ext);
    }

    let mut mask = [0u8; 4];
    if masked {
        stream.read_exact(&mut mask).await?;
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok(Frame { opcode, payload })
}

/// Write one server-to-client frame, unmasked per RFC 6455 §5.1.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, frame: &Frame) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(frame.payload.len() + 10);
    out.push(0x80 | frame.opcode.as_u8());

    let len = frame.payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(&frame.payload);

    stream.write_all(&out).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 section 1.3's worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
