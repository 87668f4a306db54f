//! Framing: 22-byte UDP beacon and signature-prefixed ZRE frames.
//!
//! All integers are network byte order. Short strings carry a 1-byte
//! length, header values a 4-byte length; lists and maps a 4-byte count.

use std::collections::HashMap;

use crate::identity::NodeUuid;
use crate::protocol::{ZreMsg, BEACON_SIZE, BEACON_VERSION, SIGNATURE, VERSION};

/// Longest single frame accepted by the decoder: 16 MiB.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const MAX_SHORT_STRING: usize = 255;

/// Discovery beacon payload: sender identity and TCP inbox port.
/// Port 0 announces that the sender is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub uuid: NodeUuid,
    pub port: u16,
}

/// Encode a beacon into its fixed 22-byte layout.
pub fn encode_beacon(beacon: &Beacon) -> [u8; BEACON_SIZE] {
    let mut out = [0u8; BEACON_SIZE];
    out[0..3].copy_from_slice(b"ZRE");
    out[3] = BEACON_VERSION;
    out[4..20].copy_from_slice(beacon.uuid.as_bytes());
    out[20..22].copy_from_slice(&beacon.port.to_be_bytes());
    out
}

/// Decode a beacon. Anything failing the magic/length/version check is
/// rejected; the caller drops it silently.
pub fn decode_beacon(bytes: &[u8]) -> Result<Beacon, BeaconDecodeError> {
    if bytes.len() != BEACON_SIZE {
        return Err(BeaconDecodeError::BadLength(bytes.len()));
    }
    if &bytes[0..3] != b"ZRE" {
        return Err(BeaconDecodeError::BadMagic);
    }
    if bytes[3] != BEACON_VERSION {
        return Err(BeaconDecodeError::BadVersion(bytes[3]));
    }
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&bytes[4..20]);
    let port = u16::from_be_bytes([bytes[20], bytes[21]]);
    Ok(Beacon {
        uuid: NodeUuid::from_bytes(uuid),
        port,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum BeaconDecodeError {
    #[error("beacon length {0}, expected 22")]
    BadLength(usize),
    #[error("beacon magic is not ZRE")]
    BadMagic,
    #[error("beacon version {0}, expected 1")]
    BadVersion(u8),
}

/// Encode a message into a single ZRE frame: signature, id, version, body.
pub fn encode_frame(msg: &ZreMsg) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&SIGNATURE);
    out.push(msg.id());
    out.push(VERSION);
    out.extend_from_slice(&msg.sequence().to_be_bytes());
    match msg {
        ZreMsg::Hello {
            endpoint,
            groups,
            status,
            name,
            headers,
            ..
        } => {
            put_string(&mut out, endpoint)?;
            out.extend_from_slice(&(groups.len() as u32).to_be_bytes());
            for group in groups {
                put_string(&mut out, group)?;
            }
            out.push(*status);
            put_string(&mut out, name)?;
            out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
            for (key, value) in headers {
                put_string(&mut out, key)?;
                put_longstr(&mut out, value.as_bytes())?;
            }
        }
        ZreMsg::Whisper { content, .. } => {
            put_content(&mut out, content)?;
        }
        ZreMsg::Shout { group, content, .. } => {
            put_string(&mut out, group)?;
            put_content(&mut out, content)?;
        }
        ZreMsg::Join { group, status, .. } | ZreMsg::Leave { group, status, .. } => {
            put_string(&mut out, group)?;
            out.push(*status);
        }
        ZreMsg::Ping { .. } | ZreMsg::PingOk { .. } => {}
    }
    if out.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("string longer than 255 bytes")]
    StringTooLong,
    #[error("frame too large")]
    TooLarge,
}

/// Decode one complete ZRE frame. A malformed frame drops the enclosing
/// message only; it never kills the peer.
pub fn decode_frame(bytes: &[u8]) -> Result<ZreMsg, FrameDecodeError> {
    let mut r = Reader::new(bytes);
    let sig = [r.u8()?, r.u8()?];
    if sig != SIGNATURE {
        return Err(FrameDecodeError::BadSignature);
    }
    let id = r.u8()?;
    let version = r.u8()?;
    if version != VERSION {
        return Err(FrameDecodeError::BadVersion(version));
    }
    let sequence = r.u16()?;
    let msg = match id {
        1 => {
            let endpoint = r.string()?;
            let count = r.u32()? as usize;
            let mut groups = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                groups.push(r.string()?);
            }
            let status = r.u8()?;
            let name = r.string()?;
            let count = r.u32()? as usize;
            let mut headers = HashMap::with_capacity(count.min(1024));
            for _ in 0..count {
                let key = r.string()?;
                let value = r.longstr()?;
                headers.insert(key, value);
            }
            ZreMsg::Hello {
                sequence,
                endpoint,
                groups,
                status,
                name,
                headers,
            }
        }
        2 => ZreMsg::Whisper {
            sequence,
            content: r.content()?,
        },
        3 => ZreMsg::Shout {
            sequence,
            group: r.string()?,
            content: r.content()?,
        },
        4 => ZreMsg::Join {
            sequence,
            group: r.string()?,
            status: r.u8()?,
        },
        5 => ZreMsg::Leave {
            sequence,
            group: r.string()?,
            status: r.u8()?,
        },
        6 => ZreMsg::Ping { sequence },
        7 => ZreMsg::PingOk { sequence },
        other => return Err(FrameDecodeError::UnknownId(other)),
    };
    if !r.is_empty() {
        return Err(FrameDecodeError::TrailingBytes);
    }
    Ok(msg)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("bad frame signature")]
    BadSignature,
    #[error("protocol version {0}, expected 2")]
    BadVersion(u8),
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("frame truncated")]
    Truncated,
    #[error("frame has trailing bytes")]
    TrailingBytes,
    #[error("string is not valid UTF-8")]
    Utf8,
    #[error("field exceeds frame limits")]
    TooLarge,
}

fn put_string(out: &mut Vec<u8>, s: &str) -> Result<(), FrameEncodeError> {
    if s.len() > MAX_SHORT_STRING {
        return Err(FrameEncodeError::StringTooLong);
    }
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_longstr(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), FrameEncodeError> {
    if bytes.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(FrameEncodeError::TooLarge);
    }
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_content(out: &mut Vec<u8>, frames: &[Vec<u8>]) -> Result<(), FrameEncodeError> {
    out.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        put_longstr(out, frame)?;
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameDecodeError> {
        if self.bytes.len() - self.pos < n {
            return Err(FrameDecodeError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameDecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameDecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, FrameDecodeError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameDecodeError::Utf8)
    }

    fn longstr(&mut self) -> Result<String, FrameDecodeError> {
        let len = self.u32()?;
        if len > MAX_FRAME_LEN {
            return Err(FrameDecodeError::TooLarge);
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameDecodeError::Utf8)
    }

    fn content(&mut self) -> Result<Vec<Vec<u8>>, FrameDecodeError> {
        let count = self.u32()? as usize;
        let mut frames = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let len = self.u32()?;
            if len > MAX_FRAME_LEN {
                return Err(FrameDecodeError::TooLarge);
            }
            frames.push(self.take(len as usize)?.to_vec());
        }
        Ok(frames)
    }
}
