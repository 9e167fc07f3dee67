//! Control-channel wire codec.
//!
//! Every control message is one `SOCK_SEQPACKET` datagram: a 2-byte kind, 2
//! bytes of reserved flags, then a kind-specific fixed-size payload. Because
//! `SOCK_SEQPACKET` delivers whole records, there is no framing/length-prefix
//! problem to solve here, only encode/decode of the payload itself.
//!
//! File descriptors that ride alongside a message (the region fd on
//! `AddRegion`, the interrupt fd on `AddRing`) are carried out of band via
//! `SCM_RIGHTS`; see `control.rs`.

use enum_primitive::FromPrimitive;

use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_SECRET_LEN: usize = 24;
pub const MAX_REASON_LEN: usize = 96;

enum_from_primitive! {
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Hello = 1,
    Init = 2,
    AddRegion = 3,
    AddRing = 4,
    Connect = 5,
    Connected = 6,
    Disconnect = 7,
    Ack = 8,
}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingDirection {
    S2M = 0,
    M2S = 1,
}

impl RingDirection {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(RingDirection::S2M),
            1 => Ok(RingDirection::M2S),
            _ => Err(Error::MalformedMessage),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Hello {
    pub min_version: u16,
    pub max_version: u16,
    pub max_regions: u16,
    pub max_rings: u16,
    pub max_log2_ring_size: u8,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct Init {
    pub version: u16,
    /// The sender's own claimed role. Only a slave ever sends `Init` in a
    /// correctly behaving pair, but a misconfigured peer may claim master;
    /// the receiving master rejects that as `ModeMismatch` (see endpoint.rs).
    pub is_master: bool,
    pub interface_id: u32,
    pub mode: u8,
    pub name: String,
    pub secret: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AddRegion {
    pub region_index: u16,
    pub region_size: u64,
}

#[derive(Clone, Debug)]
pub struct AddRing {
    pub direction: RingDirection,
    pub ring_index: u16,
    pub region_index: u16,
    pub byte_offset: u64,
    pub log2_ring_size: u8,
    pub flags: u16,
}

#[derive(Clone, Debug)]
pub struct Connect {
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct Connected {
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct Disconnect {
    pub error_code: u32,
    pub reason: String,
}

/// A parsed control message, paired with at most one file descriptor
/// received alongside it out of band.
#[derive(Clone, Debug)]
pub enum Message {
    Hello(Hello),
    Init(Init),
    AddRegion(AddRegion),
    AddRing(AddRing),
    Connect(Connect),
    Connected(Connected),
    Disconnect(Disconnect),
    Ack,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Init(_) => MessageKind::Init,
            Message::AddRegion(_) => MessageKind::AddRegion,
            Message::AddRing(_) => MessageKind::AddRing,
            Message::Connect(_) => MessageKind::Connect,
            Message::Connected(_) => MessageKind::Connected,
            Message::Disconnect(_) => MessageKind::Disconnect,
            Message::Ack => MessageKind::Ack,
        }
    }

    /// Does this message kind carry an fd out of band?
    pub fn expects_fd(&self) -> bool {
        matches!(self, Message::AddRegion(_) | Message::AddRing(_))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(self.kind() as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // reserved flags
        match self {
            Message::Hello(h) => {
                buf.extend_from_slice(&h.min_version.to_le_bytes());
                buf.extend_from_slice(&h.max_version.to_le_bytes());
                buf.extend_from_slice(&h.max_regions.to_le_bytes());
                buf.extend_from_slice(&h.max_rings.to_le_bytes());
                buf.push(h.max_log2_ring_size);
                push_name(&mut buf, &h.name, MAX_NAME_LEN);
            }
            Message::Init(i) => {
                buf.extend_from_slice(&i.version.to_le_bytes());
                buf.push(i.is_master as u8);
                buf.extend_from_slice(&i.interface_id.to_le_bytes());
                buf.push(i.mode);
                push_name(&mut buf, &i.name, MAX_NAME_LEN);
                match &i.secret {
                    Some(s) => {
                        buf.push(1);
                        push_name(&mut buf, s, MAX_SECRET_LEN);
                    }
                    None => {
                        buf.push(0);
                        push_name(&mut buf, "", MAX_SECRET_LEN);
                    }
                }
            }
            Message::AddRegion(r) => {
                buf.extend_from_slice(&r.region_index.to_le_bytes());
                buf.extend_from_slice(&r.region_size.to_le_bytes());
            }
            Message::AddRing(r) => {
                buf.push(r.direction as u8);
                buf.extend_from_slice(&r.ring_index.to_le_bytes());
                buf.extend_from_slice(&r.region_index.to_le_bytes());
                buf.extend_from_slice(&r.byte_offset.to_le_bytes());
                buf.push(r.log2_ring_size);
                buf.extend_from_slice(&r.flags.to_le_bytes());
            }
            Message::Connect(c) => push_name(&mut buf, &c.name, MAX_NAME_LEN),
            Message::Connected(c) => push_name(&mut buf, &c.name, MAX_NAME_LEN),
            Message::Disconnect(d) => {
                buf.extend_from_slice(&d.error_code.to_le_bytes());
                push_name(&mut buf, &d.reason, MAX_REASON_LEN);
            }
            Message::Ack => {}
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Message> {
        if buf.len() < 4 {
            return Err(Error::MalformedMessage);
        }
        let kind_raw = u16::from_le_bytes([buf[0], buf[1]]);
        let kind = MessageKind::from_u16(kind_raw).ok_or(Error::UnknownMessageType)?;
        let body = &buf[4..];

        Ok(match kind {
            MessageKind::Hello => {
                let mut r = Reader::new(body);
                Message::Hello(Hello {
                    min_version: r.u16()?,
                    max_version: r.u16()?,
                    max_regions: r.u16()?,
                    max_rings: r.u16()?,
                    max_log2_ring_size: r.u8()?,
                    name: r.name(MAX_NAME_LEN)?,
                })
            }
            MessageKind::Init => {
                let mut r = Reader::new(body);
                let version = r.u16()?;
                let is_master = r.u8()? != 0;
                let interface_id = r.u32()?;
                let mode = r.u8()?;
                let name = r.name(MAX_NAME_LEN)?;
                let has_secret = r.u8()? != 0;
                let secret_raw = r.name(MAX_SECRET_LEN)?;
                let secret = if has_secret { Some(secret_raw) } else { None };
                Message::Init(Init {
                    version,
                    is_master,
                    interface_id,
                    mode,
                    name,
                    secret,
                })
            }
            MessageKind::AddRegion => {
                let mut r = Reader::new(body);
                Message::AddRegion(AddRegion {
                    region_index: r.u16()?,
                    region_size: r.u64()?,
                })
            }
            MessageKind::AddRing => {
                let mut r = Reader::new(body);
                let direction = RingDirection::from_u8(r.u8()?)?;
                Message::AddRing(AddRing {
                    direction,
                    ring_index: r.u16()?,
                    region_index: r.u16()?,
                    byte_offset: r.u64()?,
                    log2_ring_size: r.u8()?,
                    flags: r.u16()?,
                })
            }
            MessageKind::Connect => {
                let mut r = Reader::new(body);
                Message::Connect(Connect {
                    name: r.name(MAX_NAME_LEN)?,
                })
            }
            MessageKind::Connected => {
                let mut r = Reader::new(body);
                Message::Connected(Connected {
                    name: r.name(MAX_NAME_LEN)?,
                })
            }
            MessageKind::Disconnect => {
                let mut r = Reader::new(body);
                Message::Disconnect(Disconnect {
                    error_code: r.u32()?,
                    reason: r.name(MAX_REASON_LEN)?,
                })
            }
            MessageKind::Ack => Message::Ack,
        })
    }
}

fn push_name(buf: &mut Vec<u8>, name: &str, cap: usize) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(cap);
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(buf.len() + (cap - n), 0);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::MalformedMessage);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn name(&mut self, cap: usize) -> Result<String> {
        let raw = self.take(cap)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8(raw[..end].to_vec()).map_err(|_| Error::MalformedMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip() {
        let msg = Message::Hello(Hello {
            min_version: 1,
            max_version: 1,
            max_regions: 1,
            max_rings: 2,
            max_log2_ring_size: 10,
            name: "master".into(),
        });
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Hello(h) => {
                assert_eq!(h.name, "master");
                assert_eq!(h.max_rings, 2);
            }
            _ => panic!("wrong kind decoded"),
        }
    }

    #[test]
    fn init_with_secret_roundtrip() {
        let msg = Message::Init(Init {
            version: PROTOCOL_VERSION,
            is_master: false,
            interface_id: 7,
            mode: 0,
            name: "slave".into(),
            secret: Some("shh".into()),
        });
        let decoded = Message::decode(&msg.encode()).unwrap();
        match decoded {
            Message::Init(i) => {
                assert_eq!(i.interface_id, 7);
                assert_eq!(i.secret.as_deref(), Some("shh"));
            }
            _ => panic!("wrong kind decoded"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = vec![0xffu8, 0xff, 0, 0];
        buf.extend_from_slice(&[0u8; 8]);
        assert_eq!(Message::decode(&buf).unwrap_err(), Error::UnknownMessageType);
    }

    #[test]
    fn truncated_message_is_malformed() {
        let buf = vec![1u8, 0, 0, 0];
        assert_eq!(Message::decode(&buf).unwrap_err(), Error::MalformedMessage);
    }
}
