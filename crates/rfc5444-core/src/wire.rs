//! RFC 5444 packet and message framing.
//!
//! Covers the outer layer of the wire format only: the packet header
//! (version, flags, optional 16-bit packet sequence number, skipped packet
//! TLV block) and the message header (type, flags nibble, address length
//! nibble, size, optional originator / hop limit / hop count / sequence
//! number). Message bodies (TLV blocks and address blocks) are carried as
//! opaque bytes; interpreting them is the job of registered consumers.

use std::fmt;
use std::net::IpAddr;

/// Highest packet size accepted from and emitted to a UDP socket.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Highest size of a single message inside a packet.
pub const MAX_MESSAGE_SIZE: usize = 1280;

/// RFC 5444 protocol version emitted and accepted.
pub const VERSION: u8 = 0;

/// IANA-assigned MANET UDP port (RFC 5498).
pub const MANET_UDP_PORT: u16 = 269;

/// IANA-assigned link-local MANET multicast groups (RFC 5498).
pub const MANET_MULTICAST_V4: [u8; 4] = [224, 0, 0, 109];
pub const MANET_MULTICAST_V6: [u16; 8] = [0xff02, 0, 0, 0, 0, 0, 0, 0x6d];

const PKT_FLAG_HAS_SEQNO: u8 = 0x8;
const PKT_FLAG_HAS_TLV: u8 = 0x4;

const MSG_FLAG_HAS_ORIG: u8 = 0x8;
const MSG_FLAG_HAS_HOPLIMIT: u8 = 0x4;
const MSG_FLAG_HAS_HOPCOUNT: u8 = 0x2;
const MSG_FLAG_HAS_SEQNO: u8 = 0x1;

/// Framing-level parse failure. Mirrors the result codes of a full RFC 5444
/// reader closely enough for logging and drop decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Packet shorter than its own headers claim.
    Truncated,
    /// First header byte carries an unsupported version.
    UnsupportedVersion(u8),
    /// Message size field smaller than the message header itself.
    BadMessageSize,
    /// Address length nibble outside the 1..=16 byte range we accept.
    BadAddressLength(u8),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated => write!(f, "input truncated"),
            ParseError::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            ParseError::BadMessageSize => write!(f, "message size below header size"),
            ParseError::BadAddressLength(l) => write!(f, "unsupported address length {l}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Originator address of a message, sized by the message's address length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Originator {
    buf: [u8; 16],
    len: u8,
}

impl Originator {
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > 16 {
            return None;
        }
        let mut buf = [0u8; 16];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self { buf, len: bytes.len() as u8 })
    }

    pub fn from_ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self { buf: { let mut b = [0u8; 16]; b[..4].copy_from_slice(&v4.octets()); b }, len: 4 },
            IpAddr::V6(v6) => Self { buf: v6.octets(), len: 16 },
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub seqno: Option<u16>,
}

impl PacketHeader {
    /// Encoded size of this header on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + if self.seqno.is_some() { 2 } else { 0 }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.seqno.is_some() {
            flags |= PKT_FLAG_HAS_SEQNO;
        }
        out.push((VERSION << 4) | flags);
        if let Some(seqno) = self.seqno {
            out.extend_from_slice(&seqno.to_be_bytes());
        }
    }

    /// Decode the packet header, returning it together with the offset of
    /// the first message. A packet TLV block, when present, is skipped
    /// without interpretation.
    pub fn decode(buf: &[u8]) -> Result<(PacketHeader, usize), ParseError> {
        let first = *buf.first().ok_or(ParseError::Truncated)?;
        let version = first >> 4;
        if version != VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }
        let flags = first & 0x0f;
        let mut pos = 1usize;

        let seqno = if flags & PKT_FLAG_HAS_SEQNO != 0 {
            let raw = buf.get(pos..pos + 2).ok_or(ParseError::Truncated)?;
            pos += 2;
            Some(u16::from_be_bytes([raw[0], raw[1]]))
        } else {
            None
        };

        if flags & PKT_FLAG_HAS_TLV != 0 {
            let raw = buf.get(pos..pos + 2).ok_or(ParseError::Truncated)?;
            let tlv_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
            pos += 2;
            if buf.len() < pos + tlv_len {
                return Err(ParseError::Truncated);
            }
            pos += tlv_len;
        }

        Ok((PacketHeader { seqno }, pos))
    }
}

/// Decoded message header plus its opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    pub msg_type: u8,
    /// Address length in bytes announced by the header nibble (1..=16).
    pub addr_len: u8,
    pub originator: Option<Originator>,
    pub hop_limit: Option<u8>,
    pub hop_count: Option<u8>,
    pub seqno: Option<u16>,
    /// TLV blocks and address blocks, uninterpreted.
    pub body: &'a [u8],
    /// The complete framed message including its header, for re-emission.
    pub raw: &'a [u8],
}

impl<'a> Message<'a> {
    fn decode(buf: &'a [u8]) -> Result<(Message<'a>, usize), ParseError> {
        let head = buf.get(..4).ok_or(ParseError::Truncated)?;
        let msg_type = head[0];
        let flags = head[1] >> 4;
        let addr_len = (head[1] & 0x0f) + 1;
        let size = u16::from_be_bytes([head[2], head[3]]) as usize;
        if size < 4 {
            return Err(ParseError::BadMessageSize);
        }
        let raw = buf.get(..size).ok_or(ParseError::Truncated)?;
        let mut pos = 4usize;

        let originator = if flags & MSG_FLAG_HAS_ORIG != 0 {
            let bytes = raw
                .get(pos..pos + addr_len as usize)
                .ok_or(ParseError::Truncated)?;
            pos += addr_len as usize;
            Some(Originator::new(bytes).ok_or(ParseError::BadAddressLength(addr_len))?)
        } else {
            None
        };
        let hop_limit = if flags & MSG_FLAG_HAS_HOPLIMIT != 0 {
            let v = *raw.get(pos).ok_or(ParseError::Truncated)?;
            pos += 1;
            Some(v)
        } else {
            None
        };
        let hop_count = if flags & MSG_FLAG_HAS_HOPCOUNT != 0 {
            let v = *raw.get(pos).ok_or(ParseError::Truncated)?;
            pos += 1;
            Some(v)
        } else {
            None
        };
        let seqno = if flags & MSG_FLAG_HAS_SEQNO != 0 {
            let b = raw.get(pos..pos + 2).ok_or(ParseError::Truncated)?;
            pos += 2;
            Some(u16::from_be_bytes([b[0], b[1]]))
        } else {
            None
        };

        Ok((
            Message {
                msg_type,
                addr_len,
                originator,
                hop_limit,
                hop_count,
                seqno,
                body: &raw[pos..],
                raw,
            },
            size,
        ))
    }
}

/// Iterator over the messages of a packet payload (everything after the
/// packet header).
pub struct MessageIter<'a> {
    rest: &'a [u8],
}

impl<'a> MessageIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { rest: payload }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<Message<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match Message::decode(self.rest) {
            Ok((msg, consumed)) => {
                self.rest = &self.rest[consumed..];
                Some(Ok(msg))
            }
            Err(e) => {
                // poison the iterator, a framing error is not recoverable
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}

/// Incrementally frames one message. Used by the packet assembler; the
/// header is fixed up once the body size is known.
#[derive(Debug, Default)]
pub struct MessageFrame {
    pub msg_type: u8,
    pub addr_len: u8,
    pub originator: Option<Originator>,
    pub hop_limit: Option<u8>,
    pub hop_count: Option<u8>,
    pub seqno: Option<u16>,
    pub body: Vec<u8>,
}

impl MessageFrame {
    pub fn new(msg_type: u8) -> Self {
        Self { msg_type, addr_len: 4, ..Default::default() }
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 4;
        if let Some(orig) = &self.originator {
            len += orig.len();
        }
        if self.hop_limit.is_some() {
            len += 1;
        }
        if self.hop_count.is_some() {
            len += 1;
        }
        if self.seqno.is_some() {
            len += 2;
        }
        len + self.body.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = self.encoded_len();
        let mut out = Vec::with_capacity(size);

        let mut flags = 0u8;
        let mut addr_len = self.addr_len.clamp(1, 16);
        if let Some(orig) = &self.originator {
            flags |= MSG_FLAG_HAS_ORIG;
            addr_len = orig.len() as u8;
        }
        if self.hop_limit.is_some() {
            flags |= MSG_FLAG_HAS_HOPLIMIT;
        }
        if self.hop_count.is_some() {
            flags |= MSG_FLAG_HAS_HOPCOUNT;
        }
        if self.seqno.is_some() {
            flags |= MSG_FLAG_HAS_SEQNO;
        }

        out.push(self.msg_type);
        out.push((flags << 4) | (addr_len - 1));
        out.extend_from_slice(&(size as u16).to_be_bytes());
        if let Some(orig) = &self.originator {
            out.extend_from_slice(orig.as_bytes());
        }
        if let Some(hl) = self.hop_limit {
            out.push(hl);
        }
        if let Some(hc) = self.hop_count {
            out.push(hc);
        }
        if let Some(seqno) = self.seqno {
            out.extend_from_slice(&seqno.to_be_bytes());
        }
        out.extend_from_slice(&self.body);
        out
    }
}
