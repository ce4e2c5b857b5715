//! STUN (RFC 5389) Binding Request / XOR-MAPPED-ADDRESS wire codec.
//!
//! TURN relay, message-integrity, and every other RFC 5389/5766 attribute not needed to
//! discover a reflexive address are out of scope here — the source only ever issues a
//! Binding Request and reads the address back out of XOR-MAPPED-ADDRESS.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    #[error("message parse error: {0}")]
    ParseError(String),
    #[error("unsupported address family")]
    UnsupportedAddressFamily,
}

pub type StunResult<T> = Result<T, StunError>;

const MAGIC_COOKIE: u32 = 0x2112A442;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    BindingRequest = 0x0001,
    BindingResponse = 0x0101,
    BindingErrorResponse = 0x0111,
}

impl MessageType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::BindingRequest),
            0x0101 => Some(Self::BindingResponse),
            0x0111 => Some(Self::BindingErrorResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AttributeType {
    XorMappedAddress = 0x0020,
    Software = 0x8022,
}

/// STUN message header.
#[derive(Debug, Clone)]
pub struct StunHeader {
    pub message_type: MessageType,
    pub length: u16,
    pub transaction_id: [u8; 12],
}

#[derive(Debug, Clone)]
pub struct StunAttribute {
    pub attr_type: u16,
    pub value: Bytes,
}

/// A decoded or to-be-encoded STUN message.
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub header: StunHeader,
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Build a Binding Request with a fresh random transaction ID.
    pub fn binding_request() -> Self {
        let mut transaction_id = [0u8; 12];
        for byte in &mut transaction_id {
            *byte = rand::random();
        }
        Self {
            header: StunHeader {
                message_type: MessageType::BindingRequest,
                length: 0,
                transaction_id,
            },
            attributes: Vec::new(),
        }
    }

    fn add_attribute(&mut self, attr_type: u16, value: Bytes) {
        self.attributes.push(StunAttribute { attr_type, value });
    }

    pub fn get_attribute(&self, attr_type: u16) -> Option<&StunAttribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// Decode the XOR-MAPPED-ADDRESS attribute, if present.
    pub fn xor_mapped_address(&self) -> StunResult<Option<SocketAddr>> {
        match self.get_attribute(AttributeType::XorMappedAddress as u16) {
            Some(attr) => decode_xor_address(&attr.value, &self.header.transaction_id).map(Some),
            None => Ok(None),
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20 + 32);

        buf.put_u16(self.header.message_type as u16);
        let attrs_len: usize = self
            .attributes
            .iter()
            .map(|a| 4 + align_to_4(a.value.len()))
            .sum();
        buf.put_u16(attrs_len as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.header.transaction_id);

        for attr in &self.attributes {
            buf.put_u16(attr.attr_type);
            buf.put_u16(attr.value.len() as u16);
            buf.put_slice(&attr.value);
            let padding = (4 - (attr.value.len() % 4)) % 4;
            buf.put_bytes(0, padding);
        }

        buf.freeze()
    }

    /// Decode from wire bytes. Structural only — no transaction-id correlation to any
    /// outstanding request is performed (matching the original, which treats any
    /// successfully-decoded Binding Response as authoritative).
    pub fn decode(data: &[u8]) -> StunResult<Self> {
        if data.len() < 20 {
            return Err(StunError::ParseError("message too short".into()));
        }

        let mut cursor = data;

        let msg_type_raw = cursor.get_u16();
        let message_type = MessageType::from_u16(msg_type_raw)
            .ok_or_else(|| StunError::ParseError(format!("unknown message type: {msg_type_raw}")))?;

        let length = cursor.get_u16();
        let magic = cursor.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::ParseError("invalid magic cookie".into()));
        }

        let mut transaction_id = [0u8; 12];
        cursor.copy_to_slice(&mut transaction_id);

        let header = StunHeader {
            message_type,
            length,
            transaction_id,
        };

        let mut attributes = Vec::new();
        let mut remaining = length as usize;

        while remaining > 0 {
            if cursor.len() < 4 {
                break;
            }
            let attr_type = cursor.get_u16();
            let attr_len = cursor.get_u16() as usize;
            if cursor.len() < attr_len {
                return Err(StunError::ParseError("truncated attribute".into()));
            }
            let value = Bytes::copy_from_slice(&cursor[..attr_len]);
            cursor.advance(attr_len);
            attributes.push(StunAttribute { attr_type, value });

            let padding = (4 - (attr_len % 4)) % 4;
            cursor.advance(padding.min(cursor.len()));
            remaining = remaining.saturating_sub(4 + attr_len + padding);
        }

        Ok(Self { header, attributes })
    }
}

fn align_to_4(value: usize) -> usize {
    (value + 3) & !3
}

fn decode_xor_address(data: &[u8], transaction_id: &[u8; 12]) -> StunResult<SocketAddr> {
    if data.len() < 4 {
        return Err(StunError::ParseError("XOR address too short".into()));
    }

    let mut cursor = data;
    cursor.advance(1); // reserved
    let family = cursor[0];
    cursor.advance(1);

    let xor_port = cursor.get_u16();
    let port = xor_port ^ ((MAGIC_COOKIE >> 16) as u16);

    match family {
        0x01 => {
            if cursor.len() < 4 {
                return Err(StunError::ParseError("IPv4 address truncated".into()));
            }
            let magic_bytes = MAGIC_COOKIE.to_be_bytes();
            let mut octets = [0u8; 4];
            for i in 0..4 {
                octets[i] = cursor[i] ^ magic_bytes[i];
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if cursor.len() < 16 {
                return Err(StunError::ParseError("IPv6 address truncated".into()));
            }
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = cursor[i] ^ xor_key[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::UnsupportedAddressFamily),
    }
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(0);
    match addr {
        SocketAddr::V4(_) => buf.put_u8(0x01),
        SocketAddr::V6(_) => buf.put_u8(0x02),
    }
    let xor_port = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
    buf.put_u16(xor_port);
    match addr.ip() {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            let magic_bytes = MAGIC_COOKIE.to_be_bytes();
            for i in 0..4 {
                buf.put_u8(octets[i] ^ magic_bytes[i]);
            }
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            for i in 0..16 {
                buf.put_u8(octets[i] ^ xor_key[i]);
            }
        }
    }
    buf.freeze()
}

impl StunMessage {
    /// Add an XOR-MAPPED-ADDRESS attribute, e.g. when acting as a minimal STUN server
    /// in tests.
    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) {
        let value = encode_xor_address(addr, &self.header.transaction_id);
        self.add_attribute(AttributeType::XorMappedAddress as u16, value);
    }
}
