//! STUN messages (RFC 5389), limited to what Binding needs: plain requests
//! to a public server, and ICE connectivity checks signed with short-term
//! credentials (MESSAGE-INTEGRITY plus FINGERPRINT).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;

const FINGERPRINT_XOR: u32 = 0x5354_554E;
const INTEGRITY_LEN: usize = 20;

/// Attribute type codes.
pub mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
}

pub type TransactionId = [u8; 12];

pub fn new_transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    id.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..12]);
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    BindingRequest,
    BindingSuccess,
    BindingError,
}

impl MessageType {
    fn code(self) -> u16 {
        match self {
            MessageType::BindingRequest => 0x0001,
            MessageType::BindingSuccess => 0x0101,
            MessageType::BindingError => 0x0111,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(MessageType::BindingRequest),
            0x0101 => Some(MessageType::BindingSuccess),
            0x0111 => Some(MessageType::BindingError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Binding Request with a fresh transaction id.
    pub fn binding_request() -> Self {
        Self::new(MessageType::BindingRequest, new_transaction_id())
    }

    /// Success response telling the requester which address we saw.
    pub fn success_response(transaction_id: TransactionId, mapped: SocketAddr) -> Self {
        let value = xor_address(mapped, &transaction_id);
        Self::new(MessageType::BindingSuccess, transaction_id).with(attr::XOR_MAPPED_ADDRESS, value)
    }

    pub fn with(mut self, kind: u16, value: impl Into<Vec<u8>>) -> Self {
        self.attributes.push(Attribute {
            kind,
            value: value.into(),
        });
        self
    }

    pub fn attribute(&self, kind: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value.as_slice())
    }

    pub fn username(&self) -> Option<&str> {
        std::str::from_utf8(self.attribute(attr::USERNAME)?).ok()
    }

    /// XOR-MAPPED-ADDRESS, or MAPPED-ADDRESS from servers that predate it.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        if let Some(value) = self.attribute(attr::XOR_MAPPED_ADDRESS) {
            return unxor_address(value, &self.transaction_id);
        }
        plain_address(self.attribute(attr::MAPPED_ADDRESS)?)
    }

    /// Wire bytes. With a key, MESSAGE-INTEGRITY and FINGERPRINT close the
    /// message; any such attributes already present are not re-emitted.
    pub fn encode(&self, key: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 96);
        buf.extend_from_slice(&self.message_type.code().to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);

        for a in &self.attributes {
            if a.kind != attr::MESSAGE_INTEGRITY && a.kind != attr::FINGERPRINT {
                put_attribute(&mut buf, a.kind, &a.value);
            }
        }

        let Some(key) = key else {
            set_length(&mut buf, 0);
            return buf;
        };

        // Both trailers are computed with the length already covering them.
        set_length(&mut buf, 4 + INTEGRITY_LEN);
        if let Some(mac) = integrity(key, &buf) {
            put_attribute(&mut buf, attr::MESSAGE_INTEGRITY, &mac);
        } else {
            set_length(&mut buf, 0);
        }
        set_length(&mut buf, 8);
        let fingerprint = crc32(&buf) ^ FINGERPRINT_XOR;
        put_attribute(&mut buf, attr::FINGERPRINT, &fingerprint.to_be_bytes());
        buf
    }

    /// Parse a datagram. None if it is not STUN, is truncated, or carries a
    /// FINGERPRINT that does not match.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN || data[0] & 0xC0 != 0 {
            return None;
        }
        if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != MAGIC_COOKIE {
            return None;
        }
        let message_type = MessageType::from_code(u16::from_be_bytes([data[0], data[1]]))?;
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..HEADER_LEN]);

        let end = HEADER_LEN + usize::from(u16::from_be_bytes([data[2], data[3]]));
        if end > data.len() {
            return None;
        }

        let mut message = Self::new(message_type, transaction_id);
        for (offset, kind, value) in attributes(&data[..end]) {
            if kind == attr::FINGERPRINT {
                let expected = crc32(&data[..offset]) ^ FINGERPRINT_XOR;
                if value != &expected.to_be_bytes()[..] {
                    return None;
                }
            }
            message.attributes.push(Attribute {
                kind,
                value: value.to_vec(),
            });
        }
        Some(message)
    }
}

/// Check MESSAGE-INTEGRITY of a raw message against `key`. Messages
/// without the attribute fail.
pub fn verify_integrity(data: &[u8], key: &[u8]) -> bool {
    if data.len() < HEADER_LEN {
        return false;
    }
    let end = (HEADER_LEN + usize::from(u16::from_be_bytes([data[2], data[3]]))).min(data.len());
    let Some((offset, received)) = attributes(&data[..end])
        .find(|(_, kind, _)| *kind == attr::MESSAGE_INTEGRITY)
        .map(|(offset, _, value)| (offset, value))
    else {
        return false;
    };
    if received.len() != INTEGRITY_LEN {
        return false;
    }

    let mut signed = data[..offset].to_vec();
    set_length(&mut signed, 4 + INTEGRITY_LEN);
    match HmacSha1::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(&signed);
            mac.verify_slice(received).is_ok()
        }
        Err(_) => false,
    }
}

/// `(offset, type, value)` for each attribute after the header.
fn attributes(data: &[u8]) -> impl Iterator<Item = (usize, u16, &[u8])> {
    let mut pos = HEADER_LEN;
    std::iter::from_fn(move || {
        if pos + 4 > data.len() {
            return None;
        }
        let kind = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let len = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        let start = pos + 4;
        let value = data.get(start..start + len)?;
        let offset = pos;
        pos = start + ((len + 3) & !3);
        Some((offset, kind, value))
    })
}

fn put_attribute(buf: &mut Vec<u8>, kind: u16, value: &[u8]) {
    buf.extend_from_slice(&kind.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + (4 - value.len() % 4) % 4, 0);
}

/// Write the header length: attributes so far plus `pending` bytes.
fn set_length(buf: &mut [u8], pending: usize) {
    let len = (buf.len() - HEADER_LEN + pending) as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}

fn integrity(key: &[u8], data: &[u8]) -> Option<[u8; INTEGRITY_LEN]> {
    let mut mac = HmacSha1::new_from_slice(key).ok()?;
    mac.update(data);
    let mut out = [0u8; INTEGRITY_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Some(out)
}

/// CRC-32 (IEEE, reflected) as FINGERPRINT uses it.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// XOR key for an address: the cookie, then the transaction id for IPv6.
fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let key = xor_key(transaction_id);
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let (family, octets): (u8, Vec<u8>) = match addr.ip() {
        IpAddr::V4(ip) => (0x01, ip.octets().to_vec()),
        IpAddr::V6(ip) => (0x02, ip.octets().to_vec()),
    };

    let mut value = vec![0, family];
    value.extend_from_slice(&port.to_be_bytes());
    value.extend(octets.iter().zip(key.iter()).map(|(b, k)| b ^ k));
    value
}

fn unxor_address(value: &[u8], transaction_id: &TransactionId) -> Option<SocketAddr> {
    let key = xor_key(transaction_id);
    let port = u16::from_be_bytes([*value.get(2)?, *value.get(3)?]) ^ (MAGIC_COOKIE >> 16) as u16;
    let mut octets = [0u8; 16];
    let width = match *value.get(1)? {
        0x01 => 4,
        0x02 => 16,
        _ => return None,
    };
    let raw = value.get(4..4 + width)?;
    for (i, b) in raw.iter().enumerate() {
        octets[i] = b ^ key[i];
    }

    let ip = if width == 4 {
        IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
    } else {
        IpAddr::V6(Ipv6Addr::from(octets))
    };
    Some(SocketAddr::new(ip, port))
}

fn plain_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}
