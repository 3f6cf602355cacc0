//! The CoAP message: header, token, options and payload (RFC 7252 §3).
//!
//! Unlike the STUN sibling of this codec, a CoAP [`Message`] is an owned,
//! mutable value: layers in `coap-core` rewrite it in place (strip
//! `Uri-Host`/`Uri-Port`, swap a `Block1`/`Block2` descriptor, bump an
//! `Observe` counter) well after the datagram that produced it has been
//! decoded, so a zero-copy `&[u8]` view (as the sibling STUN codec uses)
//! would just push the mutation into a second allocation at every layer
//! boundary. Encode/decode still operate on byte slices.

use bytes::{BufMut, BytesMut};

use crate::Error;

/// Number of the well-known/critical options this library understands.
/// See RFC 7252 §12.2 and RFC 7959 §2.1.
pub mod option_number {
    pub const IF_MATCH: u16 = 1;
    pub const URI_HOST: u16 = 3;
    pub const ETAG: u16 = 4;
    pub const IF_NONE_MATCH: u16 = 5;
    pub const OBSERVE: u16 = 6;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const LOCATION_QUERY: u16 = 20;
    pub const BLOCK2: u16 = 23;
    pub const BLOCK1: u16 = 27;
    pub const SIZE2: u16 = 28;
    pub const PROXY_URI: u16 = 35;
    pub const PROXY_SCHEME: u16 = 39;
    pub const SIZE1: u16 = 60;

    /// Options that may legally repeat (RFC 7252 §5.4.5).
    pub fn is_repeatable(number: u16) -> bool {
        matches!(
            number,
            URI_PATH | URI_QUERY | ETAG | IF_MATCH | LOCATION_PATH | LOCATION_QUERY
        )
    }

    /// `number & 1`: an unrecognized option with this bit set must be
    /// rejected with `4.02 Bad Option` (if critical) rather than ignored.
    pub fn is_critical(number: u16) -> bool {
        number & 1 == 1
    }

    /// `number & 2`: changes across a proxy cache key unless the
    /// `NoCacheKey` pattern (`number & 0x1E == 0x1C`) applies.
    pub fn is_unsafe(number: u16) -> bool {
        number & 2 == 2
    }

    pub fn is_no_cache_key(number: u16) -> bool {
        number & 0x1E == 0x1C
    }

    /// Whether `number` is one of the option numbers named above. An
    /// inbound critical option outside this set is unrecognized and must
    /// be rejected (RFC 7252 §5.4.1).
    pub fn is_recognized(number: u16) -> bool {
        matches!(
            number,
            IF_MATCH
                | URI_HOST
                | ETAG
                | IF_NONE_MATCH
                | OBSERVE
                | URI_PORT
                | LOCATION_PATH
                | URI_PATH
                | CONTENT_FORMAT
                | MAX_AGE
                | URI_QUERY
                | ACCEPT
                | LOCATION_QUERY
                | BLOCK2
                | BLOCK1
                | SIZE2
                | PROXY_URI
                | PROXY_SCHEME
                | SIZE1
        )
    }
}

/// CoAP message type (RFC 7252 §3, the `T` header field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl Type {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

/// `code.detail` (RFC 7252 §3, §12.1). Stored as the raw byte; `class()`/
/// `detail()` split it as `code >> 5` / `code & 0x1F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);

    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);
    pub const FETCH: Code = Code(0x05);
    pub const PATCH: Code = Code(0x06);
    pub const IPATCH: Code = Code(0x07);

    pub const CONTENT: Code = Code(0x45);
    pub const CREATED: Code = Code(0x41);
    pub const CHANGED: Code = Code(0x44);
    pub const DELETED: Code = Code(0x42);
    pub const VALID: Code = Code(0x43);
    pub const CONTINUE: Code = Code(0x5F);

    pub const BAD_REQUEST: Code = Code(0x80);
    pub const UNAUTHORIZED: Code = Code(0x81);
    pub const BAD_OPTION: Code = Code(0x82);
    pub const FORBIDDEN: Code = Code(0x83);
    pub const NOT_FOUND: Code = Code(0x84);
    pub const METHOD_NOT_ALLOWED: Code = Code(0x85);
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code(0x88);
    pub const PRECONDITION_FAILED: Code = Code(0x8C);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code(0x8D);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code(0x8F);

    pub const INTERNAL_SERVER_ERROR: Code = Code(0xA0);
    pub const NOT_IMPLEMENTED: Code = Code(0xA1);
    pub const BAD_GATEWAY: Code = Code(0xA2);
    pub const SERVICE_UNAVAILABLE: Code = Code(0xA3);
    pub const GATEWAY_TIMEOUT: Code = Code(0xA4);
    pub const PROXYING_NOT_SUPPORTED: Code = Code(0xA5);

    pub fn new(class: u8, detail: u8) -> Self {
        Self((class << 5) | (detail & 0x1F))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self.0 != 0
    }

    pub fn is_response(self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_client_error(self) -> bool {
        self.class() == 4
    }

    pub fn is_server_error(self) -> bool {
        self.class() == 5
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// A single TLV option: `(number, value)`. RFC 7252 §3.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn new(number: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            number,
            value: value.into(),
        }
    }

    /// Big-endian, minimal-length integer view (RFC 7252 §3.2).
    pub fn as_uint(&self) -> u32 {
        self.value
            .iter()
            .fold(0u32, |acc, byte| (acc << 8) | *byte as u32)
    }

    pub fn from_uint(number: u16, value: u32) -> Self {
        let bytes = value.to_be_bytes();
        let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(3);
        Self::new(number, bytes[first_nonzero..].to_vec())
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        Ok(std::str::from_utf8(&self.value)?)
    }
}

/// A decoded `Block1`/`Block2` option value (RFC 7959 §2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockOption {
    pub fn new(num: u32, more: bool, szx: u8) -> Self {
        assert!(szx <= 6, "szx out of range: {szx}");
        Self { num, more, szx }
    }

    /// `2^(szx+4)` bytes, per RFC 7959 §2.2.
    pub fn size(self) -> usize {
        1usize << (self.szx as u32 + 4)
    }

    pub fn decode(option: &CoapOption) -> Option<Self> {
        let raw = option.as_uint();
        let szx = (raw & 0x07) as u8;
        let more = (raw & 0x08) != 0;
        let num = raw >> 4;
        Some(Self { num, more, szx })
    }

    pub fn encode(self, number: u16) -> CoapOption {
        let raw = (self.num << 4) | ((self.more as u32) << 3) | self.szx as u32;
        CoapOption::from_uint(number, raw)
    }
}

/// A parsed (or to-be-encoded) CoAP message (RFC 7252 §3). `Message` does
/// not remember which socket it arrived on or from; `coap-core` pairs it
/// with a `SocketAddr` at the edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: Type,
    pub code: Code,
    pub mid: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: Type, code: Code, mid: u16, token: Vec<u8>) -> Self {
        Self {
            kind,
            code,
            mid,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn empty_ack(mid: u16) -> Self {
        Self::new(Type::Acknowledgement, Code::EMPTY, mid, Vec::new())
    }

    pub fn reset(mid: u16) -> Self {
        Self::new(Type::Reset, Code::EMPTY, mid, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.options.is_empty() && self.payload.is_empty()
    }

    pub fn is_confirmable(&self) -> bool {
        self.kind == Type::Confirmable
    }

    pub fn get_option(&self, number: u16) -> Option<&CoapOption> {
        self.options.iter().find(|o| o.number == number)
    }

    pub fn get_options(&self, number: u16) -> impl Iterator<Item = &CoapOption> {
        self.options.iter().filter(move |o| o.number == number)
    }

    pub fn has_option(&self, number: u16) -> bool {
        self.get_option(number).is_some()
    }

    /// Replace every occurrence of `number`, preserving sort position.
    pub fn set_option(&mut self, number: u16, value: impl Into<Vec<u8>>) {
        self.options.retain(|o| o.number != number);
        self.add_option(CoapOption::new(number, value));
    }

    pub fn add_option(&mut self, option: CoapOption) {
        let pos = self
            .options
            .iter()
            .position(|o| o.number > option.number)
            .unwrap_or(self.options.len());

        self.options.insert(pos, option);
    }

    pub fn remove_option(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    pub fn block_option(&self, number: u16) -> Option<BlockOption> {
        BlockOption::decode(self.get_option(number)?)
    }

    pub fn set_block_option(&mut self, number: u16, block: BlockOption) {
        self.options.retain(|o| o.number != number);
        self.add_option(block.encode(number));
    }

    /// Encode the message onto a fresh buffer (RFC 7252 §3).
    pub fn encode(&self) -> Result<BytesMut, Error> {
        if self.token.len() > 8 {
            return Err(Error::InvalidInput);
        }

        let mut bytes = BytesMut::with_capacity(32 + self.payload.len());

        let first = (1u8 << 6) | (self.kind.to_bits() << 4) | self.token.len() as u8;
        bytes.put_u8(first);
        bytes.put_u8(self.code.0);
        bytes.put_u16(self.mid);
        bytes.put_slice(&self.token);

        let mut running = 0u16;
        for option in &self.options {
            if option.number < running {
                return Err(Error::InvalidInput);
            }

            let delta = option.number - running;
            running = option.number;
            write_option(&mut bytes, delta, &option.value);
        }

        if !self.payload.is_empty() {
            bytes.put_u8(0xFF);
            bytes.put_slice(&self.payload);
        }

        Ok(bytes)
    }

    /// Decode a datagram into a message (RFC 7252 §3).
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let version = bytes[0] >> 6;
        if version != 1 {
            return Err(Error::InvalidInput);
        }

        let kind = Type::from_bits((bytes[0] >> 4) & 0x03);
        let tkl = (bytes[0] & 0x0F) as usize;
        if tkl > 8 {
            return Err(Error::ReservedTokenLength);
        }

        let code = Code(bytes[1]);
        let mid = u16::from_be_bytes([bytes[2], bytes[3]]);

        if bytes.len() < 4 + tkl {
            return Err(Error::InvalidInput);
        }

        let token = bytes[4..4 + tkl].to_vec();
        let mut offset = 4 + tkl;

        let mut options = Vec::new();
        let mut running = 0u16;

        while offset < bytes.len() {
            if bytes[offset] == 0xFF {
                offset += 1;
                break;
            }

            let delta_nibble = bytes[offset] >> 4;
            let length_nibble = bytes[offset] & 0x0F;
            offset += 1;

            let delta = read_extension(bytes, &mut offset, delta_nibble)?;
            let length = read_extension(bytes, &mut offset, length_nibble)? as usize;

            if offset + length > bytes.len() {
                return Err(Error::InvalidInput);
            }

            running = running
                .checked_add(delta as u16)
                .ok_or(Error::InvalidInput)?;
            options.push(CoapOption::new(running, bytes[offset..offset + length].to_vec()));
            offset += length;
        }

        let payload = bytes[offset..].to_vec();

        Ok(Self {
            kind,
            code,
            mid,
            token,
            options,
            payload,
        })
    }
}

fn write_option(bytes: &mut BytesMut, delta: u16, value: &[u8]) {
    let (delta_nibble, delta_ext) = split_extension(delta as u32);
    let (length_nibble, length_ext) = split_extension(value.len() as u32);

    bytes.put_u8((delta_nibble << 4) | length_nibble);
    put_extension(bytes, delta_ext);
    put_extension(bytes, length_ext);
    bytes.put_slice(value);
}

enum Extension {
    None,
    OneByte(u8),
    TwoBytes(u16),
}

fn split_extension(value: u32) -> (u8, Extension) {
    if value < 13 {
        (value as u8, Extension::None)
    } else if value < 269 {
        (13, Extension::OneByte((value - 13) as u8))
    } else {
        (14, Extension::TwoBytes((value - 269) as u16))
    }
}

fn put_extension(bytes: &mut BytesMut, ext: Extension) {
    match ext {
        Extension::None => {}
        Extension::OneByte(b) => bytes.put_u8(b),
        Extension::TwoBytes(v) => bytes.put_u16(v),
    }
}

fn read_extension(bytes: &[u8], offset: &mut usize, nibble: u8) -> Result<u32, Error> {
    match nibble {
        15 => Err(Error::ReservedOptionNibble),
        13 => {
            if *offset >= bytes.len() {
                return Err(Error::InvalidInput);
            }
            let value = bytes[*offset] as u32 + 13;
            *offset += 1;
            Ok(value)
        }
        14 => {
            if *offset + 2 > bytes.len() {
                return Err(Error::InvalidInput);
            }
            let value = u16::from_be_bytes([bytes[*offset], bytes[*offset + 1]]) as u32 + 269;
            *offset += 2;
            Ok(value)
        }
        n => Ok(n as u32),
    }
}
