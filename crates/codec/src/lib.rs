//! ## Constrained Application Protocol (CoAP) wire codec
//!
//! [RFC7252]: https://tools.ietf.org/html/rfc7252
//! [RFC7959]: https://tools.ietf.org/html/rfc7959
//!
//! CoAP messages are carried as the payload of a single UDP datagram: a
//! fixed 4-byte header, a token, a sorted sequence of TLV options and an
//! optional payload. This crate turns bytes into [`message::Message`]
//! values and back; it has no notion of retransmission, deduplication or
//! blockwise reassembly - those live in `coap-core`.

pub mod message;

use std::{array::TryFromSliceError, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    /// The datagram is shorter than the fixed header, or an option/header
    /// field is out of range.
    InvalidInput,
    /// The token length nibble was 9-15 (reserved by RFC 7252 §3).
    ReservedTokenLength,
    /// An option delta or length used the reserved nibble value 15 outside
    /// of the payload marker position.
    ReservedOptionNibble,
    /// An option extension byte was truncated.
    TryFromSliceError(TryFromSliceError),
    /// An option value that is interpreted as UTF-8 was not valid UTF-8.
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}
