//! Error taxonomy. A plain enum implementing `std::error::Error` +
//! `Display`, the same shape as `coap_codec::Error` — `anyhow` stays
//! reserved for the root binary crate.

use crate::block::BlockError;

#[derive(Debug)]
pub enum CoreError {
    /// Malformed bytes, illegal option encoding, reserved TKL.
    Parse(coap_codec::Error),
    /// Duplicate singleton option or invalid option value at construction time.
    BadOption,
    /// The remote name could not be resolved to an address.
    HostLookup,
    /// Transport failure.
    Io(String),
    /// No response within `max_transmit_wait` or a caller-supplied bound.
    Timeout,
    /// The transaction was invalidated by the caller before it finished.
    Cancelled,
    /// A request-handling API was used from a scope that did not declare
    /// response-pending (the inbound request already returned).
    OutOfScope,
    /// No endpoint is available for the URI's scheme.
    UnsupportedScheme,
    /// Blockwise reassembly invariant violated.
    Block(BlockError),
    /// The transaction table ran out of MIDs/tokens for a peer.
    TableFull,
    /// Catch-all runtime fault.
    Protocol(String),
}

impl std::error::Error for CoreError {}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "parse error: {e}"),
            Self::BadOption => write!(f, "bad option"),
            Self::HostLookup => write!(f, "host lookup failed"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "transaction cancelled"),
            Self::OutOfScope => write!(f, "inbound request used out of scope"),
            Self::UnsupportedScheme => write!(f, "unsupported scheme"),
            Self::Block(e) => write!(f, "block reassembly error: {e:?}"),
            Self::TableFull => write!(f, "transaction table full"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl From<coap_codec::Error> for CoreError {
    fn from(value: coap_codec::Error) -> Self {
        Self::Parse(value)
    }
}

impl From<BlockError> for CoreError {
    fn from(value: BlockError) -> Self {
        Self::Block(value)
    }
}

impl From<crate::transaction_table::TableFull> for CoreError {
    fn from(_: crate::transaction_table::TableFull) -> Self {
        Self::TableFull
    }
}
