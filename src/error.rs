use std::io;
use std::net::IpAddr;

/// Errors surfaced by the runtime.
///
/// The transient kinds (`NeedMore`, `WouldBlock`, `Timeout`) are recovered
/// internally by the reactor and the codec connection; they only reach the
/// caller through APIs that are explicitly timed or non-blocking.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The decoder needs more buffered bytes before it can produce a frame.
    #[error("need more data")]
    NeedMore,

    /// A timed poll elapsed without any handler running.
    #[error("operation timed out")]
    Timeout,

    /// The kernel was not ready; arm interest and retry.
    #[error("operation would block")]
    WouldBlock,

    /// The owning object was closed while the operation was armed.
    #[error("operation cancelled")]
    Cancelled,

    /// The object was already closed.
    #[error("already closed")]
    Closed,

    /// Malformed network/address input.
    #[error("invalid address: {0}")]
    Addr(String),

    /// The given IP is not in the multicast range.
    #[error("not a multicast group: {0}")]
    InvalidGroup(IpAddr),

    /// No membership matches the given (group, source, interface) triple.
    #[error("no matching membership: {0}")]
    NotJoined(IpAddr),

    /// The encoder rejected the item; the destination buffer is unchanged.
    #[error("encode: {0}")]
    Encode(String),

    /// The decoder hit an unrecoverable format error.
    #[error("decode: {0}")]
    Decode(String),

    /// Raw OS error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }

    pub fn is_need_more(&self) -> bool {
        matches!(self, Error::NeedMore)
    }

    /// Map an `io::Error`, folding `WouldBlock` into the crate kind.
    pub(crate) fn from_io(err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::WouldBlock {
            Error::WouldBlock
        } else {
            Error::Io(err)
        }
    }
}
