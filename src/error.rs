use core::fmt;

/// Errors returned by the proxy.
///
/// Codec variants (`InvalidLength`, `InvalidValue`, `Eof`) are produced while decoding or encoding
/// packet fields. The remaining variants are operation statuses surfaced by the `Write`/send paths;
/// asynchronous failures are reported through channel events instead.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when trying to fit too much data into a fixed-size buffer, and also when
    /// reaching EOF prematurely while reading data from a buffer.
    Eof,

    /// Malformed caller input (payload over MTU/MPS, invalid handle or CID, wrong transport).
    InvalidArgument,

    /// Operation attempted on a channel that is not running.
    FailedPrecondition,

    /// A fixed-capacity table is full or a credit reservation is past its maximum.
    ResourceExhausted,

    /// Transient resource shortage (Tx queue full, H4 buffer pool exhausted). A `WriteAvailable`
    /// event fires when space returns.
    Unavailable,

    /// No connection is registered for the requested handle.
    NotFound,

    /// A connection for the handle is already being tracked.
    AlreadyExists,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::InvalidArgument => "invalid argument",
            Error::FailedPrecondition => "channel is not running",
            Error::ResourceExhausted => "fixed-capacity resource exhausted",
            Error::Unavailable => "resource temporarily unavailable",
            Error::NotFound => "connection not registered",
            Error::AlreadyExists => "connection already registered",
        })
    }
}

impl std::error::Error for Error {}
