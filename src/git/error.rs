use thiserror::Error;

/// Malformed pkt-line framing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PktLineError {
    /// The 4-byte length header is not four hex digits.
    #[error("invalid pkt-line length header {0:?}")]
    InvalidLengthHeader(String),

    /// Fewer than 4 bytes remain where a length header was expected.
    #[error("truncated pkt-line header: {remaining} byte(s) left")]
    TruncatedHeader { remaining: usize },

    /// The declared length runs past the end of the buffer.
    #[error("pkt-line declares {declared} bytes but only {remaining} remain")]
    LengthExceedsBuffer { declared: usize, remaining: usize },

    /// A line is too long to be framed with a 4-hex-digit length.
    #[error("pkt-line payload of {0} bytes exceeds the maximum")]
    LineTooLong(usize),
}

/// The response framing was valid but its content was not what the protocol expects.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("fetch response has no packfile section")]
    MissingPackfile,

    #[error("malformed ref line {0:?}")]
    MalformedRef(String),

    #[error("unexpected line in response: {0:?}")]
    UnexpectedLine(String),

    #[error("remote error: {0}")]
    RemoteError(String),
}

/// Structural problems with the packfile container.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackfileError {
    #[error("invalid pack header: expected \"PACK\"")]
    InvalidPackHeader,

    #[error("unsupported pack version {0}")]
    UnsupportedVersion(u32),

    #[error("pack declares {count} objects, limit is {max}")]
    TooManyObjects { count: u32, max: u32 },

    #[error("object declares {size} bytes, limit is {max}")]
    ObjectTooLarge { size: u64, max: u64 },

    #[error("pack of {size} bytes exceeds limit of {max}")]
    PackTooLarge { size: usize, max: usize },

    #[error("object inflated to {actual} bytes, header declared {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("unsupported object type tag {0}")]
    UnsupportedObjectType(u8),

    #[error("pack truncated while reading {0}")]
    Truncated(&'static str),

    #[error("variable-length integer overflows while reading {0}")]
    VarintOverflow(&'static str),

    #[error("corrupt zlib stream: {0}")]
    CorruptStream(String),

    #[error("{0} byte(s) after the last object record")]
    TrailingBytes(usize),

    #[error("pack checksum mismatch: trailer {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Failures while resolving or applying a delta.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    /// A delta names a base object that is not in this pack.
    #[error("delta base {0} not found")]
    DanglingBase(String),

    #[error("delta source size {expected} does not match base length {actual}")]
    SourceSizeMismatch { expected: u64, actual: u64 },

    #[error("copy of {size} bytes at offset {offset} is out of range (base {base_len}, remaining {remaining})")]
    InvalidCopyRange {
        offset: u64,
        size: u64,
        base_len: usize,
        remaining: u64,
    },

    #[error("reserved delta opcode 0")]
    InvalidOpcode,

    #[error("delta stream ended before the target was complete")]
    Truncated,

    #[error("insert of {size} bytes overruns the target (remaining {remaining})")]
    TargetSizeExceeded { size: u64, remaining: u64 },

    #[error("{0} byte(s) left in delta after the target was complete")]
    TrailingData(usize),

    #[error("delta size header overflows")]
    SizeOverflow,
}

/// Malformed commit or tree bodies.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectParseError {
    #[error("{kind} is missing the {field} field")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("invalid object hash {0:?}")]
    InvalidHash(String),

    #[error("invalid signature {0:?}")]
    InvalidSignature(String),

    #[error("invalid tree entry mode {0:?}")]
    InvalidMode(String),

    #[error("tree entry truncated at byte {0}")]
    TruncatedTreeEntry(usize),

    #[error("object is not valid utf-8: {0}")]
    InvalidUtf8(String),
}

/// Any error produced by the protocol core.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GitError {
    #[error(transparent)]
    Framing(#[from] PktLineError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Packfile(#[from] PackfileError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error(transparent)]
    Object(#[from] ObjectParseError),

    /// A walk or lookup referenced an object that was not decoded.
    #[error("object {0} not found")]
    ObjectNotFound(String),
}
