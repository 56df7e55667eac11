use thiserror::Error;

/// Errors raised while decoding a RESP frame from a byte buffer.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("invalid datatype byte {0:#x}")]
    UnknownType(u8),
    #[error("missing \\r\\n terminator")]
    MissingTerminator,
    #[error("invalid length: {0}")]
    InvalidLength(i64),
    #[error("non-utf8 line")]
    InvalidUtf8,
    #[error("invalid integer")]
    InvalidInteger,
}

/// Errors raised while parsing a decoded frame into a [`crate::commands::Command`].
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("syntax error")]
    SyntaxError,
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    #[error("unknown command")]
    Unknown,
}

/// Errors raised while reading or writing the on-disk snapshot format.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic header")]
    BadMagic,
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,
    #[error("unknown opcode {0:#x}")]
    BadOpcode(u8),
    #[error("non-utf8 snapshot version")]
    InvalidVersion,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("value of {0} bytes cannot be length-encoded (max 255)")]
    ValueTooLong(usize),
}

/// Errors raised during the replica-side startup handshake with a primary.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed during handshake")]
    ConnectionClosed,
    #[error("unexpected reply during handshake: {0}")]
    UnexpectedReply(String),
    #[error("malformed FULLRESYNC reply: {0}")]
    MalformedFullresync(String),
    #[error("invalid --replicaof value: {0}")]
    InvalidReplicaOf(String),
}
