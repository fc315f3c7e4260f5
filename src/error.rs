//! Error types for the WebSocket protocol and codec layers

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the frame codec, the connection drivers and the
/// handshake parser.
///
/// `Eof` and `NeedMore` are continuation signals rather than failures:
/// `Eof` marks a clean end of stream between frames, `NeedMore(n)` tells a
/// push-driven caller how many additional bytes the codec requires before
/// it can make progress.
#[derive(Debug)]
pub enum Error {
    /// Opcode outside {0, 1, 2, 8, 9, 10}
    ReservedOpcode,
    /// Control frame payload longer than 125 bytes
    TooBigPayloadForControlFrame,
    /// Close code outside [1000,1003] ∪ [1007,1011] ∪ [3000,4999]
    InvalidCloseCode,
    /// Control frame without the FIN bit
    FragmentedControlFrame,
    /// Text message or close reason is not valid UTF-8
    InvalidUtf8Payload,
    /// RSV2 or RSV3 bit set
    ReservedRsv,
    /// RSV1 set but permessage-deflate was not negotiated
    DeflateNotSupported,
    /// Continuation frame out of sequence
    InvalidFragmentation,
    /// Clean end of stream, no frame in progress
    Eof,
    /// Stream ended in the middle of a frame
    UnexpectedEof,
    /// Parsing needs this many more bytes to make progress
    NeedMore(usize),
    /// Upgrade request is not a well formed HTTP request
    InvalidHttp(&'static str),
    /// Upgrade request is missing a required header or value
    Handshake(&'static str),
    /// Deflate stream could not be compressed or decompressed
    Compression(&'static str),
    /// I/O error from the underlying stream
    Io(io::Error),
}

impl Error {
    /// True for the protocol violations defined by RFC 6455.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::ReservedOpcode
                | Error::TooBigPayloadForControlFrame
                | Error::InvalidCloseCode
                | Error::FragmentedControlFrame
                | Error::InvalidUtf8Payload
                | Error::ReservedRsv
                | Error::DeflateNotSupported
                | Error::InvalidFragmentation
        )
    }

    /// True when the underlying stream hit its read deadline.
    pub(crate) fn is_deadline(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReservedOpcode => write!(f, "reserved opcode"),
            Error::TooBigPayloadForControlFrame => {
                write!(f, "too big payload for control frame")
            }
            Error::InvalidCloseCode => write!(f, "invalid close code"),
            Error::FragmentedControlFrame => write!(f, "fragmented control frame"),
            Error::InvalidUtf8Payload => write!(f, "invalid utf8 payload"),
            Error::ReservedRsv => write!(f, "reserved rsv bit is set"),
            Error::DeflateNotSupported => {
                write!(f, "rsv1 set but deflate is not supported")
            }
            Error::InvalidFragmentation => write!(f, "invalid frames fragmentation"),
            Error::Eof => write!(f, "end of stream"),
            Error::UnexpectedEof => write!(f, "unexpected end of stream"),
            Error::NeedMore(n) => write!(f, "need {} more bytes", n),
            Error::InvalidHttp(msg) => write!(f, "invalid http request: {}", msg),
            Error::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            Error::Compression(msg) => write!(f, "compression error: {}", msg),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            _ => Error::Io(e),
        }
    }
}
