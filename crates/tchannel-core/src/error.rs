use std::fmt;
use std::io;

use crate::frame::FrameType;

/// Wire-level error codes carried by error frames.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid (never sent, reserved).
    Invalid = 0x00,
    /// The call exceeded its ttl.
    Timeout = 0x01,
    /// The caller cancelled the call.
    Cancelled = 0x02,
    /// The peer is overloaded.
    Busy = 0x03,
    /// The peer declined to handle the call.
    Declined = 0x04,
    /// Unexpected internal error on the peer.
    Unexpected = 0x05,
    /// The request was malformed or violated call-level rules.
    BadRequest = 0x06,
    /// A network failure terminated the call.
    Network = 0x07,
    /// The peer considers itself unhealthy.
    Unhealthy = 0x08,
    /// Unrecoverable protocol violation; the connection is going away.
    FatalProtocol = 0xFF,
}

impl ErrorCode {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0x00 => ErrorCode::Invalid,
            0x01 => ErrorCode::Timeout,
            0x02 => ErrorCode::Cancelled,
            0x03 => ErrorCode::Busy,
            0x04 => ErrorCode::Declined,
            0x05 => ErrorCode::Unexpected,
            0x06 => ErrorCode::BadRequest,
            0x07 => ErrorCode::Network,
            0x08 => ErrorCode::Unhealthy,
            0xFF => ErrorCode::FatalProtocol,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        ErrorCode::from_u8(val).ok_or(UnknownErrorCode(val))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Invalid => "invalid",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Busy => "busy",
            ErrorCode::Declined => "declined",
            ErrorCode::Unexpected => "unexpected",
            ErrorCode::BadRequest => "bad-request",
            ErrorCode::Network => "network",
            ErrorCode::Unhealthy => "unhealthy",
            ErrorCode::FatalProtocol => "fatal-protocol",
        };
        f.write_str(name)
    }
}

/// Error when converting from an unknown error-code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownErrorCode(pub u8);

impl fmt::Display for UnknownErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error code: {:#04x}", self.0)
    }
}

impl std::error::Error for UnknownErrorCode {}

/// Envelope-level faults. Any of these is unrecoverable for the connection:
/// the offended side emits `Error(fatal-protocol)` with the connection id and
/// closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The type byte does not name a known frame.
    UnknownFrameType(u8),
    /// The size field claims fewer bytes than the envelope itself.
    ShortFrame { size: usize },
    /// An encoded body would not fit a single frame.
    FrameTooLarge { size: usize },
    /// A length-prefixed field ran past the end of the body.
    Truncated { field: &'static str },
    /// Body bytes were left over after the last defined field.
    TrailingBytes { frame_type: FrameType, len: usize },
    /// A string field held invalid UTF-8.
    InvalidUtf8 { field: &'static str },
    /// A string was too long for its length-prefix field.
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    /// More than three argument chunks in one fragment.
    TooManyArgs { count: usize },
    /// The checksum type byte names no known algorithm.
    UnknownChecksumType(u8),
    /// The error code byte names no known error.
    UnknownErrorCode(u8),
    /// The response code byte names no known response disposition.
    InvalidResponseCode(u8),
    /// The peer advertised a version we do not speak.
    BadVersion(u16),
    /// An init frame was missing a required header.
    MissingInitHeader(&'static str),
    /// A frame arrived that the current connection state forbids.
    UnexpectedFrame {
        frame_type: FrameType,
        state: &'static str,
    },
    /// `arg1` did not fit in the first fragment alongside the call prefix.
    FirstFragmentOverflow { needed: usize, available: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownFrameType(ty) => {
                write!(f, "unknown frame type: {ty:#04x}")
            }
            ProtocolError::ShortFrame { size } => {
                write!(f, "frame size {size} is smaller than the 16-byte envelope")
            }
            ProtocolError::FrameTooLarge { size } => {
                write!(f, "frame of {size} bytes exceeds the 65535-byte limit")
            }
            ProtocolError::Truncated { field } => {
                write!(f, "body ended inside field `{field}`")
            }
            ProtocolError::TrailingBytes { frame_type, len } => {
                write!(f, "{len} trailing bytes after {frame_type} body")
            }
            ProtocolError::InvalidUtf8 { field } => {
                write!(f, "field `{field}` is not valid UTF-8")
            }
            ProtocolError::StringTooLong { field, len, max } => {
                write!(f, "field `{field}` is {len} bytes, limit {max}")
            }
            ProtocolError::TooManyArgs { count } => {
                write!(f, "{count} argument chunks in one fragment, limit 3")
            }
            ProtocolError::UnknownChecksumType(ty) => {
                write!(f, "unknown checksum type: {ty:#04x}")
            }
            ProtocolError::UnknownErrorCode(code) => {
                write!(f, "unknown error code: {code:#04x}")
            }
            ProtocolError::InvalidResponseCode(code) => {
                write!(f, "invalid response code: {code:#04x}")
            }
            ProtocolError::BadVersion(version) => {
                write!(f, "unsupported protocol version: {version}")
            }
            ProtocolError::MissingInitHeader(key) => {
                write!(f, "init frame is missing required header `{key}`")
            }
            ProtocolError::UnexpectedFrame { frame_type, state } => {
                write!(f, "{frame_type} frame is not allowed in state {state}")
            }
            ProtocolError::FirstFragmentOverflow { needed, available } => {
                write!(
                    f,
                    "arg1 needs {needed} bytes but the first fragment has {available}"
                )
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<UnknownErrorCode> for ProtocolError {
    fn from(err: UnknownErrorCode) -> Self {
        ProtocolError::UnknownErrorCode(err.0)
    }
}

/// Call-level validation faults detected while reassembling fragments.
/// These fail the one call; the connection survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFault {
    /// `ttl` was zero on the first fragment.
    ZeroTtl,
    /// The first fragment carried no `arg1` field.
    MissingArg1,
    /// `arg1` exceeded its cap.
    Arg1TooLong { len: usize },
    /// A continuation carried `arg1` bytes.
    Arg1AfterFirstFragment,
    /// A fragment switched checksum algorithms mid-call.
    ChecksumTypeMismatch {
        expected: crate::ChecksumType,
        got: crate::ChecksumType,
    },
    /// The fragment checksum did not verify.
    ChecksumMismatch { expected: u32, computed: u32 },
    /// A fragment arrived after the call's deadline.
    Expired,
    /// A continuation arrived for an id with no open call.
    UnknownId,
}

impl CallFault {
    /// The wire code reported to the peer for this fault.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            CallFault::Expired => ErrorCode::Timeout,
            _ => ErrorCode::BadRequest,
        }
    }
}

impl fmt::Display for CallFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFault::ZeroTtl => write!(f, "ttl must be greater than zero"),
            CallFault::MissingArg1 => write!(f, "first fragment carries no arg1"),
            CallFault::Arg1TooLong { len } => {
                write!(f, "arg1 is {len} bytes, limit {}", crate::MAX_ARG1_SIZE)
            }
            CallFault::Arg1AfterFirstFragment => {
                write!(f, "arg1 bytes after the first fragment")
            }
            CallFault::ChecksumTypeMismatch { expected, got } => {
                write!(f, "checksum type changed mid-call: {expected} then {got}")
            }
            CallFault::ChecksumMismatch { expected, computed } => {
                write!(
                    f,
                    "checksum mismatch: frame says {expected:#010x}, computed {computed:#010x}"
                )
            }
            CallFault::Expired => write!(f, "fragment arrived after the deadline"),
            CallFault::UnknownId => write!(f, "continuation for an unknown id"),
        }
    }
}

impl std::error::Error for CallFault {}

/// Terminal outcome of a call, as surfaced from a completion future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The call exceeded its ttl.
    Timeout,
    /// The caller cancelled the call.
    Cancelled,
    /// The peer reported overload.
    Busy(String),
    /// The peer declined the call.
    Declined(String),
    /// The peer rejected the request as malformed.
    BadRequest(String),
    /// The peer hit an unexpected internal error.
    Unexpected(String),
    /// The peer reported itself unhealthy.
    Unhealthy(String),
    /// A network failure terminated the call.
    Network(String),
    /// A protocol violation terminated the call.
    Protocol(ProtocolError),
    /// The connection went away before the call completed.
    ConnectionClosed,
}

impl CallError {
    /// Map a received wire error code and message onto the local error kind.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::Timeout => CallError::Timeout,
            ErrorCode::Cancelled => CallError::Cancelled,
            ErrorCode::Busy => CallError::Busy(message),
            ErrorCode::Declined => CallError::Declined(message),
            ErrorCode::BadRequest => CallError::BadRequest(message),
            ErrorCode::Network => CallError::Network(message),
            ErrorCode::Unhealthy => CallError::Unhealthy(message),
            _ => CallError::Unexpected(message),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Timeout => write!(f, "call timed out"),
            CallError::Cancelled => write!(f, "call cancelled"),
            CallError::Busy(msg) => write!(f, "peer busy: {msg}"),
            CallError::Declined(msg) => write!(f, "peer declined: {msg}"),
            CallError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            CallError::Unexpected(msg) => write!(f, "unexpected peer error: {msg}"),
            CallError::Unhealthy(msg) => write!(f, "peer unhealthy: {msg}"),
            CallError::Network(msg) => write!(f, "network failure: {msg}"),
            CallError::Protocol(err) => write!(f, "protocol violation: {err}"),
            CallError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProtocolError> for CallError {
    fn from(err: ProtocolError) -> Self {
        CallError::Protocol(err)
    }
}

impl From<CallFault> for CallError {
    fn from(fault: CallFault) -> Self {
        match fault {
            CallFault::Expired => CallError::Timeout,
            other => CallError::BadRequest(other.to_string()),
        }
    }
}

/// Failures at the frame-transport seam.
#[derive(Debug)]
pub enum TransportError {
    /// The transport was closed, locally or by the peer.
    Closed,
    /// The underlying stream failed.
    Io(io::Error),
    /// The byte stream could not be parsed into frames.
    Protocol(ProtocolError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(err) => write!(f, "transport i/o failure: {err}"),
            TransportError::Protocol(err) => write!(f, "transport protocol failure: {err}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(err) => Some(err),
            TransportError::Protocol(err) => Some(err),
            TransportError::Closed => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        TransportError::Protocol(err)
    }
}

/// Driver-level failures that end the connection.
#[derive(Debug)]
pub enum ConnectionError {
    /// A protocol violation forced the connection closed.
    Protocol(ProtocolError),
    /// The transport failed.
    Transport(TransportError),
    /// The peer terminated the connection with an error frame addressed to
    /// the connection id.
    Peer { code: ErrorCode, message: String },
    /// The connection handle is gone; nothing more can be submitted.
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Protocol(err) => write!(f, "connection protocol failure: {err}"),
            ConnectionError::Transport(err) => write!(f, "connection transport failure: {err}"),
            ConnectionError::Peer { code, message } => {
                write!(f, "peer closed the connection ({code}): {message}")
            }
            ConnectionError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Protocol(err) => Some(err),
            ConnectionError::Transport(err) => Some(err),
            ConnectionError::Peer { .. } | ConnectionError::Closed => None,
        }
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        ConnectionError::Protocol(err)
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        ConnectionError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_roundtrip() {
        for byte in [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xFF] {
            let code = ErrorCode::from_u8(byte).unwrap();
            assert_eq!(code.as_u8(), byte);
        }
        assert_eq!(ErrorCode::from_u8(0x42), None);
        assert_eq!(ErrorCode::try_from(0x42), Err(UnknownErrorCode(0x42)));
    }

    #[test]
    fn fault_codes() {
        assert_eq!(CallFault::ZeroTtl.wire_code(), ErrorCode::BadRequest);
        assert_eq!(CallFault::Expired.wire_code(), ErrorCode::Timeout);
        assert_eq!(CallFault::UnknownId.wire_code(), ErrorCode::BadRequest);
    }

    #[test]
    fn from_wire_mapping() {
        assert_eq!(
            CallError::from_wire(ErrorCode::Timeout, String::new()),
            CallError::Timeout
        );
        assert_eq!(
            CallError::from_wire(ErrorCode::Busy, "overloaded".into()),
            CallError::Busy("overloaded".into())
        );
        assert_eq!(
            CallError::from_wire(ErrorCode::FatalProtocol, "boom".into()),
            CallError::Unexpected("boom".into())
        );
    }

    #[test]
    fn display_carries_detail() {
        let err = ProtocolError::StringTooLong {
            field: "service",
            len: 300,
            max: 255,
        };
        let s = err.to_string();
        assert!(s.contains("service"));
        assert!(s.contains("300"));

        let s = CallError::Declined("draining".into()).to_string();
        assert!(s.contains("draining"));
    }
}
