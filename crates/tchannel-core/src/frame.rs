//! Frame types and body variants.

use std::fmt;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum::ChecksumType;
use crate::error::ErrorCode;
use crate::headers::Headers;
use crate::limits::{INIT_HEADER_HOST_PORT, INIT_HEADER_PROCESS_NAME, PROTOCOL_VERSION};

/// Frame type byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    InitRequest = 0x01,
    InitResponse = 0x02,
    CallRequest = 0x03,
    CallResponse = 0x04,
    CallRequestContinue = 0x13,
    CallResponseContinue = 0x14,
    Cancel = 0xC0,
    Claim = 0xC1,
    PingRequest = 0xD0,
    PingResponse = 0xD1,
    Error = 0xFF,
}

impl FrameType {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0x01 => FrameType::InitRequest,
            0x02 => FrameType::InitResponse,
            0x03 => FrameType::CallRequest,
            0x04 => FrameType::CallResponse,
            0x13 => FrameType::CallRequestContinue,
            0x14 => FrameType::CallResponseContinue,
            0xC0 => FrameType::Cancel,
            0xC1 => FrameType::Claim,
            0xD0 => FrameType::PingRequest,
            0xD1 => FrameType::PingResponse,
            0xFF => FrameType::Error,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::InitRequest => "init-request",
            FrameType::InitResponse => "init-response",
            FrameType::CallRequest => "call-request",
            FrameType::CallResponse => "call-response",
            FrameType::CallRequestContinue => "call-request-continue",
            FrameType::CallResponseContinue => "call-response-continue",
            FrameType::Cancel => "cancel",
            FrameType::Claim => "claim",
            FrameType::PingRequest => "ping-request",
            FrameType::PingResponse => "ping-response",
            FrameType::Error => "error",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Flag byte on call and continue frames.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FragmentFlags: u8 {
        /// More fragments of this call follow.
        const MORE_FRAGMENTS = 0x01;
    }
}

impl FragmentFlags {
    pub fn more(self) -> bool {
        self.contains(FragmentFlags::MORE_FRAGMENTS)
    }
}

/// The 25-byte protocol-level trace block carried by call and error frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceFields {
    pub span_id: u64,
    pub parent_id: u64,
    pub trace_id: u64,
    pub flags: u8,
}

impl TraceFields {
    pub const WIRE_SIZE: usize = 25;

    /// True when no trace has been attached.
    pub fn is_zero(&self) -> bool {
        self.span_id == 0 && self.parent_id == 0 && self.trace_id == 0 && self.flags == 0
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64(self.span_id);
        buf.put_u64(self.parent_id);
        buf.put_u64(self.trace_id);
        buf.put_u8(self.flags);
    }

    pub(crate) fn read_from(buf: &mut Bytes) -> Self {
        // Caller has checked that WIRE_SIZE bytes remain.
        Self {
            span_id: buf.get_u64(),
            parent_id: buf.get_u64(),
            trace_id: buf.get_u64(),
            flags: buf.get_u8(),
        }
    }
}

/// Response code on call-response frames.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseCode {
    #[default]
    Ok = 0x00,
    Error = 0x01,
}

impl ResponseCode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ResponseCode::Ok),
            0x01 => Some(ResponseCode::Error),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Body of init-request and init-response frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitBody {
    pub version: u16,
    pub headers: Headers,
}

impl InitBody {
    /// An init body advertising this implementation's version and identity.
    pub fn new(host_port: &str, process_name: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert(INIT_HEADER_HOST_PORT, host_port);
        headers.insert(INIT_HEADER_PROCESS_NAME, process_name);
        Self {
            version: PROTOCOL_VERSION,
            headers,
        }
    }

    pub fn host_port(&self) -> Option<&str> {
        self.headers.get(INIT_HEADER_HOST_PORT)
    }

    pub fn process_name(&self) -> Option<&str> {
        self.headers.get(INIT_HEADER_PROCESS_NAME)
    }
}

/// Body of the first fragment of a call request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRequestBody {
    pub flags: FragmentFlags,
    pub ttl_ms: u32,
    pub tracing: TraceFields,
    pub service: String,
    pub headers: Headers,
    pub checksum_type: ChecksumType,
    pub checksum: u32,
    /// This fragment's argument byte runs, positionally arg1, arg2, arg3.
    pub args: Vec<Bytes>,
}

/// Body of the first fragment of a call response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResponseBody {
    pub flags: FragmentFlags,
    pub code: ResponseCode,
    pub tracing: TraceFields,
    pub headers: Headers,
    pub checksum_type: ChecksumType,
    pub checksum: u32,
    pub args: Vec<Bytes>,
}

/// Body of call-request-continue and call-response-continue frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinueBody {
    pub flags: FragmentFlags,
    pub checksum_type: ChecksumType,
    pub checksum: u32,
    pub args: Vec<Bytes>,
}

/// Body of error frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub tracing: TraceFields,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            tracing: TraceFields::default(),
            message: message.into(),
        }
    }
}

/// A parsed frame body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameBody {
    InitRequest(InitBody),
    InitResponse(InitBody),
    CallRequest(CallRequestBody),
    CallResponse(CallResponseBody),
    CallRequestContinue(ContinueBody),
    CallResponseContinue(ContinueBody),
    Cancel,
    Claim,
    PingRequest,
    PingResponse,
    Error(ErrorBody),
}

impl FrameBody {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::InitRequest(_) => FrameType::InitRequest,
            FrameBody::InitResponse(_) => FrameType::InitResponse,
            FrameBody::CallRequest(_) => FrameType::CallRequest,
            FrameBody::CallResponse(_) => FrameType::CallResponse,
            FrameBody::CallRequestContinue(_) => FrameType::CallRequestContinue,
            FrameBody::CallResponseContinue(_) => FrameType::CallResponseContinue,
            FrameBody::Cancel => FrameType::Cancel,
            FrameBody::Claim => FrameType::Claim,
            FrameBody::PingRequest => FrameType::PingRequest,
            FrameBody::PingResponse => FrameType::PingResponse,
            FrameBody::Error(_) => FrameType::Error,
        }
    }
}

/// One frame on the wire: a 4-byte id plus a typed body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(id: u32, body: FrameBody) -> Self {
        Self { id, body }
    }

    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }

    /// An error frame addressed to a call (or the connection).
    pub fn error(id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(id, FrameBody::Error(ErrorBody::new(code, message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_roundtrip() {
        for byte in [
            0x01, 0x02, 0x03, 0x04, 0x13, 0x14, 0xC0, 0xC1, 0xD0, 0xD1, 0xFF,
        ] {
            assert_eq!(FrameType::from_u8(byte).unwrap().as_u8(), byte);
        }
        assert_eq!(FrameType::from_u8(0x05), None);
        assert_eq!(FrameType::from_u8(0x00), None);
    }

    #[test]
    fn trace_fields_wire_roundtrip() {
        let fields = TraceFields {
            span_id: 0x0102_0304_0506_0708,
            parent_id: 0x1112_1314_1516_1718,
            trace_id: 0x2122_2324_2526_2728,
            flags: 0x01,
        };
        let mut buf = BytesMut::new();
        fields.write_to(&mut buf);
        assert_eq!(buf.len(), TraceFields::WIRE_SIZE);
        assert_eq!(TraceFields::read_from(&mut buf.freeze()), fields);
    }

    #[test]
    fn init_body_identity() {
        let body = InitBody::new("127.0.0.1:4040", "svc");
        assert_eq!(body.version, PROTOCOL_VERSION);
        assert_eq!(body.host_port(), Some("127.0.0.1:4040"));
        assert_eq!(body.process_name(), Some("svc"));
    }
}
