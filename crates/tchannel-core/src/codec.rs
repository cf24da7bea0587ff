//! Frame envelope and body codec.
//!
//! `decode` consumes whole frames out of a read buffer, returning `None`
//! until a complete frame is buffered. `encode` appends one frame to a write
//! buffer, refusing bodies that cannot fit the 2-byte size field. Every
//! multi-byte integer is big-endian; reserved envelope bytes are written as
//! zero and ignored on reception.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum::ChecksumType;
use crate::error::{ErrorCode, ProtocolError};
use crate::frame::{
    CallRequestBody, CallResponseBody, ContinueBody, ErrorBody, Frame, FrameBody, FrameType,
    FragmentFlags, InitBody, ResponseCode, TraceFields,
};
use crate::headers::{
    decode_call_headers, decode_init_headers, encode_call_headers, encode_init_headers,
};
use crate::limits::{FRAME_HEADER_SIZE, MAX_BODY_SIZE, MAX_SERVICE_SIZE};

/// Decode one frame from the front of `buf`, or `None` if a whole frame has
/// not been buffered yet.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if size < FRAME_HEADER_SIZE {
        return Err(ProtocolError::ShortFrame { size });
    }
    if buf.len() < size {
        return Ok(None);
    }

    let mut frame = buf.split_to(size).freeze();
    frame.advance(2);
    let type_byte = frame.get_u8();
    frame.advance(1); // reserved
    let id = frame.get_u32();
    frame.advance(8); // reserved

    let frame_type =
        FrameType::from_u8(type_byte).ok_or(ProtocolError::UnknownFrameType(type_byte))?;
    let body = decode_body(frame_type, frame)?;
    Ok(Some(Frame { id, body }))
}

/// Append one encoded frame to `buf`.
pub fn encode(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut body = BytesMut::new();
    encode_body(&frame.body, &mut body)?;
    if body.len() > MAX_BODY_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: FRAME_HEADER_SIZE + body.len(),
        });
    }

    buf.reserve(FRAME_HEADER_SIZE + body.len());
    buf.put_u16((FRAME_HEADER_SIZE + body.len()) as u16);
    buf.put_u8(frame.body.frame_type().as_u8());
    buf.put_u8(0);
    buf.put_u32(frame.id);
    buf.put_slice(&[0u8; 8]);
    buf.put_slice(&body);
    Ok(())
}

fn decode_body(frame_type: FrameType, mut buf: Bytes) -> Result<FrameBody, ProtocolError> {
    let body = match frame_type {
        FrameType::InitRequest => FrameBody::InitRequest(decode_init(&mut buf, frame_type)?),
        FrameType::InitResponse => FrameBody::InitResponse(decode_init(&mut buf, frame_type)?),
        FrameType::CallRequest => {
            let flags = FragmentFlags::from_bits_truncate(get_u8(&mut buf, "flags")?);
            let ttl_ms = get_u32(&mut buf, "ttl")?;
            let tracing = get_tracing(&mut buf)?;
            let service = get_str_u8(&mut buf, "service")?;
            let headers = decode_call_headers(&mut buf)?;
            let (checksum_type, checksum) = get_checksum(&mut buf)?;
            let args = decode_args(&mut buf)?;
            FrameBody::CallRequest(CallRequestBody {
                flags,
                ttl_ms,
                tracing,
                service,
                headers,
                checksum_type,
                checksum,
                args,
            })
        }
        FrameType::CallResponse => {
            let flags = FragmentFlags::from_bits_truncate(get_u8(&mut buf, "flags")?);
            let code_byte = get_u8(&mut buf, "code")?;
            let code = ResponseCode::from_u8(code_byte)
                .ok_or(ProtocolError::InvalidResponseCode(code_byte))?;
            let tracing = get_tracing(&mut buf)?;
            let headers = decode_call_headers(&mut buf)?;
            let (checksum_type, checksum) = get_checksum(&mut buf)?;
            let args = decode_args(&mut buf)?;
            FrameBody::CallResponse(CallResponseBody {
                flags,
                code,
                tracing,
                headers,
                checksum_type,
                checksum,
                args,
            })
        }
        FrameType::CallRequestContinue | FrameType::CallResponseContinue => {
            let flags = FragmentFlags::from_bits_truncate(get_u8(&mut buf, "flags")?);
            let (checksum_type, checksum) = get_checksum(&mut buf)?;
            let args = decode_args(&mut buf)?;
            let body = ContinueBody {
                flags,
                checksum_type,
                checksum,
                args,
            };
            if frame_type == FrameType::CallRequestContinue {
                FrameBody::CallRequestContinue(body)
            } else {
                FrameBody::CallResponseContinue(body)
            }
        }
        // Addressed purely by id; body bytes, if any, are ignored.
        FrameType::Cancel => FrameBody::Cancel,
        FrameType::Claim => FrameBody::Claim,
        FrameType::PingRequest => FrameBody::PingRequest,
        FrameType::PingResponse => FrameBody::PingResponse,
        FrameType::Error => {
            let code = ErrorCode::try_from(get_u8(&mut buf, "code")?)?;
            let tracing = get_tracing(&mut buf)?;
            let message = get_str_u16(&mut buf, "message")?;
            if buf.has_remaining() {
                return Err(ProtocolError::TrailingBytes {
                    frame_type,
                    len: buf.remaining(),
                });
            }
            FrameBody::Error(ErrorBody {
                code,
                tracing,
                message,
            })
        }
    };
    Ok(body)
}

fn encode_body(body: &FrameBody, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    match body {
        FrameBody::InitRequest(init) | FrameBody::InitResponse(init) => {
            buf.put_u16(init.version);
            encode_init_headers(&init.headers, buf)?;
        }
        FrameBody::CallRequest(call) => {
            buf.put_u8(call.flags.bits());
            buf.put_u32(call.ttl_ms);
            call.tracing.write_to(buf);
            if call.service.len() > MAX_SERVICE_SIZE {
                return Err(ProtocolError::StringTooLong {
                    field: "service",
                    len: call.service.len(),
                    max: MAX_SERVICE_SIZE,
                });
            }
            put_str_u8(&call.service, "service", buf)?;
            encode_call_headers(&call.headers, buf)?;
            put_checksum(call.checksum_type, call.checksum, buf);
            encode_args(&call.args, buf)?;
        }
        FrameBody::CallResponse(res) => {
            buf.put_u8(res.flags.bits());
            buf.put_u8(res.code.as_u8());
            res.tracing.write_to(buf);
            encode_call_headers(&res.headers, buf)?;
            put_checksum(res.checksum_type, res.checksum, buf);
            encode_args(&res.args, buf)?;
        }
        FrameBody::CallRequestContinue(cont) | FrameBody::CallResponseContinue(cont) => {
            buf.put_u8(cont.flags.bits());
            put_checksum(cont.checksum_type, cont.checksum, buf);
            encode_args(&cont.args, buf)?;
        }
        FrameBody::Cancel | FrameBody::Claim | FrameBody::PingRequest | FrameBody::PingResponse => {
        }
        FrameBody::Error(err) => {
            buf.put_u8(err.code.as_u8());
            err.tracing.write_to(buf);
            put_str_u16(&err.message, "message", buf)?;
        }
    }
    Ok(())
}

fn decode_init(buf: &mut Bytes, frame_type: FrameType) -> Result<InitBody, ProtocolError> {
    let version = get_u16(buf, "version")?;
    let headers = decode_init_headers(buf)?;
    if buf.has_remaining() {
        return Err(ProtocolError::TrailingBytes {
            frame_type,
            len: buf.remaining(),
        });
    }
    Ok(InitBody { version, headers })
}

fn decode_args(buf: &mut Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    let mut args = Vec::new();
    while buf.has_remaining() {
        if args.len() == 3 {
            return Err(ProtocolError::TooManyArgs { count: 4 });
        }
        let len = get_u16(buf, "arg length")? as usize;
        args.push(get_bytes(buf, len, "arg bytes")?);
    }
    Ok(args)
}

fn encode_args(args: &[Bytes], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if args.len() > 3 {
        return Err(ProtocolError::TooManyArgs { count: args.len() });
    }
    for arg in args {
        if arg.len() > u16::MAX as usize {
            return Err(ProtocolError::StringTooLong {
                field: "arg",
                len: arg.len(),
                max: u16::MAX as usize,
            });
        }
        buf.put_u16(arg.len() as u16);
        buf.put_slice(arg);
    }
    Ok(())
}

fn get_checksum(buf: &mut Bytes) -> Result<(ChecksumType, u32), ProtocolError> {
    let type_byte = get_u8(buf, "checksum type")?;
    let checksum_type =
        ChecksumType::from_u8(type_byte).ok_or(ProtocolError::UnknownChecksumType(type_byte))?;
    let checksum = if checksum_type == ChecksumType::None {
        0
    } else {
        get_u32(buf, "checksum")?
    };
    Ok((checksum_type, checksum))
}

fn put_checksum(checksum_type: ChecksumType, checksum: u32, buf: &mut BytesMut) {
    buf.put_u8(checksum_type.as_u8());
    if checksum_type != ChecksumType::None {
        buf.put_u32(checksum);
    }
}

fn get_tracing(buf: &mut Bytes) -> Result<TraceFields, ProtocolError> {
    if buf.remaining() < TraceFields::WIRE_SIZE {
        return Err(ProtocolError::Truncated { field: "tracing" });
    }
    Ok(TraceFields::read_from(buf))
}

// Length-checked field readers. Every read validates against the remaining
// body so a lying length prefix surfaces as `Truncated` instead of a panic.

pub(crate) fn get_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut Bytes, field: &'static str) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_bytes(
    buf: &mut Bytes,
    len: usize,
    field: &'static str,
) -> Result<Bytes, ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(buf.split_to(len))
}

pub(crate) fn get_str_u8(buf: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let len = get_u8(buf, field)? as usize;
    let bytes = get_bytes(buf, len, field)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
}

pub(crate) fn get_str_u16(buf: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let len = get_u16(buf, field)? as usize;
    let bytes = get_bytes(buf, len, field)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
}

pub(crate) fn put_str_u8(
    s: &str,
    field: &'static str,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if s.len() > u8::MAX as usize {
        return Err(ProtocolError::StringTooLong {
            field,
            len: s.len(),
            max: u8::MAX as usize,
        });
    }
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn put_str_u16(
    s: &str,
    field: &'static str,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if s.len() > u16::MAX as usize {
        return Err(ProtocolError::StringTooLong {
            field,
            len: s.len(),
            max: u16::MAX as usize,
        });
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use crate::limits::MAX_FRAME_SIZE;

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf).unwrap();
        // Size field equals total frame length.
        let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(size, buf.len());
        assert!(size <= MAX_FRAME_SIZE);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded, frame);
    }

    fn sample_tracing() -> TraceFields {
        TraceFields {
            span_id: 7,
            parent_id: 3,
            trace_id: 99,
            flags: 1,
        }
    }

    #[test]
    fn init_roundtrip() {
        roundtrip(Frame::new(
            1,
            FrameBody::InitRequest(InitBody::new("127.0.0.1:4040", "a")),
        ));
        roundtrip(Frame::new(
            1,
            FrameBody::InitResponse(InitBody::new("127.0.0.1:4041", "b")),
        ));
    }

    #[test]
    fn call_request_roundtrip() {
        let headers: Headers = [("cn", "caller"), ("as", "json")].into_iter().collect();
        roundtrip(Frame::new(
            2,
            FrameBody::CallRequest(CallRequestBody {
                flags: FragmentFlags::MORE_FRAGMENTS,
                ttl_ms: 1000,
                tracing: sample_tracing(),
                service: "svc".into(),
                headers,
                checksum_type: ChecksumType::Crc32,
                checksum: 0xDEAD_BEEF,
                args: vec![
                    Bytes::from_static(b"endpoint"),
                    Bytes::new(),
                    Bytes::from_static(b"{}"),
                ],
            }),
        ));
    }

    #[test]
    fn call_response_roundtrip() {
        roundtrip(Frame::new(
            2,
            FrameBody::CallResponse(CallResponseBody {
                flags: FragmentFlags::empty(),
                code: ResponseCode::Error,
                tracing: TraceFields::default(),
                headers: Headers::new(),
                checksum_type: ChecksumType::None,
                checksum: 0,
                args: vec![Bytes::new(), Bytes::new(), Bytes::from_static(b"oops")],
            }),
        ));
    }

    #[test]
    fn continue_roundtrip() {
        let body = ContinueBody {
            flags: FragmentFlags::empty(),
            checksum_type: ChecksumType::Crc32c,
            checksum: 42,
            args: vec![Bytes::new(), Bytes::new(), Bytes::from_static(b"tail")],
        };
        roundtrip(Frame::new(9, FrameBody::CallRequestContinue(body.clone())));
        roundtrip(Frame::new(9, FrameBody::CallResponseContinue(body)));
    }

    #[test]
    fn control_frames_roundtrip() {
        roundtrip(Frame::new(5, FrameBody::Cancel));
        roundtrip(Frame::new(5, FrameBody::Claim));
        roundtrip(Frame::new(6, FrameBody::PingRequest));
        roundtrip(Frame::new(6, FrameBody::PingResponse));
        roundtrip(Frame::error(7, ErrorCode::Busy, "try later"));
    }

    #[test]
    fn incomplete_returns_none() {
        let frame = Frame::new(3, FrameBody::PingRequest);
        let mut encoded = BytesMut::new();
        encode(&frame, &mut encoded).unwrap();

        // Feed the bytes one at a time; no prefix may decode.
        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            if i + 1 < encoded.len() {
                buf.put_u8(*byte);
                assert_eq!(decode(&mut buf).unwrap(), None, "decoded at {} bytes", i + 1);
            }
        }
        buf.put_u8(encoded[encoded.len() - 1]);
        assert_eq!(decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        encode(&Frame::new(1, FrameBody::PingRequest), &mut buf).unwrap();
        encode(&Frame::new(2, FrameBody::PingResponse), &mut buf).unwrap();
        assert_eq!(decode(&mut buf).unwrap().unwrap().id, 1);
        assert_eq!(decode(&mut buf).unwrap().unwrap().id, 2);
        assert_eq!(decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn unknown_type_is_fatal() {
        let mut buf = BytesMut::new();
        encode(&Frame::new(1, FrameBody::PingRequest), &mut buf).unwrap();
        buf[2] = 0x55;
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownFrameType(0x55));
    }

    #[test]
    fn short_size_field_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        buf.put_slice(&[0, 0]);
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::ShortFrame { size: 4 });
    }

    #[test]
    fn lying_length_prefix_is_fatal() {
        let mut buf = BytesMut::new();
        encode(
            &Frame::error(1, ErrorCode::Declined, "short"),
            &mut buf,
        )
        .unwrap();
        // Inflate the message length prefix past the end of the body.
        let msg_len_at = FRAME_HEADER_SIZE + 1 + TraceFields::WIRE_SIZE;
        buf[msg_len_at] = 0xFF;
        buf[msg_len_at + 1] = 0xFF;
        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { field: "message" }));
    }

    #[test]
    fn oversized_body_refused() {
        let frame = Frame::new(
            2,
            FrameBody::CallRequestContinue(ContinueBody {
                flags: FragmentFlags::empty(),
                checksum_type: ChecksumType::None,
                checksum: 0,
                args: vec![Bytes::from(vec![0x41; 40000]), Bytes::from(vec![0x42; 40000])],
            }),
        );
        let mut buf = BytesMut::new();
        let err = encode(&frame, &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn reserved_bytes_zero_on_emission() {
        let mut buf = BytesMut::new();
        encode(&Frame::new(0x01020304, FrameBody::PingRequest), &mut buf).unwrap();
        assert_eq!(buf[3], 0);
        assert_eq!(&buf[8..16], &[0u8; 8]);
        // ...and ignored on reception.
        buf[3] = 0xAA;
        buf[12] = 0xBB;
        let frame = decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.id, 0x01020304);
    }
}
