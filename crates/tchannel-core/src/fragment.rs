//! Call fragmentation and reassembly.
//!
//! Outgoing calls are cut into a first fragment plus as many continuations
//! as the argument bytes need; incoming fragments are validated and folded
//! back into contiguous argument buffers. Argument chunks inside a fragment
//! are positional: chunk j always belongs to arg j+1, with zero-length
//! chunks standing in for args already fully sent. The codec is the sole
//! producer of the chunk slices consumed here, and this module is their sole
//! consumer.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::call::{OutgoingCall, OutgoingResponse};
use crate::checksum::{ChecksumStream, ChecksumType};
use crate::error::{CallFault, ProtocolError};
use crate::frame::{
    CallRequestBody, CallResponseBody, ContinueBody, Frame, FrameBody, FragmentFlags,
    ResponseCode, TraceFields,
};
use crate::headers::{Headers, call_encoded_len};
use crate::limits::{MAX_ARG1_SIZE, MAX_BODY_SIZE, MAX_SERVICE_SIZE};

/// Fixed call-request prefix: flags (1) + ttl (4) + tracing (25).
const REQUEST_PREFIX: usize = 30;
/// Fixed call-response prefix: flags (1) + code (1) + tracing (25).
const RESPONSE_PREFIX: usize = 27;
/// Continuation prefix before the checksum field: flags (1).
const CONTINUE_PREFIX: usize = 1;

/// Cut an outgoing request into its ordered fragment frames.
pub(crate) fn fragment_request(id: u32, call: &OutgoingCall) -> Result<Vec<Frame>, ProtocolError> {
    if call.service.len() > MAX_SERVICE_SIZE {
        return Err(ProtocolError::StringTooLong {
            field: "service",
            len: call.service.len(),
            max: MAX_SERVICE_SIZE,
        });
    }
    if call.arg1.len() > MAX_ARG1_SIZE {
        return Err(ProtocolError::StringTooLong {
            field: "arg1",
            len: call.arg1.len(),
            max: MAX_ARG1_SIZE,
        });
    }

    let prefix = REQUEST_PREFIX
        + 1
        + call.service.len()
        + call_encoded_len(&call.headers)
        + call.checksum_type.field_len();
    let ttl_ms = u32::try_from(call.ttl.as_millis()).unwrap_or(u32::MAX);

    fragment(
        id,
        prefix,
        call.checksum_type,
        [call.arg1.clone(), call.arg2.clone(), call.arg3.clone()],
        |flags, checksum, args| {
            FrameBody::CallRequest(CallRequestBody {
                flags,
                ttl_ms,
                tracing: call.tracing,
                service: call.service.clone(),
                headers: call.headers.clone(),
                checksum_type: call.checksum_type,
                checksum,
                args,
            })
        },
        FrameBody::CallRequestContinue,
    )
}

/// Cut an outgoing response into its ordered fragment frames. `arg1` is
/// empty in responses by convention.
pub(crate) fn fragment_response(
    id: u32,
    response: &OutgoingResponse,
) -> Result<Vec<Frame>, ProtocolError> {
    let prefix = RESPONSE_PREFIX
        + call_encoded_len(&response.headers)
        + response.checksum_type.field_len();

    fragment(
        id,
        prefix,
        response.checksum_type,
        [Bytes::new(), response.arg2.clone(), response.arg3.clone()],
        |flags, checksum, args| {
            FrameBody::CallResponse(CallResponseBody {
                flags,
                code: response.code,
                tracing: response.tracing,
                headers: response.headers.clone(),
                checksum_type: response.checksum_type,
                checksum,
                args,
            })
        },
        FrameBody::CallResponseContinue,
    )
}

fn fragment(
    id: u32,
    first_prefix: usize,
    checksum_type: ChecksumType,
    args: [Bytes; 3],
    first_body: impl FnOnce(FragmentFlags, u32, Vec<Bytes>) -> FrameBody,
    continue_body: impl Fn(ContinueBody) -> FrameBody,
) -> Result<Vec<Frame>, ProtocolError> {
    // arg1 must be wholly inside the first fragment, chunk prefix included.
    let needed = first_prefix + 2 + args[0].len();
    if needed > MAX_BODY_SIZE {
        return Err(ProtocolError::FirstFragmentOverflow {
            needed,
            available: MAX_BODY_SIZE,
        });
    }

    let mut writer = ArgWriter::new(args);
    let mut stream = ChecksumStream::new(checksum_type);
    let mut frames = Vec::new();

    let chunks = writer.fill(MAX_BODY_SIZE - first_prefix);
    let checksum = stream.digest(chunks.iter().map(Bytes::as_ref));
    let flags = flags_for(writer.remaining());
    frames.push(Frame::new(id, first_body(flags, checksum, chunks)));

    let continue_capacity = MAX_BODY_SIZE - CONTINUE_PREFIX - checksum_type.field_len();
    while writer.remaining() > 0 {
        let chunks = writer.fill(continue_capacity);
        let checksum = stream.digest(chunks.iter().map(Bytes::as_ref));
        frames.push(Frame::new(
            id,
            continue_body(ContinueBody {
                flags: flags_for(writer.remaining()),
                checksum_type,
                checksum,
                args: chunks,
            }),
        ));
    }
    Ok(frames)
}

fn flags_for(remaining: usize) -> FragmentFlags {
    if remaining > 0 {
        FragmentFlags::MORE_FRAGMENTS
    } else {
        FragmentFlags::empty()
    }
}

/// Walks the three argument buffers in order, handing out as many
/// length-prefixed chunks as fit each fragment.
struct ArgWriter {
    args: [Bytes; 3],
    offsets: [usize; 3],
}

impl ArgWriter {
    fn new(args: [Bytes; 3]) -> Self {
        Self {
            args,
            offsets: [0; 3],
        }
    }

    fn remaining(&self) -> usize {
        (0..3).map(|i| self.args[i].len() - self.offsets[i]).sum()
    }

    /// Take chunks for one fragment with `space` body bytes available.
    /// Chunks are emitted from arg1 onward; an arg that does not fit is cut
    /// at the space boundary and resumes in the next fragment.
    fn fill(&mut self, mut space: usize) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        for i in 0..3 {
            if space < 2 {
                break;
            }
            let rest = self.args[i].len() - self.offsets[i];
            let take = rest.min(space - 2);
            chunks.push(self.args[i].slice(self.offsets[i]..self.offsets[i] + take));
            self.offsets[i] += take;
            space -= 2 + take;
        }
        chunks
    }
}

/// Reassembly of an incoming request, keyed by id on the connection.
#[derive(Debug)]
pub(crate) struct RequestReassembly {
    pub service: String,
    pub headers: Headers,
    pub ttl: Duration,
    pub tracing: TraceFields,
    pub deadline: Instant,
    assembly: ArgAssembly,
}

impl RequestReassembly {
    /// Start from the first fragment. Returns the reassembly and whether the
    /// call is already complete.
    pub fn begin(body: CallRequestBody, now: Instant) -> Result<(Self, bool), CallFault> {
        if body.ttl_ms == 0 {
            return Err(CallFault::ZeroTtl);
        }
        if body.args.is_empty() {
            return Err(CallFault::MissingArg1);
        }
        let assembly = ArgAssembly::begin(body.checksum_type, body.checksum, &body.args)?;
        let ttl = Duration::from_millis(u64::from(body.ttl_ms));
        let done = !body.flags.more();
        Ok((
            Self {
                service: body.service,
                headers: body.headers,
                ttl,
                tracing: body.tracing,
                deadline: now + ttl,
                assembly,
            },
            done,
        ))
    }

    pub fn absorb(&mut self, body: &ContinueBody, now: Instant) -> Result<bool, CallFault> {
        if now > self.deadline {
            return Err(CallFault::Expired);
        }
        self.assembly.absorb(body)
    }

    pub fn into_args(self) -> (Bytes, Bytes, Bytes) {
        self.assembly.into_args()
    }
}

/// Reassembly of an incoming response to one of our outgoing calls.
#[derive(Debug)]
pub(crate) struct ResponseReassembly {
    pub code: ResponseCode,
    pub headers: Headers,
    pub tracing: TraceFields,
    assembly: ArgAssembly,
}

impl ResponseReassembly {
    pub fn begin(body: CallResponseBody) -> Result<(Self, bool), CallFault> {
        let assembly = ArgAssembly::begin(body.checksum_type, body.checksum, &body.args)?;
        let done = !body.flags.more();
        Ok((
            Self {
                code: body.code,
                headers: body.headers,
                tracing: body.tracing,
                assembly,
            },
            done,
        ))
    }

    pub fn absorb(&mut self, body: &ContinueBody) -> Result<bool, CallFault> {
        self.assembly.absorb(body)
    }

    pub fn into_args(self) -> (Bytes, Bytes, Bytes) {
        self.assembly.into_args()
    }
}

/// Shared chunk accumulation and per-fragment checksum verification.
#[derive(Debug)]
struct ArgAssembly {
    checksum: ChecksumStream,
    args: [BytesMut; 3],
}

impl ArgAssembly {
    fn begin(
        checksum_type: ChecksumType,
        checksum: u32,
        chunks: &[Bytes],
    ) -> Result<Self, CallFault> {
        if let Some(arg1) = chunks.first() {
            if arg1.len() > MAX_ARG1_SIZE {
                return Err(CallFault::Arg1TooLong { len: arg1.len() });
            }
        }
        let mut assembly = Self {
            checksum: ChecksumStream::new(checksum_type),
            args: [BytesMut::new(), BytesMut::new(), BytesMut::new()],
        };
        assembly.verify_and_append(checksum, chunks, true)?;
        Ok(assembly)
    }

    fn absorb(&mut self, body: &ContinueBody) -> Result<bool, CallFault> {
        if body.checksum_type != self.checksum.checksum_type() {
            return Err(CallFault::ChecksumTypeMismatch {
                expected: self.checksum.checksum_type(),
                got: body.checksum_type,
            });
        }
        self.verify_and_append(body.checksum, &body.args, false)?;
        Ok(!body.flags.more())
    }

    fn verify_and_append(
        &mut self,
        checksum: u32,
        chunks: &[Bytes],
        first: bool,
    ) -> Result<(), CallFault> {
        if !first && chunks.first().is_some_and(|arg1| !arg1.is_empty()) {
            return Err(CallFault::Arg1AfterFirstFragment);
        }
        if let Err(computed) = self
            .checksum
            .verify(chunks.iter().map(Bytes::as_ref), checksum)
        {
            return Err(CallFault::ChecksumMismatch {
                expected: checksum,
                computed,
            });
        }
        for (arg, chunk) in self.args.iter_mut().zip(chunks) {
            arg.extend_from_slice(chunk);
        }
        Ok(())
    }

    fn into_args(self) -> (Bytes, Bytes, Bytes) {
        let [arg1, arg2, arg3] = self.args;
        (arg1.freeze(), arg2.freeze(), arg3.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{OutgoingCall, OutgoingResponse};
    use crate::codec;
    use crate::limits::MAX_FRAME_SIZE;

    fn reassemble_request(frames: &[Frame]) -> (Bytes, Bytes, Bytes) {
        let now = Instant::now();
        let mut iter = frames.iter();
        let first = match &iter.next().unwrap().body {
            FrameBody::CallRequest(body) => body.clone(),
            other => panic!("expected call request, got {other:?}"),
        };
        let (mut assembly, mut done) = RequestReassembly::begin(first, now).unwrap();
        for frame in iter {
            assert!(!done, "fragments after the final fragment");
            let body = match &frame.body {
                FrameBody::CallRequestContinue(body) => body,
                other => panic!("expected continuation, got {other:?}"),
            };
            done = assembly.absorb(body, now).unwrap();
        }
        assert!(done);
        assembly.into_args()
    }

    fn request_with_args(arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> OutgoingCall {
        let mut call = OutgoingCall::new("svc", Bytes::copy_from_slice(arg1));
        call.arg2 = Bytes::copy_from_slice(arg2);
        call.arg3 = Bytes::copy_from_slice(arg3);
        call.checksum_type = ChecksumType::Crc32;
        call
    }

    #[test]
    fn small_call_is_one_fragment() {
        let call = request_with_args(b"op", b"", b"{}");
        let frames = fragment_request(2, &call).unwrap();
        assert_eq!(frames.len(), 1);
        let (arg1, arg2, arg3) = reassemble_request(&frames);
        assert_eq!(&arg1[..], b"op");
        assert!(arg2.is_empty());
        assert_eq!(&arg3[..], b"{}");
    }

    #[test]
    fn large_arg3_fragments_and_reassembles() {
        let payload = vec![0x41u8; 70000];
        let call = request_with_args(b"op", b"meta", &payload);
        let frames = fragment_request(7, &call).unwrap();
        assert!(frames.len() >= 2);

        // Every emitted frame fits the wire and the final fragment alone
        // clears the more flag.
        for (i, frame) in frames.iter().enumerate() {
            let mut buf = BytesMut::new();
            codec::encode(frame, &mut buf).unwrap();
            assert!(buf.len() <= MAX_FRAME_SIZE);
            let more = match &frame.body {
                FrameBody::CallRequest(b) => b.flags.more(),
                FrameBody::CallRequestContinue(b) => b.flags.more(),
                other => panic!("unexpected body {other:?}"),
            };
            assert_eq!(more, i + 1 < frames.len());
        }

        let (arg1, arg2, arg3) = reassemble_request(&frames);
        assert_eq!(&arg1[..], b"op");
        assert_eq!(&arg2[..], b"meta");
        assert_eq!(arg3.len(), payload.len());
        assert_eq!(&arg3[..], &payload[..]);
    }

    #[test]
    fn fragmentation_survives_any_boundary() {
        // arg2 large enough to straddle a fragment boundary, arg3 after it.
        let arg2 = (0..80000u32).map(|i| i as u8).collect::<Vec<_>>();
        let call = request_with_args(b"boundary", &arg2, b"tail");
        let frames = fragment_request(3, &call).unwrap();
        assert!(frames.len() >= 2);
        let (arg1, got2, got3) = reassemble_request(&frames);
        assert_eq!(&arg1[..], b"boundary");
        assert_eq!(&got2[..], &arg2[..]);
        assert_eq!(&got3[..], b"tail");
    }

    #[test]
    fn checksum_chains_across_fragments() {
        let payload = vec![0x5Au8; 100000];
        let call = request_with_args(b"op", b"", &payload);
        let frames = fragment_request(4, &call).unwrap();

        // The last fragment's digest equals the single-pass crc of the whole
        // argument stream.
        let mut all = Vec::new();
        all.extend_from_slice(b"op");
        all.extend_from_slice(&payload);
        let single_pass = crc32fast::hash(&all);
        let last = match &frames.last().unwrap().body {
            FrameBody::CallRequestContinue(b) => b.checksum,
            FrameBody::CallRequest(b) => b.checksum,
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(last, single_pass);
    }

    #[test]
    fn corrupted_fragment_fails_checksum() {
        let call = request_with_args(b"op", b"payload", b"");
        let frames = fragment_request(5, &call).unwrap();
        let mut body = match &frames[0].body {
            FrameBody::CallRequest(body) => body.clone(),
            other => panic!("unexpected body {other:?}"),
        };
        body.checksum ^= 1;
        let err = RequestReassembly::begin(body, Instant::now()).unwrap_err();
        assert!(matches!(err, CallFault::ChecksumMismatch { .. }));
    }

    #[test]
    fn zero_ttl_rejected() {
        let mut call = request_with_args(b"op", b"", b"");
        call.ttl = Duration::ZERO;
        let frames = fragment_request(6, &call).unwrap();
        let body = match frames.into_iter().next().unwrap().body {
            FrameBody::CallRequest(body) => body,
            other => panic!("unexpected body {other:?}"),
        };
        let err = RequestReassembly::begin(body, Instant::now()).unwrap_err();
        assert_eq!(err, CallFault::ZeroTtl);
    }

    #[test]
    fn missing_arg1_rejected() {
        let body = CallRequestBody {
            flags: FragmentFlags::empty(),
            ttl_ms: 100,
            tracing: TraceFields::default(),
            service: "svc".into(),
            headers: Headers::new(),
            checksum_type: ChecksumType::None,
            checksum: 0,
            args: Vec::new(),
        };
        let err = RequestReassembly::begin(body, Instant::now()).unwrap_err();
        assert_eq!(err, CallFault::MissingArg1);
    }

    #[test]
    fn zero_length_arg1_is_legal() {
        let call = request_with_args(b"", b"x", b"y");
        let frames = fragment_request(8, &call).unwrap();
        let (arg1, arg2, arg3) = reassemble_request(&frames);
        assert!(arg1.is_empty());
        assert_eq!(&arg2[..], b"x");
        assert_eq!(&arg3[..], b"y");
    }

    #[test]
    fn arg1_bytes_in_continuation_rejected() {
        let call = request_with_args(b"op", &vec![0u8; 70000], b"");
        let frames = fragment_request(9, &call).unwrap();
        let first = match frames[0].body.clone() {
            FrameBody::CallRequest(body) => body,
            other => panic!("unexpected body {other:?}"),
        };
        let now = Instant::now();
        let (mut assembly, done) = RequestReassembly::begin(first, now).unwrap();
        assert!(!done);

        let rogue = ContinueBody {
            flags: FragmentFlags::empty(),
            checksum_type: ChecksumType::Crc32,
            checksum: 0,
            args: vec![Bytes::from_static(b"late arg1")],
        };
        let err = assembly.absorb(&rogue, now).unwrap_err();
        assert_eq!(err, CallFault::Arg1AfterFirstFragment);
    }

    #[test]
    fn checksum_type_cannot_change_mid_call() {
        let call = request_with_args(b"op", &vec![1u8; 70000], b"");
        let frames = fragment_request(10, &call).unwrap();
        let first = match frames[0].body.clone() {
            FrameBody::CallRequest(body) => body,
            other => panic!("unexpected body {other:?}"),
        };
        let now = Instant::now();
        let (mut assembly, _) = RequestReassembly::begin(first, now).unwrap();

        let switched = ContinueBody {
            flags: FragmentFlags::empty(),
            checksum_type: ChecksumType::Crc32c,
            checksum: 0,
            args: vec![Bytes::new()],
        };
        let err = assembly.absorb(&switched, now).unwrap_err();
        assert!(matches!(err, CallFault::ChecksumTypeMismatch { .. }));
    }

    #[test]
    fn late_fragment_is_expired() {
        let mut call = request_with_args(b"op", &vec![2u8; 70000], b"");
        call.ttl = Duration::from_millis(50);
        let frames = fragment_request(11, &call).unwrap();
        let first = match frames[0].body.clone() {
            FrameBody::CallRequest(body) => body,
            other => panic!("unexpected body {other:?}"),
        };
        let now = Instant::now();
        let (mut assembly, _) = RequestReassembly::begin(first, now).unwrap();
        let cont = match &frames[1].body {
            FrameBody::CallRequestContinue(body) => body.clone(),
            other => panic!("unexpected body {other:?}"),
        };
        let err = assembly
            .absorb(&cont, now + Duration::from_millis(51))
            .unwrap_err();
        assert_eq!(err, CallFault::Expired);
    }

    #[test]
    fn oversized_arg1_refused_on_both_sides() {
        let call = request_with_args(&vec![0u8; MAX_ARG1_SIZE + 1], b"", b"");
        let err = fragment_request(12, &call).unwrap_err();
        assert!(matches!(err, ProtocolError::StringTooLong { field: "arg1", .. }));

        let body = CallRequestBody {
            flags: FragmentFlags::empty(),
            ttl_ms: 100,
            tracing: TraceFields::default(),
            service: "svc".into(),
            headers: Headers::new(),
            checksum_type: ChecksumType::None,
            checksum: 0,
            args: vec![Bytes::from(vec![0u8; MAX_ARG1_SIZE + 1])],
        };
        let err = RequestReassembly::begin(body, Instant::now()).unwrap_err();
        assert!(matches!(err, CallFault::Arg1TooLong { .. }));
    }

    #[test]
    fn response_roundtrip() {
        let mut response = OutgoingResponse::ok(vec![9u8; 70000]);
        response.arg2 = Bytes::from_static(b"res-meta");
        response.checksum_type = ChecksumType::Crc32c;
        let frames = fragment_response(13, &response).unwrap();
        assert!(frames.len() >= 2);

        let mut iter = frames.iter();
        let first = match iter.next().unwrap().body.clone() {
            FrameBody::CallResponse(body) => body,
            other => panic!("unexpected body {other:?}"),
        };
        let (mut assembly, mut done) = ResponseReassembly::begin(first).unwrap();
        for frame in iter {
            let body = match &frame.body {
                FrameBody::CallResponseContinue(body) => body,
                other => panic!("unexpected body {other:?}"),
            };
            done = assembly.absorb(body).unwrap();
        }
        assert!(done);
        assert_eq!(assembly.code, ResponseCode::Ok);
        let (arg1, arg2, arg3) = assembly.into_args();
        assert!(arg1.is_empty());
        assert_eq!(&arg2[..], b"res-meta");
        assert_eq!(arg3.len(), 70000);
    }

    #[test]
    fn first_fragment_overflow_refused() {
        let mut call = request_with_args(&vec![0u8; MAX_ARG1_SIZE], b"", b"");
        // Blow the first-fragment budget with bulky headers.
        for i in 0..250 {
            call.headers.insert(format!("key-{i}"), "v".repeat(250));
        }
        let err = fragment_request(14, &call).unwrap_err();
        assert!(matches!(err, ProtocolError::FirstFragmentOverflow { .. }));
    }
}
