//! Protocol constants.

/// Largest value the leading 2-byte `size` field can carry, and therefore the
/// largest frame that can appear on the wire.
pub const MAX_FRAME_SIZE: usize = 65535;

/// Envelope bytes preceding the body: size (2) + type (1) + reserved (1) +
/// id (4) + reserved (8).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Largest body a single frame can carry. Anything bigger must be fragmented
/// before it reaches the codec.
pub const MAX_BODY_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Cap on the total length of `arg1` (the endpoint name).
pub const MAX_ARG1_SIZE: usize = 16384;

/// Cap on the service name, dictated by its 1-byte length prefix.
pub const MAX_SERVICE_SIZE: usize = 255;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 2;

/// Frame id addressing the connection itself in error frames. Never
/// allocated for calls.
pub const CONNECTION_ID: u32 = 0xFFFF_FFFF;

/// Id the active side burns on its init request. Reserved thereafter.
pub const INIT_ID: u32 = 1;

/// Required init header carrying the peer's listening address.
pub const INIT_HEADER_HOST_PORT: &str = "host_port";

/// Required init header carrying the peer's process identifier.
pub const INIT_HEADER_PROCESS_NAME: &str = "process_name";

/// Transport header naming the calling service.
pub const HEADER_CALLER_NAME: &str = "cn";

/// Transport header naming the argument scheme of `arg2`/`arg3`.
pub const HEADER_ARG_SCHEME: &str = "as";

/// Reserved prefix for tracer-owned transport headers. Headers under this
/// prefix are never surfaced to handlers and are rejected in user-supplied
/// outbound header maps.
pub const TRACING_KEY_PREFIX: &str = "$tracing$";
