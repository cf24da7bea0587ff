//! Logical calls: what callers submit, what handlers receive, and the
//! completion handles both sides await.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::checksum::ChecksumType;
use crate::connection::Command;
use crate::error::{CallError, ConnectionError, ErrorCode};
use crate::frame::{ResponseCode, TraceFields};
use crate::headers::Headers;
use crate::limits::TRACING_KEY_PREFIX;

/// Default ttl for calls that do not set one explicitly.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// A user-supplied header key collided with the reserved tracing prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedHeaderKey(pub String);

impl fmt::Display for ReservedHeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "header key `{}` uses the reserved `{TRACING_KEY_PREFIX}` prefix",
            self.0
        )
    }
}

impl std::error::Error for ReservedHeaderKey {}

/// An outbound call as submitted to a connection.
#[derive(Clone, Debug)]
pub struct OutgoingCall {
    pub service: String,
    pub ttl: Duration,
    pub headers: Headers,
    pub tracing: TraceFields,
    pub checksum_type: ChecksumType,
    /// The endpoint name.
    pub arg1: Bytes,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

impl OutgoingCall {
    pub fn new(service: impl Into<String>, arg1: impl Into<Bytes>) -> Self {
        Self {
            service: service.into(),
            ttl: DEFAULT_TTL,
            headers: Headers::new(),
            tracing: TraceFields::default(),
            checksum_type: ChecksumType::default(),
            arg1: arg1.into(),
            arg2: Bytes::new(),
            arg3: Bytes::new(),
        }
    }

    /// Add a transport header. Keys under the reserved tracing prefix are
    /// tracer-owned and rejected here.
    pub fn header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, ReservedHeaderKey> {
        let key = key.into();
        if key.starts_with(TRACING_KEY_PREFIX) {
            return Err(ReservedHeaderKey(key));
        }
        self.headers.insert(key, value);
        Ok(self)
    }

    pub fn endpoint(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.arg1)
    }
}

/// A response produced by a handler for an inbound call.
#[derive(Clone, Debug, Default)]
pub struct OutgoingResponse {
    pub code: ResponseCode,
    pub headers: Headers,
    pub tracing: TraceFields,
    pub checksum_type: ChecksumType,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

impl OutgoingResponse {
    pub fn ok(arg3: impl Into<Bytes>) -> Self {
        Self {
            arg3: arg3.into(),
            ..Self::default()
        }
    }

    pub fn application_error(arg3: impl Into<Bytes>) -> Self {
        Self {
            code: ResponseCode::Error,
            arg3: arg3.into(),
            ..Self::default()
        }
    }
}

/// A fully reassembled response, delivered through a [`CallHandle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResponse {
    pub code: ResponseCode,
    pub headers: Headers,
    pub tracing: TraceFields,
    pub arg1: Bytes,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

impl CallResponse {
    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }
}

/// A fully reassembled inbound call, delivered through [`crate::Incoming`].
///
/// Consuming it with [`respond`](Self::respond) or
/// [`respond_error`](Self::respond_error) terminates the call; dropping it
/// without responding leaves the peer to its ttl.
#[derive(Debug)]
pub struct InboundCall {
    pub id: u32,
    pub service: String,
    pub headers: Headers,
    pub ttl: Duration,
    pub tracing: TraceFields,
    pub arg1: Bytes,
    pub arg2: Bytes,
    pub arg3: Bytes,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
}

impl InboundCall {
    /// An inbound call not attached to any connection, for exercising
    /// handlers and bridges in isolation. Responding fails with
    /// [`ConnectionError::Closed`].
    pub fn detached(service: impl Into<String>, arg1: impl Into<Bytes>) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        cmd_rx.close();
        Self {
            id: 0,
            service: service.into(),
            headers: Headers::new(),
            ttl: DEFAULT_TTL,
            tracing: TraceFields::default(),
            arg1: arg1.into(),
            arg2: Bytes::new(),
            arg3: Bytes::new(),
            cmd_tx,
        }
    }

    pub fn endpoint(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.arg1)
    }

    /// Send the response fragments for this call.
    pub async fn respond(self, response: OutgoingResponse) -> Result<(), ConnectionError> {
        self.cmd_tx
            .send(Command::Respond {
                id: self.id,
                response,
            })
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Fail this call with an error frame instead of a response.
    pub async fn respond_error(
        self,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.cmd_tx
            .send(Command::RespondError {
                id: self.id,
                code,
                message: message.into(),
            })
            .await
            .map_err(|_| ConnectionError::Closed)
    }
}

/// Completion future for an outbound call.
#[derive(Debug)]
pub struct CallHandle {
    pub(crate) id: u32,
    pub(crate) rx: oneshot::Receiver<Result<CallResponse, CallError>>,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
}

impl CallHandle {
    /// The id this call occupies on the connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the terminal outcome. Fires exactly once.
    pub async fn response(self) -> Result<CallResponse, CallError> {
        self.rx.await.unwrap_or(Err(CallError::ConnectionClosed))
    }

    /// Ask the connection to cancel this call. The completion future then
    /// resolves with [`CallError::Cancelled`].
    pub async fn cancel(&self) {
        let _ = self.cmd_tx.send(Command::Cancel { id: self.id }).await;
    }
}

/// Completion future for a ping.
#[derive(Debug)]
pub struct PingHandle {
    pub(crate) rx: oneshot::Receiver<Result<(), CallError>>,
}

impl PingHandle {
    pub async fn pong(self) -> Result<(), CallError> {
        self.rx.await.unwrap_or(Err(CallError::ConnectionClosed))
    }
}
