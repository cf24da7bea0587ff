#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

use tchannel_core::{
    Connection, ConnectionConfig, ConnectionError, Frame, FrameBody, INIT_ID, Incoming, InitBody,
    MemTransport, StreamTransport, TraceFields, Transport,
};
use tchannel_tracing::{
    InjectError, Span, SpanBuilder, SpanContext, TextMapReader, TextMapWriter, Tracer,
};

/// Two connections wired back to back, drivers already spawned.
pub struct ConnectedPair {
    pub client: Connection,
    pub client_incoming: Incoming,
    pub server: Connection,
    pub server_incoming: Incoming,
    pub client_task: JoinHandle<Result<(), ConnectionError>>,
    pub server_task: JoinHandle<Result<(), ConnectionError>>,
}

impl ConnectedPair {
    fn wire<T: Transport>(client_end: T, server_end: T) -> Self {
        let (client, client_incoming, client_driver) = Connection::client(
            client_end,
            ConnectionConfig::new("127.0.0.1:4040", "testkit-client"),
        );
        let (server, server_incoming, server_driver) = Connection::server(
            server_end,
            ConnectionConfig::new("127.0.0.1:4041", "testkit-server"),
        );
        Self {
            client,
            client_incoming,
            server,
            server_incoming,
            client_task: tokio::spawn(client_driver.run()),
            server_task: tokio::spawn(server_driver.run()),
        }
    }

    /// Pair over the in-process frame transport. Must be called inside a
    /// tokio runtime.
    pub fn over_mem() -> Self {
        let (a, b) = MemTransport::pair();
        Self::wire(a, b)
    }

    /// Pair over a byte stream, exercising the frame codec in between.
    pub fn over_stream() -> Self {
        let (a, b) = StreamTransport::pair();
        Self::wire(a, b)
    }
}

/// A bare-frames peer for driving a connection off the beaten path:
/// handshakes, violations, and late frames are all spelled out by the test.
pub struct RawPeer {
    transport: StreamTransport<DuplexStream>,
}

impl RawPeer {
    /// A client connection whose peer is this raw wire.
    pub fn with_client(config: ConnectionConfig) -> (Connection, Incoming, RawSession) {
        let (client_end, raw_end) = StreamTransport::pair();
        let (client, incoming, driver) = Connection::client(client_end, config);
        (
            client,
            incoming,
            RawSession {
                peer: RawPeer {
                    transport: raw_end,
                },
                task: tokio::spawn(driver.run()),
            },
        )
    }

    /// A server connection whose peer is this raw wire.
    pub fn with_server(config: ConnectionConfig) -> (Connection, Incoming, RawSession) {
        let (server_end, raw_end) = StreamTransport::pair();
        let (server, incoming, driver) = Connection::server(server_end, config);
        (
            server,
            incoming,
            RawSession {
                peer: RawPeer {
                    transport: raw_end,
                },
                task: tokio::spawn(driver.run()),
            },
        )
    }

    pub async fn send(&mut self, frame: Frame) {
        self.transport
            .send_frame(frame)
            .await
            .expect("raw peer send failed");
    }

    pub async fn recv(&mut self) -> Frame {
        self.transport
            .recv_frame()
            .await
            .expect("raw peer recv failed")
    }

    /// Play the passive side of the init handshake and return the init
    /// request the connection sent.
    pub async fn accept_handshake(&mut self, host_port: &str, process_name: &str) -> Frame {
        let request = self.recv().await;
        let reply = Frame::new(
            request.id,
            FrameBody::InitResponse(InitBody::new(host_port, process_name)),
        );
        self.send(reply).await;
        request
    }

    /// Play the active side of the init handshake and return the init
    /// response the connection sent.
    pub async fn initiate_handshake(&mut self, host_port: &str, process_name: &str) -> Frame {
        self.send(Frame::new(
            INIT_ID,
            FrameBody::InitRequest(InitBody::new(host_port, process_name)),
        ))
        .await;
        self.recv().await
    }
}

/// [`RawPeer`] plus the spawned driver of the connection under test.
pub struct RawSession {
    pub peer: RawPeer,
    pub task: JoinHandle<Result<(), ConnectionError>>,
}

// --- Mock tracer -----------------------------------------------------------

/// A span recorded by [`MockTracer`] when it finished.
#[derive(Clone, Debug)]
pub struct FinishedSpan {
    pub operation: String,
    pub tags: Vec<(String, String)>,
    pub logs: Vec<Vec<(String, String)>>,
    pub ids: TraceFields,
}

impl FinishedSpan {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    finished: Vec<FinishedSpan>,
}

/// A tracer with sequential 64-bit ids that records finished spans.
///
/// `inject` writes exactly two carrier keys, `traceid` and `spanid`;
/// `extract` recovers a context from them.
#[derive(Clone, Default)]
pub struct MockTracer {
    state: Arc<Mutex<MockState>>,
}

impl MockTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> Vec<FinishedSpan> {
        self.state.lock().finished.clone()
    }
}

#[derive(Clone, Copy)]
struct MockSpanContext(TraceFields);

impl SpanContext for MockSpanContext {
    fn protocol_ids(&self) -> Option<TraceFields> {
        Some(self.0)
    }
}

struct MockSpanBuilder {
    tracer: MockTracer,
    operation: String,
    parent: Option<TraceFields>,
    tags: Vec<(String, String)>,
}

impl SpanBuilder for MockSpanBuilder {
    fn child_of(mut self: Box<Self>, parent: &dyn SpanContext) -> Box<dyn SpanBuilder> {
        self.parent = parent.protocol_ids();
        self
    }

    fn with_tag(mut self: Box<Self>, key: &str, value: &str) -> Box<dyn SpanBuilder> {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    fn start(self: Box<Self>) -> Box<dyn Span> {
        let span_id = {
            let mut state = self.tracer.state.lock();
            state.next_id += 1;
            state.next_id
        };
        let ids = match self.parent {
            Some(parent) => TraceFields {
                span_id,
                parent_id: parent.span_id,
                trace_id: parent.trace_id,
                flags: parent.flags,
            },
            None => TraceFields {
                span_id,
                parent_id: 0,
                trace_id: span_id,
                flags: 1,
            },
        };
        Box::new(MockSpan {
            tracer: self.tracer,
            operation: self.operation,
            tags: self.tags,
            logs: Vec::new(),
            context: MockSpanContext(ids),
            finished: false,
        })
    }
}

struct MockSpan {
    tracer: MockTracer,
    operation: String,
    tags: Vec<(String, String)>,
    logs: Vec<Vec<(String, String)>>,
    context: MockSpanContext,
    finished: bool,
}

impl Span for MockSpan {
    fn context(&self) -> &dyn SpanContext {
        &self.context
    }

    fn set_tag(&mut self, key: &str, value: &str) {
        self.tags.push((key.to_string(), value.to_string()));
    }

    fn log(&mut self, fields: &[(&str, &str)]) {
        self.logs.push(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.tracer.state.lock().finished.push(FinishedSpan {
            operation: self.operation.clone(),
            tags: self.tags.clone(),
            logs: self.logs.clone(),
            ids: self.context.0,
        });
    }
}

impl Tracer for MockTracer {
    fn build_span(&self, operation: &str) -> Box<dyn SpanBuilder> {
        Box::new(MockSpanBuilder {
            tracer: self.clone(),
            operation: operation.to_string(),
            parent: None,
            tags: Vec::new(),
        })
    }

    fn inject(
        &self,
        context: &dyn SpanContext,
        carrier: &mut dyn TextMapWriter,
    ) -> Result<(), InjectError> {
        let ids = context
            .protocol_ids()
            .ok_or_else(|| InjectError("span context exposes no protocol ids".into()))?;
        carrier.put("traceid", &format!("{:016x}", ids.trace_id));
        carrier.put("spanid", &format!("{:016x}", ids.span_id));
        Ok(())
    }

    fn extract(&self, carrier: &dyn TextMapReader) -> Option<Box<dyn SpanContext>> {
        let mut trace_id = None;
        let mut span_id = None;
        carrier.for_each(&mut |key, value| match key {
            "traceid" => trace_id = u64::from_str_radix(value, 16).ok(),
            "spanid" => span_id = u64::from_str_radix(value, 16).ok(),
            _ => {}
        });
        Some(Box::new(MockSpanContext(TraceFields {
            span_id: span_id?,
            parent_id: 0,
            trace_id: trace_id?,
            flags: 1,
        })))
    }
}
