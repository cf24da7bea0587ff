//! Connection multiplexer.
//!
//! One [`Driver`] task per connection owns the handshake state, both
//! in-flight tables, and the deadline heap; nothing else touches them, so
//! they carry no locks. Callers reach the driver through a bounded command
//! queue and await oneshot completion signals, which fire exactly once on a
//! call's terminal transition. The driver finishes the init handshake before
//! it reads or writes any call frame.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::call::{
    CallHandle, CallResponse, InboundCall, OutgoingCall, OutgoingResponse, PingHandle,
};
use crate::error::{CallError, ConnectionError, ErrorCode, ProtocolError, TransportError};
use crate::fragment::{
    RequestReassembly, ResponseReassembly, fragment_request, fragment_response,
};
use crate::frame::{CallRequestBody, CallResponseBody, ContinueBody, ErrorBody, Frame, FrameBody};
use crate::init::{Handshake, PeerIdentity};
use crate::limits::{CONNECTION_ID, INIT_ID};
use crate::transport::Transport;

/// How long a terminated call's record lingers to swallow late fragments
/// before its id returns to the pool.
const TOMBSTONE_LINGER: Duration = Duration::from_secs(30);

/// Connection construction parameters.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Local listening address advertised in the init handshake.
    pub host_port: String,
    /// Local process identifier advertised in the init handshake.
    pub process_name: String,
    /// Capacity of the caller→driver command queue.
    pub command_queue: usize,
    /// Capacity of the inbound-call delivery queue.
    pub inbound_queue: usize,
    /// Deadline applied to outbound pings.
    pub ping_ttl: Duration,
}

impl ConnectionConfig {
    pub fn new(host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            host_port: host_port.into(),
            process_name: process_name.into(),
            command_queue: 64,
            inbound_queue: 64,
            ping_ttl: Duration::from_secs(10),
        }
    }
}

/// Commands crossing from caller tasks into the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        id: u32,
        call: OutgoingCall,
        done: oneshot::Sender<Result<CallResponse, CallError>>,
    },
    Cancel {
        id: u32,
    },
    Respond {
        id: u32,
        response: OutgoingResponse,
    },
    RespondError {
        id: u32,
        code: ErrorCode,
        message: String,
    },
    Ping {
        id: u32,
        done: oneshot::Sender<Result<(), CallError>>,
    },
    Close,
}

/// Cloneable handle for submitting calls on one connection.
#[derive(Clone, Debug)]
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
    ids: Arc<Mutex<IdAllocator>>,
    peer: Arc<Mutex<Option<PeerIdentity>>>,
}

impl Connection {
    /// Build the active (client) side of a connection. The returned
    /// [`Driver`] must be spawned; it performs the handshake and then serves
    /// the connection until it fails or is closed.
    pub fn client<T: Transport>(
        transport: T,
        config: ConnectionConfig,
    ) -> (Connection, Incoming, Driver<T>) {
        Self::build(transport, config, true)
    }

    /// Build the passive (server) side of a connection.
    pub fn server<T: Transport>(
        transport: T,
        config: ConnectionConfig,
    ) -> (Connection, Incoming, Driver<T>) {
        Self::build(transport, config, false)
    }

    fn build<T: Transport>(
        transport: T,
        config: ConnectionConfig,
        is_client: bool,
    ) -> (Connection, Incoming, Driver<T>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        let ids = Arc::new(Mutex::new(IdAllocator::new()));
        let peer = Arc::new(Mutex::new(None));

        let connection = Connection {
            cmd_tx: cmd_tx.clone(),
            ids: Arc::clone(&ids),
            peer: Arc::clone(&peer),
        };
        let incoming = Incoming { rx: inbound_rx };
        let driver = Driver {
            transport,
            is_client,
            handshake: Handshake::new(config.host_port, config.process_name),
            cmd_tx,
            cmd_rx,
            inbound_tx,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            pings: HashMap::new(),
            deadlines: BinaryHeap::new(),
            ids,
            peer,
            ping_ttl: config.ping_ttl,
            commands_open: true,
            shutdown: false,
        };
        (connection, incoming, driver)
    }

    /// Submit an outbound call. The returned handle resolves on the call's
    /// terminal transition: response, error frame, timeout, or cancel.
    pub async fn call(&self, call: OutgoingCall) -> Result<CallHandle, ConnectionError> {
        let id = self.ids.lock().allocate();
        let (done, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Submit { id, call, done })
            .await
            .is_err()
        {
            self.ids.lock().release(id);
            return Err(ConnectionError::Closed);
        }
        Ok(CallHandle {
            id,
            rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Send a ping and obtain a handle resolving on the matching response.
    pub async fn ping(&self) -> Result<PingHandle, ConnectionError> {
        let id = self.ids.lock().allocate();
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Ping { id, done }).await.is_err() {
            self.ids.lock().release(id);
            return Err(ConnectionError::Closed);
        }
        Ok(PingHandle { rx })
    }

    /// Stop the connection. In-flight calls fail with a network error.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }

    /// The peer's identity, once the handshake has completed.
    pub fn peer(&self) -> Option<PeerIdentity> {
        self.peer.lock().clone()
    }

    pub fn peer_host_port(&self) -> Option<String> {
        self.peer.lock().as_ref().map(|p| p.host_port.clone())
    }

    pub fn peer_process_name(&self) -> Option<String> {
        self.peer.lock().as_ref().map(|p| p.process_name.clone())
    }
}

/// Stream of fully reassembled inbound calls.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::Receiver<InboundCall>,
}

impl Incoming {
    /// The next inbound call, or `None` once the connection is gone.
    pub async fn accept(&mut self) -> Option<InboundCall> {
        self.rx.recv().await
    }
}

/// Outgoing id allocation: monotonic, wrapping at 2^32, skipping reserved
/// ids and anything still in flight.
#[derive(Debug)]
struct IdAllocator {
    next: u32,
    in_flight: HashSet<u32>,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            next: 2,
            in_flight: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if id == 0 || id == INIT_ID || id == CONNECTION_ID {
                continue;
            }
            if self.in_flight.insert(id) {
                return id;
            }
        }
    }

    fn release(&mut self, id: u32) {
        self.in_flight.remove(&id);
    }

    fn reset(&mut self) {
        self.in_flight.clear();
    }
}

enum OutboundState {
    /// Caller is waiting; response fragments accumulate here.
    Waiting {
        done: oneshot::Sender<Result<CallResponse, CallError>>,
        reassembly: Option<ResponseReassembly>,
    },
    /// Already completed locally (timeout or cancel); late fragments for the
    /// id are discarded until the record is evicted.
    Terminated,
}

struct OutboundRecord {
    state: OutboundState,
}

enum InboundState {
    Reassembling(RequestReassembly),
    /// Delivered to the handler; the id stays occupied until the response
    /// goes out.
    AwaitingResponse,
}

struct InboundRecord {
    state: InboundState,
    deadline: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum DeadlineKey {
    Out(u32),
    In(u32),
    Ping(u32),
    Evict(u32),
}

/// The connection task. Owns the transport and all per-connection state.
pub struct Driver<T: Transport> {
    transport: T,
    is_client: bool,
    handshake: Handshake,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    inbound_tx: mpsc::Sender<InboundCall>,
    outgoing: HashMap<u32, OutboundRecord>,
    incoming: HashMap<u32, InboundRecord>,
    pings: HashMap<u32, oneshot::Sender<Result<(), CallError>>>,
    deadlines: BinaryHeap<Reverse<(Instant, DeadlineKey)>>,
    ids: Arc<Mutex<IdAllocator>>,
    peer: Arc<Mutex<Option<PeerIdentity>>>,
    ping_ttl: Duration,
    commands_open: bool,
    shutdown: bool,
}

impl<T: Transport> Driver<T> {
    /// Run the connection to completion: handshake, then the multiplexing
    /// loop until the transport closes, a fatal violation occurs, or the
    /// connection is closed locally.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        self.run_handshake().await?;
        loop {
            if self.shutdown {
                return Ok(());
            }
            let next_deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv(), if self.commands_open => {
                    match maybe_cmd {
                        Some(cmd) => self.on_command(cmd).await?,
                        None => self.commands_open = false,
                    }
                }
                received = self.transport.recv_frame() => {
                    match received {
                        Ok(frame) => self.on_frame(frame).await?,
                        Err(TransportError::Closed) => {
                            debug!("transport closed by peer");
                            self.fail_all(CallError::Network("connection closed by peer".into()));
                            return Ok(());
                        }
                        Err(TransportError::Protocol(err)) => {
                            return Err(self.fatal(err).await);
                        }
                        Err(err) => {
                            self.fail_all(CallError::Network(err.to_string()));
                            self.transport.close();
                            return Err(err.into());
                        }
                    }
                }
                () = sleep_at(next_deadline), if next_deadline.is_some() => {
                    self.tick(Instant::now()).await?;
                }
            }
        }
    }

    /// No call frame flows before this returns with the machine in `Ready`.
    async fn run_handshake(&mut self) -> Result<(), ConnectionError> {
        if self.is_client {
            let frame = self.handshake.initiate();
            self.send(frame).await?;
        }
        while !self.handshake.is_ready() {
            let frame = match self.transport.recv_frame().await {
                Ok(frame) => frame,
                Err(TransportError::Protocol(err)) => return Err(self.fatal(err).await),
                Err(err) => {
                    self.fail_all(CallError::Network(err.to_string()));
                    return Err(err.into());
                }
            };
            match self.handshake.on_frame(&frame) {
                Ok(Some(reply)) => self.send(reply).await?,
                Ok(None) => {}
                Err(err) => return Err(self.fatal(err).await),
            }
        }
        let identity = self.handshake.peer().cloned();
        if let Some(identity) = &identity {
            debug!(
                host_port = %identity.host_port,
                process_name = %identity.process_name,
                "handshake complete"
            );
        }
        *self.peer.lock() = identity;
        Ok(())
    }

    async fn on_command(&mut self, cmd: Command) -> Result<(), ConnectionError> {
        match cmd {
            Command::Submit { id, call, done } => self.on_submit(id, call, done).await,
            Command::Cancel { id } => self.on_cancel_command(id).await,
            Command::Respond { id, response } => self.on_respond(id, response).await,
            Command::RespondError { id, code, message } => {
                if self.incoming.remove(&id).is_some() {
                    self.send(Frame::error(id, code, message)).await?;
                }
                Ok(())
            }
            Command::Ping { id, done } => {
                self.pings.insert(id, done);
                self.push_deadline(Instant::now() + self.ping_ttl, DeadlineKey::Ping(id));
                self.send(Frame::new(id, FrameBody::PingRequest)).await
            }
            Command::Close => {
                debug!("connection closed locally");
                self.fail_all(CallError::Network("connection closed locally".into()));
                self.transport.close();
                self.shutdown = true;
                Ok(())
            }
        }
    }

    async fn on_submit(
        &mut self,
        id: u32,
        call: OutgoingCall,
        done: oneshot::Sender<Result<CallResponse, CallError>>,
    ) -> Result<(), ConnectionError> {
        if call.ttl.is_zero() {
            let _ = done.send(Err(CallError::BadRequest(
                "ttl must be greater than zero".into(),
            )));
            self.ids.lock().release(id);
            return Ok(());
        }
        let frames = match fragment_request(id, &call) {
            Ok(frames) => frames,
            Err(err) => {
                let _ = done.send(Err(CallError::Protocol(err)));
                self.ids.lock().release(id);
                return Ok(());
            }
        };

        self.outgoing.insert(
            id,
            OutboundRecord {
                state: OutboundState::Waiting {
                    done,
                    reassembly: None,
                },
            },
        );
        self.push_deadline(Instant::now() + call.ttl, DeadlineKey::Out(id));
        // Fragments of one call go out back to back; other calls may only
        // interleave at fragment granularity.
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    async fn on_cancel_command(&mut self, id: u32) -> Result<(), ConnectionError> {
        let cancelled = match self.outgoing.get_mut(&id) {
            Some(record) => match mem::replace(&mut record.state, OutboundState::Terminated) {
                OutboundState::Waiting { done, .. } => {
                    let _ = done.send(Err(CallError::Cancelled));
                    true
                }
                OutboundState::Terminated => false,
            },
            None => false,
        };
        if cancelled {
            self.push_deadline(Instant::now() + TOMBSTONE_LINGER, DeadlineKey::Evict(id));
            self.send(Frame::new(id, FrameBody::Cancel)).await?;
        }
        Ok(())
    }

    async fn on_respond(
        &mut self,
        id: u32,
        response: OutgoingResponse,
    ) -> Result<(), ConnectionError> {
        // The record disappears if the call was cancelled, claimed, or timed
        // out; a late response is silently dropped.
        if self.incoming.remove(&id).is_none() {
            return Ok(());
        }
        match fragment_response(id, &response) {
            Ok(frames) => {
                for frame in frames {
                    self.send(frame).await?;
                }
                Ok(())
            }
            Err(err) => {
                warn!(id, error = %err, "response could not be fragmented");
                self.send(Frame::error(id, ErrorCode::Unexpected, err.to_string()))
                    .await
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let id = frame.id;
        match frame.body {
            FrameBody::InitRequest(_) | FrameBody::InitResponse(_) => {
                let err = ProtocolError::UnexpectedFrame {
                    frame_type: frame.body.frame_type(),
                    state: "ready",
                };
                Err(self.fatal(err).await)
            }
            FrameBody::CallRequest(body) => self.on_call_request(id, body).await,
            FrameBody::CallRequestContinue(body) => {
                self.on_call_request_continue(id, body).await
            }
            FrameBody::CallResponse(body) => self.on_call_response(id, body).await,
            FrameBody::CallResponseContinue(body) => {
                self.on_call_response_continue(id, body).await
            }
            FrameBody::Cancel => {
                if self.incoming.remove(&id).is_some() {
                    debug!(id, "inbound call cancelled by peer");
                } else if let Some(record) = self.outgoing.get_mut(&id) {
                    let state = mem::replace(&mut record.state, OutboundState::Terminated);
                    if let OutboundState::Waiting { done, .. } = state {
                        let _ = done.send(Err(CallError::Cancelled));
                        self.push_deadline(
                            Instant::now() + TOMBSTONE_LINGER,
                            DeadlineKey::Evict(id),
                        );
                    }
                }
                Ok(())
            }
            FrameBody::Claim => {
                if self.incoming.remove(&id).is_some() {
                    debug!(id, "inbound call claimed by a sibling worker");
                }
                Ok(())
            }
            FrameBody::PingRequest => self.send(Frame::new(id, FrameBody::PingResponse)).await,
            FrameBody::PingResponse => {
                if let Some(done) = self.pings.remove(&id) {
                    let _ = done.send(Ok(()));
                    self.ids.lock().release(id);
                }
                Ok(())
            }
            FrameBody::Error(body) => self.on_error_frame(id, body).await,
        }
    }

    async fn on_call_request(
        &mut self,
        id: u32,
        body: CallRequestBody,
    ) -> Result<(), ConnectionError> {
        if self.incoming.contains_key(&id) {
            self.send(Frame::error(
                id,
                ErrorCode::BadRequest,
                "call-request for an id that is already open",
            ))
            .await?;
            let err = ProtocolError::UnexpectedFrame {
                frame_type: crate::frame::FrameType::CallRequest,
                state: "open-call",
            };
            return Err(self.fatal(err).await);
        }

        let now = Instant::now();
        match RequestReassembly::begin(body, now) {
            Err(fault) => {
                debug!(id, %fault, "rejecting inbound call");
                self.send(Frame::error(id, fault.wire_code(), fault.to_string()))
                    .await
            }
            Ok((assembly, complete)) => {
                let deadline = assembly.deadline;
                self.push_deadline(deadline, DeadlineKey::In(id));
                if complete {
                    self.deliver(id, assembly, deadline).await
                } else {
                    self.incoming.insert(
                        id,
                        InboundRecord {
                            state: InboundState::Reassembling(assembly),
                            deadline,
                        },
                    );
                    Ok(())
                }
            }
        }
    }

    async fn on_call_request_continue(
        &mut self,
        id: u32,
        body: ContinueBody,
    ) -> Result<(), ConnectionError> {
        let Some(mut record) = self.incoming.remove(&id) else {
            // Never allocate state for an unknown id.
            return self
                .send(Frame::error(
                    id,
                    ErrorCode::BadRequest,
                    "continuation for an unknown id",
                ))
                .await;
        };
        match record.state {
            InboundState::AwaitingResponse => {
                // The call itself is still in flight awaiting its response;
                // only the stray continuation is rejected.
                self.incoming.insert(
                    id,
                    InboundRecord {
                        state: InboundState::AwaitingResponse,
                        deadline: record.deadline,
                    },
                );
                self.send(Frame::error(
                    id,
                    ErrorCode::BadRequest,
                    "continuation after the final fragment",
                ))
                .await
            }
            InboundState::Reassembling(mut assembly) => {
                match assembly.absorb(&body, Instant::now()) {
                    Ok(true) => self.deliver(id, assembly, record.deadline).await,
                    Ok(false) => {
                        record.state = InboundState::Reassembling(assembly);
                        self.incoming.insert(id, record);
                        Ok(())
                    }
                    Err(fault) => {
                        debug!(id, %fault, "terminating inbound call");
                        self.send(Frame::error(id, fault.wire_code(), fault.to_string()))
                            .await
                    }
                }
            }
        }
    }

    /// Hand a completed request up to the handler layer. The id stays
    /// occupied until the handler responds.
    async fn deliver(
        &mut self,
        id: u32,
        mut assembly: RequestReassembly,
        deadline: Instant,
    ) -> Result<(), ConnectionError> {
        let service = mem::take(&mut assembly.service);
        let headers = mem::take(&mut assembly.headers);
        let ttl = assembly.ttl;
        let tracing = assembly.tracing;
        let (arg1, arg2, arg3) = assembly.into_args();

        self.incoming.insert(
            id,
            InboundRecord {
                state: InboundState::AwaitingResponse,
                deadline,
            },
        );
        let call = InboundCall {
            id,
            service,
            headers,
            ttl,
            tracing,
            arg1,
            arg2,
            arg3,
            cmd_tx: self.cmd_tx.clone(),
        };
        if self.inbound_tx.send(call).await.is_err() {
            self.incoming.remove(&id);
            return self
                .send(Frame::error(id, ErrorCode::Declined, "no handler attached"))
                .await;
        }
        Ok(())
    }

    async fn on_call_response(
        &mut self,
        id: u32,
        body: CallResponseBody,
    ) -> Result<(), ConnectionError> {
        let more = body.flags.more();
        let Some(mut record) = self.outgoing.remove(&id) else {
            return self
                .send(Frame::error(
                    id,
                    ErrorCode::BadRequest,
                    "call-response for an unknown id",
                ))
                .await;
        };
        match mem::replace(&mut record.state, OutboundState::Terminated) {
            OutboundState::Terminated => {
                if more {
                    self.outgoing.insert(id, record);
                } else {
                    self.ids.lock().release(id);
                }
                Ok(())
            }
            OutboundState::Waiting {
                done,
                reassembly: Some(_),
            } => {
                let _ = done.send(Err(CallError::BadRequest(
                    "duplicate call-response".into(),
                )));
                self.ids.lock().release(id);
                self.send(Frame::error(
                    id,
                    ErrorCode::BadRequest,
                    "duplicate call-response",
                ))
                .await
            }
            OutboundState::Waiting {
                done,
                reassembly: None,
            } => match ResponseReassembly::begin(body) {
                Ok((assembly, true)) => {
                    complete_call(done, assembly);
                    self.ids.lock().release(id);
                    Ok(())
                }
                Ok((assembly, false)) => {
                    record.state = OutboundState::Waiting {
                        done,
                        reassembly: Some(assembly),
                    };
                    self.outgoing.insert(id, record);
                    Ok(())
                }
                Err(fault) => {
                    let wire_code = fault.wire_code();
                    let message = fault.to_string();
                    let _ = done.send(Err(fault.into()));
                    self.ids.lock().release(id);
                    self.send(Frame::error(id, wire_code, message)).await
                }
            },
        }
    }

    async fn on_call_response_continue(
        &mut self,
        id: u32,
        body: ContinueBody,
    ) -> Result<(), ConnectionError> {
        let more = body.flags.more();
        let Some(mut record) = self.outgoing.remove(&id) else {
            return self
                .send(Frame::error(
                    id,
                    ErrorCode::BadRequest,
                    "continuation for an unknown id",
                ))
                .await;
        };
        match mem::replace(&mut record.state, OutboundState::Terminated) {
            OutboundState::Terminated => {
                if more {
                    self.outgoing.insert(id, record);
                } else {
                    self.ids.lock().release(id);
                }
                Ok(())
            }
            OutboundState::Waiting {
                done,
                reassembly: None,
            } => {
                let _ = done.send(Err(CallError::BadRequest(
                    "continuation before call-response".into(),
                )));
                self.ids.lock().release(id);
                self.send(Frame::error(
                    id,
                    ErrorCode::BadRequest,
                    "continuation before call-response",
                ))
                .await
            }
            OutboundState::Waiting {
                done,
                reassembly: Some(mut assembly),
            } => match assembly.absorb(&body) {
                Ok(true) => {
                    complete_call(done, assembly);
                    self.ids.lock().release(id);
                    Ok(())
                }
                Ok(false) => {
                    record.state = OutboundState::Waiting {
                        done,
                        reassembly: Some(assembly),
                    };
                    self.outgoing.insert(id, record);
                    Ok(())
                }
                Err(fault) => {
                    let wire_code = fault.wire_code();
                    let message = fault.to_string();
                    let _ = done.send(Err(fault.into()));
                    self.ids.lock().release(id);
                    self.send(Frame::error(id, wire_code, message)).await
                }
            },
        }
    }

    async fn on_error_frame(&mut self, id: u32, body: ErrorBody) -> Result<(), ConnectionError> {
        if id == CONNECTION_ID {
            warn!(code = %body.code, message = %body.message, "peer terminated the connection");
            let err = ConnectionError::Peer {
                code: body.code,
                message: body.message.clone(),
            };
            self.fail_all(CallError::from_wire(body.code, body.message));
            self.transport.close();
            return Err(err);
        }
        if let Some(record) = self.outgoing.remove(&id) {
            if let OutboundState::Waiting { done, .. } = record.state {
                let _ = done.send(Err(CallError::from_wire(body.code, body.message)));
            }
            self.ids.lock().release(id);
        } else if let Some(done) = self.pings.remove(&id) {
            let _ = done.send(Err(CallError::from_wire(body.code, body.message)));
            self.ids.lock().release(id);
        } else if self.incoming.remove(&id).is_some() {
            debug!(id, code = %body.code, "peer aborted its call");
        }
        Ok(())
    }

    /// Evict everything whose deadline has passed.
    async fn tick(&mut self, now: Instant) -> Result<(), ConnectionError> {
        while let Some(Reverse((at, key))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            match key {
                DeadlineKey::Out(id) => {
                    let timed_out = match self.outgoing.get_mut(&id) {
                        Some(record) => {
                            match mem::replace(&mut record.state, OutboundState::Terminated) {
                                OutboundState::Waiting { done, .. } => {
                                    let _ = done.send(Err(CallError::Timeout));
                                    true
                                }
                                OutboundState::Terminated => false,
                            }
                        }
                        None => false,
                    };
                    if timed_out {
                        debug!(id, "outbound call timed out");
                        self.push_deadline(now + TOMBSTONE_LINGER, DeadlineKey::Evict(id));
                        self.send(Frame::error(id, ErrorCode::Timeout, "call timed out"))
                            .await?;
                    }
                }
                DeadlineKey::Evict(id) => {
                    if self.outgoing.remove(&id).is_some() {
                        self.ids.lock().release(id);
                    }
                }
                DeadlineKey::In(id) => {
                    if self.incoming.remove(&id).is_some() {
                        debug!(id, "inbound call timed out");
                        self.send(Frame::error(id, ErrorCode::Timeout, "call timed out"))
                            .await?;
                    }
                }
                DeadlineKey::Ping(id) => {
                    if let Some(done) = self.pings.remove(&id) {
                        let _ = done.send(Err(CallError::Timeout));
                        self.ids.lock().release(id);
                    }
                }
            }
        }
        Ok(())
    }

    fn push_deadline(&mut self, at: Instant, key: DeadlineKey) {
        self.deadlines.push(Reverse((at, key)));
    }

    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        match self.transport.send_frame(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail_all(CallError::Network(err.to_string()));
                self.transport.close();
                Err(err.into())
            }
        }
    }

    /// Unrecoverable violation: tell the peer, fail everything, close.
    async fn fatal(&mut self, err: ProtocolError) -> ConnectionError {
        warn!(error = %err, "fatal protocol violation; closing connection");
        let _ = self
            .transport
            .send_frame(Frame::error(
                CONNECTION_ID,
                ErrorCode::FatalProtocol,
                err.to_string(),
            ))
            .await;
        self.fail_all(CallError::Protocol(err.clone()));
        self.transport.close();
        ConnectionError::Protocol(err)
    }

    fn fail_all(&mut self, err: CallError) {
        for (_, record) in self.outgoing.drain() {
            if let OutboundState::Waiting { done, .. } = record.state {
                let _ = done.send(Err(err.clone()));
            }
        }
        for (_, done) in self.pings.drain() {
            let _ = done.send(Err(err.clone()));
        }
        self.incoming.clear();
        self.deadlines.clear();
        self.ids.lock().reset();
    }
}

fn complete_call(
    done: oneshot::Sender<Result<CallResponse, CallError>>,
    mut assembly: ResponseReassembly,
) {
    let code = assembly.code;
    let headers = mem::take(&mut assembly.headers);
    let tracing = assembly.tracing;
    let (arg1, arg2, arg3) = assembly.into_args();
    let _ = done.send(Ok(CallResponse {
        code,
        headers,
        tracing,
        arg1,
        arg2,
        arg3,
    }));
}

async fn sleep_at(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
