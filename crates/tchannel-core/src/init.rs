//! Version-negotiating init handshake.
//!
//! Pure state machine, driven by the connection task: it produces frames to
//! send and absorbs init frames, never touching I/O itself. No call frame
//! may flow in either direction until the machine reaches `Ready`.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameBody, InitBody};
use crate::limits::{
    INIT_HEADER_HOST_PORT, INIT_HEADER_PROCESS_NAME, INIT_ID, PROTOCOL_VERSION,
};

/// Handshake progress for one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitState {
    /// Nothing sent or received yet.
    New,
    /// Active side: init request sent, waiting for the response.
    AwaitInitRes,
    /// Handshake complete; call frames may flow.
    Ready,
}

impl InitState {
    fn name(self) -> &'static str {
        match self {
            InitState::New => "new",
            InitState::AwaitInitRes => "await-init-res",
            InitState::Ready => "ready",
        }
    }
}

/// Identity a peer advertises during the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIdentity {
    pub host_port: String,
    pub process_name: String,
}

/// The per-connection handshake machine.
#[derive(Debug)]
pub struct Handshake {
    state: InitState,
    host_port: String,
    process_name: String,
    peer: Option<PeerIdentity>,
}

impl Handshake {
    pub fn new(host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            state: InitState::New,
            host_port: host_port.into(),
            process_name: process_name.into(),
            peer: None,
        }
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == InitState::Ready
    }

    /// The peer's advertised identity, once the handshake has seen it.
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    /// Active side: produce the opening init request.
    pub fn initiate(&mut self) -> Frame {
        debug_assert_eq!(self.state, InitState::New);
        self.state = InitState::AwaitInitRes;
        Frame::new(
            INIT_ID,
            FrameBody::InitRequest(InitBody::new(&self.host_port, &self.process_name)),
        )
    }

    /// Absorb one frame while not yet ready. Returns the frame to send in
    /// reply, if any. Any violation is fatal for the connection.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Option<Frame>, ProtocolError> {
        match (self.state, &frame.body) {
            (InitState::New, FrameBody::InitRequest(init)) => {
                self.check_version(init)?;
                self.peer = Some(Self::identity(init)?);
                self.state = InitState::Ready;
                Ok(Some(Frame::new(
                    frame.id,
                    FrameBody::InitResponse(InitBody::new(&self.host_port, &self.process_name)),
                )))
            }
            (InitState::AwaitInitRes, FrameBody::InitResponse(init)) => {
                self.check_version(init)?;
                self.peer = Some(Self::identity(init)?);
                self.state = InitState::Ready;
                Ok(None)
            }
            _ => Err(ProtocolError::UnexpectedFrame {
                frame_type: frame.frame_type(),
                state: self.state.name(),
            }),
        }
    }

    fn check_version(&self, init: &InitBody) -> Result<(), ProtocolError> {
        if init.version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(init.version));
        }
        Ok(())
    }

    fn identity(init: &InitBody) -> Result<PeerIdentity, ProtocolError> {
        let host_port = init
            .host_port()
            .ok_or(ProtocolError::MissingInitHeader(INIT_HEADER_HOST_PORT))?;
        let process_name = init
            .process_name()
            .ok_or(ProtocolError::MissingInitHeader(INIT_HEADER_PROCESS_NAME))?;
        Ok(PeerIdentity {
            host_port: host_port.to_string(),
            process_name: process_name.to_string(),
        })
    }
}
