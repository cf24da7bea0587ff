//! In-process frame transport, for tests and local wiring.

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::frame::Frame;

use super::Transport;

const CHANNEL_CAPACITY: usize = 64;

/// One end of an in-process frame pipe.
#[derive(Debug)]
pub struct MemTransport {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
    closed: bool,
}

impl MemTransport {
    /// A connected pair of transports; frames sent on one end arrive on the
    /// other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                tx: tx_b,
                rx: rx_a,
                closed: false,
            },
            Self {
                tx: tx_a,
                rx: rx_b,
                closed: false,
            },
        )
    }
}

impl Transport for MemTransport {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}
