//! The frame-level transport seam.
//!
//! The connection driver is generic over [`Transport`] and is the sole owner
//! of its transport, so backends take `&mut self` and need no internal
//! locking. Each backend lives in its own module under `transport/`.

use std::future::Future;

use crate::error::TransportError;
use crate::frame::Frame;

pub trait Transport: Send + 'static {
    /// Send one frame. Frames are written whole; fragments queued back to
    /// back by the driver stay contiguous on the wire.
    fn send_frame(
        &mut self,
        frame: Frame,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame. Resolves to [`TransportError::Closed`] on a
    /// clean shutdown.
    fn recv_frame(&mut self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    /// Stop the transport. Subsequent sends and receives fail with
    /// [`TransportError::Closed`].
    fn close(&mut self);
}

pub mod mem;
pub mod stream;

pub use mem::MemTransport;
pub use stream::StreamTransport;
