//! Frame transport over any byte stream.
//!
//! Applies the codec to a read buffer: the leading 2-byte size field tells
//! us how much to buffer, and `decode` consumes whole frames as they become
//! available. EOF mid-frame is a protocol failure, EOF on a frame boundary a
//! clean close.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::codec;
use crate::error::{ProtocolError, TransportError};
use crate::frame::Frame;

use super::Transport;

const READ_BUFFER_CAPACITY: usize = 16 * 1024;
const PAIR_PIPE_CAPACITY: usize = 256 * 1024;

/// Frame transport over an `AsyncRead + AsyncWrite` byte stream.
#[derive(Debug)]
pub struct StreamTransport<S> {
    io: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    closed: bool,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: S) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            write_buf: BytesMut::new(),
            closed: false,
        }
    }
}

impl StreamTransport<DuplexStream> {
    /// A connected in-memory pair, with real frame encoding in between.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PAIR_PIPE_CAPACITY);
        (Self::new(a), Self::new(b))
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.write_buf.clear();
        codec::encode(&frame, &mut self.write_buf)?;
        self.io.write_all(&self.write_buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if self.closed {
                return Err(TransportError::Closed);
            }
            if let Some(frame) = codec::decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            let read = self.io.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return if self.read_buf.is_empty() {
                    Err(TransportError::Closed)
                } else {
                    Err(TransportError::Protocol(ProtocolError::Truncated {
                        field: "frame",
                    }))
                };
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
