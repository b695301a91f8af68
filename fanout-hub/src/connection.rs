//! Framed, bidirectional connection with a shared, idempotent close.
//!
//! A [`Connection`] wraps any `Stream` of inbound frames and `Sink` of
//! outbound frames. It is split into a [`FrameReader`] for the read pump and a
//! [`FrameWriter`] for the write pump. Both halves share a [`CloseSignal`], so
//! either pump can tear the connection down, as many times as it likes, and
//! the other half notices on its next suspension point.

use std::{future::Future, time::Duration};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{select, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ConnectionError};

/// One unit exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application payload.
    Message(Bytes),
    /// Keepalive probe.
    Ping(Bytes),
    /// Keepalive response.
    Pong(Bytes),
    /// Close handshake, with the close code if the peer sent one.
    Close(Option<u16>),
}

#[derive(Debug, Clone, Default)]
pub struct CloseSignal {
    token: CancellationToken,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the connection closed. Calling this more than once is harmless.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once either half has closed the connection.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}

pub struct Connection<R, W> {
    stream: R,
    sink: W,
    signal: CloseSignal,
}

impl<R, W> Connection<R, W> {
    pub fn new(stream: R, sink: W) -> Self {
        Self {
            stream,
            sink,
            signal: CloseSignal::new(),
        }
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    pub fn split(self) -> (FrameReader<R>, FrameWriter<W>) {
        let Connection {
            stream,
            sink,
            signal,
        } = self;
        (
            FrameReader {
                stream,
                signal: signal.clone(),
            },
            FrameWriter {
                sink,
                signal,
                sink_closed: false,
            },
        )
    }
}

/// Read half of a [`Connection`].
pub struct FrameReader<R> {
    stream: R,
    signal: CloseSignal,
}

impl<R, E> FrameReader<R>
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Into<BoxError>,
{
    /// Waits for the next frame. Returns [`ConnectionError::Closed`] when the
    /// stream ends or the connection has been closed locally.
    pub async fn read_frame(&mut self) -> Result<Frame, ConnectionError> {
        if self.signal.is_closed() {
            return Err(ConnectionError::Closed);
        }

        select! {
            biased;
            _ = self.signal.closed() => Err(ConnectionError::Closed),
            next = self.stream.next() => match next {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(err)) => Err(ConnectionError::Transport(err.into())),
                None => Err(ConnectionError::Closed),
            },
        }
    }
}

impl<R> FrameReader<R> {
    pub fn close(&self) {
        self.signal.close();
    }
}

/// Write half of a [`Connection`].
pub struct FrameWriter<W> {
    sink: W,
    signal: CloseSignal,
    sink_closed: bool,
}

impl<W> FrameWriter<W>
where
    W: Sink<Frame> + Unpin,
    W::Error: Into<BoxError>,
{
    /// Writes and flushes one frame, giving up after `wait`.
    pub async fn write_frame(&mut self, frame: Frame, wait: Duration) -> Result<(), ConnectionError> {
        if self.signal.is_closed() {
            return Err(ConnectionError::Closed);
        }

        match timeout(wait, self.sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ConnectionError::Transport(err.into())),
            Err(_) => Err(ConnectionError::WriteTimeout(wait)),
        }
    }

    /// Closes the connection for both halves and shuts the sink down, waiting
    /// at most `wait` for the transport to flush. Safe to call repeatedly.
    pub async fn close(&mut self, wait: Duration) {
        self.signal.close();
        if self.sink_closed {
            return;
        }
        self.sink_closed = true;
        // The peer may already be gone; a failed shutdown changes nothing.
        let _ = timeout(wait, self.sink.close()).await;
    }
}

impl<W> FrameWriter<W> {
    /// Resolves once either half has closed the connection. The returned
    /// future owns its handle on the close signal and does not borrow the
    /// writer.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let signal = self.signal.clone();
        async move { signal.closed().await }
    }
}
