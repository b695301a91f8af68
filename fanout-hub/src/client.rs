//! Per-connection state and the pumps that move frames between a peer and the
//! hub.
//!
//! Every connection gets exactly two tasks. The read pump is the only reader:
//! it enforces the size limit and read deadline and forwards normalized
//! messages to the hub. The write pump is the only writer: it drains the
//! client's bounded outbound queue and keeps the peer alive with pings. The
//! two pumps never call into each other; they share only the outbound queue
//! (through the hub) and the connection's close signal.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout_at},
};
use tracing::{debug, info, warn};

use crate::{
    config::PumpConfig,
    connection::{Connection, Frame, FrameReader, FrameWriter},
    error::{BoxError, ConnectionError, HubError},
    hub::{ClientId, HubHandle},
    message::{coalesce, normalize},
};

/// A connection that has been accepted but not yet registered.
pub struct Client<R, W> {
    id: ClientId,
    hub: HubHandle,
    connection: Connection<R, W>,
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: mpsc::Receiver<Bytes>,
    config: Arc<PumpConfig>,
}

/// Running pumps of a registered client.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Waits until both pumps have finished.
    pub async fn join(self) {
        let (read, write) = tokio::join!(self.read_task, self.write_task);
        if let Err(err) = read.and(write) {
            warn!(client = %self.id, error = ?err, "client pump panicked");
        }
    }
}

impl<R, W, E> Client<R, W>
where
    R: Stream<Item = Result<Frame, E>> + Unpin + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    W: Sink<Frame> + Unpin + Send + 'static,
    W::Error: Into<BoxError> + Send,
{
    pub fn new(hub: HubHandle, connection: Connection<R, W>, config: Arc<PumpConfig>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_buffer);
        Self {
            id: ClientId::next(),
            hub,
            connection,
            outbound_tx,
            outbound_rx,
            config,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Registers with the hub, then launches both pumps.
    ///
    /// Registration is queued before either pump runs, so the hub knows about
    /// the client before any message it sends can be broadcast.
    pub fn start(self) -> Result<ClientHandle, HubError> {
        let Client {
            id,
            hub,
            connection,
            outbound_tx,
            outbound_rx,
            config,
        } = self;

        if let Err(err) = hub.register(id, outbound_tx) {
            connection.close_signal().close();
            return Err(err);
        }

        let (reader, writer) = connection.split();
        let write_task = tokio::spawn(write_pump(id, writer, outbound_rx, Arc::clone(&config)));
        let read_task = tokio::spawn(read_pump(id, hub, reader, config));

        Ok(ClientHandle {
            id,
            read_task,
            write_task,
        })
    }
}

/// Wraps an established connection in a [`Client`] and starts serving it.
pub fn serve_connection<R, W, E>(
    hub: &HubHandle,
    connection: Connection<R, W>,
    config: Arc<PumpConfig>,
) -> Result<ClientHandle, HubError>
where
    R: Stream<Item = Result<Frame, E>> + Unpin + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    W: Sink<Frame> + Unpin + Send + 'static,
    W::Error: Into<BoxError> + Send,
{
    let client = Client::new(hub.clone(), connection, config);
    debug!(client = %client.id(), "client connected");
    client.start()
}

async fn read_pump<R, E>(
    id: ClientId,
    hub: HubHandle,
    mut reader: FrameReader<R>,
    config: Arc<PumpConfig>,
) where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Into<BoxError>,
{
    let result = read_loop(&hub, &mut reader, &config).await;
    // A stopped hub has nothing left to deregister from.
    let _ = hub.unregister(id);
    reader.close();
    log_termination(id, "read", result);
}

async fn read_loop<R, E>(
    hub: &HubHandle,
    reader: &mut FrameReader<R>,
    config: &PumpConfig,
) -> Result<(), ConnectionError>
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Into<BoxError>,
{
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let frame = match timeout_at(deadline, reader.read_frame()).await {
            Ok(frame) => frame?,
            Err(_) => return Err(ConnectionError::ReadTimeout(config.pong_wait)),
        };
        deadline = Instant::now() + config.pong_wait;

        match frame {
            Frame::Message(payload) => {
                if payload.len() > config.max_message_size {
                    return Err(ConnectionError::FrameTooLarge {
                        size: payload.len(),
                        limit: config.max_message_size,
                    });
                }
                hub.broadcast(normalize(&payload))?;
            }
            // The transport answers pings itself; both only prove liveness.
            Frame::Ping(_) | Frame::Pong(_) => {}
            Frame::Close(code) => {
                return match ConnectionError::from_close_code(code) {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
        }
    }
}

async fn write_pump<W>(
    id: ClientId,
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Bytes>,
    config: Arc<PumpConfig>,
) where
    W: Sink<Frame> + Unpin,
    W::Error: Into<BoxError>,
{
    let result = write_loop(&mut writer, &mut outbound, &config).await;
    writer.close(config.write_wait).await;
    log_termination(id, "write", result);
}

async fn write_loop<W>(
    writer: &mut FrameWriter<W>,
    outbound: &mut mpsc::Receiver<Bytes>,
    config: &PumpConfig,
) -> Result<(), ConnectionError>
where
    W: Sink<Frame> + Unpin,
    W::Error: Into<BoxError>,
{
    let mut keepalive = interval_at(Instant::now() + config.ping_period, config.ping_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = writer.closed() => return Ok(()),
            message = outbound.recv() => match message {
                Some(first) => {
                    let frame = coalesce(first, drain_queued(outbound, config.send_buffer));
                    writer.write_frame(Frame::Message(frame), config.write_wait).await?;
                }
                None => {
                    // The hub dropped us; tell the peer before hanging up.
                    let _ = writer.write_frame(Frame::Close(None), config.write_wait).await;
                    return Ok(());
                }
            },
            _ = keepalive.tick() => {
                writer.write_frame(Frame::Ping(Bytes::new()), config.write_wait).await?;
            }
        }
    }
}

/// Takes whatever is already queued, without waiting for more.
fn drain_queued(outbound: &mut mpsc::Receiver<Bytes>, limit: usize) -> Vec<Bytes> {
    let mut queued = Vec::new();
    while queued.len() < limit {
        match outbound.try_recv() {
            Ok(payload) => queued.push(payload),
            Err(_) => break,
        }
    }
    queued
}

fn log_termination(id: ClientId, pump: &'static str, result: Result<(), ConnectionError>) {
    match result {
        Ok(()) | Err(ConnectionError::Closed) => debug!(client = %id, pump, "connection closed"),
        Err(err @ (ConnectionError::ReadTimeout(_) | ConnectionError::WriteTimeout(_))) => {
            info!(client = %id, pump, error = %err, "peer timed out")
        }
        Err(err) if err.is_unexpected() => {
            warn!(client = %id, pump, error = %err, "connection failed")
        }
        Err(err) => debug!(client = %id, pump, error = %err, "connection ended"),
    }
}
