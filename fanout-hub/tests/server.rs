//! Runs the real axum server and talks to it over WebSockets.

use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use fanout_hub::{config::PumpConfig, hub::HubHandle, server::Server};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Running {
    addr: SocketAddr,
    hub: HubHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Running {
    async fn start(config: PumpConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, config);
        let addr = server.local_addr()?;
        let hub = server.hub();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));
        Ok(Self {
            addr,
            hub,
            stop,
            task,
        })
    }

    async fn connect(&self) -> Result<Socket> {
        let url = format!("ws://{}/ws", self.addr);
        let (socket, _response) = timeout(WAIT, connect_async(url.as_str())).await??;
        Ok(socket)
    }

    async fn wait_for_clients(&self, count: usize) -> Result<()> {
        timeout(WAIT, async {
            loop {
                if self.hub.status().await?.clients.len() == count {
                    return Ok::<_, anyhow::Error>(());
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await?
    }

    async fn stop(self) -> Result<()> {
        let _ = self.stop.send(());
        timeout(WAIT, self.task).await???;
        Ok(())
    }
}

async fn next_text(socket: &mut Socket) -> Result<String> {
    loop {
        let message = timeout(WAIT, socket.next())
            .await?
            .ok_or_else(|| anyhow!("connection ended"))??;
        match message {
            Message::Text(text) => return Ok(text),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Err(anyhow!("unexpected message {other:?}")),
        }
    }
}

/// Waits for the server to hang up, tolerating an abrupt reset.
async fn expect_closed(socket: &mut Socket) -> Result<()> {
    loop {
        match timeout(WAIT, socket.next()).await? {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => return Err(anyhow!("unexpected message {other:?}")),
        }
    }
}

#[tokio::test]
async fn message_reaches_every_client_including_sender() -> Result<()> {
    let server = Running::start(PumpConfig::default()).await?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;
    let mut carol = server.connect().await?;
    server.wait_for_clients(3).await?;

    alice
        .send(Message::Text("hello\n  world  ".to_string()))
        .await?;

    for socket in [&mut alice, &mut bob, &mut carol] {
        assert_eq!(next_text(socket).await?, "hello world");
    }

    server.stop().await
}

#[tokio::test]
async fn healthz_reports_hub_counters() -> Result<()> {
    let server = Running::start(PumpConfig::default()).await?;
    let mut alice = server.connect().await?;
    server.wait_for_clients(1).await?;

    alice.send(Message::Text("ping".to_string())).await?;
    assert_eq!(next_text(&mut alice).await?, "ping");

    let body: Value = reqwest::get(format!("http://{}/healthz", server.addr))
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["clients"], 1);
    assert_eq!(body["broadcasts"], 1);
    assert_eq!(body["evictions"], 0);

    server.stop().await
}

#[tokio::test]
async fn plain_http_on_ws_route_is_rejected() -> Result<()> {
    let server = Running::start(PumpConfig::default()).await?;

    let response = reqwest::get(format!("http://{}/ws", server.addr)).await?;
    assert!(response.status().is_client_error());
    assert_eq!(server.hub.status().await?.clients.len(), 0);

    server.stop().await
}

#[tokio::test]
async fn oversized_message_closes_the_connection() -> Result<()> {
    let server = Running::start(PumpConfig {
        max_message_size: 16,
        ..PumpConfig::default()
    })
    .await?;
    let mut alice = server.connect().await?;
    server.wait_for_clients(1).await?;

    alice.send(Message::Text("x".repeat(64))).await?;

    expect_closed(&mut alice).await?;
    server.wait_for_clients(0).await?;
    assert_eq!(server.hub.status().await?.broadcasts, 0);

    server.stop().await
}

#[tokio::test]
async fn shutdown_closes_connected_clients() -> Result<()> {
    let server = Running::start(PumpConfig::default()).await?;
    let mut alice = server.connect().await?;
    server.wait_for_clients(1).await?;

    let hub = server.hub.clone();
    server.stop().await?;

    expect_closed(&mut alice).await?;
    assert!(hub.status().await.is_err());
    Ok(())
}
