use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::config::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SEND_BUFFER, PumpConfig, ping_period_for,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub, accepting WebSocket connections on /ws.
    Serve(ServeArgs),
    /// Connect to a hub and exchange messages from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Seconds allowed to write one frame to a peer.
    #[arg(long, default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Seconds a peer may stay silent before it is considered dead.
    #[arg(long, default_value_t = 60)]
    pub pong_wait_secs: u64,

    /// Seconds between keepalive pings. Defaults to 9/10 of the pong wait.
    #[arg(long)]
    pub ping_period_secs: Option<u64>,

    /// Largest message accepted from a peer, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Messages buffered per client before it is dropped as too slow.
    #[arg(long, default_value_t = DEFAULT_SEND_BUFFER)]
    pub send_buffer: usize,
}

impl ServeArgs {
    pub fn pump_config(&self) -> Result<PumpConfig> {
        let pong_wait = Duration::from_secs(self.pong_wait_secs);
        let config = PumpConfig {
            write_wait: Duration::from_secs(self.write_wait_secs),
            pong_wait,
            ping_period: self
                .ping_period_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| ping_period_for(pong_wait)),
            max_message_size: self.max_message_size,
            send_buffer: self.send_buffer,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the hub.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    pub url: String,
}
