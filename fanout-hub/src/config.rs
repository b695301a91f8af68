//! Timing and sizing knobs shared by every connection's pumps.

use std::time::Duration;

use anyhow::{Result, ensure};

/// Time allowed to write a single frame to the peer.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between two frames from the peer before it is considered dead.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Largest inbound message accepted from a peer, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Capacity of each client's outbound queue.
pub const DEFAULT_SEND_BUFFER: usize = 256;

/// Limits applied to every client connection.
///
/// `ping_period` must stay below `pong_wait` so that our keepalive probes reach
/// the peer (and its pongs come back) before our own read deadline expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpConfig {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub send_buffer: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            write_wait: DEFAULT_WRITE_WAIT,
            pong_wait: DEFAULT_PONG_WAIT,
            ping_period: ping_period_for(DEFAULT_PONG_WAIT),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_buffer: DEFAULT_SEND_BUFFER,
        }
    }
}

impl PumpConfig {
    /// Builds a config whose ping period is derived from `pong_wait`.
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: ping_period_for(pong_wait),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.write_wait.is_zero(), "write wait must be non-zero");
        ensure!(!self.pong_wait.is_zero(), "pong wait must be non-zero");
        ensure!(!self.ping_period.is_zero(), "ping period must be non-zero");
        ensure!(
            self.ping_period < self.pong_wait,
            "ping period ({:?}) must be shorter than pong wait ({:?})",
            self.ping_period,
            self.pong_wait
        );
        ensure!(
            self.max_message_size > 0,
            "max message size must be at least one byte"
        );
        ensure!(self.send_buffer > 0, "send buffer must hold at least one message");
        Ok(())
    }
}

/// Nine tenths of `pong_wait`.
pub fn ping_period_for(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}
