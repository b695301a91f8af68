use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Close codes a peer sends when it leaves on purpose.
const NORMAL_CLOSURE: u16 = 1000;
const GOING_AWAY: u16 = 1001;

/// Reasons a connection's pumps stop. Every variant is terminal for that
/// connection only.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("peer closed the connection with code {0}")]
    ClosedAbnormally(u16),
    #[error("no frame from peer within {0:?}")]
    ReadTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("hub is no longer running")]
    HubStopped,
}

impl ConnectionError {
    /// Maps a peer close code to a graceful close or an abnormal one.
    pub fn from_close_code(code: Option<u16>) -> Option<Self> {
        match code {
            None | Some(NORMAL_CLOSURE) | Some(GOING_AWAY) => None,
            Some(code) => Some(Self::ClosedAbnormally(code)),
        }
    }

    /// Whether this termination deserves a warning rather than a debug line.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            Self::ClosedAbnormally(_) | Self::FrameTooLarge { .. } | Self::Transport(_)
        )
    }
}

impl From<HubError> for ConnectionError {
    fn from(_: HubError) -> Self {
        Self::HubStopped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("hub dispatch loop has stopped")]
    Stopped,
}
