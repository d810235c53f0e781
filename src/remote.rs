//! The remote transport seam: commits stream both ways with explicit ack
//! cursors, and a reconnect policy governs transient failures.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::commit::Commit;
use crate::config::NetworkSettings;
use crate::error::Result;
use crate::presence::PresenceRecord;
use crate::status::RemoteState;
use crate::store::RemoteSyncInfo;

// ============================================================================
// Events
// ============================================================================

/// Events pushed by the remote to the connected leader.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// Initial snapshot has been pushed; the inbound stream is caught up.
    Ready,
    /// A batch of commits from other stores, tagged with the cursor that
    /// acknowledges them.
    Commits {
        commits: Vec<Commit>,
        remote_sync_id: String,
    },
    /// Outbound commits were persisted remotely.
    Ack {
        refs: Vec<String>,
        remote_sync_id: String,
    },
    /// The transport's own connect/read/save sub-states.
    State(RemoteState),
    /// Presence forwarded from clients on other stores.
    Presence(PresenceRecord),
    Error {
        message: String,
        fatal: bool,
        reconnect: bool,
    },
}

// ============================================================================
// Transport traits
// ============================================================================

/// A live connection to the remote. Outbound only; inbound traffic arrives
/// on the event channel handed to [`RemoteFactory::connect`].
#[async_trait]
pub trait Remote: Send + Sync {
    async fn send_commits(&self, commits: Vec<Commit>) -> Result<()>;

    async fn send_presence(&self, _record: PresenceRecord) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self);
}

/// Opens remote connections. Supplied by the host application; the sync core
/// calls it from whichever client currently holds leadership.
#[async_trait]
pub trait RemoteFactory: Send + Sync {
    async fn connect(
        &self,
        user_id: &str,
        info: RemoteSyncInfo,
        events: mpsc::UnboundedSender<RemoteEvent>,
    ) -> Result<Box<dyn Remote>>;
}

// ============================================================================
// Reconnect policy
// ============================================================================

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_ms: u64,
    multiplier: f64,
    max_ms: u64,
    current_ms: f64,
}

impl ReconnectPolicy {
    pub fn new(settings: &NetworkSettings) -> Self {
        Self {
            initial_ms: settings.initial_delay_ms,
            multiplier: settings.reconnect_backoff_multiplier.max(1.0),
            max_ms: settings.max_reconnect_delay_ms,
            current_ms: settings.initial_delay_ms as f64,
        }
    }

    /// Delay to wait before the next attempt; grows after each call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = (self.current_ms as u64).min(self.max_ms);
        self.current_ms = (self.current_ms * self.multiplier).min(self.max_ms as f64);
        Duration::from_millis(delay)
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms as f64;
    }
}
