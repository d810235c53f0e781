//! Local persistence: an append-only commit log with heads and remote-sync
//! metadata, shared by every client on the same machine.

pub mod coordinator;
pub mod memory;
pub mod queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use coordinator::{CoordinatingLocalStore, LocalStoreFactory};
pub use memory::{MemoryBackend, MemoryOpener};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBackend, SqliteOpener};
pub use traits::{BackendOpener, LocalStore, StoreBackend};

use serde::{Deserialize, Serialize};

use crate::commit::Commit;
use crate::presence::PresenceRecord;
use crate::status::RemoteState;

// ============================================================================
// Store data types
// ============================================================================

/// Acknowledgement for a batch handed to [`LocalStore::add_commits`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAck {
    /// Every ref from the request, duplicates included.
    pub refs: Vec<String>,
    /// The store's local cursor after the write.
    pub sync_id: u64,
}

/// A batch of commits plus the store cursor they run up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitsEvent {
    pub commits: Vec<Commit>,
    pub sync_id: u64,
}

/// Stable identity of a local store plus the last acknowledged remote cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSyncInfo {
    pub local_store_id: String,
    pub last_sync_cursor: Option<String>,
}

/// Result of a backend insert: the ack for the caller plus what actually
/// changed (duplicates and re-acks excluded from `new_commits`).
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub ack: CommitAck,
    pub new_commits: Vec<Commit>,
}

// ============================================================================
// Store events
// ============================================================================

/// Typed event stream each client receives from its store handle.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Newly visible commits: a peer's, the remote's, or a lag resync.
    Commits(CommitsEvent),
    /// A local save was acknowledged.
    Ack(CommitAck),
    /// Initial replay is complete.
    Ready,
    /// The leader's view of the remote, proxied to every client.
    RemoteState(RemoteState),
    ClientJoin(PresenceRecord),
    ClientPresence(PresenceRecord),
    ClientLeave { user_id: String, client_id: String },
    Error {
        message: String,
        fatal: bool,
        reconnect: bool,
    },
}
