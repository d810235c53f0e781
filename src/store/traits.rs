//! Traits at the storage seams: the async handle each client holds, the
//! synchronous backend primitives behind the store queue, and the opener
//! that binds backends to document ids.

use async_trait::async_trait;
use serde_json::Value;

use crate::commit::Commit;
use crate::error::Result;
use crate::store::{AddOutcome, CommitAck, CommitsEvent, RemoteSyncInfo};

// ============================================================================
// LocalStore — per-client async handle
// ============================================================================

/// One client's handle onto the shared local store.
///
/// Every mutation is serialized through the store's FIFO queue, so concurrent
/// callers observe a total order. Events (peer commits, remote state, roster
/// changes) arrive on the event channel supplied when the handle was opened.
#[async_trait]
pub trait LocalStore: Send + Sync {
    fn user_id(&self) -> &str;

    fn client_id(&self) -> &str;

    /// Append commits. Idempotent on ref: duplicates are silently ignored,
    /// and re-inserting a known ref with a newer `remote_sync_id` records the
    /// ack instead of erroring. When `remote_sync_id` is given, the inserted
    /// commits are marked remote-synced and the store's cursor advances.
    async fn add_commits(
        &self,
        commits: Vec<Commit>,
        remote_sync_id: Option<String>,
    ) -> Result<CommitAck>;

    /// Mark pre-existing commits as remote-synced without re-inserting.
    async fn acknowledge_commits(
        &self,
        refs: Vec<String>,
        remote_sync_id: String,
    ) -> Result<CommitAck>;

    /// All commits with local sync id greater than `since`, insertion order.
    async fn get_local_commits_event(&self, since: Option<u64>) -> Result<CommitsEvent>;

    async fn get_remote_sync_info(&self) -> Result<RemoteSyncInfo>;

    /// Next fixed-size batch of commits not yet remote-synced; `None` once
    /// drained.
    async fn get_commits_for_remote(&self) -> Result<Option<CommitsEvent>>;

    /// Whether this client currently proxies the remote.
    fn is_remote_leader(&self) -> bool;

    /// Announce presence to co-resident clients (and, via the leader, the
    /// remote). Never creates a commit.
    fn update_presence(&self, head_ref: Option<String>, presence: Option<Value>);

    async fn shutdown(&self) -> Result<()>;
}

// ============================================================================
// StoreBackend — synchronous primitives behind the queue
// ============================================================================

/// Storage primitives executed one at a time on the store's worker. The
/// worker owns the backend exclusively; implementations never need their own
/// locking.
pub trait StoreBackend: Send + 'static {
    /// Insert commits, assigning strictly increasing local sync ids.
    /// Rejects commits whose parents are unknown (earlier entries of the same
    /// batch count as known).
    fn add_commits(&mut self, commits: &[Commit], remote_sync_id: Option<&str>)
        -> Result<AddOutcome>;

    /// Record a remote ack on existing commits and advance the cursor.
    fn acknowledge(&mut self, refs: &[String], remote_sync_id: &str) -> Result<CommitAck>;

    fn commits_since(&mut self, since: Option<u64>) -> Result<CommitsEvent>;

    fn commits_by_refs(&mut self, refs: &[String]) -> Result<Vec<Commit>>;

    fn remote_sync_info(&mut self) -> Result<RemoteSyncInfo>;

    /// Oldest `limit` commits still lacking a `remote_sync_id`.
    fn next_unsynced_batch(&mut self, limit: usize) -> Result<Option<CommitsEvent>>;

    /// Current local cursor: the last assigned sync id, 0 when empty.
    fn cursor(&mut self) -> Result<u64>;

    /// Blank every commit's `remote_sync_id` and forget the remote record,
    /// forcing a full re-push on the next leader election.
    fn reset_remote_sync_data(&mut self) -> Result<()>;
}

// ============================================================================
// BackendOpener — doc id -> backend
// ============================================================================

/// Opens (and deletes) the backend for a given document id. Called at most
/// once per doc id per process; co-resident clients share the opened backend
/// through the store queue.
pub trait BackendOpener: Send + Sync + 'static {
    type Backend: StoreBackend;

    fn open(&self, doc_id: &str) -> Result<Self::Backend>;

    /// Remove persisted state for a document.
    fn delete(&self, doc_id: &str) -> Result<()>;
}
