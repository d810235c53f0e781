//! Client-side document sync: edits become content-addressed commits in a
//! DAG, concurrent histories reconcile through deterministic three-way
//! merges, and a leader-elected client replicates the log to a remote.
//!
//! The core is document-agnostic: diff/patch/merge/hashing live behind the
//! [`Differ`] trait ([`JsonDiffer`] is a ready-made implementation over
//! `serde_json::Value`), persistence behind [`StoreBackend`] (in-memory and
//! SQLite drivers included), and the remote transport behind
//! [`RemoteFactory`].

pub mod broadcast;
pub mod commit;
pub mod config;
pub mod differ;
pub mod engine;
pub mod error;
pub mod json_differ;
pub mod leader;
pub mod presence;
pub mod remote;
pub mod status;
pub mod store;

pub use commit::{Commit, CommitGraph};
pub use config::{EngineOptions, NetworkSettings, REMOTE_BATCH_SIZE};
pub use differ::{CommitDoc, Differ, MergeResult};
pub use engine::{SyncEngine, Unsubscribe};
pub use error::{Result, SyncError};
pub use json_differ::JsonDiffer;
pub use presence::{ClientList, PresenceRecord};
pub use remote::{ReconnectPolicy, Remote, RemoteEvent, RemoteFactory};
pub use status::{
    LocalRead, LocalSave, RemoteConnect, RemoteRead, RemoteSave, RemoteState, SyncStatus,
};
pub use store::{
    AddOutcome, BackendOpener, CommitAck, CommitsEvent, CoordinatingLocalStore, LocalStore,
    LocalStoreFactory, MemoryBackend, MemoryOpener, RemoteSyncInfo, StoreBackend, StoreEvent,
};
#[cfg(feature = "sqlite")]
pub use store::{SqliteBackend, SqliteOpener};
