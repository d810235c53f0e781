//! Shared fixtures: an in-process loopback remote with pause/kill switches,
//! engine builders over the memory store, and quiescence helpers.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use coalesce_sync::{
    Commit, Differ, EngineOptions, JsonDiffer, LocalStore, LocalStoreFactory, MemoryOpener,
    NetworkSettings, Remote, RemoteEvent, RemoteFactory, RemoteSyncInfo, Result, StoreEvent,
    SyncEngine, SyncError,
};

// ============================================================================
// Loopback remote
// ============================================================================

struct ServerState {
    commits: Vec<Commit>,
    known: HashSet<String>,
    next_cursor: u64,
    connections: HashMap<u64, mpsc::UnboundedSender<RemoteEvent>>,
    next_conn_id: u64,
    paused: bool,
}

/// A loopback remote shared by any number of leader connections. Commits get
/// monotonically increasing string cursors; each accepted batch is acked to
/// its sender and broadcast to every other connection.
#[derive(Clone)]
pub struct TestRemoteServer {
    state: Arc<Mutex<ServerState>>,
}

impl TestRemoteServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                commits: Vec::new(),
                known: HashSet::new(),
                next_cursor: 1,
                connections: HashMap::new(),
                next_conn_id: 1,
                paused: false,
            })),
        }
    }

    pub fn factory(&self) -> Arc<dyn RemoteFactory> {
        Arc::new(TestRemoteFactory {
            state: Arc::clone(&self.state),
        })
    }

    /// Refuse new connections (existing ones stay up; combine with
    /// [`TestRemoteServer::kill_connections`] for a full outage).
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
    }

    /// Drop every live connection; clients observe a closed transport.
    pub fn kill_connections(&self) {
        self.state.lock().connections.clear();
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.state.lock().commits.clone()
    }

    pub fn merge_commit_count(&self) -> usize {
        self.state.lock().commits.iter().filter(|c| c.is_merge()).count()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

struct TestRemoteFactory {
    state: Arc<Mutex<ServerState>>,
}

#[async_trait]
impl RemoteFactory for TestRemoteFactory {
    async fn connect(
        &self,
        _user_id: &str,
        _info: RemoteSyncInfo,
        events: mpsc::UnboundedSender<RemoteEvent>,
    ) -> Result<Box<dyn Remote>> {
        let mut state = self.state.lock();
        if state.paused {
            return Err(SyncError::Network("remote unavailable".to_string()));
        }
        let conn_id = state.next_conn_id;
        state.next_conn_id += 1;

        // Initial snapshot, then the ready marker.
        if !state.commits.is_empty() {
            let cursor = format!("{:08}", state.next_cursor - 1);
            let _ = events.send(RemoteEvent::Commits {
                commits: state.commits.clone(),
                remote_sync_id: cursor,
            });
        }
        let _ = events.send(RemoteEvent::Ready);
        state.connections.insert(conn_id, events);

        Ok(Box::new(TestRemote {
            state: Arc::clone(&self.state),
            conn_id,
        }))
    }
}

struct TestRemote {
    state: Arc<Mutex<ServerState>>,
    conn_id: u64,
}

#[async_trait]
impl Remote for TestRemote {
    async fn send_commits(&self, commits: Vec<Commit>) -> Result<()> {
        let mut state = self.state.lock();
        if state.paused || !state.connections.contains_key(&self.conn_id) {
            return Err(SyncError::Network("connection lost".to_string()));
        }
        let cursor = format!("{:08}", state.next_cursor);
        state.next_cursor += 1;

        let refs: Vec<String> = commits.iter().map(|c| c.ref_.clone()).collect();
        let mut fresh = Vec::new();
        for mut commit in commits {
            if state.known.insert(commit.ref_.clone()) {
                commit.remote_sync_id = Some(cursor.clone());
                state.commits.push(commit.clone());
                fresh.push(commit);
            }
        }

        if let Some(sender) = state.connections.get(&self.conn_id) {
            let _ = sender.send(RemoteEvent::Ack {
                refs,
                remote_sync_id: cursor.clone(),
            });
        }
        if !fresh.is_empty() {
            for (id, sender) in &state.connections {
                if *id != self.conn_id {
                    let _ = sender.send(RemoteEvent::Commits {
                        commits: fresh.clone(),
                        remote_sync_id: cursor.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.state.lock().connections.remove(&self.conn_id);
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Timings small enough for fast tests, large enough to stay deterministic.
pub fn test_settings() -> NetworkSettings {
    NetworkSettings {
        initial_delay_ms: 10,
        reconnect_backoff_multiplier: 2.0,
        max_reconnect_delay_ms: 50,
        election_timeout_ms: 25,
        heartbeat_interval_ms: 25,
        heartbeat_timeout_ms: 150,
    }
}

pub fn memory_factory() -> LocalStoreFactory<MemoryOpener> {
    LocalStoreFactory::new(MemoryOpener, test_settings())
}

pub fn memory_factory_with_remote(server: &TestRemoteServer) -> LocalStoreFactory<MemoryOpener> {
    LocalStoreFactory::new(MemoryOpener, test_settings()).with_remote(server.factory())
}

/// Connect a store handle and wrap it in an engine. Returns the engine plus
/// the handle (kept for direct store assertions).
pub fn spawn_engine<O, D>(
    factory: &LocalStoreFactory<O>,
    differ: D,
    doc_id: &str,
    user_id: &str,
    client_id: &str,
) -> (SyncEngine<D>, Arc<dyn LocalStore>)
where
    O: coalesce_sync::BackendOpener,
    D: Differ,
{
    let (tx, rx) = mpsc::unbounded_channel::<StoreEvent>();
    let store: Arc<dyn LocalStore> = factory
        .connect(doc_id, user_id, client_id, tx)
        .expect("connect store handle");
    let engine = SyncEngine::new(differ, Arc::clone(&store), rx, EngineOptions::default());
    (engine, store)
}

pub fn spawn_json_engine<O>(
    factory: &LocalStoreFactory<O>,
    doc_id: &str,
    user_id: &str,
    client_id: &str,
) -> (SyncEngine<JsonDiffer>, Arc<dyn LocalStore>)
where
    O: coalesce_sync::BackendOpener,
{
    spawn_engine(factory, JsonDiffer::new(), doc_id, user_id, client_id)
}

// ============================================================================
// Quiescence helpers
// ============================================================================

/// Poll `predicate` every 10ms until it holds or `timeout_ms` elapses.
pub async fn wait_until(timeout_ms: u64, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give background tasks a beat to drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
