//! The per-client sync engine.
//!
//! Owns the working document, the pending commit buffer, and the graph
//! index. Local edits become commits synchronously; a driver task flushes
//! them to the local store, drains store events (peer and remote commits,
//! roster changes, proxied remote state), and reduces multiple heads to one
//! through deterministic three-way merges. Two clients holding the same head
//! set produce byte-identical merge commits, so the store dedups them by ref.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::commit::{Commit, CommitGraph};
use crate::config::EngineOptions;
use crate::differ::{CommitDoc, Differ, MergeResult};
use crate::error::{Result, SyncError};
use crate::presence::{ClientList, PresenceRecord};
use crate::status::{LocalRead, LocalSave, RemoteConnect, SyncStatus};
use crate::store::{CommitsEvent, LocalStore, StoreEvent};

/// Handle returned by the subscribe methods; call it to stop receiving.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

type DocCallback<T> = Arc<dyn Fn(Option<&T>) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(&SyncStatus) + Send + Sync>;
type ClientsCallback = Arc<dyn Fn(&[PresenceRecord]) + Send + Sync>;

// ============================================================================
// Engine
// ============================================================================

pub struct SyncEngine<D: Differ> {
    inner: Arc<EngineInner<D>>,
}

impl<D: Differ> Clone for SyncEngine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<D: Differ> {
    differ: D,
    store: Arc<dyn LocalStore>,
    options: EngineOptions,
    state: Mutex<EngineState<D>>,
    flush_tx: mpsc::UnboundedSender<()>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct EngineState<D: Differ> {
    graph: CommitGraph,
    /// Memoized document per ref.
    docs: HashMap<String, CommitDoc<D::Doc>>,
    /// What subscribers see: the head doc, or an advisory merge overlay.
    doc: Option<D::Doc>,
    /// Last committed document (base for the next diff).
    saved_doc: Option<D::Doc>,
    head: Option<String>,
    /// Commits created locally but not yet flushed to the store.
    pending: Vec<Commit>,
    flush_scheduled: bool,
    /// One retry is allowed after a failed save.
    save_retried: bool,
    /// Advisory merge doc while multiple heads remain un-committed.
    temp_merge: Option<D::Doc>,
    /// Head pairs whose merge failed; never retried with identical inputs.
    merge_errors: HashSet<(String, String)>,
    status: SyncStatus,
    last_emitted_status: Option<SyncStatus>,
    loaded: bool,
    clients: ClientList,
    doc_subs: HashMap<u64, DocCallback<D::Doc>>,
    status_subs: HashMap<u64, StatusCallback>,
    client_subs: HashMap<u64, ClientsCallback>,
    next_sub_id: u64,
}

impl<D: Differ> SyncEngine<D> {
    /// Build an engine on top of an opened store handle and its event stream.
    /// The driver task runs on the ambient tokio runtime.
    pub fn new(
        differ: D,
        store: Arc<dyn LocalStore>,
        events: mpsc::UnboundedReceiver<StoreEvent>,
        options: EngineOptions,
    ) -> Self {
        let mut clients = ClientList::new();
        clients.upsert(PresenceRecord::new(store.user_id(), store.client_id()));

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            differ,
            store,
            options,
            state: Mutex::new(EngineState {
                graph: CommitGraph::new(),
                docs: HashMap::new(),
                doc: None,
                saved_doc: None,
                head: None,
                pending: Vec::new(),
                flush_scheduled: false,
                save_retried: false,
                temp_merge: None,
                merge_errors: HashSet::new(),
                status: SyncStatus::default(),
                last_emitted_status: None,
                loaded: false,
                clients,
                doc_subs: HashMap::new(),
                status_subs: HashMap::new(),
                client_subs: HashMap::new(),
                next_sub_id: 0,
            }),
            flush_tx,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            driver: Mutex::new(None),
        });

        let driver = tokio::spawn(drive(Arc::clone(&inner), events, flush_rx));
        *inner.driver.lock() = Some(driver);

        Self { inner }
    }

    // ------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------

    /// Apply a local edit. Synchronous: the new document is visible to
    /// subscribers before this returns; the commit flushes on the next turn
    /// (or after `buffer_ms`). Returns the new head ref, or `None` when the
    /// differ reports no change.
    pub fn update_doc(
        &self,
        new_doc: D::Doc,
        edit_metadata: impl Into<Vec<u8>>,
        presence: Option<Value>,
    ) -> Result<Option<String>> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(SyncError::Shutdown);
        }
        let metadata = edit_metadata.into();

        let mut state = inner.state.lock();
        let delta = inner.differ.diff(state.saved_doc.as_ref(), &new_doc);
        let Some(delta) = delta else {
            let head = state.head.clone();
            drop(state);
            if let Some(p) = presence {
                inner.store.update_presence(head, Some(p));
            }
            return Ok(None);
        };

        let base_ref = state.head.clone();
        let ref_ = inner.differ.compute_ref(
            base_ref.as_deref(),
            None,
            None,
            Some(&delta),
            &metadata,
        );
        let commit = Commit {
            ref_: ref_.clone(),
            base_ref,
            merge_ref: None,
            merge_base_ref: None,
            delta: Some(delta),
            edit_metadata: metadata.clone(),
            user_id: inner.store.user_id().to_string(),
            client_id: inner.store.client_id().to_string(),
            remote_sync_id: None,
        };
        state.graph.insert(commit.clone())?;
        state.docs.insert(
            ref_.clone(),
            CommitDoc {
                doc: new_doc.clone(),
                metadata,
            },
        );
        state.head = Some(ref_.clone());
        state.saved_doc = Some(new_doc.clone());
        state.doc = Some(new_doc);
        state.temp_merge = None;
        state.pending.push(commit);
        state.status.local_save = LocalSave::Pending;
        schedule_flush(inner, &mut state);
        drop(state);

        // Document first, then the status flip to pending.
        notify_doc(inner);
        emit_status(inner);

        if let Some(p) = presence {
            inner.store.update_presence(Some(ref_.clone()), Some(p));
        }
        Ok(Some(ref_))
    }

    /// Broadcast presence without creating a commit.
    pub fn update_presence(&self, presence: Option<Value>) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let head = self.inner.state.lock().head.clone();
        self.inner.store.update_presence(head, presence);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn doc(&self) -> Option<D::Doc> {
        self.inner.state.lock().doc.clone()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.state.lock().status
    }

    pub fn clients(&self) -> Vec<PresenceRecord> {
        self.inner.state.lock().clients.snapshot()
    }

    pub fn is_remote_leader(&self) -> bool {
        self.inner.store.is_remote_leader()
    }

    /// Recompute the document at `ref_`, walking up from the nearest
    /// memoized ancestor.
    pub fn get_commit_doc(&self, ref_: &str) -> Result<CommitDoc<D::Doc>> {
        let mut state = self.inner.state.lock();
        compute_doc(&self.inner.differ, &mut state, ref_)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Fires immediately with the current document, then on every change.
    pub fn subscribe_doc(
        &self,
        callback: impl Fn(Option<&D::Doc>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let callback: DocCallback<D::Doc> = Arc::new(callback);
        let (id, snapshot) = {
            let mut state = self.inner.state.lock();
            let id = state.next_sub_id;
            state.next_sub_id += 1;
            state.doc_subs.insert(id, Arc::clone(&callback));
            (id, state.doc.clone())
        };
        callback(snapshot.as_ref());
        let weak = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().doc_subs.remove(&id);
            }
        })
    }

    pub fn subscribe_sync_status(
        &self,
        callback: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let callback: StatusCallback = Arc::new(callback);
        let (id, snapshot) = {
            let mut state = self.inner.state.lock();
            let id = state.next_sub_id;
            state.next_sub_id += 1;
            state.status_subs.insert(id, Arc::clone(&callback));
            (id, state.status)
        };
        callback(&snapshot);
        let weak = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().status_subs.remove(&id);
            }
        })
    }

    pub fn subscribe_clients(
        &self,
        callback: impl Fn(&[PresenceRecord]) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let callback: ClientsCallback = Arc::new(callback);
        let (id, snapshot) = {
            let mut state = self.inner.state.lock();
            let id = state.next_sub_id;
            state.next_sub_id += 1;
            state.client_subs.insert(id, Arc::clone(&callback));
            (id, state.clients.snapshot())
        };
        callback(&snapshot);
        let weak = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().client_subs.remove(&id);
            }
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Flush outstanding edits, close the store handle (and, through it, the
    /// remote), and stop the driver. Later calls on the engine fail with
    /// [`SyncError::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        flush(inner).await;
        inner.shutdown_notify.notify_waiters();
        inner.store.shutdown().await?;
        if let Some(driver) = inner.driver.lock().take() {
            driver.abort();
        }
        debug!(client_id = %inner.store.client_id(), "engine shut down");
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

async fn drive<D: Differ>(
    inner: Arc<EngineInner<D>>,
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
    mut flush_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            _ = inner.shutdown_notify.notified() => break,
            _ = flush_rx.recv() => {
                if inner.options.buffer_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(inner.options.buffer_ms)).await;
                } else {
                    // Coalesce every edit made in the current turn.
                    tokio::task::yield_now().await;
                }
                flush(&inner).await;
            }
            event = events.recv() => match event {
                None => break,
                Some(event) => handle_event(&inner, event),
            }
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
    }
}

/// Write the pending buffer to the local store in one batch.
///
/// The buffer is snapshotted, not drained: commits leave it only once the
/// store accepts them. A concurrent flush (the shutdown drain racing the
/// driver) at worst re-sends the same batch, which the store ignores.
async fn flush<D: Differ>(inner: &Arc<EngineInner<D>>) {
    let commits = {
        let mut state = inner.state.lock();
        state.flush_scheduled = false;
        if state.pending.is_empty() {
            return;
        }
        state.status.local_save = LocalSave::Saving;
        state.pending.clone()
    };
    emit_status(inner);

    match inner.store.add_commits(commits.clone(), None).await {
        Ok(_ack) => {
            {
                let mut state = inner.state.lock();
                let saved: HashSet<String> =
                    commits.into_iter().map(|c| c.ref_).collect();
                state.pending.retain(|c| !saved.contains(&c.ref_));
                state.save_retried = false;
                state.status.local_save = if state.pending.is_empty() {
                    LocalSave::Ready
                } else {
                    // Edits landed while the write was in flight; another
                    // flush is already scheduled.
                    LocalSave::Pending
                };
            }
            emit_status(inner);
        }
        Err(e) => {
            warn!(error = %e, "local save failed");
            // The buffer still holds the batch; one retry is allowed.
            let retry = {
                let mut state = inner.state.lock();
                state.status.local_save = LocalSave::Error;
                if state.save_retried {
                    false
                } else {
                    state.save_retried = true;
                    schedule_flush(inner, &mut state);
                    true
                }
            };
            emit_status(inner);
            if !retry {
                warn!("local save failed twice; keeping buffer, no further retries");
            }
        }
    }
}

fn handle_event<D: Differ>(inner: &Arc<EngineInner<D>>, event: StoreEvent) {
    match event {
        StoreEvent::Commits(CommitsEvent { commits, .. }) => {
            ingest(inner, commits);
        }
        StoreEvent::Ready => {
            {
                let mut state = inner.state.lock();
                state.loaded = true;
                state.status.local_read = LocalRead::Ready;
            }
            notify_doc(inner);
            notify_clients(inner);
            emit_status(inner);
        }
        StoreEvent::Ack(_) => {
            // The flush path already consumed the returned ack.
        }
        StoreEvent::RemoteState(remote) => {
            {
                let mut state = inner.state.lock();
                state.status.remote_connect = remote.connect;
                state.status.remote_read = remote.read;
                state.status.remote_save = remote.save;
            }
            emit_status(inner);
        }
        StoreEvent::ClientJoin(record) | StoreEvent::ClientPresence(record) => {
            let changed = inner.state.lock().clients.upsert(record);
            if changed {
                notify_clients(inner);
            }
        }
        StoreEvent::ClientLeave { client_id, .. } => {
            let changed = inner.state.lock().clients.remove(&client_id);
            if changed {
                notify_clients(inner);
            }
        }
        StoreEvent::Error {
            message,
            fatal,
            reconnect,
        } => {
            warn!(message = %message, fatal, reconnect, "store error");
            {
                let mut state = inner.state.lock();
                if !state.loaded {
                    state.status.local_read = LocalRead::Error;
                } else if fatal {
                    state.status.remote_connect = RemoteConnect::Error;
                }
            }
            emit_status(inner);
        }
    }
}

/// Fold newly visible commits into the graph, reduce heads, refresh the doc.
fn ingest<D: Differ>(inner: &Arc<EngineInner<D>>, commits: Vec<Commit>) {
    let notify = {
        let mut state = inner.state.lock();
        let mut changed = false;
        for commit in commits {
            match state.graph.insert(commit) {
                Ok(inserted) => changed |= inserted,
                Err(e) => {
                    // Out-of-order arrival over the lossy channel; the store
                    // resync will redeliver with parents first.
                    warn!(error = %e, "dropping commit with unresolved parents");
                }
            }
        }
        if changed {
            merge_heads(inner, &mut state);
            refresh_doc(inner, &mut state);
        }
        changed && state.loaded
    };
    if notify {
        notify_doc(inner);
        emit_status(inner);
    }
}

// ============================================================================
// Head reduction
// ============================================================================

/// While more than one head exists, merge the two lexicographically-first
/// heads. Commits the merge unless the differ marks it advisory (`temp`).
fn merge_heads<D: Differ>(inner: &Arc<EngineInner<D>>, state: &mut EngineState<D>) {
    loop {
        let heads = state.graph.heads();
        if heads.len() <= 1 {
            state.head = heads.into_iter().next().or_else(|| state.head.clone());
            return;
        }
        let left = heads[0].clone();
        let right = heads[1].clone();
        let pair = (left.clone(), right.clone());
        if state.merge_errors.contains(&pair) {
            // Same inputs, same failure; the doc stays on the last good head.
            return;
        }

        match prepare_merge(&inner.differ, state, &left, &right) {
            Ok((_, _, result)) if result.temp => {
                // Advisory only: display the merge, commit nothing.
                state.temp_merge = Some(result.doc);
                return;
            }
            Ok((base_ref, left_doc, result)) => {
                let delta = inner.differ.diff(Some(&left_doc.doc), &result.doc);
                let ref_ = inner.differ.compute_ref(
                    Some(&left),
                    Some(&right),
                    base_ref.as_deref(),
                    delta.as_deref(),
                    &result.metadata,
                );
                let commit = Commit {
                    ref_: ref_.clone(),
                    base_ref: Some(left),
                    merge_ref: Some(right),
                    // Absent only when the two histories share no root.
                    merge_base_ref: base_ref,
                    delta,
                    edit_metadata: result.metadata.clone(),
                    user_id: inner.store.user_id().to_string(),
                    client_id: inner.store.client_id().to_string(),
                    remote_sync_id: None,
                };
                if let Err(e) = state.graph.insert(commit.clone()) {
                    warn!(error = %e, "merge commit rejected");
                    state.merge_errors.insert(pair);
                    state.status.local_save = LocalSave::Error;
                    return;
                }
                state.docs.insert(
                    ref_,
                    CommitDoc {
                        doc: result.doc,
                        metadata: result.metadata,
                    },
                );
                state.temp_merge = None;
                state.pending.push(commit);
                state.status.local_save = LocalSave::Pending;
                schedule_flush(inner, state);
            }
            Err(e) => {
                warn!(left = %pair.0, right = %pair.1, error = %e, "merge failed");
                state.merge_errors.insert(pair);
                state.status.local_save = LocalSave::Error;
                return;
            }
        }
    }
}

/// Resolve everything a three-way merge needs: the base from the lowest
/// common ancestor (absent for disjoint roots) and both head documents.
fn prepare_merge<D: Differ>(
    differ: &D,
    state: &mut EngineState<D>,
    left: &str,
    right: &str,
) -> Result<(Option<String>, CommitDoc<D::Doc>, MergeResult<D::Doc>)> {
    let base_ref = state.graph.lowest_common_ancestor(left, right);
    let base = match &base_ref {
        Some(b) => Some(compute_doc(differ, state, b)?),
        None => None,
    };
    let left_doc = compute_doc(differ, state, left)?;
    let right_doc = compute_doc(differ, state, right)?;
    let result = differ.merge(base.as_ref(), &left_doc, &right_doc)?;
    Ok((base_ref, left_doc, result))
}

/// Recompute `saved_doc`/`doc` from the current head (running `migrate` on
/// the way out) and the advisory overlay.
fn refresh_doc<D: Differ>(inner: &Arc<EngineInner<D>>, state: &mut EngineState<D>) {
    let Some(head) = state.head.clone() else {
        return;
    };
    match compute_doc(&inner.differ, state, &head) {
        Ok(commit_doc) => {
            let (doc, _metadata) = inner
                .differ
                .migrate(commit_doc.doc, commit_doc.metadata);
            state.saved_doc = Some(doc.clone());
            state.doc = match state.temp_merge.clone() {
                Some(overlay) => Some(overlay),
                None => Some(doc),
            };
        }
        Err(e) => {
            warn!(error = %e, head = %head, "failed to materialize head document");
            state.status.local_read = LocalRead::Error;
        }
    }
}

/// Walk back from `ref_` to the nearest memoized ancestor (or a root), then
/// patch forward, memoizing every step. A merge commit's delta applies to
/// its `base_ref` document.
fn compute_doc<D: Differ>(
    differ: &D,
    state: &mut EngineState<D>,
    ref_: &str,
) -> Result<CommitDoc<D::Doc>> {
    if let Some(found) = state.docs.get(ref_) {
        return Ok(found.clone());
    }
    let mut chain: Vec<String> = Vec::new();
    let mut cursor: Option<String> = Some(ref_.to_string());
    let memoized = loop {
        let Some(current) = cursor.take() else {
            break None;
        };
        if state.docs.contains_key(&current) {
            break Some(current);
        }
        let commit = state
            .graph
            .get(&current)
            .ok_or_else(|| SyncError::Internal(format!("unknown commit {current}")))?;
        cursor = commit.base_ref.clone();
        chain.push(current);
    };

    let mut parent: Option<CommitDoc<D::Doc>> = memoized.map(|m| state.docs[&m].clone());

    for current in chain.into_iter().rev() {
        let commit = state
            .graph
            .get(&current)
            .ok_or_else(|| SyncError::Internal(format!("unknown commit {current}")))?;
        let doc = differ.patch(parent.as_ref().map(|p| &p.doc), commit.delta.as_deref())?;
        let materialized = CommitDoc {
            doc,
            metadata: commit.edit_metadata.clone(),
        };
        state.docs.insert(current, materialized.clone());
        parent = Some(materialized);
    }

    parent.ok_or_else(|| SyncError::Internal(format!("no document for {ref_}")))
}

// ============================================================================
// Notification plumbing
// ============================================================================

fn schedule_flush<D: Differ>(inner: &Arc<EngineInner<D>>, state: &mut EngineState<D>) {
    if !state.flush_scheduled {
        state.flush_scheduled = true;
        let _ = inner.flush_tx.send(());
    }
}

/// Callbacks run outside the state lock so they may re-enter the engine.
fn notify_doc<D: Differ>(inner: &Arc<EngineInner<D>>) {
    let (subs, snapshot) = {
        let state = inner.state.lock();
        (
            state.doc_subs.values().cloned().collect::<Vec<_>>(),
            state.doc.clone(),
        )
    };
    for sub in subs {
        sub(snapshot.as_ref());
    }
}

fn notify_clients<D: Differ>(inner: &Arc<EngineInner<D>>) {
    let (subs, snapshot) = {
        let state = inner.state.lock();
        (
            state.client_subs.values().cloned().collect::<Vec<_>>(),
            state.clients.snapshot(),
        )
    };
    for sub in subs {
        sub(&snapshot);
    }
}

/// One emission per distinct status: consecutive equal values are dropped.
fn emit_status<D: Differ>(inner: &Arc<EngineInner<D>>) {
    let (subs, snapshot) = {
        let mut state = inner.state.lock();
        if state.last_emitted_status == Some(state.status) {
            return;
        }
        state.last_emitted_status = Some(state.status);
        (
            state.status_subs.values().cloned().collect::<Vec<_>>(),
            state.status,
        )
    };
    for sub in subs {
        sub(&snapshot);
    }
}
