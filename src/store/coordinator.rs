//! The coordinating store handle.
//!
//! Each client opens one handle onto the machine-shared store. The handle
//! serializes storage ops through the shared FIFO queue, relays commit
//! notifications and presence over the broadcast channel, runs leader
//! election, and (while leader) owns the remote connection: pumping
//! unsynced commits out in fixed batches and folding inbound batches back
//! into the store for every co-resident client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broadcast::{ChannelMessage, MessageHub};
use crate::commit::Commit;
use crate::config::{NetworkSettings, REMOTE_BATCH_SIZE};
use crate::error::{Result, SyncError};
use crate::leader::{Election, ElectionAction, ElectionMessage, Role};
use crate::presence::PresenceRecord;
use crate::remote::{Remote, RemoteEvent, RemoteFactory, ReconnectPolicy};
use crate::status::{RemoteConnect, RemoteRead, RemoteSave, RemoteState};
use crate::store::queue::SerialQueue;
use crate::store::traits::{BackendOpener, LocalStore, StoreBackend};
use crate::store::{AddOutcome, CommitAck, CommitsEvent, RemoteSyncInfo, StoreEvent};

// ============================================================================
// Factory
// ============================================================================

/// Opens store handles, sharing one backend (behind one queue) per document
/// id within the process.
pub struct LocalStoreFactory<O: BackendOpener> {
    opener: O,
    hub: MessageHub,
    settings: NetworkSettings,
    remote_factory: Option<Arc<dyn RemoteFactory>>,
    shared: Mutex<HashMap<String, Weak<StoreShared<O::Backend>>>>,
}

struct StoreShared<B> {
    queue: SerialQueue<B>,
}

impl<O: BackendOpener> LocalStoreFactory<O> {
    pub fn new(opener: O, settings: NetworkSettings) -> Self {
        Self {
            opener,
            hub: MessageHub::new(),
            settings,
            remote_factory: None,
            shared: Mutex::new(HashMap::new()),
        }
    }

    /// Configure the remote transport. Without one, clients stay local-only.
    pub fn with_remote(mut self, remote_factory: Arc<dyn RemoteFactory>) -> Self {
        self.remote_factory = Some(remote_factory);
        self
    }

    fn shared_for(&self, doc_id: &str) -> Result<Arc<StoreShared<O::Backend>>> {
        let mut map = self.shared.lock();
        if let Some(existing) = map.get(doc_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let backend = self.opener.open(doc_id)?;
        let shared = Arc::new(StoreShared {
            queue: SerialQueue::new(backend),
        });
        map.insert(doc_id.to_string(), Arc::downgrade(&shared));
        Ok(shared)
    }

    /// Open a client handle. Events flow to `events`; the handle's background
    /// tasks run on the ambient tokio runtime.
    pub fn connect(
        &self,
        doc_id: &str,
        user_id: &str,
        client_id: &str,
        events: mpsc::UnboundedSender<StoreEvent>,
    ) -> Result<Arc<CoordinatingLocalStore<O::Backend>>> {
        let shared = self.shared_for(doc_id)?;
        let (channel, channel_rx) = self.hub.join(doc_id);

        let ctx = Arc::new(HandleCtx {
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            shared,
            channel,
            events,
            election: Mutex::new(Election::new(client_id, self.settings.clone())),
            is_leader: AtomicBool::new(false),
            presence: Mutex::new(PresenceRecord::new(user_id, client_id)),
            remote_state: Mutex::new(RemoteState::default()),
            settings: self.settings.clone(),
            remote_factory: self.remote_factory.clone(),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            local_commits: Notify::new(),
            last_delivered: AtomicU64::new(0),
            remote_conn: tokio::sync::Mutex::new(None),
            remote_generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let t1 = tokio::spawn(channel_task(Arc::clone(&ctx), channel_rx));
        let t2 = tokio::spawn(election_task(Arc::clone(&ctx)));
        let t3 = tokio::spawn(init_task(Arc::clone(&ctx)));
        ctx.tasks.lock().extend([t1, t2, t3]);

        Ok(Arc::new(CoordinatingLocalStore { ctx }))
    }

    /// Close the shared queue (outstanding handles start failing with
    /// [`SyncError::Shutdown`]) and remove all persisted state for the doc.
    pub async fn delete_doc_database(&self, doc_id: &str) -> Result<()> {
        let shared = self.shared.lock().remove(doc_id).and_then(|w| w.upgrade());
        if let Some(shared) = shared {
            shared.queue.close();
        }
        self.hub.remove(doc_id);
        self.opener.delete(doc_id)
    }

    /// Blank all remote-sync metadata so the next leader re-pushes the full
    /// history to a remote that has never seen this store.
    pub async fn reset_doc_remote_sync_data(&self, doc_id: &str) -> Result<()> {
        let live = self.shared.lock().get(doc_id).and_then(Weak::upgrade);
        match live {
            Some(shared) => shared.queue.run(|b| b.reset_remote_sync_data()).await?,
            None => {
                let mut backend = self.opener.open(doc_id)?;
                backend.reset_remote_sync_data()
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

pub struct CoordinatingLocalStore<B: StoreBackend> {
    ctx: Arc<HandleCtx<B>>,
}

struct HandleCtx<B: StoreBackend> {
    user_id: String,
    client_id: String,
    shared: Arc<StoreShared<B>>,
    channel: broadcast::Sender<ChannelMessage>,
    events: mpsc::UnboundedSender<StoreEvent>,
    election: Mutex<Election>,
    is_leader: AtomicBool,
    presence: Mutex<PresenceRecord>,
    remote_state: Mutex<RemoteState>,
    settings: NetworkSettings,
    remote_factory: Option<Arc<dyn RemoteFactory>>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    /// Wakes the outbound pump when new unsynced commits may exist.
    local_commits: Notify,
    /// Highest local sync id already emitted to (or authored by) our client.
    last_delivered: AtomicU64,
    remote_conn: tokio::sync::Mutex<Option<Box<dyn Remote>>>,
    /// Bumped to cancel an in-flight remote loop on step-down or shutdown.
    remote_generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: StoreBackend> HandleCtx<B> {
    async fn store<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut B) -> Result<R> + Send + 'static,
    {
        self.shared.queue.run(f).await?
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    fn send_channel(&self, msg: ChannelMessage) {
        // No receivers is fine: a lone client simply has no peers.
        let _ = self.channel.send(msg);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Apply `f` to the remote state; on change, emit to our client and (as
    /// leader) proxy to peers.
    fn update_remote_state(&self, f: impl FnOnce(&mut RemoteState)) {
        let (before, after) = {
            let mut guard = self.remote_state.lock();
            let before = *guard;
            f(&mut guard);
            (before, *guard)
        };
        if before != after {
            self.emit(StoreEvent::RemoteState(after));
            if self.is_leader.load(Ordering::Acquire) {
                self.send_channel(ChannelMessage::RemoteState {
                    origin: self.client_id.clone(),
                    state: after,
                });
            }
        }
    }

    /// Record what an insert changed: bump the delivery cursor, tell peers,
    /// and wake the outbound pump. `notify_self` controls whether our own
    /// client sees a `Commits` event (it should for remote arrivals, not for
    /// commits it authored itself).
    fn deliver_new(&self, outcome: &AddOutcome, notify_self: bool) {
        self.last_delivered
            .fetch_max(outcome.ack.sync_id, Ordering::AcqRel);
        if outcome.new_commits.is_empty() {
            return;
        }
        let refs: Vec<String> = outcome
            .new_commits
            .iter()
            .map(|c| c.ref_.clone())
            .collect();
        if notify_self {
            self.emit(StoreEvent::Commits(CommitsEvent {
                commits: outcome.new_commits.clone(),
                sync_id: outcome.ack.sync_id,
            }));
        }
        self.send_channel(ChannelMessage::Commits {
            origin: self.client_id.clone(),
            refs,
        });
        self.local_commits.notify_one();
    }
}

// ============================================================================
// LocalStore impl
// ============================================================================

#[async_trait]
impl<B: StoreBackend> LocalStore for CoordinatingLocalStore<B> {
    fn user_id(&self) -> &str {
        &self.ctx.user_id
    }

    fn client_id(&self) -> &str {
        &self.ctx.client_id
    }

    async fn add_commits(
        &self,
        commits: Vec<Commit>,
        remote_sync_id: Option<String>,
    ) -> Result<CommitAck> {
        if self.ctx.is_shutdown() {
            return Err(SyncError::Shutdown);
        }
        let outcome = self
            .ctx
            .store(move |b| b.add_commits(&commits, remote_sync_id.as_deref()))
            .await?;
        self.ctx.deliver_new(&outcome, false);
        self.ctx.emit(StoreEvent::Ack(outcome.ack.clone()));
        Ok(outcome.ack)
    }

    async fn acknowledge_commits(
        &self,
        refs: Vec<String>,
        remote_sync_id: String,
    ) -> Result<CommitAck> {
        if self.ctx.is_shutdown() {
            return Err(SyncError::Shutdown);
        }
        self.ctx
            .store(move |b| b.acknowledge(&refs, &remote_sync_id))
            .await
    }

    async fn get_local_commits_event(&self, since: Option<u64>) -> Result<CommitsEvent> {
        if self.ctx.is_shutdown() {
            return Err(SyncError::Shutdown);
        }
        self.ctx.store(move |b| b.commits_since(since)).await
    }

    async fn get_remote_sync_info(&self) -> Result<RemoteSyncInfo> {
        if self.ctx.is_shutdown() {
            return Err(SyncError::Shutdown);
        }
        self.ctx.store(|b| b.remote_sync_info()).await
    }

    async fn get_commits_for_remote(&self) -> Result<Option<CommitsEvent>> {
        if self.ctx.is_shutdown() {
            return Err(SyncError::Shutdown);
        }
        self.ctx
            .store(|b| b.next_unsynced_batch(REMOTE_BATCH_SIZE))
            .await
    }

    fn is_remote_leader(&self) -> bool {
        self.ctx.is_leader.load(Ordering::Acquire)
    }

    fn update_presence(&self, head_ref: Option<String>, presence: Option<Value>) {
        if self.ctx.is_shutdown() {
            return;
        }
        let record = {
            let mut own = self.ctx.presence.lock();
            own.ref_ = head_ref;
            own.presence = presence;
            own.clone()
        };
        self.ctx.send_channel(ChannelMessage::Presence(record.clone()));
        if self.ctx.is_leader.load(Ordering::Acquire) {
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                forward_presence(&ctx, record).await;
            });
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let was_leader = ctx.is_leader.swap(false, Ordering::AcqRel);
        if was_leader {
            ctx.send_channel(ChannelMessage::Election(ElectionMessage::Resign {
                client_id: ctx.client_id.clone(),
            }));
        }
        ctx.send_channel(ChannelMessage::Leave {
            user_id: ctx.user_id.clone(),
            client_id: ctx.client_id.clone(),
        });
        ctx.remote_generation.fetch_add(1, Ordering::AcqRel);
        ctx.shutdown_notify.notify_waiters();
        if let Some(conn) = ctx.remote_conn.lock().await.take() {
            conn.shutdown().await;
        }
        for task in ctx.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(client_id = %ctx.client_id, "store handle shut down");
        Ok(())
    }
}

// ============================================================================
// Background tasks
// ============================================================================

/// Initial replay: push everything already in the store to our client, then
/// signal readiness and announce ourselves on the channel.
async fn init_task<B: StoreBackend>(ctx: Arc<HandleCtx<B>>) {
    match ctx.store(|b| b.commits_since(None)).await {
        Ok(event) => {
            ctx.last_delivered.store(event.sync_id, Ordering::Release);
            if !event.commits.is_empty() {
                ctx.emit(StoreEvent::Commits(event));
            }
            ctx.emit(StoreEvent::Ready);
        }
        Err(e) => {
            ctx.emit(StoreEvent::Error {
                message: e.to_string(),
                fatal: true,
                reconnect: false,
            });
        }
    }
    let record = ctx.presence.lock().clone();
    ctx.send_channel(ChannelMessage::Join(record));
}

async fn channel_task<B: StoreBackend>(
    ctx: Arc<HandleCtx<B>>,
    mut rx: broadcast::Receiver<ChannelMessage>,
) {
    loop {
        tokio::select! {
            _ = ctx.shutdown_notify.notified() => break,
            received = rx.recv() => match received {
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "broadcast channel lagged; resyncing from store");
                    resync_from_store(&ctx).await;
                }
                Ok(msg) => handle_message(&ctx, msg).await,
            }
        }
        if ctx.is_shutdown() {
            break;
        }
    }
}

/// The channel is lossy; whenever we may have missed a commit notification,
/// the store itself fills the gap.
async fn resync_from_store<B: StoreBackend>(ctx: &Arc<HandleCtx<B>>) {
    let since = ctx.last_delivered.load(Ordering::Acquire);
    if let Ok(event) = ctx.store(move |b| b.commits_since(Some(since))).await {
        if !event.commits.is_empty() {
            ctx.last_delivered
                .fetch_max(event.sync_id, Ordering::AcqRel);
            ctx.emit(StoreEvent::Commits(event));
            if ctx.is_leader.load(Ordering::Acquire) {
                ctx.local_commits.notify_one();
            }
        }
    }
}

async fn handle_message<B: StoreBackend>(ctx: &Arc<HandleCtx<B>>, msg: ChannelMessage) {
    match msg {
        ChannelMessage::Commits { origin, refs } if origin != ctx.client_id => {
            let event = ctx
                .store(move |b| {
                    Ok(CommitsEvent {
                        commits: b.commits_by_refs(&refs)?,
                        sync_id: b.cursor()?,
                    })
                })
                .await;
            if let Ok(event) = event {
                if !event.commits.is_empty() {
                    ctx.last_delivered
                        .fetch_max(event.sync_id, Ordering::AcqRel);
                    ctx.emit(StoreEvent::Commits(event));
                    if ctx.is_leader.load(Ordering::Acquire) {
                        ctx.local_commits.notify_one();
                    }
                }
            }
        }
        ChannelMessage::Join(record) if record.client_id != ctx.client_id => {
            ctx.emit(StoreEvent::ClientJoin(record.clone()));
            // Answer so the newcomer learns the existing roster.
            let own = ctx.presence.lock().clone();
            ctx.send_channel(ChannelMessage::Presence(own));
            if ctx.is_leader.load(Ordering::Acquire) {
                forward_presence(ctx, record).await;
            }
        }
        ChannelMessage::Presence(record) if record.client_id != ctx.client_id => {
            ctx.emit(StoreEvent::ClientPresence(record.clone()));
            if ctx.is_leader.load(Ordering::Acquire) {
                forward_presence(ctx, record).await;
            }
        }
        ChannelMessage::Leave { user_id, client_id } if client_id != ctx.client_id => {
            ctx.emit(StoreEvent::ClientLeave { user_id, client_id });
        }
        ChannelMessage::Election(message) => {
            let action = ctx.election.lock().on_message(&message);
            apply_election_action(ctx, action).await;
        }
        ChannelMessage::RemoteState { origin, state } if origin != ctx.client_id => {
            *ctx.remote_state.lock() = state;
            ctx.emit(StoreEvent::RemoteState(state));
        }
        _ => {}
    }
}

async fn forward_presence<B: StoreBackend>(ctx: &Arc<HandleCtx<B>>, record: PresenceRecord) {
    let guard = ctx.remote_conn.lock().await;
    if let Some(conn) = guard.as_ref() {
        if let Err(e) = conn.send_presence(record).await {
            debug!(error = %e, "presence forward failed");
        }
    }
}

// ============================================================================
// Election driving
// ============================================================================

async fn election_task<B: StoreBackend>(ctx: Arc<HandleCtx<B>>) {
    let first = ctx.election.lock().start();
    apply_election_action(&ctx, first).await;

    loop {
        let deadline = ctx.election.lock().next_deadline();
        tokio::select! {
            _ = ctx.shutdown_notify.notified() => break,
            _ = tokio::time::sleep(deadline) => {}
        }
        if ctx.is_shutdown() {
            break;
        }
        let action = {
            let mut election = ctx.election.lock();
            match election.role() {
                Role::Candidate => election.close_window(),
                Role::Leader => ElectionAction::Heartbeat {
                    client_id: ctx.client_id.clone(),
                },
                Role::Follower => election.tick(deadline.as_millis() as u64),
            }
        };
        apply_election_action(&ctx, action).await;
    }
}

async fn apply_election_action<B: StoreBackend>(ctx: &Arc<HandleCtx<B>>, action: ElectionAction) {
    match action {
        ElectionAction::Announce {
            client_id,
            tiebreak,
        } => {
            ctx.send_channel(ChannelMessage::Election(ElectionMessage::Propose {
                client_id,
                tiebreak,
            }));
        }
        ElectionAction::Heartbeat { client_id } => {
            ctx.send_channel(ChannelMessage::Election(ElectionMessage::Heartbeat {
                client_id,
            }));
        }
        ElectionAction::BecomeLeader => {
            debug!(client_id = %ctx.client_id, "became remote leader");
            ctx.is_leader.store(true, Ordering::Release);
            ctx.send_channel(ChannelMessage::Election(ElectionMessage::Heartbeat {
                client_id: ctx.client_id.clone(),
            }));
            spawn_remote_loop(ctx);
        }
        ElectionAction::StepDown => {
            debug!(client_id = %ctx.client_id, "stepped down as remote leader");
            ctx.is_leader.store(false, Ordering::Release);
            ctx.remote_generation.fetch_add(1, Ordering::AcqRel);
            if let Some(conn) = ctx.remote_conn.lock().await.take() {
                conn.shutdown().await;
            }
            ctx.update_remote_state(|s| *s = RemoteState::default());
        }
        ElectionAction::None => {}
    }
}

// ============================================================================
// Remote loop (leader only)
// ============================================================================

enum ConnOutcome {
    /// Transport dropped; retry after backoff.
    Retry,
    /// Stop reconnecting (fatal error, step-down, or shutdown).
    Stop,
}

fn spawn_remote_loop<B: StoreBackend>(ctx: &Arc<HandleCtx<B>>) {
    let Some(factory) = ctx.remote_factory.clone() else {
        return;
    };
    let generation = ctx.remote_generation.load(Ordering::Acquire);
    let task_ctx = Arc::clone(ctx);
    let task = tokio::spawn(async move {
        remote_loop(&task_ctx, factory, generation).await;
    });
    ctx.tasks.lock().push(task);
}

async fn remote_loop<B: StoreBackend>(
    ctx: &Arc<HandleCtx<B>>,
    factory: Arc<dyn RemoteFactory>,
    generation: u64,
) {
    let mut policy = ReconnectPolicy::new(&ctx.settings);
    loop {
        if cancelled(ctx, generation) {
            break;
        }
        // A backlog accumulated while offline surfaces as a pending save.
        if let Ok(Some(_)) = ctx.store(|b| b.next_unsynced_batch(1)).await {
            ctx.update_remote_state(|s| s.save = RemoteSave::Pending);
        }
        ctx.update_remote_state(|s| {
            s.connect = RemoteConnect::Connecting;
            s.read = RemoteRead::Loading;
        });

        let info = match ctx.store(|b| b.remote_sync_info()).await {
            Ok(info) => info,
            Err(_) => break,
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        match factory.connect(&ctx.user_id, info, event_tx).await {
            Ok(conn) => {
                policy.reset();
                *ctx.remote_conn.lock().await = Some(conn);
                ctx.update_remote_state(|s| s.connect = RemoteConnect::Online);

                let outcome = run_connection(ctx, event_rx, generation).await;

                if let Some(conn) = ctx.remote_conn.lock().await.take() {
                    conn.shutdown().await;
                }
                if matches!(outcome, ConnOutcome::Stop) {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "remote connect failed");
                let fatal = matches!(e, SyncError::Fatal(_));
                ctx.emit(StoreEvent::Error {
                    message: e.to_string(),
                    fatal,
                    reconnect: !fatal,
                });
                if fatal {
                    ctx.update_remote_state(|s| s.connect = RemoteConnect::Error);
                    break;
                }
            }
        }

        ctx.update_remote_state(|s| {
            s.connect = RemoteConnect::Offline;
            s.read = RemoteRead::Offline;
        });

        let delay = policy.next_delay();
        tokio::select! {
            _ = ctx.shutdown_notify.notified() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn cancelled<B: StoreBackend>(ctx: &HandleCtx<B>, generation: u64) -> bool {
    ctx.is_shutdown()
        || ctx.remote_generation.load(Ordering::Acquire) != generation
        || !ctx.is_leader.load(Ordering::Acquire)
}

async fn run_connection<B: StoreBackend>(
    ctx: &Arc<HandleCtx<B>>,
    mut events: mpsc::UnboundedReceiver<RemoteEvent>,
    generation: u64,
) -> ConnOutcome {
    let mut ready = false;
    let mut in_flight: Option<Vec<String>> = None;

    loop {
        if cancelled(ctx, generation) {
            return ConnOutcome::Stop;
        }
        tokio::select! {
            _ = ctx.shutdown_notify.notified() => return ConnOutcome::Stop,
            _ = ctx.local_commits.notified() => {
                if ready && in_flight.is_none() {
                    send_next_batch(ctx, &mut in_flight).await;
                } else {
                    // Snapshot still streaming in, or a batch in flight.
                    ctx.update_remote_state(|s| s.save = RemoteSave::Pending);
                }
            }
            event = events.recv() => match event {
                None => return ConnOutcome::Retry,
                Some(RemoteEvent::Ready) => {
                    ready = true;
                    ctx.update_remote_state(|s| s.read = RemoteRead::Ready);
                    if in_flight.is_none() {
                        send_next_batch(ctx, &mut in_flight).await;
                    }
                }
                Some(RemoteEvent::Commits { commits, remote_sync_id }) => {
                    let outcome = ctx
                        .store(move |b| b.add_commits(&commits, Some(&remote_sync_id)))
                        .await;
                    match outcome {
                        Ok(outcome) => ctx.deliver_new(&outcome, true),
                        Err(e) => {
                            warn!(error = %e, "failed to store remote commits");
                            ctx.emit(StoreEvent::Error {
                                message: e.to_string(),
                                fatal: false,
                                reconnect: true,
                            });
                        }
                    }
                }
                Some(RemoteEvent::Ack { refs, remote_sync_id }) => {
                    let _ = ctx
                        .store(move |b| b.acknowledge(&refs, &remote_sync_id))
                        .await;
                    in_flight = None;
                    send_next_batch(ctx, &mut in_flight).await;
                }
                Some(RemoteEvent::State(state)) => {
                    ctx.update_remote_state(|s| *s = state);
                }
                Some(RemoteEvent::Presence(record)) => {
                    ctx.emit(StoreEvent::ClientPresence(record.clone()));
                    ctx.send_channel(ChannelMessage::Presence(record));
                }
                Some(RemoteEvent::Error { message, fatal, reconnect }) => {
                    ctx.emit(StoreEvent::Error {
                        message: message.clone(),
                        fatal,
                        reconnect,
                    });
                    if fatal {
                        ctx.update_remote_state(|s| s.connect = RemoteConnect::Error);
                        return ConnOutcome::Stop;
                    }
                    return if reconnect { ConnOutcome::Retry } else { ConnOutcome::Stop };
                }
            }
        }
    }
}

/// Ship the next fixed-size batch of unsynced commits; the next batch waits
/// for this one's ack.
async fn send_next_batch<B: StoreBackend>(
    ctx: &Arc<HandleCtx<B>>,
    in_flight: &mut Option<Vec<String>>,
) {
    match ctx
        .store(|b| b.next_unsynced_batch(REMOTE_BATCH_SIZE))
        .await
    {
        Ok(Some(batch)) => {
            let refs: Vec<String> = batch.commits.iter().map(|c| c.ref_.clone()).collect();
            ctx.update_remote_state(|s| s.save = RemoteSave::Saving);
            let guard = ctx.remote_conn.lock().await;
            if let Some(conn) = guard.as_ref() {
                match conn.send_commits(batch.commits).await {
                    Ok(()) => *in_flight = Some(refs),
                    Err(e) => {
                        // The transport reports the failure on its event
                        // stream; the next connection re-yields the batch.
                        warn!(error = %e, "outbound batch failed");
                    }
                }
            }
        }
        Ok(None) => {
            ctx.update_remote_state(|s| s.save = RemoteSave::Ready);
        }
        Err(_) => {}
    }
}
