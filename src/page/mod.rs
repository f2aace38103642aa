//! Page communicator (component C6) — the protocol state machine.
//!
//! Modeled as a single-owner handle: one [`tokio::sync::Mutex`] guards all
//! mutable state. A parallel-thread implementation is fine too, as long as
//! it interposes a sequentializing lock at the user-communicator boundary
//! instead of the channel/actor split used elsewhere in this stack. A page
//! communicator serves two independent
//! callers — inbound protocol events pumped by its owning namespace
//! communicator, and [`PageSyncDelegate`] calls made independently by
//! storage — so a plain `&mut self` state machine driven from one place
//! doesn't fit; the lock lets both callers share `&self`.

pub mod commit_batch;
pub mod pending_object;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, CommitEntry, Envelope, MessageBody, ObjectResponseBody, Request, Response};
use crate::config::PageCommunicatorConfig;
use crate::ids::{CommitId, DeviceId, Generation, NamespaceId, ObjectId, PageId};
use crate::page::commit_batch::{BatchAction, CommitBatch};
use crate::page::pending_object::{ObjectOutcome, ObjectResponseOutcome, PendingObjectRegistry, ResponseAction};
use crate::storage::{
    Commit, CommitWatcher, DiffResult, ObjectFetchResult, ObjectFetchStatus, PageStorage, PageSyncDelegate,
};

/// Forward-only send capability handed to a page communicator by whoever
/// owns the route to the mesh (the user communicator, C4). Keeps C6 from
/// holding a back-pointer into C4/C3/C2 — it only ever calls forward
/// through this trait object, avoiding a back-reference cycle.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send_to(&self, dest: &DeviceId, bytes: Vec<u8>) -> bool;
}

/// Bridges [`CommitWatcher`]'s synchronous callback contract into the
/// async world: storage calls `on_new_commits` from whatever thread it
/// likes, we just forward onto a channel the page communicator's own pump
/// task drains.
struct ChannelCommitWatcher(mpsc::UnboundedSender<Vec<Commit>>);

impl CommitWatcher for ChannelCommitWatcher {
    fn on_new_commits(&self, commits: Vec<Commit>) {
        let _ = self.0.send(commits);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

struct Inner {
    lifecycle: Lifecycle,
    interest: HashSet<DeviceId>,
    not_interested: HashSet<DeviceId>,
    batches: HashMap<DeviceId, CommitBatch>,
    pending_objects: PendingObjectRegistry,
    /// Outstanding single-commit fetches issued by `get_diff`, keyed by the
    /// commit id requested and the device it was sent to — kept separate
    /// from `batches` since a diff fetch is not part of any batch's parent
    /// closure — it's a distinct path from commit-batch assembly.
    pending_diffs: HashMap<CommitId, (DeviceId, oneshot::Sender<Option<(Vec<u8>, Generation, Vec<CommitId>)>>)>,
    marked_synced: bool,
    pending_local_commits: Vec<Commit>,
    pump_task: Option<JoinHandle<()>>,
}

/// Advertises/revokes interest in one page, uploads local commits,
/// serves object/diff requests from peers, and admits remote commit
/// batches. Owned by a [`crate::namespace::NamespaceCommunicator`].
pub struct PageCommunicator<S: PageStorage> {
    page_id: PageId,
    namespace_id: NamespaceId,
    config: PageCommunicatorConfig,
    storage: Arc<S>,
    sink: Arc<dyn OutboundSink>,
    commit_tx: mpsc::UnboundedSender<Vec<Commit>>,
    commit_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<Commit>>>>,
    inner: Mutex<Inner>,
}

impl<S: PageStorage + 'static> PageCommunicator<S> {
    pub fn new(
        page_id: PageId,
        namespace_id: NamespaceId,
        config: PageCommunicatorConfig,
        storage: Arc<S>,
        sink: Arc<dyn OutboundSink>,
    ) -> Arc<Self> {
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            page_id,
            namespace_id,
            config,
            storage,
            sink,
            commit_tx,
            commit_rx: Mutex::new(Some(commit_rx)),
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Created,
                interest: HashSet::new(),
                not_interested: HashSet::new(),
                batches: HashMap::new(),
                pending_objects: PendingObjectRegistry::new(),
                pending_diffs: HashMap::new(),
                marked_synced: false,
                pending_local_commits: Vec::new(),
                pump_task: None,
            }),
        })
    }

    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// Devices in the interest table right now. Exposed for tests and for
    /// a namespace communicator that wants to report sync status upward.
    pub async fn interested_devices(&self) -> HashSet<DeviceId> {
        self.inner.lock().await.interest.clone()
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Idempotent-by-first-call. Registers as a commit watcher and sends
    /// `WatchStart` to every currently visible device not already known to
    /// lack this page.
    pub async fn start(self: &Arc<Self>, visible_devices: impl IntoIterator<Item = DeviceId>) {
        let mut guard = self.inner.lock().await;
        if guard.lifecycle != Lifecycle::Created {
            return;
        }
        guard.lifecycle = Lifecycle::Started;
        let targets: Vec<DeviceId> =
            visible_devices.into_iter().filter(|d| !guard.not_interested.contains(d)).collect();
        drop(guard);

        self.storage.register_commit_watcher(Box::new(ChannelCommitWatcher(self.commit_tx.clone())));

        if let Some(rx) = self.commit_rx.lock().await.take() {
            let this = Arc::clone(self);
            let handle = tokio::spawn(pump_local_commits(this, rx));
            self.inner.lock().await.pump_task = Some(handle);
        }

        info!(page = %self.page_id, targets = targets.len(), "page communicator started");
        for device in targets {
            self.send_request(&device, Request::WatchStart).await;
        }
    }

    /// Explicit teardown: broadcasts `WatchStop` to the interest table,
    /// cancels every pending object request and abandons every in-progress
    /// commit batch. `Drop` cannot run this itself — it has no executor to
    /// await a send on — so this is the real teardown path; `Drop` only
    /// warns if it's skipped.
    pub async fn stop(&self) {
        let (targets, task) = {
            let mut guard = self.inner.lock().await;
            if guard.lifecycle == Lifecycle::Stopped {
                return;
            }
            guard.lifecycle = Lifecycle::Stopped;
            let targets: Vec<DeviceId> = guard.interest.drain().collect();
            guard.batches.clear();
            guard.pending_objects.cancel_all();
            for (_, tx) in std::mem::take(&mut guard.pending_diffs).into_values() {
                let _ = tx.send(None);
            }
            (targets, guard.pump_task.take())
        };
        for device in &targets {
            self.send_request(device, Request::WatchStop).await;
        }
        if let Some(handle) = task {
            handle.abort();
        }
        info!(page = %self.page_id, "page communicator stopped");
    }

    // ── Device arrivals / departures ─────────────────────────────────────

    pub async fn on_device_new(&self, device: DeviceId) {
        let should_watch = {
            let guard = self.inner.lock().await;
            guard.lifecycle == Lifecycle::Started && !guard.not_interested.contains(&device)
        };
        if should_watch {
            self.send_request(&device, Request::WatchStart).await;
        }
    }

    pub async fn on_device_deleted(&self, device: DeviceId) {
        let (batch_action, object_retries, diff_cancellations) = {
            let mut guard = self.inner.lock().await;
            guard.interest.remove(&device);
            guard.not_interested.remove(&device);
            let batch_action = guard.batches.get_mut(&device).map(|b| b.on_peer_gone());
            let object_retries = guard.pending_objects.on_device_gone(&device);
            let stale: Vec<CommitId> =
                guard.pending_diffs.iter().filter(|(_, (d, _))| d == &device).map(|(id, _)| id.clone()).collect();
            let mut cancelled = Vec::new();
            for id in stale {
                if let Some((_, tx)) = guard.pending_diffs.remove(&id) {
                    cancelled.push(tx);
                }
            }
            (batch_action, object_retries, cancelled)
        };
        for tx in diff_cancellations {
            let _ = tx.send(None);
        }
        if let Some(action) = batch_action {
            self.apply_batch_action(device.clone(), action).await;
        }
        for (id, retry_device) in object_retries {
            self.send_request(&retry_device, Request::ObjectRequest { id }).await;
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    /// Entry point for an already-decoded message body addressed to this
    /// page, handed down by the owning namespace communicator.
    pub async fn handle_envelope(&self, source: DeviceId, body: MessageBody) {
        match body {
            MessageBody::Request(request) => self.handle_request(source, request).await,
            MessageBody::Response(response) => self.handle_response(source, response).await,
        }
    }

    async fn handle_request(&self, source: DeviceId, request: Request) {
        match request {
            Request::WatchStart => self.handle_watch_start(source).await,
            Request::WatchStop => self.handle_watch_stop(source).await,
            Request::CommitRequest { ids } => self.handle_commit_request(source, ids).await,
            Request::ObjectRequest { id } => self.handle_object_request(source, id).await,
        }
    }

    async fn handle_response(&self, source: DeviceId, response: Response) {
        match response {
            Response::WatchStartAck { has_page } => self.handle_watch_start_ack(source, has_page).await,
            Response::Commits { commits } => self.handle_commits(source, commits).await,
            Response::CommitResponse { commits } => self.handle_commit_response(source, commits).await,
            Response::ObjectResponse { id, body } => self.handle_object_response(source, id, body).await,
        }
    }

    // ── Inbound requests ─────────────────────────────────────────────

    /// A page communicator only exists for a page this process hosts, so
    /// `has_page` is always true here — a namespace communicator answers
    /// `false` itself, before a page communicator is ever created for an
    /// unhosted page.
    async fn handle_watch_start(&self, source: DeviceId) {
        let heads = self.storage.get_head_commits().await;
        {
            let mut guard = self.inner.lock().await;
            guard.interest.insert(source.clone());
            guard.not_interested.remove(&source);
        }
        self.send_response(&source, Response::WatchStartAck { has_page: true }).await;
        if heads.len() == 1 {
            let head = &heads[0];
            let entry = CommitEntry {
                id: head.id.clone(),
                bytes: head.bytes.clone(),
                generation: head.generation,
                parents: head.parents.clone(),
            };
            self.send_response(&source, Response::Commits { commits: vec![entry] }).await;
        }
        self.maybe_mark_synced().await;
    }

    async fn handle_watch_stop(&self, source: DeviceId) {
        self.inner.lock().await.interest.remove(&source);
    }

    async fn handle_commit_request(&self, source: DeviceId, ids: Vec<CommitId>) {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let payload = self.storage.get_commit(&id).await.map(|c| (c.bytes, c.generation, c.parents));
            results.push((id, payload));
        }
        self.send_response(&source, Response::CommitResponse { commits: results }).await;
    }

    /// `missing_reference` is never produced here: [`PageStorage::get_piece`]
    /// is a binary present/absent contract. A peer's own
    /// `missing_reference` reply is still honored on the receiving side, in
    /// [`Self::handle_object_response`].
    async fn handle_object_request(&self, source: DeviceId, id: ObjectId) {
        let body = match self.storage.get_piece(&id).await {
            Some((bytes, is_synced_to_peer)) => ObjectResponseBody::Present { bytes, is_synced_to_peer },
            None => ObjectResponseBody::NotFound,
        };
        self.send_response(&source, Response::ObjectResponse { id, body }).await;
    }

    // ── Inbound responses ────────────────────────────────────────────

    async fn handle_watch_start_ack(&self, source: DeviceId, has_page: bool) {
        if !has_page {
            self.inner.lock().await.not_interested.insert(source);
            return;
        }

        let (dispatched, batch_action) = {
            let mut guard = self.inner.lock().await;
            guard.interest.insert(source.clone());
            let dispatched = guard.pending_objects.on_peer_available(source.clone());
            let batch_action = if let Some(batch) = guard.batches.get_mut(&source) {
                batch.mark_peer_ready(self.storage.as_ref()).await
            } else {
                BatchAction::None
            };
            (dispatched, batch_action)
        };

        for (id, device) in dispatched {
            self.send_request(&device, Request::ObjectRequest { id }).await;
        }
        self.apply_batch_action(source, batch_action).await;
        self.maybe_mark_synced().await;
    }

    async fn handle_commits(&self, source: DeviceId, commits: Vec<CommitEntry>) {
        let action = {
            let mut guard = self.inner.lock().await;
            let is_ready = guard.interest.contains(&source);
            let storage = self.storage.as_ref();
            let batch =
                guard.batches.entry(source.clone()).or_insert_with(|| CommitBatch::new(self.config.max_batch_requests));
            let mut action = batch.add(commits, storage).await;
            if is_ready {
                let ready_action = batch.mark_peer_ready(storage).await;
                if !matches!(ready_action, BatchAction::None) {
                    action = ready_action;
                }
            }
            action
        };
        self.apply_batch_action(source, action).await;
    }

    async fn handle_commit_response(
        &self,
        source: DeviceId,
        commits: Vec<(CommitId, Option<(Vec<u8>, Generation, Vec<CommitId>)>)>,
    ) {
        let action = {
            let mut guard = self.inner.lock().await;
            let mut for_batch = Vec::new();
            for (id, payload) in commits {
                let routed = matches!(guard.pending_diffs.get(&id), Some((device, _)) if *device == source);
                if routed {
                    if let Some((_, tx)) = guard.pending_diffs.remove(&id) {
                        let _ = tx.send(payload);
                    }
                } else {
                    for_batch.push((id, payload));
                }
            }
            if for_batch.is_empty() {
                None
            } else {
                match guard.batches.get_mut(&source) {
                    Some(batch) => Some(batch.on_commit_response(for_batch, self.storage.as_ref()).await),
                    None => None,
                }
            }
        };
        if let Some(action) = action {
            self.apply_batch_action(source, action).await;
        }
    }

    async fn handle_object_response(&self, source: DeviceId, id: ObjectId, body: ObjectResponseBody) {
        let outcome = match body {
            ObjectResponseBody::Present { bytes, is_synced_to_peer } => {
                if let Err(e) = self.storage.add_object_from_sync(id.clone(), bytes.clone(), is_synced_to_peer).await
                {
                    warn!(object = %id, error = %e, "failed to store object received from peer");
                }
                ObjectResponseOutcome::Present { bytes, is_synced_to_peer }
            }
            ObjectResponseBody::NotFound => ObjectResponseOutcome::NotFound,
            ObjectResponseBody::MissingReference => ObjectResponseOutcome::MissingReference,
        };
        let action = {
            let mut guard = self.inner.lock().await;
            guard.pending_objects.on_response(&id, &source, outcome)
        };
        if let Some(ResponseAction::Retry(device)) = action {
            self.send_request(&device, Request::ObjectRequest { id }).await;
        }
    }

    // ── Batch action application ────────────────────────────────────

    async fn apply_batch_action(&self, source: DeviceId, action: BatchAction) {
        match action {
            BatchAction::None => {}
            BatchAction::RequestParents(ids) => {
                self.send_request(&source, Request::CommitRequest { ids }).await;
            }
            BatchAction::Admitted => {
                info!(device = %source, page = %self.page_id, "commit batch admitted");
                self.inner.lock().await.batches.remove(&source);
            }
            BatchAction::Abandon(reason) => {
                warn!(device = %source, page = %self.page_id, reason = ?reason, "commit batch abandoned");
                self.inner.lock().await.batches.remove(&source);
            }
        }
    }

    // ── Outbound commits ─────────────────────────────────────────────

    async fn on_local_commits(&self, commits: Vec<Commit>) {
        let mut guard = self.inner.lock().await;
        guard.pending_local_commits.extend(commits);
        let heads = self.storage.get_head_commits().await;
        if heads.len() != 1 {
            debug!(page = %self.page_id, heads = heads.len(), "merge in progress, holding queued commits");
            return;
        }
        let to_send = std::mem::take(&mut guard.pending_local_commits);
        if to_send.is_empty() {
            return;
        }
        let peers: Vec<DeviceId> = guard.interest.iter().cloned().collect();
        drop(guard);
        if peers.is_empty() {
            return;
        }
        let entries: Vec<CommitEntry> = to_send
            .into_iter()
            .map(|c| CommitEntry { id: c.id, bytes: c.bytes, generation: c.generation, parents: c.parents })
            .collect();
        for peer in &peers {
            self.send_response(peer, Response::Commits { commits: entries.clone() }).await;
        }
        self.maybe_mark_synced().await;
    }

    // ── Marked-as-synced optimization ───────────────────────────────

    /// Fires on whichever happens first: a peer entering the interest
    /// table (it can now fast-catch-up or receive a broadcast), or a
    /// successful outbound commit broadcast to at least one interested
    /// peer. Either is a reasonable proxy for "some peer now has this
    /// page"; `marked_synced` makes the actual storage call idempotent
    /// across both call sites regardless.
    async fn maybe_mark_synced(&self) {
        {
            let mut guard = self.inner.lock().await;
            if guard.marked_synced {
                return;
            }
            guard.marked_synced = true;
        }
        if let Err(e) = self.storage.mark_synced_to_peer().await {
            warn!(page = %self.page_id, error = %e, "mark_synced_to_peer failed");
        }
    }

    // ── send helpers ─────────────────────────────────────────────────

    async fn send_request(&self, dest: &DeviceId, request: Request) {
        self.send_body(dest, MessageBody::Request(request)).await;
    }

    async fn send_response(&self, dest: &DeviceId, response: Response) {
        self.send_body(dest, MessageBody::Response(response)).await;
    }

    async fn send_body(&self, dest: &DeviceId, body: MessageBody) {
        let envelope = Envelope { namespace_id: self.namespace_id.clone(), page_id: self.page_id.clone(), body };
        match codec::encode(&envelope) {
            Ok(bytes) => {
                self.sink.send_to(dest, bytes).await;
            }
            Err(e) => warn!(device = %dest, error = %e, "failed to encode outbound envelope"),
        }
    }
}

/// Drains the commit-watcher channel for the lifetime of the spawned pump
/// task; `start()` aborts this task on `stop()`.
async fn pump_local_commits<S: PageStorage + 'static>(
    communicator: Arc<PageCommunicator<S>>,
    mut rx: mpsc::UnboundedReceiver<Vec<Commit>>,
) {
    while let Some(commits) = rx.recv().await {
        communicator.on_local_commits(commits).await;
    }
}

#[async_trait]
impl<S: PageStorage + 'static> PageSyncDelegate for PageCommunicator<S> {
    /// Look up or create a pending request, dispatch to any untried
    /// interest-table candidate, and wait for it to resolve.
    /// Concurrent callers requesting the same object collapse onto one
    /// registry entry.
    async fn get_object(&self, id: ObjectId) -> ObjectFetchResult {
        let (rx, dispatch) = {
            let mut guard = self.inner.lock().await;
            let candidates: Vec<DeviceId> = guard.interest.iter().cloned().collect();
            guard.pending_objects.request(id.clone(), candidates)
        };
        if let Some(device) = dispatch {
            self.send_request(&device, Request::ObjectRequest { id: id.clone() }).await;
        }
        match rx.await {
            Ok(ObjectOutcome::Present { bytes, is_synced_to_peer }) => {
                ObjectFetchResult { status: ObjectFetchStatus::Present, bytes: Some(bytes), is_synced_to_peer }
            }
            Ok(ObjectOutcome::NotFound) | Ok(ObjectOutcome::Cancelled) | Err(_) => {
                ObjectFetchResult { status: ObjectFetchStatus::NotFound, bytes: None, is_synced_to_peer: false }
            }
        }
    }

    /// Fetch a candidate base commit from an interested peer so storage can
    /// make it locally available and compute the diff itself.
    /// Tries `possible_bases` in order, stopping at the first one an
    /// interested peer actually has.
    async fn get_diff(&self, _commit: CommitId, possible_bases: Vec<CommitId>) -> DiffResult {
        let device = { self.inner.lock().await.interest.iter().next().cloned() };
        let Some(device) = device else {
            return DiffResult { status: ObjectFetchStatus::NotFound, chosen_base: None, entry_changes: vec![] };
        };

        for base in possible_bases {
            let (tx, rx) = oneshot::channel();
            {
                let mut guard = self.inner.lock().await;
                guard.pending_diffs.insert(base.clone(), (device.clone(), tx));
            }
            self.send_request(&device, Request::CommitRequest { ids: vec![base.clone()] }).await;

            match rx.await {
                Ok(Some((bytes, generation, _parents))) => {
                    if let Err(e) = self.storage.add_commits_from_sync(vec![(base.clone(), bytes, generation)]).await
                    {
                        warn!(commit = %base, error = %e, "failed to admit diff base commit");
                        continue;
                    }
                    return DiffResult {
                        status: ObjectFetchStatus::Present,
                        chosen_base: Some(base),
                        entry_changes: vec![],
                    };
                }
                Ok(None) | Err(_) => continue,
            }
        }

        DiffResult { status: ObjectFetchStatus::NotFound, chosen_base: None, entry_changes: vec![] }
    }
}

impl<S: PageStorage> Drop for PageCommunicator<S> {
    /// `Drop` cannot run the real teardown — "on drop, a `WatchStop` is
    /// broadcast..." — since that requires awaiting sends; callers are
    /// expected to call [`Self::stop`] explicitly. This only logs, as a
    /// backstop against a caller forgetting to.
    fn drop(&mut self) {
        if let Ok(guard) = self.inner.try_lock() {
            if guard.lifecycle != Lifecycle::Stopped {
                warn!(page = %self.page_id, "page communicator dropped without calling stop() first");
            }
        }
    }
}
