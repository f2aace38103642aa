//! Commit batch assembler (component C7).
//!
//! Owned by a page communicator, keyed by the source `DeviceId` — at most
//! one in-flight batch per source. Accumulates commits from one peer until
//! their parent closure is locally satisfiable, then admits them to storage
//! in one call.

use std::collections::{HashMap, HashSet};

use crate::codec::CommitEntry;
use crate::ids::{CommitId, DeviceId, Generation};
use crate::storage::PageStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Collecting,
    PeerReady,
    Admitted,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// Parent closure never became satisfiable within the configured
    /// request/time bound — a malformed peer advertising a parent cycle, or
    /// one that stalls mid-transfer.
    Watchdog,
    PeerGone,
    /// A parent requested from the source peer came back `None` — the
    /// source cannot complete this batch.
    MissingParentUnavailable,
    StorageError(String),
}

/// What the owning page communicator must do in response to feeding an
/// event into the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAction {
    /// Nothing to do yet (still collecting, or not peer-ready).
    None,
    /// Send a `CommitRequest` for these ids to the batch's source device.
    RequestParents(Vec<CommitId>),
    /// The batch was admitted to storage.
    Admitted,
    Abandon(AbandonReason),
}

struct Entry {
    bytes: Vec<u8>,
    generation: Generation,
    parents: Vec<CommitId>,
}

pub struct CommitBatch {
    state: BatchState,
    commits: HashMap<CommitId, Entry>,
    missing: HashSet<CommitId>,
    requested: HashSet<CommitId>,
    requests_issued: u32,
    max_requests: Option<u32>,
}

impl CommitBatch {
    pub fn new(max_requests: Option<u32>) -> Self {
        Self {
            state: BatchState::Collecting,
            commits: HashMap::new(),
            missing: HashSet::new(),
            requested: HashSet::new(),
            requests_issued: 0,
            max_requests,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, BatchState::Admitted | BatchState::Abandoned)
    }

    /// Merge new commits, recompute the missing-parent set against both
    /// the batch's own map and local storage, and either request what's
    /// still missing or admit if everything is satisfied and the peer has
    /// already been marked ready.
    pub async fn add(&mut self, entries: Vec<CommitEntry>, storage: &dyn PageStorage) -> BatchAction {
        if self.is_terminal() {
            return BatchAction::None;
        }
        for entry in entries {
            self.commits.insert(
                entry.id,
                Entry { bytes: entry.bytes, generation: entry.generation, parents: entry.parents },
            );
        }
        self.recompute_missing(storage).await;
        self.progress(storage).await
    }

    /// Only once the source device is confirmed in the interest table does
    /// the assembler attempt admission — this two-phase peer readiness
    /// closes the race where admitted commits reference objects we'd fetch
    /// from a peer not yet known present.
    pub async fn mark_peer_ready(&mut self, storage: &dyn PageStorage) -> BatchAction {
        if self.is_terminal() {
            return BatchAction::None;
        }
        self.state = BatchState::PeerReady;
        self.progress(storage).await
    }

    pub fn on_peer_gone(&mut self) -> BatchAction {
        if self.is_terminal() {
            return BatchAction::None;
        }
        self.state = BatchState::Abandoned;
        BatchAction::Abandon(AbandonReason::PeerGone)
    }

    /// A `CommitRequest` issued for a missing parent came back. `None`
    /// entries mean the source doesn't have that commit — abandon in that
    /// case. Present entries are merged in like any other commit.
    pub async fn on_commit_response(
        &mut self,
        results: Vec<(CommitId, Option<(Vec<u8>, Generation, Vec<CommitId>)>)>,
        storage: &dyn PageStorage,
    ) -> BatchAction {
        if self.is_terminal() {
            return BatchAction::None;
        }
        for (id, result) in results {
            self.requested.remove(&id);
            match result {
                Some((bytes, generation, parents)) => {
                    self.commits.insert(id, Entry { bytes, generation, parents });
                }
                None => {
                    self.state = BatchState::Abandoned;
                    return BatchAction::Abandon(AbandonReason::MissingParentUnavailable);
                }
            }
        }
        self.recompute_missing(storage).await;
        self.progress(storage).await
    }

    async fn recompute_missing(&mut self, storage: &dyn PageStorage) {
        let candidates: HashSet<CommitId> = self
            .commits
            .values()
            .flat_map(|e| e.parents.iter().cloned())
            .filter(|id| !self.commits.contains_key(id))
            .collect();

        let mut missing = HashSet::new();
        for id in candidates {
            if storage.get_commit(&id).await.is_none() {
                missing.insert(id);
            }
        }
        self.missing = missing;
    }

    async fn progress(&mut self, storage: &dyn PageStorage) -> BatchAction {
        if !self.missing.is_empty() {
            let to_request: Vec<CommitId> =
                self.missing.difference(&self.requested).cloned().collect();
            if to_request.is_empty() {
                return BatchAction::None;
            }
            self.requested.extend(to_request.iter().cloned());
            self.requests_issued += to_request.len() as u32;
            if let Some(max) = self.max_requests {
                if self.requests_issued > max {
                    self.state = BatchState::Abandoned;
                    return BatchAction::Abandon(AbandonReason::Watchdog);
                }
            }
            return BatchAction::RequestParents(to_request);
        }

        if self.state != BatchState::PeerReady || self.commits.is_empty() {
            return BatchAction::None;
        }

        let mut ordered: Vec<(CommitId, Vec<u8>, Generation)> = self
            .commits
            .iter()
            .map(|(id, e)| (id.clone(), e.bytes.clone(), e.generation))
            .collect();
        ordered.sort_by_key(|(_, _, generation)| *generation);

        match storage.add_commits_from_sync(ordered).await {
            Ok(()) => {
                self.state = BatchState::Admitted;
                BatchAction::Admitted
            }
            Err(e) => {
                self.state = BatchState::Abandoned;
                BatchAction::Abandon(AbandonReason::StorageError(e.to_string()))
            }
        }
    }
}
