//! External interfaces: the contracts the core consumes from the local page
//! storage engine and the credential layer, and the contract the core
//! exposes back to storage. None of these are implemented by this crate —
//! the storage engine, the object store, and diff/merge semantics are all
//! explicitly out of scope.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::ids::{CommitId, Generation, ObjectId, PageId, UserId};

/// A node in a page's commit graph, as stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: CommitId,
    pub bytes: Vec<u8>,
    pub generation: Generation,
    pub parents: Vec<CommitId>,
}

/// Invoked by storage whenever new commits are appended locally, via
/// `register_commit_watcher`. Storage guarantees calls are made in commit
/// order; this crate never calls back into storage from within a watcher
/// invocation to avoid reentrancy.
pub trait CommitWatcher: Send + Sync {
    fn on_new_commits(&self, commits: Vec<Commit>);
}

/// The local on-disk commit graph and object store for one page.
/// Implemented by the embedding host, not this crate.
#[async_trait]
pub trait PageStorage: Send + Sync {
    fn id(&self) -> PageId;

    async fn get_head_commits(&self) -> Vec<Commit>;

    async fn get_commit(&self, id: &CommitId) -> Option<Commit>;

    /// Admit a batch of commits received over P2P. Storage is responsible
    /// for graph integrity; the core only guarantees it has requested and
    /// received the commits' declared parents before calling this.
    async fn add_commits_from_sync(
        &self,
        commits: Vec<(CommitId, Vec<u8>, Generation)>,
    ) -> Result<(), SyncError>;

    /// Fetch a content-addressed object. The returned flag reports whether
    /// storage already knows this object to be present on some peer.
    async fn get_piece(&self, id: &ObjectId) -> Option<(Vec<u8>, bool)>;

    async fn add_object_from_sync(
        &self,
        id: ObjectId,
        bytes: Vec<u8>,
        is_synced_to_peer: bool,
    ) -> Result<(), SyncError>;

    /// Idempotent from storage's side; the core still only calls this once
    /// per page-communicator lifetime.
    async fn mark_synced_to_peer(&self) -> Result<(), SyncError>;

    fn register_commit_watcher(&self, watcher: Box<dyn CommitWatcher>);
}

/// Outcome of a delegate-side object fetch, mirroring the three
/// `ObjectResponse` statuses on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFetchStatus {
    Present,
    NotFound,
    /// Storage reports the object exists but a transitively referenced
    /// object is not yet local, so it would be unsafe to forward.
    MissingReference,
}

#[derive(Debug, Clone)]
pub struct ObjectFetchResult {
    pub status: ObjectFetchStatus,
    pub bytes: Option<Vec<u8>>,
    pub is_synced_to_peer: bool,
}

/// An opaque storage-level description of one changed entry between two
/// commits. This crate never interprets the bytes — diff semantics, and
/// conflict resolution of page content, belong to the storage engine; they
/// are carried through so storage can reconstitute the change once the
/// chosen base commit is locally available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChange(pub Vec<u8>);

#[derive(Debug, Clone)]
pub struct DiffResult {
    pub status: ObjectFetchStatus,
    pub chosen_base: Option<CommitId>,
    /// Always empty from this crate's own implementation: computing entry
    /// changes from commit content requires understanding the page's object
    /// model, which is storage's job. The core's contribution to a diff
    /// fetch is making `chosen_base` locally available; storage is expected
    /// to compute changes itself once that holds.
    pub entry_changes: Vec<EntryChange>,
}

/// Implemented by [`crate::page::PageCommunicator`] and called by storage
/// when it needs the core's help satisfying a local read against content
/// that may live on a peer.
#[async_trait]
pub trait PageSyncDelegate: Send + Sync {
    async fn get_object(&self, id: ObjectId) -> ObjectFetchResult;

    async fn get_diff(&self, commit: CommitId, possible_bases: Vec<CommitId>) -> DiffResult;
}

/// Resolves this device's own user identity. Called once, by
/// [`crate::user::UserCommunicator::start`], before the provider can be
/// brought up — it is the only thing that needs this device's user id
/// before construction.
#[async_trait]
pub trait UserIdProvider: Send + Sync {
    async fn get_user_id(&self) -> Result<UserId, SyncError>;
}

/// Trivial provider returning a fixed id, grounded in the original's
/// `StaticUserIdProvider` test double.
pub struct StaticUserIdProvider(UserId);

impl StaticUserIdProvider {
    pub fn new(id: UserId) -> Self {
        Self(id)
    }
}

#[async_trait]
impl UserIdProvider for StaticUserIdProvider {
    async fn get_user_id(&self) -> Result<UserId, SyncError> {
        Ok(self.0.clone())
    }
}
