//! Shared integration-test harness: a trivial in-memory [`PageStorage`]
//! double and a [`Host`] wrapper around a [`UserCommunicator`] wired to a
//! [`FakeMesh`], plus a deterministic event-draining helper so multi-host
//! scenarios don't need arbitrary sleeps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use ledger_sync::config::ProviderConfig;
use ledger_sync::error::SyncError;
use ledger_sync::ids::{CommitId, DeviceId, Generation, ObjectId, PageId, UserId};
use ledger_sync::storage::{Commit, CommitWatcher, PageStorage};
use ledger_sync::testing::{FakeMesh, FakeMeshTransport};
use ledger_sync::user::UserCommunicator;

/// Minimal in-memory page store: enough of `PageStorage` to drive the
/// protocol end to end without a real commit graph implementation.
pub struct MemoryStorage {
    id: PageId,
    heads: StdMutex<Vec<Commit>>,
    commits: StdMutex<HashMap<CommitId, Commit>>,
    pieces: StdMutex<HashMap<ObjectId, (Vec<u8>, bool)>>,
    pub admitted: StdMutex<Vec<(CommitId, Vec<u8>, Generation)>>,
    pub mark_synced_calls: StdMutex<u32>,
}

impl MemoryStorage {
    pub fn new(id: PageId) -> Arc<Self> {
        Arc::new(Self {
            id,
            heads: StdMutex::new(Vec::new()),
            commits: StdMutex::new(HashMap::new()),
            pieces: StdMutex::new(HashMap::new()),
            admitted: StdMutex::new(Vec::new()),
            mark_synced_calls: StdMutex::new(0),
        })
    }

    /// Add a commit to local history without touching the head set — used
    /// to seed ancestors a `CommitRequest` should be able to answer.
    pub fn insert_commit(&self, commit: Commit) {
        self.commits.lock().unwrap().insert(commit.id.clone(), commit);
    }

    /// Seed the single local head commit, as if it had just been created —
    /// used by tests that need the fast-catch-up path to fire. Replaces any
    /// previous head so the page stays singly-headed.
    pub fn seed_head(&self, commit: Commit) {
        self.commits.lock().unwrap().insert(commit.id.clone(), commit.clone());
        *self.heads.lock().unwrap() = vec![commit];
    }
}

#[async_trait]
impl PageStorage for MemoryStorage {
    fn id(&self) -> PageId {
        self.id.clone()
    }

    async fn get_head_commits(&self) -> Vec<Commit> {
        self.heads.lock().unwrap().clone()
    }

    async fn get_commit(&self, id: &CommitId) -> Option<Commit> {
        self.commits.lock().unwrap().get(id).cloned()
    }

    async fn add_commits_from_sync(&self, commits: Vec<(CommitId, Vec<u8>, Generation)>) -> Result<(), SyncError> {
        for (id, bytes, generation) in &commits {
            self.commits.lock().unwrap().insert(
                id.clone(),
                Commit { id: id.clone(), bytes: bytes.clone(), generation: *generation, parents: vec![] },
            );
        }
        self.admitted.lock().unwrap().extend(commits);
        Ok(())
    }

    async fn get_piece(&self, id: &ObjectId) -> Option<(Vec<u8>, bool)> {
        self.pieces.lock().unwrap().get(id).cloned()
    }

    async fn add_object_from_sync(&self, id: ObjectId, bytes: Vec<u8>, is_synced_to_peer: bool) -> Result<(), SyncError> {
        self.pieces.lock().unwrap().insert(id, (bytes, is_synced_to_peer));
        Ok(())
    }

    async fn mark_synced_to_peer(&self) -> Result<(), SyncError> {
        *self.mark_synced_calls.lock().unwrap() += 1;
        Ok(())
    }

    fn register_commit_watcher(&self, _watcher: Box<dyn CommitWatcher>) {}
}

/// One simulated device: its `UserCommunicator` plus the raw transport used
/// to drain events deterministically (see [`settle`]).
pub struct Host {
    pub device: DeviceId,
    pub transport: Arc<FakeMeshTransport>,
    pub user: Arc<UserCommunicator<FakeMeshTransport, MemoryStorage>>,
}

pub async fn spawn_host(mesh: &FakeMesh, device: &[u8], user_id: &[u8]) -> Host {
    let device = DeviceId::new(device.to_vec());
    let transport = Arc::new(mesh.add_device(device.clone()).await);
    let config = ProviderConfig::new(UserId::new(user_id.to_vec()), device.clone());
    let user = UserCommunicator::new(config, transport.clone());
    Host { device, transport, user }
}

/// Drain every host's pending transport events into its `UserCommunicator`
/// until a full pass produces nothing new. The fake mesh never has real
/// network latency, so a short per-recv timeout is enough to detect "no more
/// events queued right now" without guessing a global sleep duration.
pub async fn settle(hosts: &[&Host]) {
    loop {
        let mut any = false;
        for host in hosts {
            while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(20), host.transport.recv()).await {
                host.user.handle_transport_event(event).await;
                any = true;
            }
        }
        if !any {
            break;
        }
    }
}
