//! In-process fake mesh, exported (not `#[cfg(test)]`-gated) so both this
//! crate's own tests and a downstream embedder's integration tests can
//! exercise the stack without a real transport.
//!
//! Grounded in `fake_p2p_provider_factory.cc` from `original_source`: a
//! shared registry keyed by `DeviceId` that fans a `send` out to the
//! matching peer's inbox and fans `new`/`deleted` out to every other
//! registered device. The original posts these onto a single-threaded
//! dispatcher task queue; this port uses one `tokio::sync::mpsc` channel per
//! device instead, which is the Rust async equivalent for a fake that needs
//! to hand events back to a caller rather than push them through a virtual
//! method.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::ids::DeviceId;
use crate::transport::{DeviceChange, MeshTransport, TransportEvent};
use crate::user::UserCommunicator;
use crate::storage::PageStorage;

struct Inner {
    devices: HashMap<DeviceId, mpsc::UnboundedSender<TransportEvent>>,
}

/// Shared mesh registry. Clone freely — every clone refers to the same
/// underlying device table, the way every `FakeP2PProvider` in the original
/// shares one `FakeP2PProviderFactory`.
#[derive(Clone)]
pub struct FakeMesh {
    inner: Arc<Mutex<Inner>>,
}

impl FakeMesh {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner { devices: HashMap::new() })) }
    }

    /// Register `device` on the mesh. Mirrors `FakeP2PProviderFactory::Register`:
    /// every already-registered device is told about the newcomer, and the
    /// newcomer is told about every device already present — both directions
    /// see a `DeviceChange::New`.
    pub async fn add_device(&self, device: DeviceId) -> FakeMeshTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.lock().await;
        for (other, other_tx) in guard.devices.iter() {
            let _ = other_tx.send(TransportEvent::DeviceChange { device: device.clone(), change: DeviceChange::New });
            let _ = tx.send(TransportEvent::DeviceChange { device: other.clone(), change: DeviceChange::New });
        }
        guard.devices.insert(device.clone(), tx);
        drop(guard);
        FakeMeshTransport { device, mesh: self.clone(), rx: Mutex::new(rx) }
    }

    /// Deregister `device`. Mirrors `FakeP2PProviderFactory::Unregister`:
    /// every remaining device sees a `DeviceChange::Deleted`; `device` itself
    /// receives nothing further (its channel is simply dropped).
    pub async fn remove_device(&self, device: &DeviceId) {
        let mut guard = self.inner.lock().await;
        guard.devices.remove(device);
        for other_tx in guard.devices.values() {
            let _ = other_tx.send(TransportEvent::DeviceChange { device: device.clone(), change: DeviceChange::Deleted });
        }
    }
}

impl Default for FakeMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One device's view of a [`FakeMesh`]: a [`MeshTransport`] implementation
/// plus the event stream a test driver pumps into the owning
/// [`crate::user::UserCommunicator`].
pub struct FakeMeshTransport {
    device: DeviceId,
    mesh: FakeMesh,
    rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl FakeMeshTransport {
    /// Wait for the next event addressed to this device (a device change or
    /// an incoming datagram). Returns `None` once the mesh has dropped this
    /// device's sender — never happens in practice since `FakeMesh` never
    /// removes a still-registered device's own channel.
    pub async fn recv(&self) -> Option<TransportEvent> {
        self.rx.lock().await.recv().await
    }
}

#[async_trait]
impl MeshTransport for FakeMeshTransport {
    async fn send(&self, dest: &DeviceId, bytes: Vec<u8>) -> bool {
        let guard = self.mesh.inner.lock().await;
        match guard.devices.get(dest) {
            Some(tx) => tx.send(TransportEvent::Incoming { device: self.device.clone(), bytes }).is_ok(),
            None => false,
        }
    }

    fn list_devices(&self) -> std::collections::HashSet<DeviceId> {
        // Synchronous trait method over an async-locked registry: `try_lock`
        // is safe here because nothing holds the lock across an await point
        // in this module, so it is never actually contended across a yield.
        match self.mesh.inner.try_lock() {
            Ok(guard) => guard.devices.keys().filter(|d| *d != &self.device).cloned().collect(),
            Err(_) => std::collections::HashSet::new(),
        }
    }
}

/// Spawn a task that drains `transport`'s event stream into `user`'s
/// `handle_transport_event`, one event at a time — the single-threaded,
/// non-reentrant pump assumed to sit in front of a user communicator. The
/// handle is dropped by callers that want to stop pumping (the task then
/// runs until its next `recv`, which simply never returns).
pub fn pump<S>(transport: Arc<FakeMeshTransport>, user: Arc<UserCommunicator<FakeMeshTransport, S>>) -> JoinHandle<()>
where
    S: PageStorage + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = transport.recv().await {
            user.handle_transport_event(event).await;
        }
    })
}
