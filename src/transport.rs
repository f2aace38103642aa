//! Mesh transport adapter contract (component C2).
//!
//! This crate never implements a transport itself — the per-device byte
//! pipe, peer discovery, and any transport-level security are someone
//! else's concern (typically a point-to-point connection over whatever
//! carrier the embedding host chooses). [`MeshTransport`] is the seam; see
//! [`crate::testing::FakeMeshTransport`] for the in-process double used by
//! this crate's own tests.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::ids::DeviceId;

/// A device arrival or departure reported by the mesh transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    New,
    Deleted,
}

/// Events pushed from the transport up into [`crate::provider::P2pProvider`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    DeviceChange { device: DeviceId, change: DeviceChange },
    Incoming { device: DeviceId, bytes: Vec<u8> },
}

/// Deliver a byte datagram between named devices; report arrivals and
/// departures. The transport does not interpret `bytes` — framing and
/// parsing is entirely the codec's job, layered on top.
///
/// Send failures are not retried at this layer; callers above are built to
/// tolerate drops.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Best-effort send. Returns `false` synchronously if `dest` is not
    /// currently known to the transport; does not indicate the datagram was
    /// actually received.
    async fn send(&self, dest: &DeviceId, bytes: Vec<u8>) -> bool;

    /// Snapshot of devices currently visible to this transport.
    fn list_devices(&self) -> HashSet<DeviceId>;
}
