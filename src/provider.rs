//! P2P provider (component C3): per-device authenticated mesh membership,
//! filtered by user id, with asymmetric connection establishment and a
//! handshake state machine.
//!
//! Modeled as an explicit per-device state machine driven by transition
//! functions rather than callback chaining — [`P2pProvider`] holds no task
//! of its own; it is driven by whoever owns it (the user communicator, C4)
//! feeding it transport events and reading back the [`ProviderEvent`]s each
//! one produces.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{cbor_decode, cbor_encode, frame, unframe};
use crate::config::ProviderConfig;
use crate::error::SyncError;
use crate::ids::{DeviceId, UserId};
use crate::transport::{DeviceChange, MeshTransport, TransportEvent};

/// States a remote device passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    /// We've opened (or are waiting to receive) a channel but no handshake
    /// envelope has been exchanged yet.
    Contacted,
    /// We are the initiator and have sent our handshake; waiting for the
    /// peer's reply.
    PendingHandshake,
    Established,
    /// Terminal until the transport reports the device gone — prevents the
    /// "new → open → wrong user → close → open again" loop.
    Closed,
}

struct DeviceEntry {
    state: DeviceState,
    /// Whether we have emitted `ProviderEvent::DeviceChange(New)` for this
    /// device. Guards the "deleted only after new" ordering invariant.
    notified_established: bool,
}

/// Event the provider surfaces to its client (the user communicator).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    DeviceChange { device: DeviceId, change: DeviceChange },
    Incoming { device: DeviceId, bytes: Vec<u8> },
}

#[derive(Serialize, Deserialize)]
struct Handshake {
    version: u32,
    local_user_id: Vec<u8>,
    local_device_id: Vec<u8>,
}

fn encode_handshake(h: &Handshake) -> Result<Vec<u8>, SyncError> {
    frame(&cbor_encode(h)?)
}

fn decode_handshake(bytes: &[u8]) -> Result<Handshake, SyncError> {
    cbor_decode(unframe(bytes)?)
}

/// Deterministic tie-break: the greater `DeviceId` initiates, so two devices
/// that become mutually visible at the same instant never both open a
/// channel.
fn should_initiate(local: &DeviceId, remote: &DeviceId) -> bool {
    local > remote
}

pub struct P2pProvider<T: MeshTransport> {
    config: ProviderConfig,
    transport: Arc<T>,
    devices: HashMap<DeviceId, DeviceEntry>,
}

impl<T: MeshTransport> P2pProvider<T> {
    pub fn new(config: ProviderConfig, transport: Arc<T>) -> Self {
        Self { config, transport, devices: HashMap::new() }
    }

    /// Feed one transport-reported event through the state machine, returning
    /// whatever provider-level events fall out of it. May suspend across an
    /// outbound handshake send.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Vec<ProviderEvent> {
        match event {
            TransportEvent::DeviceChange { device, change: DeviceChange::New } => {
                self.handle_device_new(device).await
            }
            TransportEvent::DeviceChange { device, change: DeviceChange::Deleted } => {
                self.handle_device_deleted(device)
            }
            TransportEvent::Incoming { device, bytes } => self.handle_incoming(device, bytes).await,
        }
    }

    async fn handle_device_new(&mut self, device: DeviceId) -> Vec<ProviderEvent> {
        if self.devices.contains_key(&device) {
            // Contacted-hosts memory: a re-announce without an intervening
            // `Deleted` must not restart the handshake dance.
            debug!(%device, "ignoring duplicate device-new, already tracked");
            return Vec::new();
        }

        let initiate = should_initiate(&self.config.local_device_id, &device);
        let mut entry = DeviceEntry { state: DeviceState::Contacted, notified_established: false };

        if initiate {
            let handshake = Handshake {
                version: self.config.version,
                local_user_id: self.config.local_user_id.as_bytes().to_vec(),
                local_device_id: self.config.local_device_id.as_bytes().to_vec(),
            };
            match encode_handshake(&handshake) {
                Ok(bytes) => {
                    self.transport.send(&device, bytes).await;
                    entry.state = DeviceState::PendingHandshake;
                    info!(%device, "initiating handshake");
                }
                Err(e) => warn!(%device, error = %e, "failed to encode handshake"),
            }
        } else {
            debug!(%device, "waiting for inbound handshake");
        }

        self.devices.insert(device, entry);
        Vec::new()
    }

    fn handle_device_deleted(&mut self, device: DeviceId) -> Vec<ProviderEvent> {
        let Some(entry) = self.devices.remove(&device) else {
            return Vec::new();
        };
        if entry.notified_established {
            info!(%device, "device gone");
            vec![ProviderEvent::DeviceChange { device, change: DeviceChange::Deleted }]
        } else {
            Vec::new()
        }
    }

    async fn handle_incoming(&mut self, device: DeviceId, bytes: Vec<u8>) -> Vec<ProviderEvent> {
        let Some(state) = self.devices.get(&device).map(|e| e.state) else {
            warn!(%device, "incoming datagram from untracked device, dropping");
            return Vec::new();
        };

        match state {
            DeviceState::Established => {
                vec![ProviderEvent::Incoming { device, bytes }]
            }
            DeviceState::Closed => {
                debug!(%device, "dropping datagram, connection closed");
                Vec::new()
            }
            DeviceState::Contacted | DeviceState::PendingHandshake => {
                self.handle_handshake_envelope(device, state, &bytes).await
            }
        }
    }

    async fn handle_handshake_envelope(
        &mut self,
        device: DeviceId,
        state: DeviceState,
        bytes: &[u8],
    ) -> Vec<ProviderEvent> {
        let handshake = match decode_handshake(bytes) {
            Ok(h) => h,
            Err(e) => {
                warn!(%device, error = %e, "malformed handshake, dropping");
                return Vec::new();
            }
        };

        let peer_user_id = UserId::new(handshake.local_user_id);
        let version_ok = handshake.version <= self.config.version;
        let user_ok = peer_user_id == self.config.local_user_id;

        if !version_ok || !user_ok {
            warn!(%device, version_ok, user_ok, "handshake mismatch, closing");
            if let Some(entry) = self.devices.get_mut(&device) {
                entry.state = DeviceState::Closed;
            }
            return Vec::new();
        }

        // Only the responder (state == Contacted, never initiated) replies
        // with its own handshake; the initiator's PendingHandshake state
        // means it already sent one and is just completing the exchange.
        if state == DeviceState::Contacted {
            let reply = Handshake {
                version: self.config.version,
                local_user_id: self.config.local_user_id.as_bytes().to_vec(),
                local_device_id: self.config.local_device_id.as_bytes().to_vec(),
            };
            match encode_handshake(&reply) {
                Ok(out) => {
                    self.transport.send(&device, out).await;
                }
                Err(e) => {
                    warn!(%device, error = %e, "failed to encode handshake reply");
                    return Vec::new();
                }
            }
        }

        if let Some(entry) = self.devices.get_mut(&device) {
            entry.state = DeviceState::Established;
            entry.notified_established = true;
        }
        info!(%device, "handshake established");
        vec![ProviderEvent::DeviceChange { device, change: DeviceChange::New }]
    }

    /// Forward already-framed bytes to an established peer. Returns `false`
    /// if the device is unknown or not established (the caller sees this
    /// the same way it would see `PeerUnavailable`).
    pub async fn send(&self, dest: &DeviceId, bytes: Vec<u8>) -> bool {
        match self.devices.get(dest).map(|e| e.state) {
            Some(DeviceState::Established) => self.transport.send(dest, bytes).await,
            _ => false,
        }
    }

    /// Devices currently in the `established` state.
    pub fn established_devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices
            .iter()
            .filter(|(_, e)| e.state == DeviceState::Established)
            .map(|(d, _)| d)
    }
}
