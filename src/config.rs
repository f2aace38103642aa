//! Host-supplied configuration. Plain public-field structs, constructed by
//! the embedding application — this crate never reads environment variables
//! or files itself.

use crate::ids::{DeviceId, UserId};

/// Current wire protocol version. A handshake from a peer reporting a newer
/// version than this is treated like a user mismatch.
pub const PROTOCOL_VERSION: u32 = 1;

/// Configuration for a [`crate::provider::P2pProvider`].
pub struct ProviderConfig {
    /// Protocol version advertised in this device's handshake envelope.
    pub version: u32,

    /// This device's own user identity, resolved once at startup through a
    /// [`crate::storage::UserIdProvider`] (see
    /// [`crate::user::UserCommunicator::start`]).
    pub local_user_id: UserId,

    /// This device's own identity as known to the mesh transport.
    pub local_device_id: DeviceId,
}

impl ProviderConfig {
    pub fn new(local_user_id: UserId, local_device_id: DeviceId) -> Self {
        Self { version: PROTOCOL_VERSION, local_user_id, local_device_id }
    }
}

/// Configuration for a [`crate::page::PageCommunicator`].
///
/// No wall-clock timeouts are mandated by the design; `max_batch_requests`
/// exists only as the bounded-watchdog escape hatch for malformed peers
/// that never complete a commit batch (parent cycles, a peer that stops
/// answering `CommitRequest`).
pub struct PageCommunicatorConfig {
    /// Abandon a commit batch once it has issued this many outstanding
    /// `CommitRequest`s without completing. `None` disables the bound.
    pub max_batch_requests: Option<u32>,
}

impl PageCommunicatorConfig {
    pub fn new() -> Self {
        Self { max_batch_requests: Some(64) }
    }
}

impl Default for PageCommunicatorConfig {
    fn default() -> Self {
        Self::new()
    }
}
