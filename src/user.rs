//! User communicator (component C4): owns the one [`P2pProvider`] for this
//! user identity, fans its events out to namespace communicators, and is
//! the [`OutboundSink`] every page communicator ultimately sends through.
//!
//! Implementing `OutboundSink` on the user communicator itself — rather
//! than giving namespace/page communicators a raw pointer back up — is the
//! forward-capability answer: a page communicator holds an
//! `Arc<dyn OutboundSink>`, never an `Arc<UserCommunicator<...>>`, so it
//! cannot observe or depend on anything about its owner beyond that one
//! method.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec;
use crate::config::ProviderConfig;
use crate::error::SyncError;
use crate::ids::{DeviceId, NamespaceId};
use crate::namespace::NamespaceCommunicator;
use crate::page::OutboundSink;
use crate::provider::{P2pProvider, ProviderEvent};
use crate::storage::{PageStorage, UserIdProvider};
use crate::transport::{DeviceChange, MeshTransport, TransportEvent};

pub struct UserCommunicator<T: MeshTransport, S: PageStorage> {
    provider: Mutex<P2pProvider<T>>,
    namespaces: Mutex<HashMap<NamespaceId, Arc<NamespaceCommunicator<S>>>>,
}

impl<T: MeshTransport + 'static, S: PageStorage + 'static> UserCommunicator<T, S> {
    pub fn new(config: ProviderConfig, transport: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            provider: Mutex::new(P2pProvider::new(config, transport)),
            namespaces: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve this device's user identity through `id_provider` and bring
    /// up the communicator. This is the entry point a host uses when it
    /// doesn't already hold its own user id in hand — `new` stays available
    /// for callers (tests included) that do.
    pub async fn start(
        id_provider: &dyn UserIdProvider,
        local_device_id: DeviceId,
        transport: Arc<T>,
    ) -> Result<Arc<Self>, SyncError> {
        let local_user_id = id_provider.get_user_id().await?;
        let config = ProviderConfig::new(local_user_id, local_device_id);
        Ok(Self::new(config, transport))
    }

    /// Returns the namespace communicator for `namespace_id`, creating it
    /// on first use.
    pub async fn get_namespace_communicator(
        self: &Arc<Self>,
        namespace_id: NamespaceId,
    ) -> Arc<NamespaceCommunicator<S>> {
        let mut guard = self.namespaces.lock().await;
        guard
            .entry(namespace_id.clone())
            .or_insert_with(|| {
                let sink: Arc<dyn OutboundSink> = self.clone();
                Arc::new(NamespaceCommunicator::new(namespace_id, sink))
            })
            .clone()
    }

    /// Devices currently established with the provider — the snapshot a
    /// caller typically seeds a freshly hosted page's `start()` with.
    pub async fn established_devices(&self) -> Vec<DeviceId> {
        self.provider.lock().await.established_devices().cloned().collect()
    }

    /// Feed one event from the mesh transport through the provider and
    /// fan out whatever provider-level events result.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        let events = self.provider.lock().await.handle_transport_event(event).await;
        for event in events {
            match event {
                ProviderEvent::DeviceChange { device, change: DeviceChange::New } => {
                    for ns in self.namespace_snapshot().await {
                        ns.forward_device_new(device.clone()).await;
                    }
                }
                ProviderEvent::DeviceChange { device, change: DeviceChange::Deleted } => {
                    for ns in self.namespace_snapshot().await {
                        ns.forward_device_deleted(device.clone()).await;
                    }
                }
                ProviderEvent::Incoming { device, bytes } => {
                    self.dispatch_incoming(device, bytes).await;
                }
            }
        }
    }

    async fn namespace_snapshot(&self) -> Vec<Arc<NamespaceCommunicator<S>>> {
        self.namespaces.lock().await.values().cloned().collect()
    }

    /// Decode just the envelope header to learn the destination namespace
    /// (and page), and forward — creating nothing implicitly. Traffic for a
    /// namespace with no local communicator is dropped.
    async fn dispatch_incoming(&self, device: DeviceId, bytes: Vec<u8>) {
        let (namespace_id, page_id, body) = match codec::decode_header(&bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(device = %device, error = %e, "failed to decode envelope header, dropping");
                return;
            }
        };

        let ns = self.namespaces.lock().await.get(&namespace_id).cloned();
        let Some(ns) = ns else {
            debug!(namespace = %namespace_id, "dropping datagram for namespace with no local communicator");
            return;
        };

        match codec::decode_body(&body) {
            Ok(body) => ns.handle_incoming(device, page_id, body).await,
            Err(e) => warn!(device = %device, error = %e, "failed to decode envelope body, dropping"),
        }
    }
}

#[async_trait]
impl<T: MeshTransport + 'static, S: PageStorage + 'static> OutboundSink for UserCommunicator<T, S> {
    async fn send_to(&self, dest: &DeviceId, bytes: Vec<u8>) -> bool {
        self.provider.lock().await.send(dest, bytes).await
    }
}
