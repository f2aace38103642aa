//! Namespace communicator (component C5): a trivial demultiplexer over the
//! page communicators of one application namespace.
//!
//! Page communicators are never created from inbound traffic — only an
//! explicit [`Self::host_page`] call from the embedding application does
//! that — so a `WatchStart` for a page this process doesn't host gets an
//! immediate `WatchStartAck{has_page: false}` answered right here, without
//! ever instantiating a [`PageCommunicator`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::{self, Envelope, MessageBody, Request, Response};
use crate::config::PageCommunicatorConfig;
use crate::ids::{DeviceId, NamespaceId, PageId};
use crate::page::{OutboundSink, PageCommunicator};
use crate::storage::PageStorage;

pub struct NamespaceCommunicator<S: PageStorage> {
    namespace_id: NamespaceId,
    sink: Arc<dyn OutboundSink>,
    pages: Mutex<HashMap<PageId, Arc<PageCommunicator<S>>>>,
}

impl<S: PageStorage + 'static> NamespaceCommunicator<S> {
    pub fn new(namespace_id: NamespaceId, sink: Arc<dyn OutboundSink>) -> Self {
        Self { namespace_id, sink, pages: Mutex::new(HashMap::new()) }
    }

    pub fn namespace_id(&self) -> &NamespaceId {
        &self.namespace_id
    }

    /// The application says "I have this page, sync it". Constructs and
    /// starts a page communicator, seeded with whatever devices are
    /// currently visible (typically the caller's own snapshot of the
    /// provider's established set).
    pub async fn host_page(
        &self,
        page_id: PageId,
        config: PageCommunicatorConfig,
        storage: Arc<S>,
        visible_devices: impl IntoIterator<Item = DeviceId>,
    ) -> Arc<PageCommunicator<S>> {
        let page = PageCommunicator::new(page_id.clone(), self.namespace_id.clone(), config, storage, self.sink.clone());
        page.start(visible_devices).await;
        self.pages.lock().await.insert(page_id, page.clone());
        page
    }

    /// Stop and drop a previously hosted page.
    pub async fn remove_page(&self, page_id: &PageId) {
        let page = self.pages.lock().await.remove(page_id);
        if let Some(page) = page {
            page.stop().await;
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.pages.lock().await.is_empty()
    }

    pub async fn forward_device_new(&self, device: DeviceId) {
        let pages: Vec<Arc<PageCommunicator<S>>> = self.pages.lock().await.values().cloned().collect();
        for page in pages {
            page.on_device_new(device.clone()).await;
        }
    }

    pub async fn forward_device_deleted(&self, device: DeviceId) {
        let pages: Vec<Arc<PageCommunicator<S>>> = self.pages.lock().await.values().cloned().collect();
        for page in pages {
            page.on_device_deleted(device.clone()).await;
        }
    }

    /// Route an already-demultiplexed datagram body to the page it targets.
    pub async fn handle_incoming(&self, device: DeviceId, page_id: PageId, body: MessageBody) {
        let page = self.pages.lock().await.get(&page_id).cloned();
        match page {
            Some(page) => page.handle_envelope(device, body).await,
            None if matches!(body, MessageBody::Request(Request::WatchStart)) => {
                self.reply_not_hosted(&device, &page_id).await;
            }
            None => {
                debug!(namespace = %self.namespace_id, page = %page_id, "dropping traffic for unhosted page");
            }
        }
    }

    async fn reply_not_hosted(&self, device: &DeviceId, page_id: &PageId) {
        let envelope = Envelope {
            namespace_id: self.namespace_id.clone(),
            page_id: page_id.clone(),
            body: MessageBody::Response(Response::WatchStartAck { has_page: false }),
        };
        match codec::encode(&envelope) {
            Ok(bytes) => {
                self.sink.send_to(device, bytes).await;
            }
            Err(e) => warn!(device = %device, error = %e, "failed to encode has_page=false reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::ids::{CommitId, Generation, ObjectId};
    use crate::storage::{Commit, CommitWatcher};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        sent: StdMutex<Vec<(DeviceId, Vec<u8>)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { sent: StdMutex::new(Vec::new()) }
        }
        fn decoded(&self) -> Vec<(DeviceId, MessageBody)> {
            self.sent.lock().unwrap().iter().map(|(d, b)| (d.clone(), codec::decode(b).unwrap().body)).collect()
        }
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn send_to(&self, dest: &DeviceId, bytes: Vec<u8>) -> bool {
            self.sent.lock().unwrap().push((dest.clone(), bytes));
            true
        }
    }

    #[derive(Default)]
    struct EmptyStorage;

    #[async_trait]
    impl PageStorage for EmptyStorage {
        fn id(&self) -> PageId {
            PageId::new(b"p".to_vec())
        }
        async fn get_head_commits(&self) -> Vec<Commit> {
            vec![]
        }
        async fn get_commit(&self, _id: &CommitId) -> Option<Commit> {
            None
        }
        async fn add_commits_from_sync(
            &self,
            _commits: Vec<(CommitId, Vec<u8>, Generation)>,
        ) -> Result<(), SyncError> {
            Ok(())
        }
        async fn get_piece(&self, _id: &ObjectId) -> Option<(Vec<u8>, bool)> {
            None
        }
        async fn add_object_from_sync(&self, _id: ObjectId, _bytes: Vec<u8>, _s: bool) -> Result<(), SyncError> {
            Ok(())
        }
        async fn mark_synced_to_peer(&self) -> Result<(), SyncError> {
            Ok(())
        }
        fn register_commit_watcher(&self, _watcher: Box<dyn CommitWatcher>) {}
    }

    fn did(b: &[u8]) -> DeviceId {
        DeviceId::new(b.to_vec())
    }

    #[tokio::test]
    async fn unhosted_page_gets_immediate_not_hosted_reply() {
        let sink = Arc::new(RecordingSink::new());
        let ns = NamespaceCommunicator::<EmptyStorage>::new(NamespaceId::new(b"ns".to_vec()), sink.clone());
        ns.handle_incoming(did(b"peer"), PageId::new(b"p1".to_vec()), MessageBody::Request(Request::WatchStart)).await;
        let sent = sink.decoded();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].1, MessageBody::Response(Response::WatchStartAck { has_page: false })));
    }

    #[tokio::test]
    async fn hosted_page_receives_forwarded_traffic() {
        let sink = Arc::new(RecordingSink::new());
        let ns = NamespaceCommunicator::new(NamespaceId::new(b"ns".to_vec()), sink.clone());
        let storage = Arc::new(EmptyStorage);
        let page_id = PageId::new(b"p1".to_vec());
        ns.host_page(page_id.clone(), PageCommunicatorConfig::new(), storage, Vec::new()).await;

        ns.handle_incoming(did(b"peer"), page_id, MessageBody::Request(Request::WatchStart)).await;
        let sent = sink.decoded();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].1, MessageBody::Response(Response::WatchStartAck { has_page: true })));
    }

    #[tokio::test]
    async fn forwarding_device_new_reaches_every_hosted_page() {
        let sink = Arc::new(RecordingSink::new());
        let ns = NamespaceCommunicator::new(NamespaceId::new(b"ns".to_vec()), sink.clone());
        ns.host_page(PageId::new(b"p1".to_vec()), PageCommunicatorConfig::new(), Arc::new(EmptyStorage), Vec::new())
            .await;
        ns.host_page(PageId::new(b"p2".to_vec()), PageCommunicatorConfig::new(), Arc::new(EmptyStorage), Vec::new())
            .await;
        sink.sent.lock().unwrap().clear();

        ns.forward_device_new(did(b"peer")).await;
        let sent = sink.decoded();
        assert_eq!(sent.len(), 2, "both page communicators should WatchStart the new device");
    }
}
