//! Cross-module commit batch test: a multi-generation chain assembled over
//! two real `PageCommunicator`s talking through the fake mesh, exercising
//! the full fast-catch-up -> multi-round parent-request -> admission path
//! (see `src/page/commit_batch.rs`'s own inline tests for single-hop
//! coverage of the assembler in isolation).

mod support;

use ledger_sync::config::PageCommunicatorConfig;
use ledger_sync::ids::{CommitId, NamespaceId, PageId};
use ledger_sync::storage::Commit;
use ledger_sync::testing::FakeMesh;

use support::{settle, spawn_host, MemoryStorage};

fn cid(b: &[u8]) -> CommitId {
    CommitId::new(b.to_vec())
}

#[tokio::test]
async fn chain_of_three_commits_resolves_across_two_round_trips() {
    let mesh = FakeMesh::new();
    let h1 = spawn_host(&mesh, b"h1", b"u").await;
    let h2 = spawn_host(&mesh, b"h2", b"u").await;
    settle(&[&h1, &h2]).await;

    let page_id = PageId::new(b"p".to_vec());
    let storage1 = MemoryStorage::new(page_id.clone());
    let c1 = Commit { id: cid(b"c1"), bytes: vec![1], generation: 1, parents: vec![] };
    let c2 = Commit { id: cid(b"c2"), bytes: vec![2], generation: 2, parents: vec![cid(b"c1")] };
    let c3 = Commit { id: cid(b"c3"), bytes: vec![3], generation: 3, parents: vec![cid(b"c2")] };
    storage1.insert_commit(c1.clone());
    storage1.insert_commit(c2.clone());
    storage1.seed_head(c3.clone());
    let ns1 = h1.user.get_namespace_communicator(NamespaceId::new(b"ns".to_vec())).await;
    let visible1 = h1.user.established_devices().await;
    let _page1 = ns1.host_page(page_id.clone(), PageCommunicatorConfig::new(), storage1.clone(), visible1).await;

    let storage2 = MemoryStorage::new(page_id.clone());
    let ns2 = h2.user.get_namespace_communicator(NamespaceId::new(b"ns".to_vec())).await;
    let visible2 = h2.user.established_devices().await;
    let page2 = ns2.host_page(page_id.clone(), PageCommunicatorConfig::new(), storage2.clone(), visible2).await;

    settle(&[&h1, &h2]).await;

    let admitted: std::collections::HashSet<_> =
        storage2.admitted.lock().unwrap().iter().map(|(id, _, _)| id.clone()).collect();
    assert!(admitted.contains(&cid(b"c1")));
    assert!(admitted.contains(&cid(b"c2")));
    assert!(admitted.contains(&cid(b"c3")));
    assert_eq!(page2.interested_devices().await, vec![h1.device.clone()].into_iter().collect());
}
