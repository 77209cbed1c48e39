//! Two full nodes talking over loopback TCP.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use slotchain::config::ConsensusConfig;
use slotchain::crypto::keys::SigningKeypair;
use slotchain::node::{Node, NodeConfig};

fn node_config(bootstrap_peers: Vec<std::net::SocketAddr>) -> NodeConfig {
    NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        bootstrap_peers,
        max_peers: 8,
        keypair: SigningKeypair::generate(),
        consensus: ConsensusConfig::default(),
    }
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn votes_and_blocks_propagate_between_nodes() {
    let shutdown = CancellationToken::new();

    let mut first = Node::new(node_config(vec![])).await.unwrap();
    let mut second = Node::new(node_config(vec![first.local_addr()])).await.unwrap();
    let (first_handle, first_p2p) = (first.handle(), first.p2p_handle());
    let second_handle = second.handle();

    let token = shutdown.clone();
    let first_task = tokio::spawn(async move { first.run(token).await });
    let token = shutdown.clone();
    let second_task = tokio::spawn(async move { second.run(token).await });

    let connected = eventually(|| {
        let p2p = first_p2p.clone();
        async move { p2p.get_peers().await.map(|p| !p.is_empty()).unwrap_or(false) }
    })
    .await;
    assert!(connected, "nodes never connected");

    // A vote cast on the first node is counted by the second.
    let candidate = SigningKeypair::generate().identity();
    first_handle.vote(candidate.clone()).await.unwrap();
    let counted = eventually(|| {
        let node = second_handle.clone();
        let candidate = candidate.clone();
        async move { node.poll().votes(&candidate).await == 1 }
    })
    .await;
    assert!(counted, "vote did not reach the second node");

    // The first block after genesis is accepted from anyone.
    let block = first_handle.produce(slotchain::now_nanos()).await.unwrap();
    let hash = block.hash;
    let synced = eventually(|| {
        let node = second_handle.clone();
        async move { node.block(&hash).await.is_some() }
    })
    .await;
    assert!(synced, "block did not reach the second node");
    assert_eq!(second_handle.status().await.height, 1);
    assert_eq!(
        second_handle.balance(&first_handle.identity()).await,
        block.reward
    );

    shutdown.cancel();
    first_task.await.unwrap();
    second_task.await.unwrap();
}
