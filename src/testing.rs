//! Testing utilities for consensus cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process replica groups over the
//! built-in channel network.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::comm::ClusterNetwork;
use crate::core::config::RaftConfig;
use crate::core::log_entry::NodeId;
use crate::core::raft_server::{
    create_new_consensus_group, join_existing_consensus_group, RaftHandle, RaftState, Status,
};
use crate::data_ops::kv::KeyValueStore;
use crate::data_ops::DataOps;
use crate::hook::{LeaderHook, NoopHook};

/// Factory producing the data plug-in for one node
pub type DataFactory = Box<dyn Fn(NodeId) -> Box<dyn DataOps>>;
/// Factory producing the leader hook for one node
pub type HookFactory = Box<dyn Fn(NodeId) -> Box<dyn LeaderHook>>;

/// A single test node in the cluster
pub struct TestNode {
    pub id: NodeId,
    pub handle: RaftHandle,
}

/// A test cluster of replicas wired over an in-process network
pub struct TestCluster {
    pub network: Arc<ClusterNetwork>,
    pub nodes: Vec<TestNode>,
    config: RaftConfig,
}

impl TestCluster {
    /// Create and start a 3-node cluster of key-value stores
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// Create and start a cluster with the given number of nodes
    pub async fn with_nodes(count: usize) -> Self {
        Self::with_factories(
            count,
            Self::test_config(),
            Box::new(|_| Box::new(KeyValueStore::new())),
            Box::new(|_| Box::new(NoopHook)),
        )
        .await
    }

    /// Fast timeouts so elections settle quickly in tests
    pub fn test_config() -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_timeout(Duration::from_millis(50))
            .with_election_timeout(Duration::from_millis(200))
    }

    /// Create and start a cluster with custom config and per-node plug-ins.
    /// Node 1 boots the group; the rest join through it in turn.
    pub async fn with_factories(
        count: usize,
        config: RaftConfig,
        data_factory: DataFactory,
        hook_factory: HookFactory,
    ) -> Self {
        assert!(count >= 1);
        let network = ClusterNetwork::new();

        let first_rx = network.register_node(1);
        let first = create_new_consensus_group(
            1,
            config.clone(),
            data_factory(1),
            hook_factory(1),
            Box::new(network.comm_for(1)),
            first_rx,
            network.router(),
        )
        .expect("config is valid");

        let mut nodes = vec![TestNode { id: 1, handle: first }];

        for id in 2..=count as NodeId {
            // The previous membership change must commit before another add
            wait_for_fully_committed(&nodes[0].handle).await;

            let rpc_rx = network.register_node(id);
            let peers: Vec<RaftHandle> = nodes.iter().map(|n| n.handle.clone()).collect();
            let handle = join_existing_consensus_group(
                id,
                data_factory(id),
                hook_factory(id),
                Box::new(network.comm_for(id)),
                rpc_rx,
                network.router(),
                &peers,
            )
            .await
            .expect("join succeeds");
            nodes.push(TestNode { id, handle });
        }

        let cluster = TestCluster {
            network,
            nodes,
            config,
        };
        // Settle: every node should agree on the full membership
        let expected: BTreeSet<NodeId> = (1..=count as NodeId).collect();
        cluster.wait_for_members(&expected).await;
        cluster
    }

    pub fn handle(&self, id: NodeId) -> &RaftHandle {
        &self
            .nodes
            .iter()
            .find(|n| n.id == id)
            .expect("unknown node id")
            .handle
    }

    pub async fn status_of(&self, id: NodeId) -> Option<Status> {
        self.handle(id).status().await.ok()
    }

    /// Wait until some replica reports itself leader; returns its id
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            for node in &self.nodes {
                if let Ok(status) = node.handle.status().await {
                    if status.state_name == RaftState::Leader {
                        return Some(node.id);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Wait (generously) for a leader and return its handle
    pub async fn leader_handle(&self) -> RaftHandle {
        let id = self
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("cluster should elect a leader");
        self.handle(id).clone()
    }

    async fn wait_for_members(&self, expected: &BTreeSet<NodeId>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        'outer: while tokio::time::Instant::now() < deadline {
            for node in &self.nodes {
                match node.handle.status().await {
                    Ok(status) if &status.members == expected => {}
                    _ => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        continue 'outer;
                    }
                }
            }
            return;
        }
        panic!("cluster never agreed on membership {:?}", expected);
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Stop one node's run loop (simulates a crash together with the
    /// network dropping messages to its closed mailbox)
    pub async fn shutdown_node(&self, id: NodeId) {
        self.handle(id).shutdown().await;
    }

    /// Shut down every node
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.handle.shutdown().await;
        }
    }
}

/// Wait until the handle's replica reports every log entry committed.
/// In particular no membership change can still be in flight.
pub async fn wait_for_fully_committed(handle: &RaftHandle) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Ok(status) = handle.status().await {
            if status.commit_index == status.log_length {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("replica never caught up its commit index");
}

/// Poll `condition` until it returns true or the timeout elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
