//! In-process cluster network
//!
//! The built-in communication module: per-node mailboxes backed by channels,
//! a shared router for asynchronous client replies, and directed link
//! cutting for fault-injection in tests. Messages to cut links, full
//! mailboxes, or stopped nodes are silently dropped, matching the
//! fire-and-forget transport contract.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::core::log_entry::{ClientRef, NodeId};
use crate::core::message::RpcMessage;
use crate::core::raft_server::ClientReply;

use super::traits::Comm;

const MAILBOX_CAPACITY: usize = 256;

/// Routes asynchronous client replies back to waiting callers.
///
/// A client facade registers a oneshot before submitting; whichever replica
/// is leader when the entry commits answers through `Comm::reply`, and the
/// router completes the oneshot. Shared across the cluster so replies
/// survive leader changes.
#[derive(Default)]
pub struct ReplyRouter {
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ClientReply>>>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a client handle and the receiver its reply will arrive on
    pub fn register(&self, node: NodeId) -> (ClientRef, oneshot::Receiver<ClientReply>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(seq, tx);
        (ClientRef { node, seq }, rx)
    }

    /// Complete the oneshot registered for `client`, if still waiting
    pub fn route(&self, client: ClientRef, reply: ClientReply) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&client.seq) {
            let _ = tx.send(reply);
        }
    }
}

/// Shared state of an in-process cluster: one mailbox per node, the reply
/// router, and the set of cut links.
pub struct ClusterNetwork {
    mailboxes: Mutex<HashMap<NodeId, mpsc::Sender<RpcMessage>>>,
    cut_links: Mutex<HashSet<(NodeId, NodeId)>>,
    router: Arc<ReplyRouter>,
}

impl ClusterNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(ClusterNetwork {
            mailboxes: Mutex::new(HashMap::new()),
            cut_links: Mutex::new(HashSet::new()),
            router: Arc::new(ReplyRouter::new()),
        })
    }

    /// Create the mailbox for a node, returning its receive side
    pub fn register_node(&self, node: NodeId) -> mpsc::Receiver<RpcMessage> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.mailboxes.lock().unwrap().insert(node, tx);
        rx
    }

    /// Communication endpoint for one node
    pub fn comm_for(self: &Arc<Self>, node: NodeId) -> InMemoryComm {
        InMemoryComm {
            node,
            network: self.clone(),
        }
    }

    pub fn router(&self) -> Arc<ReplyRouter> {
        self.router.clone()
    }

    /// Drop all traffic from `from` to `to`
    pub fn cut_link(&self, from: NodeId, to: NodeId) {
        self.cut_links.lock().unwrap().insert((from, to));
    }

    /// Restore traffic from `from` to `to`
    pub fn heal_link(&self, from: NodeId, to: NodeId) {
        self.cut_links.lock().unwrap().remove(&(from, to));
    }

    /// Cut every link to and from `node`
    pub fn isolate(&self, node: NodeId) {
        let others: Vec<NodeId> = {
            let mailboxes = self.mailboxes.lock().unwrap();
            mailboxes.keys().copied().filter(|&n| n != node).collect()
        };
        let mut cut = self.cut_links.lock().unwrap();
        for other in others {
            cut.insert((node, other));
            cut.insert((other, node));
        }
    }

    /// Restore every link to and from `node`
    pub fn heal(&self, node: NodeId) {
        self.cut_links
            .lock()
            .unwrap()
            .retain(|(from, to)| *from != node && *to != node);
    }

    fn deliver(&self, from: NodeId, dest: NodeId, msg: RpcMessage) {
        if self.cut_links.lock().unwrap().contains(&(from, dest)) {
            trace!(from, dest, "dropping message on cut link");
            return;
        }
        let sender = match self.mailboxes.lock().unwrap().get(&dest) {
            Some(sender) => sender.clone(),
            None => return,
        };
        // Fire-and-forget: a full or closed mailbox drops the message
        let _ = sender.try_send(msg);
    }
}

/// The per-node `Comm` implementation over a [`ClusterNetwork`]
pub struct InMemoryComm {
    node: NodeId,
    network: Arc<ClusterNetwork>,
}

#[async_trait]
impl Comm for InMemoryComm {
    async fn send_event(&self, dest: NodeId, msg: RpcMessage) {
        self.network.deliver(self.node, dest, msg);
    }

    async fn reply(&self, client: ClientRef, reply: ClientReply) {
        self.network.router.route(client, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::RpcMessage;

    #[tokio::test]
    async fn test_messages_reach_registered_mailbox() {
        let network = ClusterNetwork::new();
        let mut rx = network.register_node(2);
        let comm = network.comm_for(1);

        comm.send_event(2, RpcMessage::RemoveFollowerCompleted).await;
        assert!(matches!(
            rx.recv().await,
            Some(RpcMessage::RemoveFollowerCompleted)
        ));
    }

    #[tokio::test]
    async fn test_cut_link_drops_messages_one_way() {
        let network = ClusterNetwork::new();
        let mut rx1 = network.register_node(1);
        let mut rx2 = network.register_node(2);
        let comm1 = network.comm_for(1);
        let comm2 = network.comm_for(2);

        network.cut_link(1, 2);
        comm1.send_event(2, RpcMessage::RemoveFollowerCompleted).await;
        comm2.send_event(1, RpcMessage::RemoveFollowerCompleted).await;

        assert!(rx1.recv().await.is_some(), "reverse direction still flows");
        assert!(rx2.try_recv().is_err(), "cut direction is dropped");

        network.heal_link(1, 2);
        comm1.send_event(2, RpcMessage::RemoveFollowerCompleted).await;
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_send_to_unknown_node_is_dropped() {
        let network = ClusterNetwork::new();
        let comm = network.comm_for(1);
        // No mailbox for node 9; must not panic or block
        comm.send_event(9, RpcMessage::RemoveFollowerCompleted).await;
    }

    #[tokio::test]
    async fn test_reply_routing() {
        let network = ClusterNetwork::new();
        let comm = network.comm_for(1);
        let router = network.router();

        let (client, rx) = router.register(1);
        comm.reply(client, Ok("hello".to_string())).await;
        assert_eq!(rx.await.unwrap(), Ok("hello".to_string()));
    }

    #[tokio::test]
    async fn test_isolate_and_heal() {
        let network = ClusterNetwork::new();
        let _rx1 = network.register_node(1);
        let mut rx2 = network.register_node(2);
        let mut rx3 = network.register_node(3);
        let comm1 = network.comm_for(1);

        network.isolate(1);
        comm1.send_event(2, RpcMessage::RemoveFollowerCompleted).await;
        comm1.send_event(3, RpcMessage::RemoveFollowerCompleted).await;
        assert!(rx2.try_recv().is_err());
        assert!(rx3.try_recv().is_err());

        network.heal(1);
        comm1.send_event(2, RpcMessage::RemoveFollowerCompleted).await;
        assert!(rx2.recv().await.is_some());
    }
}
