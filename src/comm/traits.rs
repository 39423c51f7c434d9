//! Communication abstraction for consensus messages and client replies

use async_trait::async_trait;

use crate::core::log_entry::{ClientRef, NodeId};
use crate::core::message::RpcMessage;
use crate::core::raft_server::ClientReply;

/// Transport capability bound to a replica at construction.
///
/// Both operations are fire-and-forget: the transport may drop, reorder, or
/// duplicate. Consensus safety never depends on delivery.
#[async_trait]
pub trait Comm: Send + Sync + 'static {
    /// Deliver a consensus message to the mailbox of `dest`
    async fn send_event(&self, dest: NodeId, msg: RpcMessage);

    /// Deliver an asynchronous reply to the client identified by `client`
    async fn reply(&self, client: ClientRef, reply: ClientReply);
}
