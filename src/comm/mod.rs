//! Communication seam between replicas and to clients

pub mod inmemory;
pub mod traits;

pub use inmemory::{ClusterNetwork, InMemoryComm, ReplyRouter};
pub use traits::Comm;
