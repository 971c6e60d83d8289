//! Remote node interfaces used during replication.
//!
//! Transport and encoding are left to implementors. The processor wraps
//! every call in its own timeout.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use mnode_meta::{NodeId, Pid, ReplicationStatus, SystemMetadata};

use crate::error::ReplError;

/// An entry of the coordinating node's node registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identifier, e.g. `urn:node:mnA`.
    pub identifier: NodeId,
    /// Base URL of the node's service endpoint.
    pub base_url: String,
}

/// Client for the coordinating node.
#[async_trait]
pub trait CoordinatingNodeClient: Send + Sync {
    /// Authoritative system metadata for `pid`.
    async fn get_system_metadata(&self, pid: &Pid) -> Result<SystemMetadata, ReplError>;

    /// All registered nodes.
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ReplError>;

    /// Reports the replication status of `pid` on `node`.
    async fn set_replication_status(
        &self,
        pid: &Pid,
        node: &NodeId,
        status: ReplicationStatus,
        failure: Option<String>,
    ) -> Result<(), ReplError>;
}

/// Client for the member node holding the original object.
#[async_trait]
pub trait SourceNodeClient: Send + Sync {
    /// Object bytes of `pid`.
    async fn get_replica(&self, pid: &Pid) -> Result<Bytes, ReplError>;
}

/// Creates source node clients for base URLs found in the node registry.
pub trait SourceNodeConnector: Send + Sync {
    /// Client for the node at `base_url`.
    fn connect(&self, base_url: &str) -> Result<Arc<dyn SourceNodeClient>, ReplError>;
}
