//! In-memory coordinating and source nodes for exercising the processor
//! without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use mnode_meta::{NodeId, Pid, ReplicationStatus, SystemMetadata};

use crate::client::{CoordinatingNodeClient, NodeRecord, SourceNodeClient, SourceNodeConnector};
use crate::error::ReplError;

/// A status notification received by [`MockCoordinatingNode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    /// Replicated object.
    pub pid: Pid,
    /// Reporting node.
    pub node: NodeId,
    /// Reported status.
    pub status: ReplicationStatus,
    /// Failure description sent with the report.
    pub failure: Option<String>,
}

#[derive(Default)]
struct CnState {
    nodes: Vec<NodeRecord>,
    sysmeta: HashMap<Pid, SystemMetadata>,
    failures: HashMap<Pid, u32>,
    delay: Option<Duration>,
    fail_status_updates: bool,
    reports: Vec<StatusReport>,
}

/// Coordinating node serving canned node lists and system metadata.
#[derive(Default)]
pub struct MockCoordinatingNode {
    state: Mutex<CnState>,
}

impl MockCoordinatingNode {
    /// Creates a coordinating node that knows nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node.
    pub fn with_node(mut self, identifier: impl Into<NodeId>, base_url: impl Into<String>) -> Self {
        self.state.get_mut().nodes.push(NodeRecord {
            identifier: identifier.into(),
            base_url: base_url.into(),
        });
        self
    }

    /// Serves `sysmeta` for its identifier.
    pub fn with_system_metadata(mut self, sysmeta: SystemMetadata) -> Self {
        self.state
            .get_mut()
            .sysmeta
            .insert(sysmeta.identifier.clone(), sysmeta);
        self
    }

    /// Fails the next `count` metadata requests for `pid`.
    pub fn with_failures(mut self, pid: impl Into<Pid>, count: u32) -> Self {
        self.state.get_mut().failures.insert(pid.into(), count);
        self
    }

    /// Delays every metadata request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.state.get_mut().delay = Some(delay);
        self
    }

    /// Rejects every status notification.
    pub fn failing_status_updates(mut self) -> Self {
        self.state.get_mut().fail_status_updates = true;
        self
    }

    /// Status notifications received so far, in arrival order.
    pub async fn reports(&self) -> Vec<StatusReport> {
        self.state.lock().await.reports.clone()
    }

    /// Notifications received for `pid`.
    pub async fn reports_for(&self, pid: &Pid) -> Vec<StatusReport> {
        self.state
            .lock()
            .await
            .reports
            .iter()
            .filter(|r| &r.pid == pid)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CoordinatingNodeClient for MockCoordinatingNode {
    async fn get_system_metadata(&self, pid: &Pid) -> Result<SystemMetadata, ReplError> {
        let delay = self.state.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(remaining) = state.failures.get_mut(pid) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(pid = %pid, remaining = *remaining, "mock CN injected failure");
                return Err(ReplError::Network {
                    operation: "getSystemMetadata",
                    msg: "service unavailable".to_string(),
                });
            }
        }
        state
            .sysmeta
            .get(pid)
            .cloned()
            .ok_or_else(|| ReplError::Network {
                operation: "getSystemMetadata",
                msg: format!("no system metadata for {}", pid),
            })
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ReplError> {
        Ok(self.state.lock().await.nodes.clone())
    }

    async fn set_replication_status(
        &self,
        pid: &Pid,
        node: &NodeId,
        status: ReplicationStatus,
        failure: Option<String>,
    ) -> Result<(), ReplError> {
        let mut state = self.state.lock().await;
        state.reports.push(StatusReport {
            pid: pid.clone(),
            node: node.clone(),
            status,
            failure,
        });
        if state.fail_status_updates {
            return Err(ReplError::Network {
                operation: "setReplicationStatus",
                msg: "status update rejected".to_string(),
            });
        }
        Ok(())
    }
}

/// Source node serving object bytes from memory.
#[derive(Default)]
pub struct MockSourceNode {
    objects: HashMap<Pid, Bytes>,
    fetches: AtomicUsize,
}

impl MockSourceNode {
    /// Creates a source node without objects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `data` for `pid`.
    pub fn with_object(mut self, pid: impl Into<Pid>, data: impl Into<Bytes>) -> Self {
        self.objects.insert(pid.into(), data.into());
        self
    }

    /// Number of `get_replica` calls served or refused.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SourceNodeClient for MockSourceNode {
    async fn get_replica(&self, pid: &Pid) -> Result<Bytes, ReplError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.objects
            .get(pid)
            .cloned()
            .ok_or_else(|| ReplError::Network {
                operation: "getReplica",
                msg: format!("{} not found on source node", pid),
            })
    }
}

/// Connector handing out registered [`MockSourceNode`]s by base URL.
#[derive(Default)]
pub struct MockConnector {
    sources: HashMap<String, Arc<MockSourceNode>>,
}

impl MockConnector {
    /// Creates a connector without sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `base_url` to `source`.
    pub fn with_source(mut self, base_url: impl Into<String>, source: Arc<MockSourceNode>) -> Self {
        self.sources.insert(base_url.into(), source);
        self
    }
}

impl SourceNodeConnector for MockConnector {
    fn connect(&self, base_url: &str) -> Result<Arc<dyn SourceNodeClient>, ReplError> {
        match self.sources.get(base_url) {
            Some(source) => Ok(source.clone() as Arc<dyn SourceNodeClient>),
            None => Err(ReplError::Network {
                operation: "connect",
                msg: format!("no route to {}", base_url),
            }),
        }
    }
}
