//! Replication queue processing.
//!
//! Each pass walks the queued entries oldest first. An entry that fails is
//! retried on later passes until it has failed `max_attempts` times, at which
//! point it is marked failed and the coordinating node is told once.
//!
//! Local conflicts are not retried. A replica whose PID already names a
//! native object, or whose links point at native objects, counts one failed
//! attempt, is marked failed in the same pass and triggers a single "failed"
//! report to the coordinating node regardless of `max_attempts`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use mnode_meta::event_log::{record_event, EventOrigin};
use mnode_meta::store::Txn;
use mnode_meta::{
    ErrorKind, Event, MetaError, MetaStore, NodeConfig, NodeId, ObjectRecord, Pid,
    ReplicationQueueEntry, ReplicationStatus, RevisionChainManager, SystemMetadata,
};

use crate::client::{CoordinatingNodeClient, SourceNodeConnector};
use crate::error::ReplError;
use crate::sciobj::SciObjStore;

/// Processor settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Identity of this node, used for defaults and status reports.
    pub node_identifier: NodeId,
    /// Failed attempts after which an entry is given up.
    pub max_attempts: u32,
    /// Timeout for each remote call.
    pub call_timeout_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            node_identifier: NodeId::from("urn:node:mnDefault"),
            max_attempts: 24,
            call_timeout_ms: 30_000,
        }
    }
}

impl ProcessorConfig {
    /// Derives processor settings from the node configuration.
    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self {
            node_identifier: config.node_identifier.clone(),
            max_attempts: config.replication_max_attempts,
            call_timeout_ms: config.network_timeout_secs.saturating_mul(1000),
        }
    }
}

/// What happened to one entry during a pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryOutcome {
    /// Object the entry refers to.
    pub pid: Pid,
    /// Status after the attempt.
    pub status: ReplicationStatus,
    /// Failed attempts after the attempt.
    pub failed_attempts: u32,
    /// Error of a failed attempt.
    pub error: Option<String>,
}

/// Summary of one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Entries attempted.
    pub processed: usize,
    /// Entries that completed.
    pub completed: usize,
    /// Entries left queued for another attempt.
    pub retried: usize,
    /// Entries given up on this pass.
    pub failed: usize,
    /// Completed entries removed by the cleanup sweep.
    pub removed: usize,
    /// Per-entry results in processing order.
    pub outcomes: Vec<EntryOutcome>,
}

/// Materializes queued replicas.
pub struct ReplicationQueueProcessor {
    config: ProcessorConfig,
    store: Arc<MetaStore>,
    chains: RevisionChainManager,
    cn: Arc<dyn CoordinatingNodeClient>,
    connector: Arc<dyn SourceNodeConnector>,
    objects: Arc<dyn SciObjStore>,
}

impl ReplicationQueueProcessor {
    /// Creates a processor working on `store`.
    pub fn new(
        config: ProcessorConfig,
        store: Arc<MetaStore>,
        cn: Arc<dyn CoordinatingNodeClient>,
        connector: Arc<dyn SourceNodeConnector>,
        objects: Arc<dyn SciObjStore>,
    ) -> Self {
        Self {
            config,
            chains: RevisionChainManager::new(store.clone()),
            store,
            cn,
            connector,
            objects,
        }
    }

    /// Processor settings.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Runs one pass over the queue and then removes completed entries.
    ///
    /// Failures of individual entries are recorded on the entries and in the
    /// report. Only failures of the local store to list or sweep the queue
    /// are returned.
    pub async fn process_replication_queue_once(&self) -> Result<PassReport, ReplError> {
        let queued = self.store.list_queued_replications()?;
        debug!(entries = queued.len(), "starting replication pass");

        let mut report = PassReport::default();
        for entry in queued {
            let outcome = self.process_entry(entry).await;
            report.processed += 1;
            match outcome.status {
                ReplicationStatus::Completed => report.completed += 1,
                ReplicationStatus::Queued => report.retried += 1,
                ReplicationStatus::Failed => report.failed += 1,
            }
            report.outcomes.push(outcome);
        }

        report.removed = self.store.delete_completed_replication_entries()?;
        info!(
            processed = report.processed,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            removed = report.removed,
            "replication pass finished"
        );
        Ok(report)
    }

    async fn process_entry(&self, mut entry: ReplicationQueueEntry) -> EntryOutcome {
        let err = match self.replicate(&entry).await {
            Ok(()) => {
                info!(pid = %entry.pid, source = %entry.source_node, "replica created");
                self.notify(&entry.pid, ReplicationStatus::Completed, None).await;
                return EntryOutcome {
                    pid: entry.pid,
                    status: ReplicationStatus::Completed,
                    failed_attempts: entry.failed_attempts,
                    error: None,
                };
            }
            Err(err) => err,
        };

        entry.failed_attempts = entry.failed_attempts.saturating_add(1);
        let give_up = err.is_permanent() || entry.failed_attempts >= self.config.max_attempts;
        if give_up {
            entry.status = ReplicationStatus::Failed;
            error!(
                pid = %entry.pid,
                attempts = entry.failed_attempts,
                error = %err,
                "replication failed permanently"
            );
        } else {
            warn!(
                pid = %entry.pid,
                attempts = entry.failed_attempts,
                max_attempts = self.config.max_attempts,
                error = %err,
                "replication attempt failed, will retry"
            );
        }

        if let Err(e) = self.store.update_replication_entry(&entry) {
            error!(pid = %entry.pid, error = %e, "failed to record replication attempt");
        }
        if give_up {
            self.notify(&entry.pid, ReplicationStatus::Failed, Some(err.to_string()))
                .await;
        }

        EntryOutcome {
            pid: entry.pid,
            status: entry.status,
            failed_attempts: entry.failed_attempts,
            error: Some(err.to_string()),
        }
    }

    async fn replicate(&self, entry: &ReplicationQueueEntry) -> Result<(), ReplError> {
        let pid = &entry.pid;
        let mut sysmeta = self
            .call("getSystemMetadata", self.cn.get_system_metadata(pid))
            .await?;
        if &sysmeta.identifier != pid {
            return Err(ReplError::Network {
                operation: "getSystemMetadata",
                msg: format!("asked for {} but got {}", pid, sysmeta.identifier),
            });
        }
        self.fill_defaults(&mut sysmeta);

        let nodes = self.call("listNodes", self.cn.list_nodes()).await?;
        let base_url = nodes
            .iter()
            .find(|n| n.identifier == entry.source_node)
            .map(|n| n.base_url.clone())
            .ok_or_else(|| ReplError::SourceNodeUnknown {
                node: entry.source_node.clone(),
                known: nodes.len(),
            })?;
        debug!(pid = %pid, source = %entry.source_node, url = %base_url, "resolved source node");

        self.store
            .read(|txn| self.validate(txn, &sysmeta))
            .map_err(|e| conflict(pid, e))?;

        let source = self.connector.connect(&base_url)?;
        let data = self.call("getReplica", source.get_replica(pid)).await?;
        debug!(pid = %pid, bytes = data.len(), "fetched replica bytes");
        self.objects.put(pid, data).await?;

        self.store
            .transaction(|txn| {
                self.validate(txn, &sysmeta)?;
                self.chains
                    .create_or_update_in(txn, ObjectRecord::replica(sysmeta.clone()))?;
                record_event(
                    txn,
                    &self.config.node_identifier,
                    pid,
                    Event::Create,
                    &EventOrigin::replica(),
                )?;
                let mut done = entry.clone();
                done.status = ReplicationStatus::Completed;
                txn.put_replication_entry(&done)
            })
            .map_err(|e| conflict(pid, e))
    }

    fn fill_defaults(&self, sysmeta: &mut SystemMetadata) {
        let node = &self.config.node_identifier;
        sysmeta
            .origin_member_node
            .get_or_insert_with(|| node.clone());
        sysmeta
            .authoritative_member_node
            .get_or_insert_with(|| node.clone());
        sysmeta.serial_version.get_or_insert(1);
    }

    /// The replica must still be waiting in the queue, and the objects it
    /// links to must be unknown here or replicas themselves.
    fn validate(&self, txn: &Txn<'_>, sysmeta: &SystemMetadata) -> Result<(), MetaError> {
        self.chains
            .assert_is_pid_of_local_unprocessed_replica(txn, &sysmeta.identifier)?;
        for linked in sysmeta.obsoletes.iter().chain(sysmeta.obsoleted_by.iter()) {
            self.chains.assert_pid_is_unknown_or_replica(txn, linked)?;
        }
        Ok(())
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ReplError>
    where
        F: Future<Output = Result<T, ReplError>>,
    {
        let timeout_ms = self.config.call_timeout_ms;
        tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
            .await
            .map_err(|_| ReplError::Timeout {
                operation,
                timeout_ms,
            })?
    }

    async fn notify(&self, pid: &Pid, status: ReplicationStatus, failure: Option<String>) {
        let sent = self
            .call(
                "setReplicationStatus",
                self.cn
                    .set_replication_status(pid, &self.config.node_identifier, status, failure),
            )
            .await;
        if let Err(e) = sent {
            warn!(pid = %pid, status = %status, error = %e, "could not report replication status");
        }
    }
}

fn conflict(pid: &Pid, err: MetaError) -> ReplError {
    match err.kind() {
        ErrorKind::InvalidRequest | ErrorKind::IdentifierNotUnique => ReplError::LocalConflict {
            pid: pid.clone(),
            msg: err.description(),
        },
        _ => ReplError::Meta(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_node_config() {
        let node = NodeConfig {
            node_identifier: "urn:node:mnA".into(),
            replication_max_attempts: 5,
            network_timeout_secs: 2,
            ..NodeConfig::default()
        };
        let config = ProcessorConfig::from_node_config(&node);
        assert_eq!(config.node_identifier, NodeId::from("urn:node:mnA"));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.call_timeout_ms, 2000);
    }

    #[test]
    fn test_conflict_mapping() {
        let pid = Pid::from("p1");
        assert!(matches!(
            conflict(&pid, MetaError::IdentifierNotUnique("p1".into())),
            ReplError::LocalConflict { .. }
        ));
        assert!(matches!(
            conflict(&pid, MetaError::KvError("poisoned".into())),
            ReplError::Meta(_)
        ));
    }
}
