//! The member node facade: every externally visible metadata operation,
//! each run as one all-or-nothing transaction.

use std::sync::Arc;

use tracing::{debug, info};

use crate::access::{AccessPolicy, Permission};
use crate::authz::{AuthorizationGateway, SubjectContext};
use crate::chain::RevisionChainManager;
use crate::config::NodeConfig;
use crate::error::MetaError;
use crate::event_log::{self, Event, LogFilter, LogRecords};
use crate::store::{MetaStore, Txn};
use crate::types::{
    NodeId, ObjectRecord, Pid, ReplicationPolicy, ReplicationQueueEntry, Subject, SystemMetadata,
    Timestamp,
};

/// A mutating request against a single object.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectRequest {
    /// Create a new object.
    Create {
        /// Metadata of the new object.
        sysmeta: SystemMetadata,
    },
    /// Create a new revision obsoleting `old_pid`.
    Update {
        /// Object being superseded.
        old_pid: Pid,
        /// Metadata of the new revision.
        sysmeta: SystemMetadata,
    },
    /// Archive an object, given its PID or SID.
    Archive {
        /// PID or SID.
        did: String,
    },
    /// Replace an object's access policy.
    UpdateAccessPolicy {
        /// Target object.
        pid: Pid,
        /// New policy.
        policy: AccessPolicy,
    },
    /// Replace an object's replication policy.
    UpdateReplicationPolicy {
        /// Target object.
        pid: Pid,
        /// New policy.
        policy: ReplicationPolicy,
    },
    /// Replace an object's system metadata.
    UpdateSystemMetadata {
        /// Target object.
        pid: Pid,
        /// New metadata.
        sysmeta: SystemMetadata,
    },
}

/// Member node metadata service.
pub struct MemberNode {
    config: Arc<NodeConfig>,
    store: Arc<MetaStore>,
    chains: RevisionChainManager,
    gateway: AuthorizationGateway,
}

impl MemberNode {
    /// Creates a node over `store`.
    pub fn new(config: NodeConfig, store: Arc<MetaStore>) -> Self {
        let config = Arc::new(config);
        Self {
            chains: RevisionChainManager::new(store.clone()),
            gateway: AuthorizationGateway::new(config.clone()),
            config,
            store,
        }
    }

    /// Creates a node over an empty in-memory store.
    pub fn in_memory(config: NodeConfig) -> Self {
        Self::new(config, Arc::new(MetaStore::in_memory()))
    }

    /// Node settings.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    /// Revision chain manager sharing this node's store.
    pub fn chains(&self) -> &RevisionChainManager {
        &self.chains
    }

    /// Authorization gateway configured for this node.
    pub fn gateway(&self) -> &AuthorizationGateway {
        &self.gateway
    }

    fn node_id(&self) -> &NodeId {
        &self.config.node_identifier
    }

    /// Dispatches a mutating request and returns the affected PID.
    pub fn execute(&self, request: ObjectRequest, ctx: &SubjectContext) -> Result<Pid, MetaError> {
        match request {
            ObjectRequest::Create { sysmeta } => self.create_object(sysmeta, ctx),
            ObjectRequest::Update { old_pid, sysmeta } => {
                self.update_object(&old_pid, sysmeta, ctx)
            }
            ObjectRequest::Archive { did } => self.archive_object(&did, ctx),
            ObjectRequest::UpdateAccessPolicy { pid, policy } => {
                self.update_access_policy(&pid, policy, ctx).map(|_| pid)
            }
            ObjectRequest::UpdateReplicationPolicy { pid, policy } => {
                self.update_replication_policy(&pid, policy, ctx).map(|_| pid)
            }
            ObjectRequest::UpdateSystemMetadata { pid, sysmeta } => {
                self.update_system_metadata(&pid, sysmeta, ctx).map(|_| pid)
            }
        }
    }

    /// Creates a new object. The caller must be trusted or whitelisted.
    pub fn create_object(
        &self,
        sysmeta: SystemMetadata,
        ctx: &SubjectContext,
    ) -> Result<Pid, MetaError> {
        let pid = sysmeta.identifier.clone();
        self.store.transaction(|txn| {
            self.gateway.assert_create_update_delete_permission(txn, ctx)?;
            if sysmeta.obsoletes.is_some() {
                return Err(MetaError::InvalidRequest(
                    "obsoletes cannot be set when creating an object. use update instead"
                        .to_string(),
                ));
            }
            assert_identifier_unused(txn, &pid)?;
            let sysmeta = self.apply_node_values(sysmeta, ctx)?;
            self.chains
                .create_or_update_in(txn, ObjectRecord::native(sysmeta))?;
            event_log::record_event(txn, self.node_id(), &pid, Event::Create, &ctx.event_origin())?;
            Ok(())
        })?;
        info!(pid = %pid, subject = %ctx.primary(), "created object");
        Ok(pid)
    }

    /// Creates a new revision that obsoletes `old_pid`.
    ///
    /// The caller needs `write` on the old object and, unless disabled, must
    /// be whitelisted. The old object must be a native, unarchived head.
    pub fn update_object(
        &self,
        old_pid: &Pid,
        sysmeta: SystemMetadata,
        ctx: &SubjectContext,
    ) -> Result<Pid, MetaError> {
        let new_pid = sysmeta.identifier.clone();
        self.store.transaction(|txn| {
            self.gateway.assert_update_permission(txn, ctx)?;
            let old = self
                .gateway
                .assert_allowed(txn, ctx, Permission::Write, old_pid)?;
            assert_valid_for_update(&old)?;
            if let Some(successor) = &old.sysmeta.obsoleted_by {
                return Err(MetaError::InvalidRequest(format!(
                    "{} has already been obsoleted by {}",
                    old_pid, successor
                )));
            }
            if let Some(declared) = &sysmeta.obsoletes {
                if declared != old_pid {
                    return Err(MetaError::InvalidRequest(format!(
                        "new revision declares obsoletes {} but updates {}",
                        declared, old_pid
                    )));
                }
            }
            if sysmeta.obsoleted_by.is_some() {
                return Err(MetaError::InvalidRequest(
                    "a new revision cannot already be obsoleted".to_string(),
                ));
            }
            assert_identifier_unused(txn, &new_pid)?;

            let mut sysmeta = self.apply_node_values(sysmeta, ctx)?;
            sysmeta.obsoletes = Some(old_pid.clone());
            self.chains
                .create_or_update_in(txn, ObjectRecord::native(sysmeta))?;

            let mut old = txn.require_object(old_pid)?;
            old.sysmeta.touch();
            txn.put_object(&old)?;

            let origin = ctx.event_origin();
            event_log::record_event(txn, self.node_id(), old_pid, Event::Update, &origin)?;
            event_log::record_event(txn, self.node_id(), &new_pid, Event::Create, &origin)?;
            Ok(())
        })?;
        info!(old = %old_pid, new = %new_pid, subject = %ctx.primary(), "updated object");
        Ok(new_pid)
    }

    /// Archives the object named by a PID or SID. Requires `write`.
    pub fn archive_object(&self, did: &str, ctx: &SubjectContext) -> Result<Pid, MetaError> {
        let pid = self.store.transaction(|txn| {
            let pid = self.chains.resolve_in(txn, did)?;
            let mut record = self
                .gateway
                .assert_allowed(txn, ctx, Permission::Write, &pid)?;
            assert_valid_for_update(&record)?;
            record.sysmeta.archived = true;
            record.sysmeta.touch();
            txn.put_object(&record)?;
            event_log::record_event(txn, self.node_id(), &pid, Event::Update, &ctx.event_origin())?;
            Ok(pid)
        })?;
        info!(pid = %pid, subject = %ctx.primary(), "archived object");
        Ok(pid)
    }

    /// Replaces the access policy of `pid`. Requires `changePermission`.
    pub fn update_access_policy(
        &self,
        pid: &Pid,
        policy: AccessPolicy,
        ctx: &SubjectContext,
    ) -> Result<(), MetaError> {
        self.store.transaction(|txn| {
            let mut record =
                self.gateway
                    .assert_allowed(txn, ctx, Permission::ChangePermission, pid)?;
            record.sysmeta.access_policy = Some(policy.normalize());
            record.sysmeta.touch();
            txn.put_object(&record)?;
            event_log::record_event(txn, self.node_id(), pid, Event::Update, &ctx.event_origin())?;
            Ok(())
        })?;
        debug!(pid = %pid, "access policy updated");
        Ok(())
    }

    /// Replaces the replication policy of `pid`. Requires `changePermission`.
    pub fn update_replication_policy(
        &self,
        pid: &Pid,
        policy: ReplicationPolicy,
        ctx: &SubjectContext,
    ) -> Result<(), MetaError> {
        self.store.transaction(|txn| {
            let mut record =
                self.gateway
                    .assert_allowed(txn, ctx, Permission::ChangePermission, pid)?;
            record.sysmeta.replication_policy = Some(policy.normalize());
            record.sysmeta.touch();
            txn.put_object(&record)?;
            event_log::record_event(txn, self.node_id(), pid, Event::Update, &ctx.event_origin())?;
            Ok(())
        })?;
        debug!(pid = %pid, "replication policy updated");
        Ok(())
    }

    /// Replaces the system metadata of `pid`. Requires `write`.
    ///
    /// The submitted serial version must equal the stored one. Node-controlled
    /// fields keep their stored values.
    pub fn update_system_metadata(
        &self,
        pid: &Pid,
        mut sysmeta: SystemMetadata,
        ctx: &SubjectContext,
    ) -> Result<(), MetaError> {
        self.store.transaction(|txn| {
            let stored = self.gateway.assert_allowed(txn, ctx, Permission::Write, pid)?;
            assert_valid_for_update(&stored)?;
            if &sysmeta.identifier != pid {
                return Err(MetaError::InvalidRequest(format!(
                    "system metadata identifier {} does not match {}",
                    sysmeta.identifier, pid
                )));
            }
            if sysmeta.serial_version != stored.sysmeta.serial_version {
                return Err(MetaError::InvalidRequest(format!(
                    "serial version mismatch for {}: submitted {:?}, stored {:?}",
                    pid, sysmeta.serial_version, stored.sysmeta.serial_version
                )));
            }
            let current = stored.sysmeta;
            sysmeta.date_uploaded = current.date_uploaded;
            sysmeta.origin_member_node = current.origin_member_node;
            sysmeta.authoritative_member_node = current.authoritative_member_node;
            sysmeta.submitter = current.submitter;
            sysmeta.archived = current.archived;
            sysmeta.access_policy = sysmeta.access_policy.map(|p| p.normalize());
            sysmeta.replication_policy = sysmeta.replication_policy.map(|p| p.normalize());
            sysmeta.touch();
            self.chains.create_or_update_in(
                txn,
                ObjectRecord {
                    sysmeta,
                    origin: stored.origin,
                },
            )?;
            event_log::record_event(txn, self.node_id(), pid, Event::Update, &ctx.event_origin())?;
            Ok(())
        })?;
        info!(pid = %pid, subject = %ctx.primary(), "updated system metadata");
        Ok(())
    }

    /// System metadata of the object named by a PID or SID. Requires `read`.
    pub fn get_system_metadata(
        &self,
        did: &str,
        ctx: &SubjectContext,
    ) -> Result<SystemMetadata, MetaError> {
        self.store.read(|txn| {
            let pid = self.chains.resolve_in(txn, did)?;
            Ok(self
                .gateway
                .assert_allowed(txn, ctx, Permission::Read, &pid)?
                .sysmeta)
        })
    }

    /// Resolves a PID or SID to a PID.
    pub fn resolve(&self, did: &str) -> Result<Pid, MetaError> {
        self.chains.resolve(did)
    }

    /// Returns whether the caller may perform `action` on the object named by `did`.
    pub fn is_authorized(
        &self,
        did: &str,
        action: &str,
        ctx: &SubjectContext,
    ) -> Result<bool, MetaError> {
        let level = Permission::from_action(action)?;
        self.store.read(|txn| {
            let pid = self.chains.resolve_in(txn, did)?;
            self.gateway.is_allowed(txn, ctx, level, &pid)
        })
    }

    /// Event log page matching `filter`, filtered and redacted for the caller.
    pub fn get_log_records(
        &self,
        filter: &LogFilter,
        ctx: &SubjectContext,
    ) -> Result<LogRecords, MetaError> {
        let trusted = self.gateway.is_trusted_subject(ctx);
        if !trusted && !self.config.public_log_records {
            self.gateway.assert_trusted(ctx)?;
        }
        let count = filter
            .count
            .unwrap_or(self.config.max_log_records)
            .min(self.config.max_log_records);

        let visible = self.store.read(|txn| {
            let matching = event_log::select(txn, filter)?;
            if trusted {
                return Ok(matching);
            }
            let mut visible = Vec::with_capacity(matching.len());
            for entry in matching {
                let record = txn.object(&entry.pid)?;
                let sysmeta = record.as_ref().map(|r| &r.sysmeta);
                if let Some(entry) = self.gateway.redact_log_entry(ctx, entry, sysmeta) {
                    visible.push(entry);
                }
            }
            Ok(visible)
        })?;
        Ok(LogRecords::paginate(visible, filter.start, count))
    }

    /// Queues a replica of the object described by `sysmeta` to be fetched
    /// from `source_node`. Trusted callers only.
    pub fn replicate(
        &self,
        sysmeta: &SystemMetadata,
        source_node: &NodeId,
        ctx: &SubjectContext,
    ) -> Result<(), MetaError> {
        let pid = &sysmeta.identifier;
        self.store.transaction(|txn| {
            self.gateway.assert_trusted(ctx)?;
            match &sysmeta.replication_policy {
                Some(policy) if policy.allows_node(self.node_id()) => {}
                Some(_) => {
                    return Err(MetaError::InvalidRequest(format!(
                        "replication policy of {} does not allow a replica on {}",
                        pid,
                        self.node_id()
                    )))
                }
                None => {
                    return Err(MetaError::InvalidRequest(format!(
                        "{} has no replication policy",
                        pid
                    )))
                }
            }
            assert_identifier_unused(txn, pid)?;
            txn.put_replication_entry(&ReplicationQueueEntry::new(
                pid.clone(),
                source_node.clone(),
                Timestamp::now(),
            ))
        })?;
        info!(pid = %pid, source = %source_node, "queued replica");
        Ok(())
    }

    /// Adds `subject` to the create/update/delete whitelist.
    pub fn add_to_whitelist(&self, subject: &Subject) -> Result<(), MetaError> {
        self.store.add_to_whitelist(subject)
    }

    /// Removes `subject` from the create/update/delete whitelist.
    pub fn remove_from_whitelist(&self, subject: &Subject) -> Result<(), MetaError> {
        self.store.remove_from_whitelist(subject)
    }

    fn apply_node_values(
        &self,
        mut sysmeta: SystemMetadata,
        ctx: &SubjectContext,
    ) -> Result<SystemMetadata, MetaError> {
        if sysmeta.identifier.as_str().trim().is_empty() {
            return Err(MetaError::InvalidRequest(
                "identifier must not be empty".to_string(),
            ));
        }
        if !sysmeta.checksum.has_supported_algorithm() {
            return Err(MetaError::InvalidRequest(format!(
                "unsupported checksum algorithm: {}",
                sysmeta.checksum.algorithm
            )));
        }
        let now = Timestamp::now();
        sysmeta.serial_version = Some(1);
        sysmeta.date_uploaded = Some(now);
        sysmeta.date_sys_metadata_modified = Some(now);
        sysmeta.origin_member_node = Some(self.node_id().clone());
        sysmeta.authoritative_member_node = Some(self.node_id().clone());
        sysmeta.submitter = Some(ctx.primary().clone());
        sysmeta.access_policy = sysmeta.access_policy.map(|p| p.normalize());
        sysmeta.replication_policy = sysmeta.replication_policy.map(|p| p.normalize());
        Ok(sysmeta)
    }
}

/// Fails with `IdentifierNotUnique` if `pid` names an object, a series or a
/// queued replica.
fn assert_identifier_unused(txn: &Txn<'_>, pid: &Pid) -> Result<(), MetaError> {
    if txn.object(pid)?.is_some()
        || txn.chain_id_for_sid(&pid.as_sid())?.is_some()
        || txn.replication_entry(pid)?.is_some()
    {
        return Err(MetaError::IdentifierNotUnique(format!(
            "identifier {} is already in use",
            pid
        )));
    }
    Ok(())
}

fn assert_valid_for_update(record: &ObjectRecord) -> Result<(), MetaError> {
    if record.is_replica() {
        return Err(MetaError::InvalidRequest(format!(
            "{} is a replica and cannot be modified on this node",
            record.pid()
        )));
    }
    if record.sysmeta.archived {
        return Err(MetaError::InvalidRequest(format!(
            "{} is archived",
            record.pid()
        )));
    }
    Ok(())
}
