//! Authorization of member node operations.
//!
//! Three layers decide what a caller may do:
//! - trusted subjects (coordinating nodes, configured administrators, the
//!   node's own certificate) bypass every check,
//! - the create/update/delete whitelist governs who may add objects at all,
//! - each object's access policy, plus the implicit `changePermission` of its
//!   rights holder, governs access to that object.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::access::{Permission, PUBLIC_SUBJECT};
use crate::config::NodeConfig;
use crate::error::MetaError;
use crate::event_log::{EventOrigin, LogEntry};
use crate::store::Txn;
use crate::types::{ObjectRecord, Pid, Subject, SystemMetadata};

/// Replaces redacted log fields.
pub const REDACTED: &str = "<NotAuthorized>";

/// The subjects a request is made with, plus client details for the event log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectContext {
    primary: Subject,
    subjects: BTreeSet<Subject>,
    ip_address: String,
    user_agent: String,
}

impl SubjectContext {
    /// Context whose primary subject is `primary`. The `public` symbolic
    /// subject is always active.
    pub fn new(primary: impl Into<Subject>) -> Self {
        let primary = primary.into();
        let mut subjects = BTreeSet::new();
        subjects.insert(primary.clone());
        subjects.insert(Subject::from(PUBLIC_SUBJECT));
        Self {
            primary,
            subjects,
            ip_address: String::new(),
            user_agent: String::new(),
        }
    }

    /// Context of an unauthenticated caller.
    pub fn public() -> Self {
        Self::new(PUBLIC_SUBJECT)
    }

    /// Adds an equivalent identity or group membership.
    pub fn with_subject(mut self, subject: impl Into<Subject>) -> Self {
        self.subjects.insert(subject.into());
        self
    }

    /// Records the client address and user agent.
    pub fn with_client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = ip_address.into();
        self.user_agent = user_agent.into();
        self
    }

    /// The primary subject.
    pub fn primary(&self) -> &Subject {
        &self.primary
    }

    /// All active subjects, primary included.
    pub fn subjects(&self) -> &BTreeSet<Subject> {
        &self.subjects
    }

    /// Event log attribution for requests made in this context.
    pub fn event_origin(&self) -> EventOrigin {
        EventOrigin {
            subject: self.primary.clone(),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
        }
    }

    /// Lists the active subjects for error messages, primary first.
    pub fn format_active_subjects(&self) -> String {
        std::iter::once(format!("{} (primary)", self.primary))
            .chain(
                self.subjects
                    .iter()
                    .filter(|s| **s != self.primary)
                    .map(|s| s.to_string()),
            )
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Decides whether a caller may perform an operation.
#[derive(Clone)]
pub struct AuthorizationGateway {
    config: Arc<NodeConfig>,
    trusted: BTreeSet<Subject>,
}

impl AuthorizationGateway {
    /// Creates a gateway using the trusted subjects in `config`.
    pub fn new(config: Arc<NodeConfig>) -> Self {
        let trusted = config.all_trusted_subjects();
        Self { config, trusted }
    }

    /// Subjects that bypass all checks.
    pub fn trusted_subjects(&self) -> &BTreeSet<Subject> {
        &self.trusted
    }

    /// Returns true if any active subject is trusted.
    pub fn is_trusted_subject(&self, ctx: &SubjectContext) -> bool {
        ctx.subjects().iter().any(|s| self.trusted.contains(s))
    }

    /// Fails with `NotAuthorized` unless a trusted subject is active.
    pub fn assert_trusted(&self, ctx: &SubjectContext) -> Result<(), MetaError> {
        if self.is_trusted_subject(ctx) {
            return Ok(());
        }
        Err(MetaError::NotAuthorized(format!(
            "access allowed only for trusted subjects. active subjects: {}",
            ctx.format_active_subjects()
        )))
    }

    /// Returns true if the caller is trusted or whitelisted.
    pub fn has_create_update_delete_permission(
        &self,
        txn: &Txn<'_>,
        ctx: &SubjectContext,
    ) -> Result<bool, MetaError> {
        if self.is_trusted_subject(ctx) {
            return Ok(true);
        }
        for subject in ctx.subjects() {
            if txn.is_whitelisted(subject)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fails with `NotAuthorized` unless the caller may create objects.
    pub fn assert_create_update_delete_permission(
        &self,
        txn: &Txn<'_>,
        ctx: &SubjectContext,
    ) -> Result<(), MetaError> {
        if self.has_create_update_delete_permission(txn, ctx)? {
            return Ok(());
        }
        Err(MetaError::NotAuthorized(format!(
            "access allowed only for subjects with create/update/delete permission. active subjects: {}",
            ctx.format_active_subjects()
        )))
    }

    /// Whitelist check for updates, skipped when updates do not require it.
    pub fn assert_update_permission(
        &self,
        txn: &Txn<'_>,
        ctx: &SubjectContext,
    ) -> Result<(), MetaError> {
        if self.config.require_whitelist_for_update {
            self.assert_create_update_delete_permission(txn, ctx)
        } else {
            Ok(())
        }
    }

    /// Highest permission the caller holds on the object described by `sysmeta`.
    pub fn highest_permission(
        &self,
        ctx: &SubjectContext,
        sysmeta: &SystemMetadata,
    ) -> Option<Permission> {
        if self.is_trusted_subject(ctx) || ctx.subjects().contains(&sysmeta.rights_holder) {
            return Some(Permission::ChangePermission);
        }
        let policy = sysmeta.access_policy.as_ref()?;
        ctx.subjects()
            .iter()
            .filter_map(|s| policy.highest_permission(s))
            .max()
    }

    /// Returns true if the caller holds `level` on the object described by `sysmeta`.
    pub fn permits(
        &self,
        ctx: &SubjectContext,
        level: Permission,
        sysmeta: &SystemMetadata,
    ) -> bool {
        self.highest_permission(ctx, sysmeta)
            .map_or(false, |highest| highest >= level)
    }

    /// Returns true if the caller holds `level` on `pid`. Unknown objects are
    /// allowed only for trusted callers.
    pub fn is_allowed(
        &self,
        txn: &Txn<'_>,
        ctx: &SubjectContext,
        level: Permission,
        pid: &Pid,
    ) -> Result<bool, MetaError> {
        if self.is_trusted_subject(ctx) {
            return Ok(true);
        }
        Ok(match txn.object(pid)? {
            Some(record) => self.permits(ctx, level, &record.sysmeta),
            None => false,
        })
    }

    /// Loads `pid` and checks that the caller holds `level` on it.
    ///
    /// Fails with `NotFound` if the object does not exist, then with
    /// `NotAuthorized` if the permission is missing.
    pub fn assert_allowed(
        &self,
        txn: &Txn<'_>,
        ctx: &SubjectContext,
        level: Permission,
        pid: &Pid,
    ) -> Result<ObjectRecord, MetaError> {
        let record = txn.require_object(pid)?;
        if !self.permits(ctx, level, &record.sysmeta) {
            debug!(pid = %pid, level = %level, "access denied");
            return Err(MetaError::NotAuthorized(format!(
                "{} access to {} denied. active subjects: {}",
                level,
                pid,
                ctx.format_active_subjects()
            )));
        }
        Ok(record)
    }

    /// Filters and redacts one log entry for the caller.
    ///
    /// Returns `None` if the caller cannot read the object. A caller holding
    /// only `read` gets the entry with the client address and subject
    /// replaced by [`REDACTED`]. Anyone with more gets it unmodified.
    pub fn redact_log_entry(
        &self,
        ctx: &SubjectContext,
        entry: LogEntry,
        sysmeta: Option<&SystemMetadata>,
    ) -> Option<LogEntry> {
        if self.is_trusted_subject(ctx) {
            return Some(entry);
        }
        match sysmeta.and_then(|sm| self.highest_permission(ctx, sm))? {
            Permission::Read => Some(LogEntry {
                ip_address: REDACTED.to_string(),
                subject: Subject::from(REDACTED),
                ..entry
            }),
            Permission::Write | Permission::ChangePermission => Some(entry),
        }
    }
}
