use serde::{Deserialize, Serialize};
use std::fmt;

use crate::access::AccessPolicy;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps the given string.
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id!(
    /// Persistent identifier of exactly one immutable object.
    Pid
);
string_id!(
    /// Series identifier naming a whole revision chain.
    Sid
);
string_id!(
    /// Identifier of a member or coordinating node, e.g. `urn:node:mnA`.
    NodeId
);
string_id!(
    /// Principal string (usually an X.509 distinguished name) or a symbolic subject.
    Subject
);

impl Pid {
    /// Interprets this identifier as a series identifier.
    pub fn as_sid(&self) -> Sid {
        Sid(self.0.clone())
    }
}

impl Sid {
    /// Interprets this identifier as a persistent identifier.
    pub fn as_pid(&self) -> Pid {
        Pid(self.0.clone())
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// Timestamp at a whole number of seconds since the epoch.
    pub fn from_secs(secs: u64) -> Self {
        Self { secs, nanos: 0 }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Checksum algorithms a member node accepts.
pub const SUPPORTED_CHECKSUM_ALGORITHMS: &[&str] =
    &["MD5", "SHA-1", "SHA-224", "SHA-256", "SHA-384", "SHA-512"];

/// Object checksum as declared in system metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// Algorithm name, e.g. `SHA-256`.
    pub algorithm: String,
    /// Hex digest.
    pub value: String,
}

impl Checksum {
    /// Creates a checksum record.
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            value: value.into(),
        }
    }

    /// Returns true if the algorithm is one of [`SUPPORTED_CHECKSUM_ALGORITHMS`],
    /// ignoring case.
    pub fn has_supported_algorithm(&self) -> bool {
        SUPPORTED_CHECKSUM_ALGORITHMS
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&self.algorithm))
    }
}

/// Where copies of an object may be replicated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    /// Whether replication is allowed at all.
    pub replication_allowed: bool,
    /// Requested number of replicas.
    pub number_replicas: Option<u32>,
    /// Nodes preferred as replica targets.
    pub preferred: Vec<NodeId>,
    /// Nodes that must never hold a replica.
    pub blocked: Vec<NodeId>,
}

impl ReplicationPolicy {
    /// Canonical form: node lists sorted and deduplicated, and blocked nodes
    /// removed from the preferred list.
    pub fn normalize(&self) -> ReplicationPolicy {
        let mut blocked = self.blocked.clone();
        blocked.sort();
        blocked.dedup();
        let mut preferred: Vec<NodeId> = self
            .preferred
            .iter()
            .filter(|n| !blocked.contains(n))
            .cloned()
            .collect();
        preferred.sort();
        preferred.dedup();
        ReplicationPolicy {
            replication_allowed: self.replication_allowed,
            number_replicas: self.number_replicas,
            preferred,
            blocked,
        }
    }

    /// Returns true if a replica may be placed on `node`.
    pub fn allows_node(&self, node: &NodeId) -> bool {
        self.replication_allowed && !self.blocked.contains(node)
    }
}

/// Descriptive record attached to every object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMetadata {
    /// Persistent identifier of the object.
    pub identifier: Pid,
    /// Series the object belongs to, if any.
    pub series_id: Option<Sid>,
    /// Format identifier, e.g. `text/csv`.
    pub format_id: String,
    /// Object size in bytes.
    pub size: u64,
    /// Declared checksum of the object bytes.
    pub checksum: Checksum,
    /// Subject that submitted the object.
    pub submitter: Option<Subject>,
    /// Subject holding full rights on the object.
    pub rights_holder: Subject,
    /// Access rules, absent meaning no grants beyond the rights holder.
    pub access_policy: Option<AccessPolicy>,
    /// Replication rules.
    pub replication_policy: Option<ReplicationPolicy>,
    /// The PID this object supersedes.
    pub obsoletes: Option<Pid>,
    /// The PID that supersedes this object.
    pub obsoleted_by: Option<Pid>,
    /// Archived objects stay readable but cannot be updated.
    pub archived: bool,
    /// When the object was first stored on its origin node.
    pub date_uploaded: Option<Timestamp>,
    /// Last modification of this record.
    pub date_sys_metadata_modified: Option<Timestamp>,
    /// Node the object was originally created on.
    pub origin_member_node: Option<NodeId>,
    /// Node with authority over the record.
    pub authoritative_member_node: Option<NodeId>,
    /// Incremented on every change of the record.
    pub serial_version: Option<u64>,
}

impl SystemMetadata {
    /// Creates a record carrying only the caller-supplied core fields.
    pub fn new(
        identifier: impl Into<Pid>,
        format_id: impl Into<String>,
        size: u64,
        checksum: Checksum,
        rights_holder: impl Into<Subject>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            series_id: None,
            format_id: format_id.into(),
            size,
            checksum,
            submitter: None,
            rights_holder: rights_holder.into(),
            access_policy: None,
            replication_policy: None,
            obsoletes: None,
            obsoleted_by: None,
            archived: false,
            date_uploaded: None,
            date_sys_metadata_modified: None,
            origin_member_node: None,
            authoritative_member_node: None,
            serial_version: None,
        }
    }

    /// Sets the series identifier.
    pub fn with_sid(mut self, sid: impl Into<Sid>) -> Self {
        self.series_id = Some(sid.into());
        self
    }

    /// Sets the PID this object supersedes.
    pub fn with_obsoletes(mut self, pid: impl Into<Pid>) -> Self {
        self.obsoletes = Some(pid.into());
        self
    }

    /// Sets the PID superseding this object.
    pub fn with_obsoleted_by(mut self, pid: impl Into<Pid>) -> Self {
        self.obsoleted_by = Some(pid.into());
        self
    }

    /// Sets the access policy.
    pub fn with_access_policy(mut self, policy: AccessPolicy) -> Self {
        self.access_policy = Some(policy);
        self
    }

    /// Sets the replication policy.
    pub fn with_replication_policy(mut self, policy: ReplicationPolicy) -> Self {
        self.replication_policy = Some(policy);
        self
    }

    /// Increments the serial version and stamps the modification date.
    pub fn touch(&mut self) {
        self.serial_version = Some(self.serial_version.unwrap_or(1) + 1);
        self.date_sys_metadata_modified = Some(Timestamp::now());
    }
}

/// How an object came to exist on this node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectOrigin {
    /// Created or updated through this node's own API.
    Native,
    /// Copied here from another member node.
    Replica,
}

/// An object known to this node together with its origin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// The object's system metadata.
    pub sysmeta: SystemMetadata,
    /// Native or replica.
    pub origin: ObjectOrigin,
}

impl ObjectRecord {
    /// Wraps metadata of a natively created object.
    pub fn native(sysmeta: SystemMetadata) -> Self {
        Self {
            sysmeta,
            origin: ObjectOrigin::Native,
        }
    }

    /// Wraps metadata of a replica.
    pub fn replica(sysmeta: SystemMetadata) -> Self {
        Self {
            sysmeta,
            origin: ObjectOrigin::Replica,
        }
    }

    /// The object's PID.
    pub fn pid(&self) -> &Pid {
        &self.sysmeta.identifier
    }

    /// Returns true if the object is a local replica.
    pub fn is_replica(&self) -> bool {
        self.origin == ObjectOrigin::Replica
    }
}

/// State of a replication queue entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationStatus {
    /// Waiting to be processed.
    Queued,
    /// Replica stored locally.
    Completed,
    /// Given up on, either permanently or after the retry limit.
    Failed,
}

impl ReplicationStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicationStatus::Queued => "queued",
            ReplicationStatus::Completed => "completed",
            ReplicationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending or finished replication request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationQueueEntry {
    /// Object to replicate.
    pub pid: Pid,
    /// Node holding the object.
    pub source_node: NodeId,
    /// Time the request was queued.
    pub timestamp: Timestamp,
    /// Current state.
    pub status: ReplicationStatus,
    /// Number of failed attempts so far.
    pub failed_attempts: u32,
}

impl ReplicationQueueEntry {
    /// Creates a fresh queued entry.
    pub fn new(pid: Pid, source_node: NodeId, timestamp: Timestamp) -> Self {
        Self {
            pid,
            source_node,
            timestamp,
            status: ReplicationStatus::Queued,
            failed_attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp { secs: 5, nanos: 10 };
        let b = Timestamp { secs: 5, nanos: 20 };
        let c = Timestamp::from_secs(6);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_checksum_algorithm_case_insensitive() {
        assert!(Checksum::new("sha-256", "ab").has_supported_algorithm());
        assert!(Checksum::new("MD5", "ab").has_supported_algorithm());
        assert!(!Checksum::new("CRC32", "ab").has_supported_algorithm());
    }

    #[test]
    fn test_replication_policy_normalize_drops_blocked_from_preferred() {
        let policy = ReplicationPolicy {
            replication_allowed: true,
            number_replicas: Some(2),
            preferred: vec!["urn:node:b".into(), "urn:node:a".into(), "urn:node:b".into()],
            blocked: vec!["urn:node:b".into()],
        };
        let normalized = policy.normalize();
        assert_eq!(normalized.preferred, vec![NodeId::from("urn:node:a")]);
        assert_eq!(normalized.blocked, vec![NodeId::from("urn:node:b")]);
        assert!(normalized.allows_node(&"urn:node:a".into()));
        assert!(!normalized.allows_node(&"urn:node:b".into()));
    }

    #[test]
    fn test_replication_disallowed_blocks_every_node() {
        let policy = ReplicationPolicy::default();
        assert!(!policy.allows_node(&"urn:node:a".into()));
    }

    #[test]
    fn test_touch_bumps_serial_version() {
        let mut sm = SystemMetadata::new("p1", "text/plain", 3, Checksum::new("MD5", "x"), "CN=a");
        sm.touch();
        assert_eq!(sm.serial_version, Some(2));
        sm.touch();
        assert_eq!(sm.serial_version, Some(3));
        assert!(sm.date_sys_metadata_modified.is_some());
    }

    #[test]
    fn test_pid_sid_conversion() {
        let pid = Pid::new("doi:10.1/x");
        assert_eq!(pid.as_sid().as_str(), "doi:10.1/x");
        assert_eq!(pid.as_sid().as_pid(), pid);
    }
}
