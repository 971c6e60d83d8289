//! Error types for replication queue processing.

use mnode_meta::{ErrorKind, MetaError, NodeId, Pid};
use thiserror::Error;

/// Errors raised while materializing a replica.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Local metadata operation failed.
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    /// A remote node returned an error or could not be reached.
    #[error("network error during {operation}: {msg}")]
    Network {
        /// Remote call that failed.
        operation: &'static str,
        /// Error message describing the issue.
        msg: String,
    },

    /// A remote call did not finish in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Remote call that timed out.
        operation: &'static str,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The coordinating node's node list has no entry for the source node.
    #[error("source node {node} not found among {known} registered nodes")]
    SourceNodeUnknown {
        /// The requested source node.
        node: NodeId,
        /// Number of nodes the coordinating node listed.
        known: usize,
    },

    /// Creating the replica would clash with local state.
    #[error("local conflict for {pid}: {msg}")]
    LocalConflict {
        /// Object being replicated.
        pid: Pid,
        /// What clashed.
        msg: String,
    },

    /// The object byte store failed.
    #[error("object store error for {pid}: {msg}")]
    Store {
        /// Object being stored.
        pid: Pid,
        /// Error message describing the issue.
        msg: String,
    },
}

impl ReplError {
    /// Returns true if retrying cannot succeed without a change of local state.
    pub fn is_permanent(&self) -> bool {
        match self {
            ReplError::LocalConflict { .. } => true,
            ReplError::Meta(e) => matches!(
                e.kind(),
                ErrorKind::InvalidRequest | ErrorKind::IdentifierNotUnique
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let errors = [
            ReplError::Network {
                operation: "getReplica",
                msg: "connection refused".into(),
            },
            ReplError::Timeout {
                operation: "getSystemMetadata",
                timeout_ms: 30_000,
            },
            ReplError::SourceNodeUnknown {
                node: "urn:node:gone".into(),
                known: 3,
            },
            ReplError::Meta(MetaError::KvError("poisoned".into())),
        ];
        for err in errors {
            assert!(!err.is_permanent(), "{} should be retried", err);
        }
    }

    #[test]
    fn test_permanent_errors() {
        let conflict = ReplError::LocalConflict {
            pid: "p1".into(),
            msg: "native object exists".into(),
        };
        assert!(conflict.is_permanent());
        assert!(ReplError::from(MetaError::IdentifierNotUnique("p1".into())).is_permanent());
        assert!(ReplError::from(MetaError::InvalidRequest("cycle".into())).is_permanent());
    }

    #[test]
    fn test_display() {
        let err = ReplError::Timeout {
            operation: "listNodes",
            timeout_ms: 5,
        };
        assert_eq!(err.to_string(), "listNodes timed out after 5ms");
    }
}
