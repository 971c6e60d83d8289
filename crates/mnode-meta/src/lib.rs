#![warn(missing_docs)]

//! Member node metadata core: access policies, revision chains, authorization
//! and the event log, on top of a transactional key-value store.

pub mod access;
pub mod authz;
pub mod chain;
pub mod config;
pub mod error;
pub mod event_log;
pub mod kvstore;
pub mod service;
pub mod store;
pub mod types;

pub use access::{AccessPolicy, AccessRule, Permission};
pub use authz::{AuthorizationGateway, SubjectContext};
pub use chain::{ChainPosition, RevisionChainManager};
pub use config::NodeConfig;
pub use error::{ErrorKind, MetaError};
pub use event_log::{Event, LogEntry, LogFilter, LogRecords};
pub use service::{MemberNode, ObjectRequest};
pub use store::MetaStore;
pub use types::{
    Checksum, NodeId, ObjectOrigin, ObjectRecord, Pid, ReplicationPolicy, ReplicationQueueEntry,
    ReplicationStatus, Sid, Subject, SystemMetadata, Timestamp,
};
