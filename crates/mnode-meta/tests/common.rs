//! Shared fixtures for member node integration tests.

#![allow(dead_code)]

use mnode_meta::{
    AccessPolicy, Checksum, MemberNode, NodeConfig, Permission, Subject, SubjectContext,
    SystemMetadata,
};

pub const NODE_ID: &str = "urn:node:mnTest";
pub const CN_SUBJECT: &str = "CN=cn.test.org";
pub const SUBMITTER: &str = "CN=alice";
pub const READER: &str = "CN=reader";
pub const WRITER: &str = "CN=writer";

pub fn config() -> NodeConfig {
    let mut config = NodeConfig {
        node_identifier: NODE_ID.into(),
        ..NodeConfig::default()
    };
    config.cn_subjects.insert(Subject::from(CN_SUBJECT));
    config
}

/// In-memory node with [`SUBMITTER`] on the whitelist.
pub fn node_with(config: NodeConfig) -> MemberNode {
    let node = MemberNode::in_memory(config);
    node.add_to_whitelist(&Subject::from(SUBMITTER)).unwrap();
    node
}

pub fn node() -> MemberNode {
    node_with(config())
}

pub fn ctx(subject: &str) -> SubjectContext {
    SubjectContext::new(subject).with_client("192.0.2.10", "test-agent")
}

pub fn cn() -> SubjectContext {
    ctx(CN_SUBJECT)
}

/// Metadata owned by [`SUBMITTER`] granting read to [`READER`] and write to [`WRITER`].
pub fn sysmeta(pid: &str) -> SystemMetadata {
    SystemMetadata::new(
        pid,
        "text/csv",
        42,
        Checksum::new("SHA-256", "deadbeef"),
        SUBMITTER,
    )
    .with_access_policy(
        AccessPolicy::new()
            .with_rule([READER], Permission::Read)
            .with_rule([WRITER], Permission::Write),
    )
}
