//! Shared fixtures for replication integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use mnode_meta::{Checksum, MetaStore, NodeId, Pid, SystemMetadata, Timestamp};
use mnode_repl::{
    MemorySciObjStore, MockConnector, MockCoordinatingNode, MockSourceNode, ProcessorConfig,
    ReplicationQueueProcessor,
};

pub const NODE_ID: &str = "urn:node:mnReplica";
pub const SOURCE_ID: &str = "urn:node:mnSource";
pub const SOURCE_URL: &str = "https://source.example.org/mn";

pub fn sysmeta(pid: &str) -> SystemMetadata {
    SystemMetadata::new(
        pid,
        "text/csv",
        4,
        Checksum::new("MD5", "d41d8cd98f00b204e9800998ecf8427e"),
        "CN=alice",
    )
}

pub fn processor_config(max_attempts: u32) -> ProcessorConfig {
    ProcessorConfig {
        node_identifier: NodeId::from(NODE_ID),
        max_attempts,
        call_timeout_ms: 1_000,
    }
}

pub struct Fixture {
    pub store: Arc<MetaStore>,
    pub cn: Arc<MockCoordinatingNode>,
    pub source: Arc<MockSourceNode>,
    pub objects: Arc<MemorySciObjStore>,
    pub processor: ReplicationQueueProcessor,
}

impl Fixture {
    /// Queues `pid` from the source node with the given queue timestamp.
    pub fn enqueue(&self, pid: &str, secs: u64) {
        self.store
            .enqueue_replication(&Pid::from(pid), &NodeId::from(SOURCE_ID), Timestamp::from_secs(secs))
            .unwrap();
    }
}

/// Builds a processor over a fresh store. The source node serves bytes for
/// every PID in `pids`. `cn` is given the source node registration.
pub fn fixture_with(
    config: ProcessorConfig,
    cn: MockCoordinatingNode,
    pids: &[&str],
) -> Fixture {
    let store = Arc::new(MetaStore::in_memory());
    let cn = Arc::new(cn.with_node(SOURCE_ID, SOURCE_URL));
    let source = pids
        .iter()
        .fold(MockSourceNode::new(), |node, pid| {
            node.with_object(*pid, format!("data:{}", pid).into_bytes())
        });
    let source = Arc::new(source);
    let connector = Arc::new(MockConnector::new().with_source(SOURCE_URL, source.clone()));
    let objects = Arc::new(MemorySciObjStore::new());
    let processor = ReplicationQueueProcessor::new(
        config,
        store.clone(),
        cn.clone(),
        connector,
        objects.clone(),
    );
    Fixture {
        store,
        cn,
        source,
        objects,
        processor,
    }
}

/// Fixture whose coordinating node knows the system metadata of `pids`.
pub fn fixture(max_attempts: u32, pids: &[&str]) -> Fixture {
    let cn = pids
        .iter()
        .fold(MockCoordinatingNode::new(), |cn, pid| cn.with_system_metadata(sysmeta(pid)));
    fixture_with(processor_config(max_attempts), cn, pids)
}
