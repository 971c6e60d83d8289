#![warn(missing_docs)]

//! Replica materialization for the member node: queue processing against
//! the coordinating node and source member nodes.

pub mod client;
pub mod error;
pub mod mock;
pub mod processor;
pub mod sciobj;

pub use client::{CoordinatingNodeClient, NodeRecord, SourceNodeClient, SourceNodeConnector};
pub use error::ReplError;
pub use mock::{MockConnector, MockCoordinatingNode, MockSourceNode, StatusReport};
pub use processor::{EntryOutcome, PassReport, ProcessorConfig, ReplicationQueueProcessor};
pub use sciobj::{MemorySciObjStore, SciObjStore};
