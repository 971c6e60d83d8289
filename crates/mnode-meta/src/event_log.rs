//! Event log of object accesses and changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetaError;
use crate::store::Txn;
use crate::types::{NodeId, Pid, Subject, Timestamp};

/// Kind of a logged event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    /// Object created, natively or as a replica.
    Create,
    /// Object bytes read.
    Read,
    /// Object superseded by a new revision or its metadata changed.
    Update,
    /// Object deleted.
    Delete,
    /// Object bytes served to another node for replication.
    Replicate,
    /// Coordinating node failed to synchronize the object.
    SynchronizationFailed,
    /// Replication of the object failed.
    ReplicationFailed,
}

impl Event {
    /// Wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Create => "create",
            Event::Read => "read",
            Event::Update => "update",
            Event::Delete => "delete",
            Event::Replicate => "replicate",
            Event::SynchronizationFailed => "synchronization_failed",
            Event::ReplicationFailed => "replication_failed",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Event::Create),
            "read" => Ok(Event::Read),
            "update" => Ok(Event::Update),
            "delete" => Ok(Event::Delete),
            "replicate" => Ok(Event::Replicate),
            "synchronization_failed" => Ok(Event::SynchronizationFailed),
            "replication_failed" => Ok(Event::ReplicationFailed),
            other => Err(MetaError::InvalidRequest(format!("unknown event: {}", other))),
        }
    }
}

/// One record of the event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number assigned on append.
    pub entry_id: u64,
    /// Object the event concerns.
    pub pid: Pid,
    /// What happened.
    pub event: Event,
    /// Client address.
    pub ip_address: String,
    /// Client user agent.
    pub user_agent: String,
    /// Primary subject of the caller.
    pub subject: Subject,
    /// When the event happened.
    pub timestamp: Timestamp,
    /// Node that recorded the event.
    pub node_identifier: NodeId,
}

/// Who caused an event and from where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventOrigin {
    /// Primary subject of the caller.
    pub subject: Subject,
    /// Client address.
    pub ip_address: String,
    /// Client user agent.
    pub user_agent: String,
}

impl EventOrigin {
    /// Origin recorded for objects created by the replication processor.
    pub fn replica() -> Self {
        Self {
            subject: Subject::from("[replica]"),
            ip_address: "0.0.0.0".to_string(),
            user_agent: "[replica]".to_string(),
        }
    }
}

/// Appends an event for `pid` to the log.
pub fn record_event(
    txn: &mut Txn<'_>,
    node: &NodeId,
    pid: &Pid,
    event: Event,
    origin: &EventOrigin,
) -> Result<LogEntry, MetaError> {
    txn.append_log(LogEntry {
        entry_id: 0,
        pid: pid.clone(),
        event,
        ip_address: origin.ip_address.clone(),
        user_agent: origin.user_agent.clone(),
        subject: origin.subject.clone(),
        timestamp: Timestamp::now(),
        node_identifier: node.clone(),
    })
}

/// Selection criteria for log queries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Inclusive lower bound on the event time.
    pub from_date: Option<Timestamp>,
    /// Exclusive upper bound on the event time.
    pub to_date: Option<Timestamp>,
    /// Only events of this kind.
    pub event: Option<Event>,
    /// Only PIDs starting with this prefix.
    pub id_prefix: Option<String>,
    /// Index of the first returned record.
    pub start: usize,
    /// Maximum number of returned records. Capped by the node's limit.
    pub count: Option<usize>,
}

impl LogFilter {
    /// Returns true if `entry` satisfies the date, event and PID criteria.
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(from) = self.from_date {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to_date {
            if entry.timestamp >= to {
                return false;
            }
        }
        if let Some(event) = self.event {
            if entry.event != event {
                return false;
            }
        }
        match &self.id_prefix {
            Some(prefix) => entry.pid.as_str().starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// A page of log records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecords {
    /// Index of the first record in the page.
    pub start: usize,
    /// Number of records in the page.
    pub count: usize,
    /// Number of records matching the query before paging.
    pub total: usize,
    /// The records, newest first.
    pub entries: Vec<LogEntry>,
}

impl LogRecords {
    /// Builds a page out of the full ordered match list.
    pub fn paginate(entries: Vec<LogEntry>, start: usize, count: usize) -> Self {
        let total = entries.len();
        let page: Vec<LogEntry> = entries.into_iter().skip(start).take(count).collect();
        Self {
            start,
            count: page.len(),
            total,
            entries: page,
        }
    }
}

/// Entries matching `filter`, newest first with ties broken by PID. Paging is
/// left to the caller.
pub fn select(txn: &Txn<'_>, filter: &LogFilter) -> Result<Vec<LogEntry>, MetaError> {
    let mut entries: Vec<LogEntry> = txn
        .log_entries()?
        .into_iter()
        .filter(|e| filter.matches(e))
        .collect();
    entries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.pid.cmp(&b.pid))
            .then_with(|| a.entry_id.cmp(&b.entry_id))
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetaStore;

    fn entry(pid: &str, event: Event, secs: u64) -> LogEntry {
        LogEntry {
            entry_id: 0,
            pid: Pid::from(pid),
            event,
            ip_address: "10.0.0.1".into(),
            user_agent: "test".into(),
            subject: Subject::from("CN=a"),
            timestamp: Timestamp::from_secs(secs),
            node_identifier: NodeId::from("urn:node:mn"),
        }
    }

    #[test]
    fn test_event_names_round_trip() {
        for event in [
            Event::Create,
            Event::Read,
            Event::Update,
            Event::Delete,
            Event::Replicate,
            Event::SynchronizationFailed,
            Event::ReplicationFailed,
        ] {
            assert_eq!(event.as_str().parse::<Event>().unwrap(), event);
        }
        assert!("archive".parse::<Event>().is_err());
    }

    #[test]
    fn test_filter_date_bounds() {
        let filter = LogFilter {
            from_date: Some(Timestamp::from_secs(10)),
            to_date: Some(Timestamp::from_secs(20)),
            ..Default::default()
        };
        assert!(filter.matches(&entry("p", Event::Read, 10)));
        assert!(filter.matches(&entry("p", Event::Read, 19)));
        assert!(!filter.matches(&entry("p", Event::Read, 20)));
        assert!(!filter.matches(&entry("p", Event::Read, 9)));
    }

    #[test]
    fn test_filter_event_and_prefix() {
        let filter = LogFilter {
            event: Some(Event::Create),
            id_prefix: Some("doi:".into()),
            ..Default::default()
        };
        assert!(filter.matches(&entry("doi:1", Event::Create, 1)));
        assert!(!filter.matches(&entry("doi:1", Event::Read, 1)));
        assert!(!filter.matches(&entry("ark:1", Event::Create, 1)));
    }

    #[test]
    fn test_select_orders_newest_first_then_pid() {
        let store = MetaStore::in_memory();
        store
            .transaction(|txn| {
                txn.append_log(entry("b", Event::Read, 5))?;
                txn.append_log(entry("a", Event::Read, 5))?;
                txn.append_log(entry("c", Event::Read, 9))?;
                Ok(())
            })
            .unwrap();
        let selected = store
            .read(|txn| select(txn, &LogFilter::default()))
            .unwrap();
        let pids: Vec<&str> = selected.iter().map(|e| e.pid.as_str()).collect();
        assert_eq!(pids, vec!["c", "a", "b"]);
        assert!(selected.iter().all(|e| e.entry_id > 0));
    }

    #[test]
    fn test_paginate() {
        let entries = vec![
            entry("a", Event::Read, 3),
            entry("b", Event::Read, 2),
            entry("c", Event::Read, 1),
        ];
        let page = LogRecords::paginate(entries.clone(), 1, 5);
        assert_eq!(page.total, 3);
        assert_eq!(page.count, 2);
        assert_eq!(page.entries[0].pid.as_str(), "b");
        let empty = LogRecords::paginate(entries, 7, 5);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.total, 3);
    }
}
