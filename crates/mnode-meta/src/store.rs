//! Transactional metadata store on top of a [`KvStore`].
//!
//! Key layout:
//! - `obj/{pid}` → [`ObjectRecord`]
//! - `pid2chain/{pid}` → chain id
//! - `chain/{id_be}` → [`ChainRecord`]
//! - `sid/{sid}` → chain id
//! - `ref/{target}\0{pid}` → PID of an object linking to `target`
//! - `replq/{pid}` → [`ReplicationQueueEntry`]
//! - `log/{seq_be}` → [`LogEntry`]
//! - `wl/{subject}` → whitelist marker
//! - `ctr/chain`, `ctr/log` → id counters
//!
//! All mutations go through [`MetaStore::transaction`]. Writes are staged in
//! the transaction and committed with a single [`KvStore::write_batch`], so a
//! failed operation leaves nothing behind. Transactions and reads are
//! serialized by a store-wide lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MetaError;
use crate::event_log::LogEntry;
use crate::kvstore::{BatchOp, KvStore, MemoryKvStore};
use crate::types::{
    NodeId, ObjectRecord, Pid, ReplicationQueueEntry, ReplicationStatus, Sid, Subject, Timestamp,
};

const OBJECT_PREFIX: &[u8] = b"obj/";
const PID_CHAIN_PREFIX: &[u8] = b"pid2chain/";
const CHAIN_PREFIX: &[u8] = b"chain/";
const SID_PREFIX: &[u8] = b"sid/";
const REF_PREFIX: &[u8] = b"ref/";
const REPL_QUEUE_PREFIX: &[u8] = b"replq/";
const LOG_PREFIX: &[u8] = b"log/";
const WHITELIST_PREFIX: &[u8] = b"wl/";
const CHAIN_COUNTER_KEY: &[u8] = b"ctr/chain";
const LOG_COUNTER_KEY: &[u8] = b"ctr/log";

/// Numeric identifier of a revision chain.
pub type ChainId = u64;

fn prefixed(prefix: &[u8], id: &str) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn reference_prefix(target: &Pid) -> Vec<u8> {
    let mut key = prefixed(REF_PREFIX, target.as_str());
    key.push(0);
    key
}

fn numbered(prefix: &[u8], n: u64) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&n.to_be_bytes());
    key
}

/// A revision chain: its members in tail-to-head order, its head and its
/// optional series identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    /// Chain identifier.
    pub id: ChainId,
    /// Series identifier assigned to the chain.
    pub sid: Option<Sid>,
    /// Most recent member, the one without a known successor.
    pub head: Pid,
    /// Members ordered from tail to head.
    pub members: Vec<Pid>,
}

/// Metadata store with all-or-nothing transactions.
pub struct MetaStore {
    kv: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl MetaStore {
    /// Creates a store over the given backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    /// Creates a store over a fresh [`MemoryKvStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    /// Runs `f` in a transaction. Staged writes are committed atomically if
    /// `f` returns `Ok`, and discarded if it returns `Err`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, MetaError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, MetaError>,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let mut txn = Txn::new(self.kv.as_ref());
        let value = f(&mut txn)?;
        let ops = txn.into_batch();
        if !ops.is_empty() {
            debug!(ops = ops.len(), "committing transaction");
            self.kv.write_batch(ops)?;
        }
        Ok(value)
    }

    /// Runs `f` against a consistent view of the store. Writes staged by `f`
    /// are discarded.
    pub fn read<T, F>(&self, f: F) -> Result<T, MetaError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, MetaError>,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let mut txn = Txn::new(self.kv.as_ref());
        f(&mut txn)
    }

    /// Object stored under `pid`, if any.
    pub fn object(&self, pid: &Pid) -> Result<Option<ObjectRecord>, MetaError> {
        self.read(|txn| txn.object(pid))
    }

    /// Queues `pid` for replication from `source_node`.
    pub fn enqueue_replication(
        &self,
        pid: &Pid,
        source_node: &NodeId,
        timestamp: Timestamp,
    ) -> Result<(), MetaError> {
        self.transaction(|txn| {
            txn.put_replication_entry(&ReplicationQueueEntry::new(
                pid.clone(),
                source_node.clone(),
                timestamp,
            ))
        })
    }

    /// Queue entries still waiting to be processed, ordered by timestamp and then PID.
    pub fn list_queued_replications(&self) -> Result<Vec<ReplicationQueueEntry>, MetaError> {
        self.read(|txn| {
            Ok(txn
                .replication_entries()?
                .into_iter()
                .filter(|e| e.status == ReplicationStatus::Queued)
                .collect())
        })
    }

    /// Queue entry for `pid`, whatever its status.
    pub fn replication_entry(&self, pid: &Pid) -> Result<Option<ReplicationQueueEntry>, MetaError> {
        self.read(|txn| txn.replication_entry(pid))
    }

    /// Overwrites the stored queue entry for `entry.pid`.
    pub fn update_replication_entry(&self, entry: &ReplicationQueueEntry) -> Result<(), MetaError> {
        self.transaction(|txn| txn.put_replication_entry(entry))
    }

    /// Deletes every completed queue entry and returns how many were removed.
    pub fn delete_completed_replication_entries(&self) -> Result<usize, MetaError> {
        self.transaction(|txn| {
            let completed: Vec<Pid> = txn
                .replication_entries()?
                .into_iter()
                .filter(|e| e.status == ReplicationStatus::Completed)
                .map(|e| e.pid)
                .collect();
            for pid in &completed {
                txn.delete_replication_entry(pid);
            }
            Ok(completed.len())
        })
    }

    /// Permits `subject` to create, update and delete objects.
    pub fn add_to_whitelist(&self, subject: &Subject) -> Result<(), MetaError> {
        self.transaction(|txn| txn.whitelist_add(subject))
    }

    /// Revokes a whitelist entry.
    pub fn remove_from_whitelist(&self, subject: &Subject) -> Result<(), MetaError> {
        self.transaction(|txn| {
            txn.whitelist_remove(subject);
            Ok(())
        })
    }

    /// All stored log entries in insertion order.
    pub fn log_entries(&self) -> Result<Vec<LogEntry>, MetaError> {
        self.read(|txn| txn.log_entries())
    }
}

/// A transaction in progress. Reads see the transaction's own staged writes.
pub struct Txn<'a> {
    kv: &'a dyn KvStore,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Txn<'a> {
    fn new(kv: &'a dyn KvStore) -> Self {
        Self {
            kv,
            staged: BTreeMap::new(),
        }
    }

    fn into_batch(self) -> Vec<BatchOp> {
        self.staged
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOp::Put { key, value },
                None => BatchOp::Delete { key },
            })
            .collect()
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        match self.staged.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.kv.get(key),
        }
    }

    fn scan_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MetaError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.kv.scan_prefix(prefix)?.into_iter().collect();
        for (key, value) in self.staged.iter().filter(|(k, _)| k.starts_with(prefix)) {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, MetaError> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<(), MetaError> {
        let bytes = bincode::serialize(value)?;
        self.staged.insert(key, Some(bytes));
        Ok(())
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.staged.insert(key, None);
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>, MetaError> {
        self.scan_raw(prefix)?
            .into_iter()
            .map(|(_, bytes)| bincode::deserialize(&bytes).map_err(MetaError::from))
            .collect()
    }

    fn next_counter(&mut self, key: &[u8]) -> Result<u64, MetaError> {
        let next = self.get::<u64>(key)?.unwrap_or(1);
        self.put(key.to_vec(), &(next + 1))?;
        Ok(next)
    }

    /// Object stored under `pid`, if any.
    pub fn object(&self, pid: &Pid) -> Result<Option<ObjectRecord>, MetaError> {
        self.get(&prefixed(OBJECT_PREFIX, pid.as_str()))
    }

    /// Object stored under `pid`, or `NotFound`.
    pub fn require_object(&self, pid: &Pid) -> Result<ObjectRecord, MetaError> {
        self.object(pid)?
            .ok_or_else(|| MetaError::NotFound(format!("no object with identifier {}", pid)))
    }

    /// Stores or replaces an object record.
    ///
    /// Each link target is indexed so [`Txn::referrers`] can find the record
    /// once the target arrives.
    pub fn put_object(&mut self, record: &ObjectRecord) -> Result<(), MetaError> {
        let pid = record.pid();
        let links = record.sysmeta.obsoletes.iter().chain(record.sysmeta.obsoleted_by.iter());
        for target in links {
            let mut key = reference_prefix(target);
            key.extend_from_slice(pid.as_str().as_bytes());
            self.put(key, pid)?;
        }
        self.put(prefixed(OBJECT_PREFIX, pid.as_str()), record)
    }

    /// PIDs of objects that named `target` in a link when they were stored.
    /// Entries are not removed when links change, so callers check the
    /// referring record.
    pub fn referrers(&self, target: &Pid) -> Result<Vec<Pid>, MetaError> {
        self.scan(&reference_prefix(target))
    }

    /// All stored objects in PID order.
    pub fn objects(&self) -> Result<Vec<ObjectRecord>, MetaError> {
        self.scan(OBJECT_PREFIX)
    }

    /// Chain `pid` belongs to.
    pub fn chain_id_of(&self, pid: &Pid) -> Result<Option<ChainId>, MetaError> {
        self.get(&prefixed(PID_CHAIN_PREFIX, pid.as_str()))
    }

    /// Records `pid` as a member of chain `id`.
    pub fn set_chain_of(&mut self, pid: &Pid, id: ChainId) -> Result<(), MetaError> {
        self.put(prefixed(PID_CHAIN_PREFIX, pid.as_str()), &id)
    }

    /// Chain record by id.
    pub fn chain(&self, id: ChainId) -> Result<Option<ChainRecord>, MetaError> {
        self.get(&numbered(CHAIN_PREFIX, id))
    }

    /// Chain record by id, or `ServiceFailure` if the index points nowhere.
    pub fn require_chain(&self, id: ChainId) -> Result<ChainRecord, MetaError> {
        self.chain(id)?
            .ok_or_else(|| MetaError::ServiceFailure(format!("chain {} is missing", id)))
    }

    /// Stores or replaces a chain record.
    pub fn put_chain(&mut self, chain: &ChainRecord) -> Result<(), MetaError> {
        self.put(numbered(CHAIN_PREFIX, chain.id), chain)
    }

    /// Removes a chain record.
    pub fn delete_chain(&mut self, id: ChainId) {
        self.delete(numbered(CHAIN_PREFIX, id));
    }

    /// Allocates a fresh chain id.
    pub fn allocate_chain_id(&mut self) -> Result<ChainId, MetaError> {
        self.next_counter(CHAIN_COUNTER_KEY)
    }

    /// Chain carrying series identifier `sid`.
    pub fn chain_id_for_sid(&self, sid: &Sid) -> Result<Option<ChainId>, MetaError> {
        self.get(&prefixed(SID_PREFIX, sid.as_str()))
    }

    /// Points `sid` at chain `id`.
    pub fn set_sid(&mut self, sid: &Sid, id: ChainId) -> Result<(), MetaError> {
        self.put(prefixed(SID_PREFIX, sid.as_str()), &id)
    }

    /// Queue entry for `pid`.
    pub fn replication_entry(&self, pid: &Pid) -> Result<Option<ReplicationQueueEntry>, MetaError> {
        self.get(&prefixed(REPL_QUEUE_PREFIX, pid.as_str()))
    }

    /// Stores or replaces a queue entry.
    pub fn put_replication_entry(&mut self, entry: &ReplicationQueueEntry) -> Result<(), MetaError> {
        self.put(prefixed(REPL_QUEUE_PREFIX, entry.pid.as_str()), entry)
    }

    /// Removes the queue entry for `pid`.
    pub fn delete_replication_entry(&mut self, pid: &Pid) {
        self.delete(prefixed(REPL_QUEUE_PREFIX, pid.as_str()));
    }

    /// Every queue entry ordered by timestamp, ties broken by PID.
    pub fn replication_entries(&self) -> Result<Vec<ReplicationQueueEntry>, MetaError> {
        let mut entries: Vec<ReplicationQueueEntry> = self.scan(REPL_QUEUE_PREFIX)?;
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.pid.cmp(&b.pid)));
        Ok(entries)
    }

    /// Appends a log entry, assigning its `entry_id`.
    pub fn append_log(&mut self, mut entry: LogEntry) -> Result<LogEntry, MetaError> {
        entry.entry_id = self.next_counter(LOG_COUNTER_KEY)?;
        self.put(numbered(LOG_PREFIX, entry.entry_id), &entry)?;
        Ok(entry)
    }

    /// All log entries in insertion order.
    pub fn log_entries(&self) -> Result<Vec<LogEntry>, MetaError> {
        self.scan(LOG_PREFIX)
    }

    /// Returns true if `subject` is on the create/update/delete whitelist.
    pub fn is_whitelisted(&self, subject: &Subject) -> Result<bool, MetaError> {
        Ok(self
            .get_raw(&prefixed(WHITELIST_PREFIX, subject.as_str()))?
            .is_some())
    }

    /// Adds `subject` to the whitelist.
    pub fn whitelist_add(&mut self, subject: &Subject) -> Result<(), MetaError> {
        self.put(prefixed(WHITELIST_PREFIX, subject.as_str()), &())
    }

    /// Removes `subject` from the whitelist.
    pub fn whitelist_remove(&mut self, subject: &Subject) {
        self.delete(prefixed(WHITELIST_PREFIX, subject.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Checksum, SystemMetadata};

    fn record(pid: &str) -> ObjectRecord {
        ObjectRecord::native(SystemMetadata::new(
            pid,
            "text/plain",
            1,
            Checksum::new("MD5", "00"),
            "CN=owner",
        ))
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let store = MetaStore::in_memory();
        store
            .transaction(|txn| txn.put_object(&record("p1")))
            .unwrap();
        assert!(store.object(&Pid::from("p1")).unwrap().is_some());
    }

    #[test]
    fn test_transaction_discards_on_err() {
        let store = MetaStore::in_memory();
        let result: Result<(), MetaError> = store.transaction(|txn| {
            txn.put_object(&record("p1"))?;
            Err(MetaError::InvalidRequest("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.object(&Pid::from("p1")).unwrap().is_none());
    }

    #[test]
    fn test_reads_see_staged_writes() {
        let store = MetaStore::in_memory();
        store
            .transaction(|txn| {
                txn.put_object(&record("b"))?;
                txn.put_object(&record("a"))?;
                assert!(txn.object(&Pid::from("a"))?.is_some());
                let pids: Vec<String> = txn
                    .objects()?
                    .iter()
                    .map(|r| r.pid().to_string())
                    .collect();
                assert_eq!(pids, vec!["a", "b"]);
                txn.delete(prefixed(OBJECT_PREFIX, "a"));
                assert!(txn.object(&Pid::from("a"))?.is_none());
                assert_eq!(txn.objects()?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_read_discards_writes() {
        let store = MetaStore::in_memory();
        store.read(|txn| txn.put_object(&record("p1"))).unwrap();
        assert!(store.object(&Pid::from("p1")).unwrap().is_none());
    }

    #[test]
    fn test_counters_are_monotonic() {
        let store = MetaStore::in_memory();
        let first = store.transaction(|txn| txn.allocate_chain_id()).unwrap();
        let second = store.transaction(|txn| txn.allocate_chain_id()).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_counter_rolls_back_with_transaction() {
        let store = MetaStore::in_memory();
        let _ = store.transaction(|txn| {
            txn.allocate_chain_id()?;
            Err::<(), _>(MetaError::ServiceFailure("x".into()))
        });
        assert_eq!(store.transaction(|txn| txn.allocate_chain_id()).unwrap(), 1);
    }

    #[test]
    fn test_replication_queue_order_and_cleanup() {
        let store = MetaStore::in_memory();
        let node = NodeId::from("urn:node:src");
        store
            .enqueue_replication(&Pid::from("b"), &node, Timestamp::from_secs(10))
            .unwrap();
        store
            .enqueue_replication(&Pid::from("a"), &node, Timestamp::from_secs(10))
            .unwrap();
        store
            .enqueue_replication(&Pid::from("c"), &node, Timestamp::from_secs(5))
            .unwrap();

        let queued: Vec<String> = store
            .list_queued_replications()
            .unwrap()
            .iter()
            .map(|e| e.pid.to_string())
            .collect();
        assert_eq!(queued, vec!["c", "a", "b"]);

        let mut done = store.replication_entry(&Pid::from("a")).unwrap().unwrap();
        done.status = ReplicationStatus::Completed;
        store.update_replication_entry(&done).unwrap();
        assert_eq!(store.list_queued_replications().unwrap().len(), 2);
        assert_eq!(store.delete_completed_replication_entries().unwrap(), 1);
        assert!(store.replication_entry(&Pid::from("a")).unwrap().is_none());
        assert_eq!(store.delete_completed_replication_entries().unwrap(), 0);
    }

    #[test]
    fn test_whitelist() {
        let store = MetaStore::in_memory();
        let subject = Subject::from("CN=writer");
        store.add_to_whitelist(&subject).unwrap();
        assert!(store.read(|txn| txn.is_whitelisted(&subject)).unwrap());
        store.remove_from_whitelist(&subject).unwrap();
        assert!(!store.read(|txn| txn.is_whitelisted(&subject)).unwrap());
    }

    #[test]
    fn test_referrers_indexed_by_link_target() {
        let store = MetaStore::in_memory();
        let mut newer = record("b");
        newer.sysmeta.obsoletes = Some(Pid::from("a"));
        let mut other = record("c");
        other.sysmeta.obsoletes = Some(Pid::from("ab"));
        store
            .transaction(|txn| {
                txn.put_object(&newer)?;
                txn.put_object(&other)
            })
            .unwrap();

        let referrers = store.read(|txn| txn.referrers(&Pid::from("a"))).unwrap();
        assert_eq!(referrers, vec![Pid::from("b")]);
        assert!(store
            .read(|txn| txn.referrers(&Pid::from("b")))
            .unwrap()
            .is_empty());
    }
}
