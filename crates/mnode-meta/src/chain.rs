//! Revision chains.
//!
//! Objects linked through `obsoletes` / `obsoletedBy` form a chain. Links are
//! kept mutual: whenever an object names a locally known neighbor, the
//! neighbor's opposite link is set too. A chain may carry one series
//! identifier (SID), which resolves to the chain's head, and every member
//! record carries that SID. References to PIDs this node does not hold are
//! stored on the object but do not pull anything into the chain until the
//! referenced object arrives, at which point its links are completed and the
//! chains are merged.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::MetaError;
use crate::store::{ChainId, ChainRecord, MetaStore, Txn};
use crate::types::{ObjectRecord, Pid, ReplicationStatus, Sid};

/// Where an object sits in its chain, judged by its local links.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainPosition {
    /// Sole member of its chain.
    Standalone,
    /// Oldest member; has a known successor only.
    Tail,
    /// Newest member; has a known predecessor only.
    Head,
    /// Has both a known predecessor and a known successor.
    Embedded,
}

/// Maintains revision chains and SID resolution over a [`MetaStore`].
///
/// The `*_in` methods run inside a caller's transaction. The others open
/// their own.
#[derive(Clone)]
pub struct RevisionChainManager {
    store: Arc<MetaStore>,
}

impl RevisionChainManager {
    /// Creates a manager over `store`.
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    /// Stores `record` and merges it into the chain(s) its links reach.
    pub fn create_or_update(&self, record: ObjectRecord) -> Result<(), MetaError> {
        self.store
            .transaction(|txn| self.create_or_update_in(txn, record))
    }

    /// Stores `record` inside `txn`.
    ///
    /// A new object gets its own chain unless it links to known objects, in
    /// which case it joins their chains, merging them if it bridges two.
    /// Re-saving an existing object keeps its links when the new record
    /// leaves them empty.
    ///
    /// Fails with `InvalidRequest` when a neighbor is already linked to a
    /// different object, when the links would form a cycle, or when the
    /// declared SID differs from the chain's. Fails with
    /// `IdentifierNotUnique` when a new SID is already in use, and with
    /// `ServiceFailure` when joined chains carry different SIDs.
    pub fn create_or_update_in(
        &self,
        txn: &mut Txn<'_>,
        mut record: ObjectRecord,
    ) -> Result<(), MetaError> {
        let pid = record.pid().clone();

        match txn.object(&pid)? {
            Some(existing) => {
                inherit_link(
                    &mut record.sysmeta.obsoletes,
                    existing.sysmeta.obsoletes,
                    &pid,
                    "obsoletes",
                )?;
                inherit_link(
                    &mut record.sysmeta.obsoleted_by,
                    existing.sysmeta.obsoleted_by,
                    &pid,
                    "obsoletedBy",
                )?;
            }
            None => {
                if txn.chain_id_for_sid(&pid.as_sid())?.is_some() {
                    return Err(MetaError::IdentifierNotUnique(format!(
                        "{} is in use as a series identifier",
                        pid
                    )));
                }
                adopt_back_references(txn, &mut record)?;
            }
        }
        check_self_links(&record)?;

        let predecessor = match &record.sysmeta.obsoletes {
            Some(prev) => txn.object(prev)?,
            None => None,
        };
        if let Some(prev) = &predecessor {
            if let Some(other) = &prev.sysmeta.obsoleted_by {
                if other != &pid {
                    return Err(MetaError::InvalidRequest(format!(
                        "{} is already obsoleted by {}",
                        prev.pid(),
                        other
                    )));
                }
            }
        }
        let successor = match &record.sysmeta.obsoleted_by {
            Some(next) => txn.object(next)?,
            None => None,
        };
        if let Some(next) = &successor {
            if let Some(other) = &next.sysmeta.obsoletes {
                if other != &pid {
                    return Err(MetaError::InvalidRequest(format!(
                        "{} already obsoletes {}",
                        next.pid(),
                        other
                    )));
                }
            }
        }

        let mut joined: Vec<ChainId> = Vec::new();
        let linked = std::iter::once(&pid)
            .chain(predecessor.as_ref().map(|r| r.pid()))
            .chain(successor.as_ref().map(|r| r.pid()));
        for member in linked {
            if let Some(id) = txn.chain_id_of(member)? {
                if !joined.contains(&id) {
                    joined.push(id);
                }
            }
        }

        let mut chain_sid: Option<Sid> = None;
        let mut members: BTreeSet<Pid> = BTreeSet::new();
        for id in &joined {
            let chain = txn.require_chain(*id)?;
            if let Some(sid) = chain.sid {
                match &chain_sid {
                    Some(existing) if existing != &sid => {
                        return Err(MetaError::ServiceFailure(format!(
                            "cannot join chains with series identifiers {} and {}",
                            existing, sid
                        )));
                    }
                    _ => chain_sid = Some(sid),
                }
            }
            members.extend(chain.members);
        }
        members.insert(pid.clone());

        let declared = record.sysmeta.series_id.clone();
        match (&chain_sid, &declared) {
            (Some(current), Some(declared)) if current != declared => {
                return Err(MetaError::InvalidRequest(format!(
                    "series identifier {} does not match chain series identifier {}",
                    declared, current
                )));
            }
            (None, Some(declared)) => {
                if declared.as_str() == pid.as_str()
                    || txn.chain_id_for_sid(declared)?.is_some()
                    || txn.object(&declared.as_pid())?.is_some()
                {
                    return Err(MetaError::IdentifierNotUnique(format!(
                        "series identifier {} is already in use",
                        declared
                    )));
                }
            }
            _ => {}
        }
        let sid = chain_sid.or(declared);
        if sid.is_some() {
            record.sysmeta.series_id = sid.clone();
        }

        let target = match joined.first() {
            Some(id) => *id,
            None => txn.allocate_chain_id()?,
        };

        txn.put_object(&record)?;
        if let Some(mut prev) = predecessor {
            prev.sysmeta.obsoleted_by = Some(pid.clone());
            txn.put_object(&prev)?;
        }
        if let Some(mut next) = successor {
            next.sysmeta.obsoletes = Some(pid.clone());
            txn.put_object(&next)?;
        }

        for merged in joined.iter().skip(1) {
            txn.delete_chain(*merged);
        }
        for member in &members {
            txn.set_chain_of(member, target)?;
            if sid.is_some() && member != &pid {
                let mut other = txn.require_object(member)?;
                if other.sysmeta.series_id != sid {
                    other.sysmeta.series_id = sid.clone();
                    txn.put_object(&other)?;
                }
            }
        }
        let ordered = order_members(txn, &members)?;
        let head = head_of(&ordered, &pid);
        txn.put_chain(&ChainRecord {
            id: target,
            sid: sid.clone(),
            head: head.clone(),
            members: ordered,
        })?;
        if let Some(sid) = &sid {
            txn.set_sid(sid, target)?;
        }

        tracing::debug!(
            pid = %pid,
            chain = target,
            head = %head,
            merged = joined.len().saturating_sub(1),
            "stored object in revision chain"
        );
        Ok(())
    }

    /// Detaches `pid` from its chain.
    pub fn cut_from_chain(&self, pid: &Pid) -> Result<(), MetaError> {
        self.store.transaction(|txn| self.cut_from_chain_in(txn, pid))
    }

    /// Detaches `pid` from its chain inside `txn`.
    ///
    /// The neighbors are relinked around it and it becomes a standalone
    /// object without links or SID. The chain keeps its SID, which resolves
    /// to the remaining head. Cutting a standalone object does nothing.
    pub fn cut_from_chain_in(&self, txn: &mut Txn<'_>, pid: &Pid) -> Result<(), MetaError> {
        let mut record = txn.require_object(pid)?;
        let chain_id = require_chain_id(txn, pid)?;
        let mut chain = txn.require_chain(chain_id)?;
        if chain.members.len() <= 1 {
            return Ok(());
        }

        let predecessor = match &record.sysmeta.obsoletes {
            Some(prev) => txn.object(prev)?,
            None => None,
        };
        let successor = match &record.sysmeta.obsoleted_by {
            Some(next) => txn.object(next)?,
            None => None,
        };
        let position = match (&predecessor, &successor) {
            (Some(_), Some(_)) => ChainPosition::Embedded,
            (Some(_), None) => ChainPosition::Head,
            (None, Some(_)) => ChainPosition::Tail,
            (None, None) => ChainPosition::Standalone,
        };
        match (predecessor, successor) {
            (Some(mut prev), Some(mut next)) => {
                prev.sysmeta.obsoleted_by = Some(next.pid().clone());
                next.sysmeta.obsoletes = Some(prev.pid().clone());
                txn.put_object(&prev)?;
                txn.put_object(&next)?;
            }
            (Some(mut prev), None) => {
                prev.sysmeta.obsoleted_by = None;
                txn.put_object(&prev)?;
            }
            (None, Some(mut next)) => {
                next.sysmeta.obsoletes = None;
                txn.put_object(&next)?;
            }
            (None, None) => {}
        }

        record.sysmeta.obsoletes = None;
        record.sysmeta.obsoleted_by = None;
        record.sysmeta.series_id = None;
        txn.put_object(&record)?;

        let remaining: BTreeSet<Pid> = chain.members.iter().filter(|m| *m != pid).cloned().collect();
        chain.members = order_members(txn, &remaining)?;
        chain.head = chain
            .members
            .last()
            .cloned()
            .ok_or_else(|| MetaError::ServiceFailure(format!("chain {} became empty", chain_id)))?;
        txn.put_chain(&chain)?;

        let own = txn.allocate_chain_id()?;
        txn.put_chain(&ChainRecord {
            id: own,
            sid: None,
            head: pid.clone(),
            members: vec![pid.clone()],
        })?;
        txn.set_chain_of(pid, own)?;

        tracing::debug!(pid = %pid, ?position, chain = chain_id, "cut object from revision chain");
        Ok(())
    }

    /// Head PID of the chain named by `sid`.
    pub fn resolve_sid(&self, sid: &Sid) -> Result<Pid, MetaError> {
        self.store.read(|txn| self.resolve_sid_in(txn, sid))
    }

    /// Head PID of the chain named by `sid`, inside `txn`.
    pub fn resolve_sid_in(&self, txn: &Txn<'_>, sid: &Sid) -> Result<Pid, MetaError> {
        let id = txn
            .chain_id_for_sid(sid)?
            .ok_or_else(|| MetaError::NotFound(format!("unknown series identifier {}", sid)))?;
        Ok(txn.require_chain(id)?.head)
    }

    /// Resolves an identifier that is either a PID or a SID. PIDs take precedence.
    pub fn resolve(&self, did: &str) -> Result<Pid, MetaError> {
        self.store.read(|txn| self.resolve_in(txn, did))
    }

    /// [`RevisionChainManager::resolve`] inside `txn`.
    pub fn resolve_in(&self, txn: &Txn<'_>, did: &str) -> Result<Pid, MetaError> {
        let pid = Pid::from(did);
        if txn.object(&pid)?.is_some() {
            return Ok(pid);
        }
        match txn.chain_id_for_sid(&pid.as_sid())? {
            Some(id) => Ok(txn.require_chain(id)?.head),
            None => Err(MetaError::NotFound(format!(
                "no object or series with identifier {}",
                did
            ))),
        }
    }

    /// Recomputes the head `sid` resolves to by walking the links of its
    /// chain. `pid` must be a member of that chain.
    pub fn update_sid(&self, sid: &Sid, pid: &Pid) -> Result<(), MetaError> {
        self.store.transaction(|txn| {
            let id = txn
                .chain_id_for_sid(sid)?
                .ok_or_else(|| MetaError::NotFound(format!("unknown series identifier {}", sid)))?;
            txn.require_object(pid)?;
            if require_chain_id(txn, pid)? != id {
                return Err(MetaError::InvalidRequest(format!(
                    "{} is not in the chain of series {}",
                    pid, sid
                )));
            }
            let mut chain = txn.require_chain(id)?;
            let members: BTreeSet<Pid> = chain.members.iter().cloned().collect();
            chain.members = order_members(txn, &members)?;
            chain.head = head_of(&chain.members, pid);
            txn.put_chain(&chain)
        })
    }

    /// Members of the chain containing `pid`, from tail to head.
    pub fn chain_members(&self, pid: &Pid) -> Result<Vec<Pid>, MetaError> {
        self.store.read(|txn| {
            txn.require_object(pid)?;
            let id = require_chain_id(txn, pid)?;
            Ok(txn.require_chain(id)?.members)
        })
    }

    /// SID of the chain containing `pid`.
    pub fn sid_for_pid(&self, pid: &Pid) -> Result<Option<Sid>, MetaError> {
        self.store.read(|txn| {
            txn.require_object(pid)?;
            let id = require_chain_id(txn, pid)?;
            Ok(txn.require_chain(id)?.sid)
        })
    }

    /// Position of `pid` within its chain.
    pub fn position(&self, pid: &Pid) -> Result<ChainPosition, MetaError> {
        self.store.read(|txn| {
            let record = txn.require_object(pid)?;
            let has_prev = match &record.sysmeta.obsoletes {
                Some(prev) => txn.object(prev)?.is_some(),
                None => false,
            };
            let has_next = match &record.sysmeta.obsoleted_by {
                Some(next) => txn.object(next)?.is_some(),
                None => false,
            };
            Ok(match (has_prev, has_next) {
                (true, true) => ChainPosition::Embedded,
                (true, false) => ChainPosition::Head,
                (false, true) => ChainPosition::Tail,
                (false, false) => ChainPosition::Standalone,
            })
        })
    }

    /// Returns true if `pid` names a replica stored on this node.
    pub fn is_local_replica(&self, txn: &Txn<'_>, pid: &Pid) -> Result<bool, MetaError> {
        Ok(txn.object(pid)?.map_or(false, |r| r.is_replica()))
    }

    /// Returns true if `pid` is queued for replication but not stored yet.
    pub fn is_unprocessed_local_replica(&self, txn: &Txn<'_>, pid: &Pid) -> Result<bool, MetaError> {
        if txn.object(pid)?.is_some() {
            return Ok(false);
        }
        Ok(txn
            .replication_entry(pid)?
            .map_or(false, |e| e.status == ReplicationStatus::Queued))
    }

    /// Succeeds if `pid` is waiting in the replication queue and no object
    /// with that PID exists yet.
    pub fn assert_is_pid_of_local_unprocessed_replica(
        &self,
        txn: &Txn<'_>,
        pid: &Pid,
    ) -> Result<(), MetaError> {
        if txn.object(pid)?.is_some() {
            return Err(MetaError::IdentifierNotUnique(format!(
                "{} already exists on this node",
                pid
            )));
        }
        match txn.replication_entry(pid)? {
            Some(entry) if entry.status == ReplicationStatus::Queued => Ok(()),
            Some(entry) => Err(MetaError::InvalidRequest(format!(
                "replication of {} is already {}",
                pid, entry.status
            ))),
            None => Err(MetaError::InvalidRequest(format!(
                "{} is not queued for replication",
                pid
            ))),
        }
    }

    /// Succeeds if `pid` is unknown here or names a local replica.
    pub fn assert_pid_is_unknown_or_replica(
        &self,
        txn: &Txn<'_>,
        pid: &Pid,
    ) -> Result<(), MetaError> {
        if txn.object(pid)?.is_none() || self.is_local_replica(txn, pid)? {
            return Ok(());
        }
        Err(MetaError::IdentifierNotUnique(format!(
            "{} is a native object on this node",
            pid
        )))
    }
}

/// Completes the links of a newly arriving object from stored objects that
/// already name it as predecessor or successor.
fn adopt_back_references(txn: &Txn<'_>, record: &mut ObjectRecord) -> Result<(), MetaError> {
    let pid = record.pid().clone();
    let mut successors = Vec::new();
    let mut predecessors = Vec::new();
    for referrer in txn.referrers(&pid)? {
        let other = match txn.object(&referrer)? {
            Some(other) => other,
            None => continue,
        };
        if other.sysmeta.obsoletes.as_ref() == Some(&pid) {
            successors.push(referrer.clone());
        }
        if other.sysmeta.obsoleted_by.as_ref() == Some(&pid) {
            predecessors.push(referrer);
        }
    }
    adopt_link(&mut record.sysmeta.obsoleted_by, successors, &pid, "already obsoletes")?;
    adopt_link(&mut record.sysmeta.obsoletes, predecessors, &pid, "is already obsoleted by")
}

fn adopt_link(
    link: &mut Option<Pid>,
    referrers: Vec<Pid>,
    pid: &Pid,
    relation: &str,
) -> Result<(), MetaError> {
    for referrer in &referrers {
        let conflicting = match link.as_ref() {
            Some(current) => current != referrer,
            None => referrers.len() > 1,
        };
        if conflicting {
            return Err(MetaError::InvalidRequest(format!(
                "{} {} {}",
                referrer, relation, pid
            )));
        }
    }
    if link.is_none() {
        *link = referrers.into_iter().next();
    }
    Ok(())
}

fn inherit_link(
    link: &mut Option<Pid>,
    existing: Option<Pid>,
    pid: &Pid,
    name: &str,
) -> Result<(), MetaError> {
    match (link.as_ref(), existing) {
        (None, existing) => {
            *link = existing;
            Ok(())
        }
        (Some(new), Some(old)) if *new != old => Err(MetaError::InvalidRequest(format!(
            "cannot change {} of {} from {} to {}",
            name, pid, old, new
        ))),
        _ => Ok(()),
    }
}

fn check_self_links(record: &ObjectRecord) -> Result<(), MetaError> {
    let pid = record.pid();
    let sm = &record.sysmeta;
    if sm.obsoletes.as_ref() == Some(pid) || sm.obsoleted_by.as_ref() == Some(pid) {
        return Err(MetaError::InvalidRequest(format!(
            "{} cannot obsolete itself",
            pid
        )));
    }
    if sm.obsoletes.is_some() && sm.obsoletes == sm.obsoleted_by {
        return Err(MetaError::InvalidRequest(format!(
            "{} obsoletes and is obsoleted by the same object",
            pid
        )));
    }
    Ok(())
}

fn require_chain_id(txn: &Txn<'_>, pid: &Pid) -> Result<ChainId, MetaError> {
    txn.chain_id_of(pid)?
        .ok_or_else(|| MetaError::ServiceFailure(format!("{} has no revision chain", pid)))
}

/// Newest member of a tail-to-head ordering.
fn head_of(ordered: &[Pid], pid: &Pid) -> Pid {
    ordered.last().cloned().unwrap_or_else(|| pid.clone())
}

/// Orders `members` from tail to head by following `obsoletedBy` links.
/// Fails with `InvalidRequest` if the links contain a cycle.
fn order_members(txn: &Txn<'_>, members: &BTreeSet<Pid>) -> Result<Vec<Pid>, MetaError> {
    let mut records = Vec::with_capacity(members.len());
    for pid in members {
        records.push(txn.require_object(pid)?);
    }
    let successor_of = |pid: &Pid| -> Option<Pid> {
        records
            .iter()
            .find(|r| r.pid() == pid)
            .and_then(|r| r.sysmeta.obsoleted_by.clone())
            .filter(|next| members.contains(next))
    };

    let tails: Vec<&Pid> = records
        .iter()
        .filter(|r| match &r.sysmeta.obsoletes {
            Some(prev) => !members.contains(prev),
            None => true,
        })
        .map(|r| r.pid())
        .collect();

    let mut ordered = Vec::with_capacity(members.len());
    let mut visited: HashSet<Pid> = HashSet::new();
    for tail in tails {
        let mut current = Some(tail.clone());
        while let Some(pid) = current {
            if !visited.insert(pid.clone()) {
                break;
            }
            current = successor_of(&pid);
            ordered.push(pid);
        }
    }
    if ordered.len() != members.len() {
        return Err(MetaError::InvalidRequest(
            "obsolescence links would form a cycle".to_string(),
        ));
    }
    Ok(ordered)
}
