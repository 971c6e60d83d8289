//! Property-based tests for revision chain maintenance under cuts.

use std::sync::Arc;

use mnode_meta::{
    Checksum, MetaStore, ObjectRecord, Pid, RevisionChainManager, Sid, SystemMetadata,
};
use proptest::prelude::*;

fn build(len: usize) -> (Arc<MetaStore>, RevisionChainManager) {
    let store = Arc::new(MetaStore::in_memory());
    let chains = RevisionChainManager::new(store.clone());
    for i in 0..len {
        let mut sm = SystemMetadata::new(
            format!("v{}", i),
            "text/plain",
            1,
            Checksum::new("MD5", "00"),
            "CN=owner",
        )
        .with_sid("series");
        if i > 0 {
            sm = sm.with_obsoletes(format!("v{}", i - 1));
        }
        chains.create_or_update(ObjectRecord::native(sm)).unwrap();
    }
    (store, chains)
}

/// Checks that the chain holding `member` is linear with mutual links.
fn check_chain(store: &MetaStore, chains: &RevisionChainManager, member: &Pid) {
    let members = chains.chain_members(member).unwrap();
    assert!(!members.is_empty());
    for pair in members.windows(2) {
        let older = store.object(&pair[0]).unwrap().unwrap().sysmeta;
        let newer = store.object(&pair[1]).unwrap().unwrap().sysmeta;
        assert_eq!(older.obsoleted_by.as_ref(), Some(&pair[1]));
        assert_eq!(newer.obsoletes.as_ref(), Some(&pair[0]));
    }
    let tail = store.object(&members[0]).unwrap().unwrap().sysmeta;
    assert_eq!(tail.obsoletes, None);
    let head = store.object(members.last().unwrap()).unwrap().unwrap().sysmeta;
    assert_eq!(head.obsoleted_by, None);
}

proptest! {
    #[test]
    fn prop_cuts_keep_chain_consistent(
        len in 1usize..7,
        cuts in proptest::collection::vec(0usize..7, 0..7),
    ) {
        let (store, chains) = build(len);
        for cut in cuts {
            let pid = Pid::from(format!("v{}", cut % len));
            chains.cut_from_chain(&pid).unwrap();
            check_chain(&store, &chains, &pid);
        }

        let head = chains.resolve_sid(&Sid::from("series")).unwrap();
        let members = chains.chain_members(&head).unwrap();
        prop_assert_eq!(members.last(), Some(&head));
        prop_assert_eq!(chains.sid_for_pid(&head).unwrap(), Some(Sid::from("series")));

        let mut total = 0;
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..len {
            let pid = Pid::from(format!("v{}", i));
            check_chain(&store, &chains, &pid);
            let chain = chains.chain_members(&pid).unwrap();
            prop_assert!(chain.contains(&pid));
            if seen.insert(chain.clone()) {
                total += chain.len();
            }
        }
        prop_assert_eq!(total, len);
    }
}
