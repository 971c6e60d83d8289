//! Property-based tests for access policy normalization.

use mnode_meta::access::are_equivalent;
use mnode_meta::{AccessPolicy, AccessRule, Permission, Subject};
use proptest::prelude::*;

fn any_permission() -> impl Strategy<Value = Permission> {
    prop_oneof![
        Just(Permission::Read),
        Just(Permission::Write),
        Just(Permission::ChangePermission),
    ]
}

fn any_subject() -> impl Strategy<Value = Subject> {
    prop_oneof![
        Just(Subject::from("public")),
        Just(Subject::from("CN=a")),
        Just(Subject::from("CN=b")),
        Just(Subject::from("CN=c")),
        "[a-z]{1,4}".prop_map(Subject::from),
    ]
}

fn any_rule() -> impl Strategy<Value = AccessRule> {
    (
        proptest::collection::btree_set(any_subject(), 1..4),
        any_permission(),
    )
        .prop_map(|(subjects, permission)| AccessRule {
            subjects,
            permission,
        })
}

fn any_policy() -> impl Strategy<Value = AccessPolicy> {
    proptest::collection::vec(any_rule(), 0..6).prop_map(|rules| AccessPolicy { rules })
}

proptest! {
    #[test]
    fn prop_normalize_is_idempotent(policy in any_policy()) {
        let once = policy.normalize();
        prop_assert_eq!(once.normalize(), once);
    }

    #[test]
    fn prop_normalize_preserves_meaning(policy in any_policy(), subject in any_subject()) {
        let normalized = policy.normalize();
        prop_assert!(are_equivalent(Some(&policy), Some(&normalized)));
        prop_assert_eq!(
            policy.effective_permissions(&subject),
            normalized.effective_permissions(&subject)
        );
    }

    #[test]
    fn prop_normalized_subjects_appear_once(policy in any_policy()) {
        let normalized = policy.normalize();
        let mut seen = std::collections::BTreeSet::new();
        for rule in &normalized.rules {
            for subject in &rule.subjects {
                prop_assert!(seen.insert(subject.clone()));
            }
        }
        let levels: Vec<Permission> = normalized.rules.iter().map(|r| r.permission).collect();
        let mut sorted = levels.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(levels, sorted);
    }

    #[test]
    fn prop_permission_implication(policy in any_policy(), subject in any_subject()) {
        let effective = policy.effective_permissions(&subject);
        if effective.contains(&Permission::ChangePermission) {
            prop_assert!(effective.contains(&Permission::Write));
        }
        if effective.contains(&Permission::Write) {
            prop_assert!(effective.contains(&Permission::Read));
        }
        for p in Permission::ALL {
            prop_assert_eq!(effective.contains(&p), policy.is_subject_allowed(&subject, p));
        }
    }

    #[test]
    fn prop_equivalence_is_symmetric(a in any_policy(), b in any_policy()) {
        prop_assert_eq!(a.is_equivalent(&b), b.is_equivalent(&a));
    }
}
