//! Access policies: permission levels, effective permissions and
//! normalization to a canonical form.
//!
//! Permissions are cumulative. A subject granted `changePermission` also
//! holds `write` and `read`, and `write` implies `read`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MetaError;
use crate::types::Subject;

/// Symbolic subject matching every caller, authenticated or not.
pub const PUBLIC_SUBJECT: &str = "public";
/// Symbolic subject matching any authenticated caller.
pub const AUTHENTICATED_USER_SUBJECT: &str = "authenticatedUser";
/// Symbolic subject matching any caller with a verified account.
pub const VERIFIED_USER_SUBJECT: &str = "verifiedUser";

/// A permission level. Ordering follows implication: `Read < Write < ChangePermission`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    /// Level 0.
    #[serde(rename = "read")]
    Read,
    /// Level 1.
    #[serde(rename = "write")]
    Write,
    /// Level 2.
    #[serde(rename = "changePermission")]
    ChangePermission,
}

impl Permission {
    /// All permissions in ascending order.
    pub const ALL: [Permission; 3] = [
        Permission::Read,
        Permission::Write,
        Permission::ChangePermission,
    ];

    /// Numeric level of the permission.
    pub fn level(self) -> u8 {
        match self {
            Permission::Read => 0,
            Permission::Write => 1,
            Permission::ChangePermission => 2,
        }
    }

    /// Permission at the given numeric level.
    pub fn from_level(level: u8) -> Result<Self, MetaError> {
        match level {
            0 => Ok(Permission::Read),
            1 => Ok(Permission::Write),
            2 => Ok(Permission::ChangePermission),
            other => Err(MetaError::InvalidRequest(format!(
                "invalid permission level: {}",
                other
            ))),
        }
    }

    /// Parses an action string such as `write` or `changePermission`.
    pub fn from_action(action: &str) -> Result<Self, MetaError> {
        match action {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "changePermission" => Ok(Permission::ChangePermission),
            other => Err(MetaError::InvalidRequest(format!(
                "invalid action: {}",
                other
            ))),
        }
    }

    /// The action string for this permission.
    pub fn as_action(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::ChangePermission => "changePermission",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_action())
    }
}

/// Grants one permission to a set of subjects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Subjects receiving the permission.
    pub subjects: BTreeSet<Subject>,
    /// The granted permission.
    pub permission: Permission,
}

impl AccessRule {
    /// Creates a rule granting `permission` to `subjects`.
    pub fn new<I, S>(subjects: I, permission: Permission) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Subject>,
    {
        Self {
            subjects: subjects.into_iter().map(Into::into).collect(),
            permission,
        }
    }
}

/// An ordered list of access rules.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Rules in declaration order.
    pub rules: Vec<AccessRule>,
}

impl AccessPolicy {
    /// Policy without any grants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`AccessPolicy::add_perm`].
    pub fn with_rule<I, S>(mut self, subjects: I, permission: Permission) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Subject>,
    {
        self.rules.push(AccessRule::new(subjects, permission));
        self
    }

    /// Appends a rule granting `permission` to a single subject.
    pub fn add_perm(&mut self, subject: impl Into<Subject>, permission: Permission) {
        self.rules
            .push(AccessRule::new(std::iter::once(subject.into()), permission));
    }

    /// Grants read to the `public` symbolic subject.
    pub fn add_public_read(&mut self) {
        self.add_perm(PUBLIC_SUBJECT, Permission::Read);
    }

    /// Returns true if `public` is granted at least read.
    pub fn is_public(&self) -> bool {
        self.highest_permission(&Subject::from(PUBLIC_SUBJECT))
            .is_some()
    }

    /// Removes every grant to `subject`. Rules left without subjects are dropped.
    pub fn remove_subject(&mut self, subject: &Subject) {
        for rule in &mut self.rules {
            rule.subjects.remove(subject);
        }
        self.rules.retain(|r| !r.subjects.is_empty());
    }

    /// Highest permission explicitly granted to `subject`, if any.
    pub fn highest_permission(&self, subject: &Subject) -> Option<Permission> {
        self.rules
            .iter()
            .filter(|r| r.subjects.contains(subject))
            .map(|r| r.permission)
            .max()
    }

    /// All permissions `subject` holds after applying implication.
    pub fn effective_permissions(&self, subject: &Subject) -> BTreeSet<Permission> {
        match self.highest_permission(subject) {
            Some(highest) => Permission::ALL
                .iter()
                .copied()
                .filter(|p| *p <= highest)
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Returns true if `subject` holds `permission`, directly or by implication.
    pub fn is_subject_allowed(&self, subject: &Subject, permission: Permission) -> bool {
        self.highest_permission(subject)
            .map_or(false, |highest| highest >= permission)
    }

    /// Subjects holding at least `permission`.
    pub fn subjects_with_at_least(&self, permission: Permission) -> BTreeSet<Subject> {
        self.highest_by_subject()
            .into_iter()
            .filter(|(_, p)| *p >= permission)
            .map(|(s, _)| s)
            .collect()
    }

    /// Each subject paired with its highest permission, sorted by subject.
    pub fn normalized_permission_list(&self) -> Vec<(Subject, Permission)> {
        self.highest_by_subject().into_iter().collect()
    }

    /// Canonical form: at most one rule per permission level in the order
    /// read, write, changePermission. Each subject appears once, under its
    /// highest permission, and subjects within a rule are sorted.
    pub fn normalize(&self) -> AccessPolicy {
        let mut by_permission: BTreeMap<Permission, BTreeSet<Subject>> = BTreeMap::new();
        for (subject, permission) in self.highest_by_subject() {
            by_permission.entry(permission).or_default().insert(subject);
        }
        AccessPolicy {
            rules: by_permission
                .into_iter()
                .map(|(permission, subjects)| AccessRule {
                    subjects,
                    permission,
                })
                .collect(),
        }
    }

    /// Returns true if both policies grant the same effective permissions.
    pub fn is_equivalent(&self, other: &AccessPolicy) -> bool {
        self.normalized_permission_list() == other.normalized_permission_list()
    }

    fn highest_by_subject(&self) -> BTreeMap<Subject, Permission> {
        let mut highest: BTreeMap<Subject, Permission> = BTreeMap::new();
        for rule in &self.rules {
            for subject in &rule.subjects {
                let entry = highest.entry(subject.clone()).or_insert(rule.permission);
                if rule.permission > *entry {
                    *entry = rule.permission;
                }
            }
        }
        highest
    }
}

/// Equivalence over optional policies. An absent policy grants nothing, the
/// same as an empty one.
pub fn are_equivalent(a: Option<&AccessPolicy>, b: Option<&AccessPolicy>) -> bool {
    let empty = AccessPolicy::default();
    a.unwrap_or(&empty).is_equivalent(b.unwrap_or(&empty))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(s: &str) -> Subject {
        Subject::from(s)
    }

    #[test]
    fn test_effective_permissions_follow_implication() {
        let policy = AccessPolicy::new()
            .with_rule(["alice"], Permission::Write)
            .with_rule(["bob"], Permission::ChangePermission);
        assert_eq!(
            policy.effective_permissions(&subject("alice")),
            [Permission::Read, Permission::Write].into_iter().collect()
        );
        assert_eq!(
            policy.effective_permissions(&subject("bob")).len(),
            3
        );
        assert!(policy.effective_permissions(&subject("carol")).is_empty());
    }

    #[test]
    fn test_normalize_groups_by_highest_permission() {
        let policy = AccessPolicy::new()
            .with_rule(["alice"], Permission::Read)
            .with_rule(["alice"], Permission::Write)
            .with_rule(["bob"], Permission::Read);
        let normalized = policy.normalize();
        assert_eq!(
            normalized,
            AccessPolicy::new()
                .with_rule(["bob"], Permission::Read)
                .with_rule(["alice"], Permission::Write)
        );
    }

    #[test]
    fn test_normalize_orders_rules_and_sorts_subjects() {
        let policy = AccessPolicy::new()
            .with_rule(["zed", "amy"], Permission::ChangePermission)
            .with_rule(["mia"], Permission::Read);
        let normalized = policy.normalize();
        assert_eq!(normalized.rules.len(), 2);
        assert_eq!(normalized.rules[0].permission, Permission::Read);
        assert_eq!(normalized.rules[1].permission, Permission::ChangePermission);
        let subjects: Vec<&str> = normalized.rules[1]
            .subjects
            .iter()
            .map(|s| s.as_str())
            .collect();
        assert_eq!(subjects, vec!["amy", "zed"]);
    }

    #[test]
    fn test_is_subject_allowed() {
        let policy = AccessPolicy::new().with_rule(["alice"], Permission::Write);
        assert!(policy.is_subject_allowed(&subject("alice"), Permission::Read));
        assert!(policy.is_subject_allowed(&subject("alice"), Permission::Write));
        assert!(!policy.is_subject_allowed(&subject("alice"), Permission::ChangePermission));
        assert!(!policy.is_subject_allowed(&subject("bob"), Permission::Read));
    }

    #[test]
    fn test_equivalence_ignores_rule_layout() {
        let a = AccessPolicy::new()
            .with_rule(["alice", "bob"], Permission::Read)
            .with_rule(["alice"], Permission::Write);
        let b = AccessPolicy::new()
            .with_rule(["bob"], Permission::Read)
            .with_rule(["alice"], Permission::Write);
        assert!(a.is_equivalent(&b));
        let c = AccessPolicy::new().with_rule(["alice"], Permission::Write);
        assert!(!a.is_equivalent(&c));
    }

    #[test]
    fn test_absent_and_empty_policies_are_equivalent() {
        let empty = AccessPolicy::new();
        assert!(are_equivalent(None, Some(&empty)));
        assert!(are_equivalent(None, None));
        let read = AccessPolicy::new().with_rule(["a"], Permission::Read);
        assert!(!are_equivalent(None, Some(&read)));
    }

    #[test]
    fn test_action_mapping() {
        for p in Permission::ALL {
            assert_eq!(Permission::from_action(p.as_action()).unwrap(), p);
            assert_eq!(Permission::from_level(p.level()).unwrap(), p);
        }
        assert!(matches!(
            Permission::from_action("delete"),
            Err(MetaError::InvalidRequest(_))
        ));
        assert!(matches!(
            Permission::from_level(3),
            Err(MetaError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_public_read_and_remove_subject() {
        let mut policy = AccessPolicy::new();
        assert!(!policy.is_public());
        policy.add_public_read();
        policy.add_perm("alice", Permission::Write);
        assert!(policy.is_public());
        policy.remove_subject(&subject(PUBLIC_SUBJECT));
        assert!(!policy.is_public());
        assert_eq!(policy.rules.len(), 1);
    }

    #[test]
    fn test_subjects_with_at_least() {
        let policy = AccessPolicy::new()
            .with_rule(["a"], Permission::Read)
            .with_rule(["b"], Permission::Write)
            .with_rule(["c"], Permission::ChangePermission);
        let writers = policy.subjects_with_at_least(Permission::Write);
        assert_eq!(writers.len(), 2);
        assert!(!writers.contains(&subject("a")));
    }

    #[test]
    fn test_empty_normalizes_to_empty() {
        assert!(AccessPolicy::new().normalize().rules.is_empty());
    }
}
