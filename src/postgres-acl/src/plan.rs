// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Diffing of privilege policies and planning of the statements that
//! converge one policy into another.
//!
//! Plans always revoke before they grant. An updated role has its whole old
//! entry revoked and its whole new entry granted again: a reduction cannot be
//! expressed as an additional grant.

use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::acl::{AclEntry, Grantee, RoleKey, RolePolicy};
use crate::error::AclError;
use crate::privilege::Privileges;
use crate::sql::PrivilegeTarget;

/// The partition of role keys produced by [`diff_policies`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyDiff {
    /// Present in the old policy only.
    pub dropped: BTreeMap<RoleKey, AclEntry>,
    /// Present in the new policy only.
    pub added: BTreeMap<RoleKey, AclEntry>,
    /// Present in both with differing privileges, as `(old, new)`.
    pub updated: BTreeMap<RoleKey, (AclEntry, AclEntry)>,
    /// Present in both with the same privileges. Holds the new entry.
    pub unchanged: BTreeMap<RoleKey, AclEntry>,
}

impl PolicyDiff {
    /// Whether converging requires no statements at all.
    pub fn is_noop(&self) -> bool {
        self.dropped.is_empty() && self.added.is_empty() && self.updated.is_empty()
    }
}

/// Classifies every role key of `old` and `new`.
///
/// Keys are compared case-insensitively. Entries are compared by their
/// privilege and grant option sets; how a role name is spelled does not make
/// an entry differ.
pub fn diff_policies(old: &RolePolicy, new: &RolePolicy) -> PolicyDiff {
    let mut diff = PolicyDiff::default();
    for (key, old_entry) in old.iter() {
        match new.get_key(key) {
            None => {
                diff.dropped.insert(key.clone(), old_entry.clone());
            }
            Some(new_entry) if new_entry.same_privileges(old_entry) => {
                diff.unchanged.insert(key.clone(), new_entry.clone());
            }
            Some(new_entry) => {
                diff.updated
                    .insert(key.clone(), (old_entry.clone(), new_entry.clone()));
            }
        }
    }
    for (key, new_entry) in new.iter() {
        if old.get_key(key).is_none() {
            diff.added.insert(key.clone(), new_entry.clone());
        }
    }
    diff
}

/// Whether a statement adds or removes privileges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Grant,
    /// A grant that also confers the right to grant onwards.
    GrantWithGrantOption,
    Revoke,
}

/// A rendering of the objects a statement applies to, for error messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentTarget(String);

impl IntentTarget {
    pub fn new(description: impl Into<String>) -> IntentTarget {
        IntentTarget(description.into())
    }
}

impl fmt::Display for IntentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a statement was meant to achieve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intent {
    pub direction: Direction,
    pub grantee: Grantee,
    /// `None` stands for every privilege.
    pub privileges: Option<Privileges>,
    pub target: IntentTarget,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.direction {
            Direction::Grant | Direction::GrantWithGrantOption => "grant",
            Direction::Revoke => "revoke",
        };
        write!(f, "{verb} ")?;
        match self.privileges {
            Some(privileges) => write!(f, "{privileges}")?,
            None => f.write_str("all privileges")?,
        }
        match self.direction {
            Direction::Grant => write!(f, " on {} to {}", self.target, self.grantee),
            Direction::GrantWithGrantOption => write!(
                f,
                " on {} to {} with grant option",
                self.target, self.grantee
            ),
            Direction::Revoke => write!(f, " on {} from {}", self.target, self.grantee),
        }
    }
}

/// A SQL statement and the intent it carries out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub intent: Intent,
    pub sql: String,
}

impl Statement {
    pub fn grant(target: &PrivilegeTarget, grantee: &Grantee, privileges: Privileges) -> Statement {
        Statement {
            sql: target.grant(grantee, privileges, false),
            intent: Intent {
                direction: Direction::Grant,
                grantee: grantee.clone(),
                privileges: Some(privileges),
                target: target.describe(),
            },
        }
    }

    pub fn grant_with_grant_option(
        target: &PrivilegeTarget,
        grantee: &Grantee,
        privileges: Privileges,
    ) -> Statement {
        Statement {
            sql: target.grant(grantee, privileges, true),
            intent: Intent {
                direction: Direction::GrantWithGrantOption,
                grantee: grantee.clone(),
                privileges: Some(privileges),
                target: target.describe(),
            },
        }
    }

    pub fn revoke(
        target: &PrivilegeTarget,
        grantee: &Grantee,
        privileges: Option<Privileges>,
    ) -> Statement {
        Statement {
            sql: target.revoke(grantee, privileges),
            intent: Intent {
                direction: Direction::Revoke,
                grantee: grantee.clone(),
                privileges,
                target: target.describe(),
            },
        }
    }
}

/// The statements granting `entry` in full: plain privileges in one
/// statement, privileges held with grant option in another.
pub fn grant_entry(target: &PrivilegeTarget, entry: &AclEntry) -> Vec<Statement> {
    let mut statements = vec![];
    let plain = entry.plain_privileges();
    if !plain.is_empty() {
        statements.push(Statement::grant(target, entry.grantee(), plain));
    }
    if !entry.grant_options().is_empty() {
        statements.push(Statement::grant_with_grant_option(
            target,
            entry.grantee(),
            entry.grant_options(),
        ));
    }
    statements
}

/// Replaces whatever `entry`'s grantee holds on `target` with `entry`.
pub fn plan_replace(target: &PrivilegeTarget, entry: &AclEntry) -> Vec<Statement> {
    let mut statements = vec![Statement::revoke(target, entry.grantee(), None)];
    statements.extend(grant_entry(target, entry));
    statements
}

/// Plans the statements that converge the old side of `diff` into its new
/// side.
///
/// `role_exists` is consulted for every dropped role other than `PUBLIC`. A
/// dropped role that no longer exists has lost its privileges along with its
/// existence, so no revoke is planned for it. Errors from `role_exists`
/// abort planning.
pub fn plan_policy<F>(
    diff: &PolicyDiff,
    target: &PrivilegeTarget,
    mut role_exists: F,
) -> Result<Vec<Statement>, AclError>
where
    F: FnMut(&str) -> Result<bool, AclError>,
{
    let mut revokes = vec![];
    let mut grants = vec![];

    for entry in diff.dropped.values() {
        if entry.privileges().is_empty() {
            continue;
        }
        if let Grantee::Role(name) = entry.grantee() {
            if !role_exists(name)? {
                info!(role = %name, "role no longer exists; skipping revoke");
                continue;
            }
        }
        revokes.push(Statement::revoke(
            target,
            entry.grantee(),
            Some(entry.privileges()),
        ));
    }
    for (old, new) in diff.updated.values() {
        if !old.privileges().is_empty() {
            revokes.push(Statement::revoke(target, old.grantee(), Some(old.privileges())));
        }
        grants.extend(grant_entry(target, new));
    }
    for entry in diff.added.values() {
        grants.extend(grant_entry(target, entry));
    }

    revokes.extend(grants);
    Ok(revokes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;
    use crate::privilege::ObjectKind;

    fn entry(role: &str, privileges: Privileges, grant_options: Privileges) -> AclEntry {
        AclEntry::new(Grantee::parse(role), privileges, grant_options).unwrap()
    }

    fn schema() -> PrivilegeTarget {
        PrivilegeTarget::Schema("app".into())
    }

    #[test]
    fn diff_partitions_roles() {
        let old: RolePolicy = vec![
            entry("gone", Privileges::USAGE, Privileges::empty()),
            entry("Same", Privileges::USAGE, Privileges::empty()),
            entry("shrunk", Privileges::USAGE | Privileges::CREATE, Privileges::empty()),
            entry("", Privileges::USAGE, Privileges::empty()),
        ]
        .into_iter()
        .collect();
        let new: RolePolicy = vec![
            entry("same", Privileges::USAGE, Privileges::empty()),
            entry("shrunk", Privileges::USAGE, Privileges::empty()),
            entry("new", Privileges::CREATE, Privileges::CREATE),
            entry("public", Privileges::USAGE, Privileges::empty()),
        ]
        .into_iter()
        .collect();

        let diff = diff_policies(&old, &new);
        let keys = |m: &BTreeMap<RoleKey, _>| m.keys().map(|k| k.to_string()).collect::<Vec<_>>();
        assert_eq!(keys(&diff.dropped), ["gone"]);
        assert_eq!(keys(&diff.added), ["new"]);
        assert_eq!(diff.updated.keys().map(|k| k.to_string()).collect::<Vec<_>>(), ["shrunk"]);
        assert_eq!(keys(&diff.unchanged), ["PUBLIC", "same"]);
        assert!(!diff.is_noop());
        assert!(diff_policies(&new, &new).is_noop());
    }

    #[test]
    fn updated_roles_revoke_the_old_entry_first() {
        let old: RolePolicy = vec![entry(
            "r",
            Privileges::USAGE | Privileges::CREATE,
            Privileges::empty(),
        )]
        .into_iter()
        .collect();
        let new: RolePolicy = vec![entry("r", Privileges::USAGE, Privileges::USAGE)]
            .into_iter()
            .collect();

        let statements = plan_policy(&diff_policies(&old, &new), &schema(), |_| Ok(true)).unwrap();
        let sql: Vec<_> = statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            [
                r#"REVOKE USAGE, CREATE ON SCHEMA "app" FROM "r""#,
                r#"GRANT USAGE ON SCHEMA "app" TO "r" WITH GRANT OPTION"#,
            ]
        );
        assert_eq!(statements[0].intent.direction, Direction::Revoke);
    }

    #[test]
    fn missing_dropped_roles_are_skipped() {
        let old: RolePolicy = vec![
            entry("ghost", Privileges::USAGE, Privileges::empty()),
            entry("", Privileges::USAGE, Privileges::empty()),
        ]
        .into_iter()
        .collect();
        let mut checked = vec![];
        let statements = plan_policy(&diff_policies(&old, &RolePolicy::new()), &schema(), |role| {
            checked.push(role.to_owned());
            Ok(false)
        })
        .unwrap();
        assert_eq!(checked, ["ghost"]);
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].sql, r#"REVOKE USAGE ON SCHEMA "app" FROM PUBLIC"#);
    }

    #[test]
    fn entries_without_privileges_are_never_revoked() {
        let idle = entry("r", Privileges::empty(), Privileges::empty());
        let usage = entry("r", Privileges::USAGE, Privileges::empty());

        // Declaring no privileges is the same as not declaring the role.
        let declared: RolePolicy = vec![idle.clone()].into_iter().collect();
        assert!(declared.is_empty());
        let statements =
            plan_policy(&diff_policies(&declared, &RolePolicy::new()), &schema(), |_| Ok(true))
                .unwrap();
        assert!(statements.is_empty());

        let mut diff = PolicyDiff::default();
        diff.dropped.insert(RoleKey::new("r"), idle.clone());
        let statements = plan_policy(&diff, &schema(), |_| Ok(true)).unwrap();
        assert!(statements.is_empty());

        let mut diff = PolicyDiff::default();
        diff.updated.insert(RoleKey::new("r"), (idle, usage));
        let statements = plan_policy(&diff, &schema(), |_| Ok(true)).unwrap();
        let sql: Vec<_> = statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql, [r#"GRANT USAGE ON SCHEMA "app" TO "r""#]);
    }

    #[test]
    fn existence_errors_abort_planning() {
        let old: RolePolicy = vec![entry("r", Privileges::USAGE, Privileges::empty())]
            .into_iter()
            .collect();
        let result = plan_policy(&diff_policies(&old, &RolePolicy::new()), &schema(), |_| {
            Err(AclError::validation("role", "lookup failed"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn replace_is_flat() {
        let target = PrivilegeTarget::InSchema {
            kind: ObjectKind::Table,
            schema: "app".into(),
            objects: vec!["t".into()],
        };
        let statements = plan_replace(
            &target,
            &entry("r", Privileges::SELECT | Privileges::INSERT, Privileges::SELECT),
        );
        let sql: Vec<_> = statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            [
                r#"REVOKE ALL PRIVILEGES ON TABLE "app"."t" FROM "r""#,
                r#"GRANT INSERT ON TABLE "app"."t" TO "r""#,
                r#"GRANT SELECT ON TABLE "app"."t" TO "r" WITH GRANT OPTION"#,
            ]
        );
        assert_eq!(
            statements[2].intent.to_string(),
            r#"grant SELECT on table "app"."t" to role "r" with grant option"#
        );
    }

    fn schema_privileges() -> impl Strategy<Value = Privileges> {
        prop::sample::select(vec![
            Privileges::empty(),
            Privileges::USAGE,
            Privileges::CREATE,
            Privileges::USAGE | Privileges::CREATE,
        ])
    }

    fn policy() -> impl Strategy<Value = RolePolicy> {
        let role = prop::sample::select(vec!["a", "A", "b", "c", "", "public"]);
        prop::collection::vec((role, schema_privileges(), schema_privileges()), 0..6).prop_map(
            |decls| {
                decls
                    .into_iter()
                    .map(|(role, privileges, options)| {
                        let options = if Grantee::parse(role).is_public() {
                            Privileges::empty()
                        } else {
                            options & privileges
                        };
                        entry(role, privileges, options)
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn diff_covers_every_key_once(old in policy(), new in policy()) {
            let diff = diff_policies(&old, &new);
            let mut seen = BTreeSet::new();
            for key in diff
                .dropped
                .keys()
                .chain(diff.added.keys())
                .chain(diff.updated.keys())
                .chain(diff.unchanged.keys())
            {
                prop_assert!(seen.insert(key.clone()), "{key} classified twice");
            }
            let expected: BTreeSet<_> = old.keys().chain(new.keys()).cloned().collect();
            prop_assert_eq!(seen, expected);
        }

        #[test]
        fn plans_revoke_before_granting(old in policy(), new in policy()) {
            let statements = plan_policy(&diff_policies(&old, &new), &schema(), |_| Ok(true)).unwrap();
            let first_grant = statements
                .iter()
                .position(|s| s.intent.direction != Direction::Revoke)
                .unwrap_or(statements.len());
            prop_assert!(statements[first_grant..]
                .iter()
                .all(|s| s.intent.direction != Direction::Revoke));
        }

        #[test]
        fn statements_always_name_privileges(old in policy(), new in policy()) {
            let statements = plan_policy(&diff_policies(&old, &new), &schema(), |_| Ok(true)).unwrap();
            for statement in &statements {
                prop_assert_ne!(statement.intent.privileges, Some(Privileges::empty()));
            }
        }

        #[test]
        fn converged_policies_plan_nothing(policy in policy()) {
            let statements = plan_policy(&diff_policies(&policy, &policy), &schema(), |_| Ok(true)).unwrap();
            prop_assert!(statements.is_empty());
        }
    }
}
