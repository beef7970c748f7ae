// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The normalized privilege model.
//!
//! An [`AclEntry`] says which privileges one grantee holds on one object and
//! which of those it may grant onwards. A [`RolePolicy`] collects the entries
//! of several grantees on the same object, keyed case-insensitively by role
//! name, and merges repeated declarations for the same role.

use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

use crate::capability::CapabilitySet;
use crate::desc::PolicyDecl;
use crate::error::AclError;
use crate::privilege::{ObjectKind, Privileges};

/// The recipient of a privilege.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Grantee {
    /// The `PUBLIC` pseudo-role, which every role is implicitly a member of.
    Public,
    Role(String),
}

impl Grantee {
    /// Interprets a declared role name. The empty string and `public` (in any
    /// case) denote the `PUBLIC` pseudo-role.
    pub fn parse(name: &str) -> Grantee {
        if name.is_empty() || name.eq_ignore_ascii_case("public") {
            Grantee::Public
        } else {
            Grantee::Role(name.to_owned())
        }
    }

    pub fn key(&self) -> RoleKey {
        match self {
            Grantee::Public => RoleKey::public(),
            Grantee::Role(name) => RoleKey::new(name),
        }
    }

    pub fn role_name(&self) -> Option<&str> {
        match self {
            Grantee::Public => None,
            Grantee::Role(name) => Some(name),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Grantee::Public)
    }
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grantee::Public => f.write_str("PUBLIC"),
            Grantee::Role(name) => write!(f, "role {name:?}"),
        }
    }
}

/// A lower-cased role name used to match policy entries. The empty key is
/// `PUBLIC`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoleKey(String);

impl RoleKey {
    pub fn new(name: &str) -> RoleKey {
        if name.eq_ignore_ascii_case("public") {
            return RoleKey::public();
        }
        RoleKey(name.to_lowercase())
    }

    pub fn public() -> RoleKey {
        RoleKey(String::new())
    }

    pub fn is_public(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_public() {
            f.write_str("PUBLIC")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// The privileges one grantee holds on one object.
///
/// Invariant: `grant_options` is a subset of `privileges`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclEntry {
    grantee: Grantee,
    privileges: Privileges,
    grant_options: Privileges,
}

impl AclEntry {
    pub fn new(
        grantee: Grantee,
        privileges: Privileges,
        grant_options: Privileges,
    ) -> Result<AclEntry, AclError> {
        if !privileges.contains(grant_options) {
            return Err(AclError::validation(
                "grant options",
                format!(
                    "{} may not hold grant options on {} without holding the privileges",
                    grantee,
                    grant_options.difference(privileges)
                ),
            ));
        }
        if grantee.is_public() && !grant_options.is_empty() {
            return Err(AclError::validation(
                "grant options",
                "grant options can only be granted to roles, not PUBLIC",
            ));
        }
        Ok(AclEntry {
            grantee,
            privileges,
            grant_options,
        })
    }

    pub fn grantee(&self) -> &Grantee {
        &self.grantee
    }

    pub fn privileges(&self) -> Privileges {
        self.privileges
    }

    pub fn grant_options(&self) -> Privileges {
        self.grant_options
    }

    /// Privileges held without the right to grant them onwards.
    pub fn plain_privileges(&self) -> Privileges {
        self.privileges.difference(self.grant_options)
    }

    /// Combines two declarations for the same grantee. The result holds the
    /// union of both privilege sets and both grant option sets, and keeps the
    /// spelling of `self`'s grantee.
    pub fn merge(&self, other: &AclEntry) -> AclEntry {
        AclEntry {
            grantee: self.grantee.clone(),
            privileges: self.privileges | other.privileges,
            grant_options: self.grant_options | other.grant_options,
        }
    }

    /// Compares the privileges and grant options of two entries, ignoring how
    /// the grantee is spelled.
    pub fn same_privileges(&self, other: &AclEntry) -> bool {
        self.privileges == other.privileges && self.grant_options == other.grant_options
    }
}

/// One decoded element of an `aclitem[]` column, e.g. `alice=r*w/owner`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclItem {
    pub grantee: Grantee,
    pub grantor: String,
    pub privileges: Privileges,
    pub grant_options: Privileges,
}

impl AclItem {
    /// Parses the text representation of an `aclitem`.
    pub fn parse(s: &str) -> Result<AclItem, AclError> {
        let invalid = |detail: &str| AclError::validation("aclitem", format!("{s:?}: {detail}"));

        let (grantee, rest) = take_role_name(s, '=').ok_or_else(|| invalid("missing '='"))?;
        let (privs, grantor) = match rest.split_once('/') {
            Some((privs, grantor)) => (privs, grantor),
            None => return Err(invalid("missing grantor")),
        };
        let (grantor, tail) = take_role_name(grantor, '\0').ok_or_else(|| invalid("bad grantor"))?;
        if !tail.is_empty() {
            return Err(invalid("trailing characters"));
        }

        let mut privileges = Privileges::empty();
        let mut grant_options = Privileges::empty();
        let mut last = None;
        for c in privs.chars() {
            if c == '*' {
                match last {
                    Some(privilege) => grant_options |= privilege,
                    None => return Err(invalid("dangling '*'")),
                }
                continue;
            }
            let privilege = Privileges::from_acl_char(c)
                .ok_or_else(|| invalid(&format!("unknown privilege character {c:?}")))?;
            privileges |= privilege;
            last = Some(privilege);
        }

        Ok(AclItem {
            grantee: Grantee::parse(&grantee),
            grantor,
            privileges,
            grant_options,
        })
    }

    pub fn into_entry(self) -> AclEntry {
        AclEntry {
            grantee: self.grantee,
            privileges: self.privileges,
            grant_options: self.grant_options,
        }
    }
}

/// Reads a possibly double-quoted role name up to the unquoted `terminator`
/// (or the end of input when the terminator is `'\0'`). Returns the unquoted
/// name and the input following the terminator.
fn take_role_name(s: &str, terminator: char) -> Option<(String, &str)> {
    let mut name = String::new();
    let mut chars = s.char_indices().peekable();
    let mut quoted = false;
    while let Some((i, c)) = chars.next() {
        match c {
            '"' if quoted => {
                if let Some((_, '"')) = chars.peek() {
                    chars.next();
                    name.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' => quoted = true,
            c if c == terminator && !quoted => return Some((name, &s[i + c.len_utf8()..])),
            c => name.push(c),
        }
    }
    if terminator == '\0' && !quoted {
        Some((name, ""))
    } else {
        None
    }
}

/// The policy of several grantees on one object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolePolicy {
    entries: BTreeMap<RoleKey, AclEntry>,
}

impl RolePolicy {
    pub fn new() -> RolePolicy {
        RolePolicy::default()
    }

    /// Adds `entry`, merging it into any entry already present for the same
    /// role key. An entry without privileges contributes nothing and is not
    /// recorded.
    pub fn insert(&mut self, entry: AclEntry) {
        if entry.privileges.is_empty() {
            return;
        }
        match self.entries.entry(entry.grantee.key()) {
            btree_map::Entry::Occupied(mut existing) => {
                let merged = existing.get().merge(&entry);
                existing.insert(merged);
            }
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
    }

    /// Validates declarations against the vocabulary of `kind` and merges
    /// those naming the same role.
    pub fn from_declarations(
        decls: &[PolicyDecl],
        kind: ObjectKind,
        caps: &CapabilitySet,
    ) -> Result<RolePolicy, AclError> {
        let mut policy = RolePolicy::new();
        for decl in decls {
            policy.insert(decl.to_entry(kind, caps)?);
        }
        Ok(policy)
    }

    /// Builds a policy from decoded `aclitem`s. Items granted to `owner` are
    /// skipped: ownership already implies every privilege.
    pub fn from_acl_items<I>(items: I, owner: Option<&str>) -> RolePolicy
    where
        I: IntoIterator<Item = AclItem>,
    {
        let mut policy = RolePolicy::new();
        for item in items {
            if let (Some(owner), Grantee::Role(name)) = (owner, &item.grantee) {
                if name == owner {
                    continue;
                }
            }
            policy.insert(item.into_entry());
        }
        policy
    }

    /// A copy of this policy without `role`'s entry.
    pub fn without(&self, role: &str) -> RolePolicy {
        let mut policy = self.clone();
        policy.entries.remove(&RoleKey::new(role));
        policy
    }

    pub fn get(&self, role: &str) -> Option<&AclEntry> {
        self.entries.get(&RoleKey::new(role))
    }

    pub fn get_key(&self, key: &RoleKey) -> Option<&AclEntry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RoleKey, &AclEntry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RoleKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<AclEntry> for RolePolicy {
    fn from_iter<I: IntoIterator<Item = AclEntry>>(iter: I) -> RolePolicy {
        let mut policy = RolePolicy::new();
        for entry in iter {
            policy.insert(entry);
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::capability::ServerVersion;

    fn entry(role: &str, privileges: Privileges, grant_options: Privileges) -> AclEntry {
        AclEntry::new(Grantee::parse(role), privileges, grant_options).unwrap()
    }

    #[test]
    fn parses_acl_items() {
        let item = AclItem::parse("alice=r*wU/postgres").unwrap();
        assert_eq!(item.grantee, Grantee::Role("alice".into()));
        assert_eq!(item.grantor, "postgres");
        assert_eq!(
            item.privileges,
            Privileges::SELECT | Privileges::UPDATE | Privileges::USAGE
        );
        assert_eq!(item.grant_options, Privileges::SELECT);

        let item = AclItem::parse("=UC/owner").unwrap();
        assert_eq!(item.grantee, Grantee::Public);
        assert_eq!(item.privileges, Privileges::USAGE | Privileges::CREATE);

        let item = AclItem::parse(r#""we""ird=role"=c/"own er""#).unwrap();
        assert_eq!(item.grantee, Grantee::Role(r#"we"ird=role"#.into()));
        assert_eq!(item.grantor, "own er");
        assert_eq!(item.privileges, Privileges::CONNECT);
    }

    #[test]
    fn rejects_malformed_acl_items() {
        for bad in ["alice", "alice=r", "alice=q/bob", "alice=*r/bob", "\"alice=r/bob"] {
            assert!(AclItem::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn grant_options_must_be_held() {
        let err = AclEntry::new(Grantee::parse("r"), Privileges::USAGE, Privileges::CREATE)
            .unwrap_err();
        assert!(err.to_string().contains("CREATE"), "{err}");
    }

    #[test]
    fn entries_without_privileges_are_not_recorded() {
        let decls = [
            PolicyDecl {
                role: "idle".into(),
                privileges: vec![],
                grant_options: vec![],
            },
            PolicyDecl {
                role: "reader".into(),
                privileges: vec!["USAGE".into()],
                grant_options: vec![],
            },
        ];
        let caps = CapabilitySet::new(ServerVersion::new(15, 0));
        let policy = RolePolicy::from_declarations(&decls, ObjectKind::Schema, &caps).unwrap();
        assert_eq!(policy.len(), 1);
        assert!(policy.get("idle").is_none());
        assert!(policy.get("reader").is_some());
    }

    #[test]
    fn policies_merge_case_insensitively() {
        let policy: RolePolicy = vec![
            entry("Alice", Privileges::USAGE, Privileges::empty()),
            entry("alice", Privileges::CREATE, Privileges::CREATE),
            entry("", Privileges::USAGE, Privileges::empty()),
            entry("PUBLIC", Privileges::CREATE, Privileges::empty()),
        ]
        .into_iter()
        .collect();

        assert_eq!(policy.len(), 2);
        let alice = policy.get("ALICE").unwrap();
        assert_eq!(alice.grantee(), &Grantee::Role("Alice".into()));
        assert_eq!(alice.privileges(), Privileges::USAGE | Privileges::CREATE);
        assert_eq!(alice.grant_options(), Privileges::CREATE);
        assert_eq!(alice.plain_privileges(), Privileges::USAGE);

        let public = policy.get_key(&RoleKey::public()).unwrap();
        assert!(public.grantee().is_public());
        assert_eq!(public.privileges(), Privileges::USAGE | Privileges::CREATE);
    }

    #[test]
    fn owner_items_are_implicit() {
        let items = ["owner=UC/owner", "reader=U/owner", "=U/owner"]
            .iter()
            .map(|s| AclItem::parse(s).unwrap());
        let policy = RolePolicy::from_acl_items(items, Some("owner"));
        assert_eq!(policy.len(), 2);
        assert!(policy.get("owner").is_none());
        assert!(policy.get("reader").is_some());
        assert_eq!(policy.without("Reader").len(), 1);
        assert_eq!(policy.len(), 2);
    }

    fn privileges() -> impl Strategy<Value = Privileges> {
        any::<u32>().prop_map(Privileges::from_bits_truncate)
    }

    fn entries() -> impl Strategy<Value = (AclEntry, AclEntry)> {
        (privileges(), privileges(), privileges(), privileges()).prop_map(|(p1, g1, p2, g2)| {
            (
                entry("role", p1, g1 & p1),
                entry("ROLE", p2, g2 & p2),
            )
        })
    }

    proptest! {
        #[test]
        fn merge_is_a_commutative_union((a, b) in entries()) {
            let ab = a.merge(&b);
            let ba = b.merge(&a);
            prop_assert!(ab.same_privileges(&ba));
            prop_assert_eq!(ab.privileges(), a.privileges() | b.privileges());
            prop_assert_eq!(ab.grant_options(), a.grant_options() | b.grant_options());
            prop_assert!(ab.privileges().contains(ab.grant_options()));
        }

        #[test]
        fn merge_is_associative((a, b) in entries(), (c, _) in entries()) {
            let left = a.merge(&b).merge(&c);
            let right = a.merge(&b.merge(&c));
            prop_assert!(left.same_privileges(&right));
        }
    }
}
