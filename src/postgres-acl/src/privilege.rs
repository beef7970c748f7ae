// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Privilege tokens and the object kinds they apply to.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::capability::{self, CapabilitySet, Feature};
use crate::error::AclError;

bitflags! {
    /// A set of privileges held on one object.
    ///
    /// The bits follow the server's own `ACL_*` layout so that the set can be
    /// decoded from `aclitem` text one character at a time.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Privileges: u32 {
        const INSERT = 1 << 0;
        const SELECT = 1 << 1;
        const UPDATE = 1 << 2;
        const DELETE = 1 << 3;
        const TRUNCATE = 1 << 4;
        const REFERENCES = 1 << 5;
        const TRIGGER = 1 << 6;
        const EXECUTE = 1 << 7;
        const USAGE = 1 << 8;
        const CREATE = 1 << 9;
        const TEMPORARY = 1 << 10;
        const CONNECT = 1 << 11;
        const MAINTAIN = 1 << 14;
    }
}

/// `(privilege, token, aclitem character)` in the order privileges are
/// rendered.
const TOKENS: &[(Privileges, &str, char)] = &[
    (Privileges::SELECT, "SELECT", 'r'),
    (Privileges::INSERT, "INSERT", 'a'),
    (Privileges::UPDATE, "UPDATE", 'w'),
    (Privileges::DELETE, "DELETE", 'd'),
    (Privileges::TRUNCATE, "TRUNCATE", 'D'),
    (Privileges::REFERENCES, "REFERENCES", 'x'),
    (Privileges::TRIGGER, "TRIGGER", 't'),
    (Privileges::MAINTAIN, "MAINTAIN", 'm'),
    (Privileges::EXECUTE, "EXECUTE", 'X'),
    (Privileges::USAGE, "USAGE", 'U'),
    (Privileges::CREATE, "CREATE", 'C'),
    (Privileges::CONNECT, "CONNECT", 'c'),
    (Privileges::TEMPORARY, "TEMPORARY", 'T'),
];

impl Privileges {
    /// Looks up a single privilege by its SQL keyword. Matching is
    /// case-insensitive and `TEMP` is accepted for `TEMPORARY`.
    pub fn from_token(token: &str) -> Option<Privileges> {
        let token = token.trim();
        if token.eq_ignore_ascii_case("TEMP") {
            return Some(Privileges::TEMPORARY);
        }
        TOKENS
            .iter()
            .find(|(_, name, _)| name.eq_ignore_ascii_case(token))
            .map(|(privilege, _, _)| *privilege)
    }

    /// Looks up a single privilege by its `aclitem` character.
    pub fn from_acl_char(c: char) -> Option<Privileges> {
        TOKENS
            .iter()
            .find(|(_, _, code)| *code == c)
            .map(|(privilege, _, _)| *privilege)
    }

    /// The SQL keywords of the privileges in this set, in canonical order.
    pub fn tokens(&self) -> impl Iterator<Item = &'static str> + '_ {
        TOKENS
            .iter()
            .filter(|(privilege, _, _)| self.contains(*privilege))
            .map(|(_, name, _)| *name)
    }

    /// Validates `tokens` against the vocabulary of `kind` and returns their
    /// union. `ALL` expands to the full vocabulary available on the server.
    pub fn parse<S>(kind: ObjectKind, tokens: &[S], caps: &CapabilitySet) -> Result<Privileges, AclError>
    where
        S: AsRef<str>,
    {
        let allowed = kind.vocabulary();
        let mut privileges = Privileges::empty();
        for token in tokens {
            let token = token.as_ref();
            if token.trim().eq_ignore_ascii_case("ALL") {
                privileges |= kind.allowed(caps);
                continue;
            }
            let privilege = match Privileges::from_token(token) {
                Some(privilege) if allowed.contains(privilege) => privilege,
                _ => {
                    return Err(AclError::InvalidPrivilege {
                        token: token.to_owned(),
                        kind,
                    })
                }
            };
            if privilege == Privileges::MAINTAIN {
                caps.require(&capability::MAINTAIN_PRIVILEGE)?;
            }
            privileges |= privilege;
        }
        Ok(privileges)
    }
}

impl fmt::Display for Privileges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in self.tokens() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(token)?;
            first = false;
        }
        Ok(())
    }
}

/// The kinds of objects privileges can be managed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Database,
    Schema,
    Table,
    Sequence,
    Function,
    Procedure,
    Routine,
    Type,
    ForeignDataWrapper,
    ForeignServer,
}

impl ObjectKind {
    pub const ALL: &'static [ObjectKind] = &[
        ObjectKind::Database,
        ObjectKind::Schema,
        ObjectKind::Table,
        ObjectKind::Sequence,
        ObjectKind::Function,
        ObjectKind::Procedure,
        ObjectKind::Routine,
        ObjectKind::Type,
        ObjectKind::ForeignDataWrapper,
        ObjectKind::ForeignServer,
    ];

    /// Every privilege that can ever be granted on this kind of object.
    pub fn vocabulary(&self) -> Privileges {
        match self {
            ObjectKind::Database => {
                Privileges::CREATE | Privileges::CONNECT | Privileges::TEMPORARY
            }
            ObjectKind::Schema => Privileges::CREATE | Privileges::USAGE,
            ObjectKind::Table => {
                Privileges::SELECT
                    | Privileges::INSERT
                    | Privileges::UPDATE
                    | Privileges::DELETE
                    | Privileges::TRUNCATE
                    | Privileges::REFERENCES
                    | Privileges::TRIGGER
                    | Privileges::MAINTAIN
            }
            ObjectKind::Sequence => Privileges::USAGE | Privileges::SELECT | Privileges::UPDATE,
            ObjectKind::Function | ObjectKind::Procedure | ObjectKind::Routine => {
                Privileges::EXECUTE
            }
            ObjectKind::Type | ObjectKind::ForeignDataWrapper | ObjectKind::ForeignServer => {
                Privileges::USAGE
            }
        }
    }

    /// The privileges `ALL` stands for on a server with `caps`.
    pub fn allowed(&self, caps: &CapabilitySet) -> Privileges {
        let mut allowed = self.vocabulary();
        if !caps.supports(&capability::MAINTAIN_PRIVILEGE) {
            allowed.remove(Privileges::MAINTAIN);
        }
        allowed
    }

    /// The feature the server must support before this kind can be named.
    pub fn required_feature(&self) -> Option<&'static Feature> {
        match self {
            ObjectKind::Procedure => Some(&capability::PROCEDURE),
            ObjectKind::Routine => Some(&capability::ROUTINE),
            _ => None,
        }
    }

    /// Whether objects of this kind live inside a schema.
    pub fn is_schema_scoped(&self) -> bool {
        match self {
            ObjectKind::Table
            | ObjectKind::Sequence
            | ObjectKind::Function
            | ObjectKind::Procedure
            | ObjectKind::Routine
            | ObjectKind::Type => true,
            ObjectKind::Database
            | ObjectKind::Schema
            | ObjectKind::ForeignDataWrapper
            | ObjectKind::ForeignServer => false,
        }
    }

    /// The keyword naming one object of this kind in `GRANT ... ON`.
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            ObjectKind::Database => "DATABASE",
            ObjectKind::Schema => "SCHEMA",
            ObjectKind::Table => "TABLE",
            ObjectKind::Sequence => "SEQUENCE",
            ObjectKind::Function => "FUNCTION",
            ObjectKind::Procedure => "PROCEDURE",
            ObjectKind::Routine => "ROUTINE",
            ObjectKind::Type => "TYPE",
            ObjectKind::ForeignDataWrapper => "FOREIGN DATA WRAPPER",
            ObjectKind::ForeignServer => "FOREIGN SERVER",
        }
    }

    /// The plural keyword used by `ON ALL ... IN SCHEMA` and by
    /// `ALTER DEFAULT PRIVILEGES`, for the kinds that support it.
    pub fn plural_keyword(&self) -> Option<&'static str> {
        match self {
            ObjectKind::Table => Some("TABLES"),
            ObjectKind::Sequence => Some("SEQUENCES"),
            ObjectKind::Function => Some("FUNCTIONS"),
            ObjectKind::Procedure => Some("PROCEDURES"),
            ObjectKind::Routine => Some("ROUTINES"),
            ObjectKind::Type => Some("TYPES"),
            ObjectKind::Schema => Some("SCHEMAS"),
            ObjectKind::Database | ObjectKind::ForeignDataWrapper | ObjectKind::ForeignServer => {
                None
            }
        }
    }

    /// Whether `GRANT ... ON ALL <kind> IN SCHEMA` exists for this kind.
    pub fn supports_all_in_schema(&self) -> bool {
        matches!(
            self,
            ObjectKind::Table
                | ObjectKind::Sequence
                | ObjectKind::Function
                | ObjectKind::Procedure
                | ObjectKind::Routine
        )
    }

    /// The `pg_default_acl.defaclobjtype` code, for the kinds default
    /// privileges can be declared on.
    pub fn default_acl_code(&self) -> Option<&'static str> {
        match self {
            ObjectKind::Table => Some("r"),
            ObjectKind::Sequence => Some("S"),
            ObjectKind::Function => Some("f"),
            ObjectKind::Type => Some("T"),
            ObjectKind::Schema => Some("n"),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Database => "database",
            ObjectKind::Schema => "schema",
            ObjectKind::Table => "table",
            ObjectKind::Sequence => "sequence",
            ObjectKind::Function => "function",
            ObjectKind::Procedure => "procedure",
            ObjectKind::Routine => "routine",
            ObjectKind::Type => "type",
            ObjectKind::ForeignDataWrapper => "foreign_data_wrapper",
            ObjectKind::ForeignServer => "foreign_server",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = AclError;

    fn from_str(s: &str) -> Result<ObjectKind, AclError> {
        ObjectKind::ALL
            .iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| AclError::validation("object type", format!("{s:?}")))
    }
}
