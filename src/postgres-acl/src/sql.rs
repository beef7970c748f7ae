// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! SQL text for privilege, membership and schema statements.
//!
//! Every identifier is quoted with [`escape_identifier`]; no user-supplied
//! name reaches the server unescaped.

use itertools::Itertools;
use postgres_protocol::escape::escape_identifier;

use crate::acl::Grantee;
use crate::plan::IntentTarget;
use crate::privilege::{ObjectKind, Privileges};

/// The objects a `GRANT` or `REVOKE` statement applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrivilegeTarget {
    Database(String),
    Schema(String),
    /// Objects inside `schema`. No objects means every object of the kind in
    /// the schema.
    InSchema {
        kind: ObjectKind,
        schema: String,
        objects: Vec<String>,
    },
    /// Named objects that do not live in a schema.
    Global {
        kind: ObjectKind,
        objects: Vec<String>,
    },
    /// Privileges applied to objects `owner` creates in the future.
    Defaults {
        owner: String,
        schema: Option<String>,
        kind: ObjectKind,
    },
}

impl PrivilegeTarget {
    pub fn grant(&self, grantee: &Grantee, privileges: Privileges, with_grant_option: bool) -> String {
        let grantee = grantee_sql(grantee);
        let privileges = privileges_sql(Some(privileges));
        let option = if with_grant_option {
            " WITH GRANT OPTION"
        } else {
            ""
        };
        match self {
            PrivilegeTarget::Defaults { .. } => format!(
                "{} GRANT {privileges} ON {} TO {grantee}{option}",
                self.defaults_prefix(),
                self.on_clause()
            ),
            _ => format!(
                "GRANT {privileges} ON {} TO {grantee}{option}",
                self.on_clause()
            ),
        }
    }

    /// Revokes `privileges`, or every privilege when `None`, along with the
    /// matching grant options.
    pub fn revoke(&self, grantee: &Grantee, privileges: Option<Privileges>) -> String {
        let grantee = grantee_sql(grantee);
        let privileges = privileges_sql(privileges);
        match self {
            PrivilegeTarget::Defaults { .. } => format!(
                "{} REVOKE {privileges} ON {} FROM {grantee}",
                self.defaults_prefix(),
                self.on_clause()
            ),
            _ => format!(
                "REVOKE {privileges} ON {} FROM {grantee}",
                self.on_clause()
            ),
        }
    }

    /// A human-readable rendering for error messages.
    pub fn describe(&self) -> IntentTarget {
        let text = match self {
            PrivilegeTarget::Database(name) => format!("database {name:?}"),
            PrivilegeTarget::Schema(name) => format!("schema {name:?}"),
            PrivilegeTarget::InSchema {
                kind,
                schema,
                objects,
            } if objects.is_empty() => {
                format!("all {kind} objects in schema {schema:?}")
            }
            PrivilegeTarget::InSchema {
                kind,
                schema,
                objects,
            } => format!(
                "{kind} {}",
                objects
                    .iter()
                    .map(|object| format!("{schema:?}.{object:?}"))
                    .join(", ")
            ),
            PrivilegeTarget::Global { kind, objects } => format!(
                "{kind} {}",
                objects.iter().map(|object| format!("{object:?}")).join(", ")
            ),
            PrivilegeTarget::Defaults {
                owner,
                schema: Some(schema),
                kind,
            } => format!("default {kind} privileges of role {owner:?} in schema {schema:?}"),
            PrivilegeTarget::Defaults {
                owner,
                schema: None,
                kind,
            } => format!("default {kind} privileges of role {owner:?}"),
        };
        IntentTarget::new(text)
    }

    fn defaults_prefix(&self) -> String {
        match self {
            PrivilegeTarget::Defaults {
                owner,
                schema: Some(schema),
                ..
            } => format!(
                "ALTER DEFAULT PRIVILEGES FOR ROLE {} IN SCHEMA {}",
                escape_identifier(owner),
                escape_identifier(schema)
            ),
            PrivilegeTarget::Defaults { owner, .. } => format!(
                "ALTER DEFAULT PRIVILEGES FOR ROLE {}",
                escape_identifier(owner)
            ),
            _ => String::new(),
        }
    }

    fn on_clause(&self) -> String {
        match self {
            PrivilegeTarget::Database(name) => format!("DATABASE {}", escape_identifier(name)),
            PrivilegeTarget::Schema(name) => format!("SCHEMA {}", escape_identifier(name)),
            PrivilegeTarget::InSchema {
                kind,
                schema,
                objects,
            } if objects.is_empty() => format!(
                "ALL {} IN SCHEMA {}",
                kind.plural_keyword().unwrap_or_default(),
                escape_identifier(schema)
            ),
            PrivilegeTarget::InSchema {
                kind,
                schema,
                objects,
            } => format!(
                "{} {}",
                kind.sql_keyword(),
                objects
                    .iter()
                    .map(|object| qualified_name(schema, object))
                    .join(", ")
            ),
            PrivilegeTarget::Global { kind, objects } => format!(
                "{} {}",
                kind.sql_keyword(),
                objects.iter().map(|object| escape_identifier(object)).join(", ")
            ),
            PrivilegeTarget::Defaults { kind, .. } => {
                kind.plural_keyword().unwrap_or_default().to_owned()
            }
        }
    }
}

pub fn qualified_name(schema: &str, object: &str) -> String {
    format!("{}.{}", escape_identifier(schema), escape_identifier(object))
}

pub fn grantee_sql(grantee: &Grantee) -> String {
    match grantee {
        Grantee::Public => "PUBLIC".to_owned(),
        Grantee::Role(name) => escape_identifier(name),
    }
}

fn privileges_sql(privileges: Option<Privileges>) -> String {
    match privileges {
        None => "ALL PRIVILEGES".to_owned(),
        Some(privileges) => privileges.tokens().join(", "),
    }
}

pub fn grant_membership(role: &str, member: &str) -> String {
    format!(
        "GRANT {} TO {}",
        escape_identifier(role),
        escape_identifier(member)
    )
}

pub fn revoke_membership(role: &str, member: &str) -> String {
    format!(
        "REVOKE {} FROM {}",
        escape_identifier(role),
        escape_identifier(member)
    )
}

pub fn create_schema(name: &str, owner: &str, if_not_exists: bool) -> String {
    format!(
        "CREATE SCHEMA {}{} AUTHORIZATION {}",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        escape_identifier(name),
        escape_identifier(owner)
    )
}

pub fn rename_schema(from: &str, to: &str) -> String {
    format!(
        "ALTER SCHEMA {} RENAME TO {}",
        escape_identifier(from),
        escape_identifier(to)
    )
}

pub fn alter_schema_owner(name: &str, owner: &str) -> String {
    format!(
        "ALTER SCHEMA {} OWNER TO {}",
        escape_identifier(name),
        escape_identifier(owner)
    )
}

pub fn drop_schema(name: &str, cascade: bool) -> String {
    format!(
        "DROP SCHEMA IF EXISTS {} {}",
        escape_identifier(name),
        if cascade { "CASCADE" } else { "RESTRICT" }
    )
}
