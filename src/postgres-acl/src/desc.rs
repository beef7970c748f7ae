// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Desired-state descriptors.
//!
//! Descriptors arrive from the lifecycle adapter as plain data. Each is
//! validated exactly once, against the capabilities of the connected server,
//! into a typed form that the orchestrators work from. Validation issues no
//! SQL.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::acl::{AclEntry, Grantee, RolePolicy};
use crate::capability::{self, CapabilitySet};
use crate::error::AclError;
use crate::privilege::{ObjectKind, Privileges};
use crate::sql::PrivilegeTarget;

/// Privileges held by `role` on the addressed objects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSpec {
    /// The grantee. `public` or the empty string for `PUBLIC`.
    pub role: String,
    pub database: String,
    /// Required for schema-scoped kinds and for the schema kind itself.
    #[serde(default)]
    pub schema: Option<String>,
    pub object_kind: ObjectKind,
    /// Specific objects to address. Empty means every object of the kind in
    /// the schema, for the kinds that support it.
    #[serde(default)]
    pub objects: Vec<String>,
    pub privileges: Vec<String>,
    /// The subset of `privileges` the grantee may grant onwards.
    #[serde(default)]
    pub grant_options: Vec<String>,
}

/// A validated [`GrantSpec`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedGrant {
    pub database: String,
    pub schema: Option<String>,
    pub kind: ObjectKind,
    /// Sorted and deduplicated.
    pub objects: Vec<String>,
    pub target: PrivilegeTarget,
    pub entry: AclEntry,
}

impl GrantSpec {
    pub fn validate(&self, caps: &CapabilitySet) -> Result<ValidatedGrant, AclError> {
        let kind = self.object_kind;
        require_nonempty("database", &self.database)?;
        if let Some(feature) = kind.required_feature() {
            caps.require(feature)?;
        }

        let objects: Vec<String> = self.objects.iter().cloned().sorted().dedup().collect();
        if objects.iter().any(|o| o.is_empty()) {
            return Err(AclError::validation("objects", "object names must not be empty"));
        }
        let schema = self.schema.clone().filter(|s| !s.is_empty());

        let target = match kind {
            ObjectKind::Database => {
                forbid_schema(kind, &schema)?;
                forbid_objects(kind, &objects)?;
                PrivilegeTarget::Database(self.database.clone())
            }
            ObjectKind::Schema => {
                forbid_objects(kind, &objects)?;
                PrivilegeTarget::Schema(require_schema(kind, &schema)?)
            }
            ObjectKind::ForeignDataWrapper | ObjectKind::ForeignServer => {
                forbid_schema(kind, &schema)?;
                require_objects(kind, &objects)?;
                PrivilegeTarget::Global {
                    kind,
                    objects: objects.clone(),
                }
            }
            _ => {
                let schema = require_schema(kind, &schema)?;
                if !kind.supports_all_in_schema() {
                    require_objects(kind, &objects)?;
                }
                PrivilegeTarget::InSchema {
                    kind,
                    schema,
                    objects: objects.clone(),
                }
            }
        };

        let privileges = Privileges::parse(kind, &self.privileges, caps)?;
        let grant_options = Privileges::parse(kind, &self.grant_options, caps)?;
        let entry = AclEntry::new(Grantee::parse(&self.role), privileges, grant_options)?;

        Ok(ValidatedGrant {
            database: self.database.clone(),
            schema,
            kind,
            objects,
            target,
            entry,
        })
    }
}

impl ValidatedGrant {
    /// The composite identifier `role_database[_schema]_kind[_object...]`.
    pub fn id(&self) -> String {
        let mut parts = vec![role_part(self.entry.grantee()), self.database.clone()];
        parts.extend(self.schema.clone());
        parts.push(self.kind.to_string());
        parts.extend(self.objects.iter().cloned());
        join_id(&parts, '_')
    }

    /// Whether the grant applies to a server-global object.
    pub fn is_global(&self) -> bool {
        self.kind == ObjectKind::Database
    }

    /// Whether `other` addresses the same objects for the same grantee.
    pub fn same_address(&self, other: &ValidatedGrant) -> bool {
        self.entry.grantee().key() == other.entry.grantee().key()
            && self.database == other.database
            && self.schema == other.schema
            && self.kind == other.kind
            && self.objects == other.objects
    }
}

/// Privileges `role` receives on objects `owner` creates in the future.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPrivilegesSpec {
    pub role: String,
    pub database: String,
    /// Restricts the defaults to objects created in this schema.
    #[serde(default)]
    pub schema: Option<String>,
    pub owner: String,
    pub object_kind: ObjectKind,
    pub privileges: Vec<String>,
    #[serde(default)]
    pub grant_options: Vec<String>,
}

/// A validated [`DefaultPrivilegesSpec`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedDefaultPrivileges {
    pub database: String,
    pub schema: Option<String>,
    pub owner: String,
    pub kind: ObjectKind,
    pub target: PrivilegeTarget,
    pub entry: AclEntry,
}

impl DefaultPrivilegesSpec {
    pub fn validate(&self, caps: &CapabilitySet) -> Result<ValidatedDefaultPrivileges, AclError> {
        let kind = self.object_kind;
        require_nonempty("database", &self.database)?;
        require_nonempty("owner", &self.owner)?;
        if kind.default_acl_code().is_none() {
            return Err(AclError::validation(
                "object type",
                format!("default privileges cannot be declared on {kind} objects"),
            ));
        }
        let schema = self.schema.clone().filter(|s| !s.is_empty());
        if kind == ObjectKind::Schema {
            caps.require(&capability::DEFAULT_PRIVILEGES_ON_SCHEMAS)?;
            forbid_schema(kind, &schema)?;
        }

        let privileges = Privileges::parse(kind, &self.privileges, caps)?;
        let grant_options = Privileges::parse(kind, &self.grant_options, caps)?;
        let entry = AclEntry::new(Grantee::parse(&self.role), privileges, grant_options)?;

        Ok(ValidatedDefaultPrivileges {
            database: self.database.clone(),
            target: PrivilegeTarget::Defaults {
                owner: self.owner.clone(),
                schema: schema.clone(),
                kind,
            },
            schema,
            owner: self.owner.clone(),
            kind,
            entry,
        })
    }
}

impl ValidatedDefaultPrivileges {
    /// The composite identifier `role_database_schema_owner_kind`. The schema
    /// component is empty for defaults that apply everywhere.
    pub fn id(&self) -> String {
        let parts = [
            role_part(self.entry.grantee()),
            self.database.clone(),
            self.schema.clone().unwrap_or_default(),
            self.owner.clone(),
            self.kind.to_string(),
        ];
        join_id(&parts, '_')
    }

    pub fn same_address(&self, other: &ValidatedDefaultPrivileges) -> bool {
        self.id() == other.id()
    }
}

/// One role's entry in a schema's policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecl {
    pub role: String,
    #[serde(default)]
    pub privileges: Vec<String>,
    #[serde(default)]
    pub grant_options: Vec<String>,
}

impl PolicyDecl {
    pub fn to_entry(&self, kind: ObjectKind, caps: &CapabilitySet) -> Result<AclEntry, AclError> {
        let privileges = Privileges::parse(kind, &self.privileges, caps)?;
        let grant_options = Privileges::parse(kind, &self.grant_options, caps)?;
        AclEntry::new(Grantee::parse(&self.role), privileges, grant_options)
    }
}

/// A schema, its owner, and the privileges other roles hold on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub database: String,
    pub name: String,
    /// Defaults to the connecting role.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub if_not_exists: bool,
    /// Drop contained objects along with the schema.
    #[serde(default)]
    pub drop_cascade: bool,
    #[serde(default)]
    pub policies: Vec<PolicyDecl>,
}

/// A validated [`SchemaSpec`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedSchema {
    pub database: String,
    pub name: String,
    pub owner: Option<String>,
    pub if_not_exists: bool,
    pub drop_cascade: bool,
    pub policy: RolePolicy,
}

impl SchemaSpec {
    pub fn validate(&self, caps: &CapabilitySet) -> Result<ValidatedSchema, AclError> {
        require_nonempty("database", &self.database)?;
        require_nonempty("schema name", &self.name)?;
        if self.if_not_exists {
            caps.require(&capability::SCHEMA_CREATE_IF_NOT_EXISTS)?;
        }
        let policy = RolePolicy::from_declarations(&self.policies, ObjectKind::Schema, caps)?;
        Ok(ValidatedSchema {
            database: self.database.clone(),
            name: self.name.clone(),
            owner: self.owner.clone().filter(|o| !o.is_empty()),
            if_not_exists: self.if_not_exists,
            drop_cascade: self.drop_cascade,
            policy,
        })
    }
}

impl ValidatedSchema {
    /// The composite identifier `database.schema`.
    pub fn id(&self) -> String {
        join_id(&[self.database.clone(), self.name.clone()], '.')
    }
}

/// Joins id components with `sep`. Occurrences of `sep` and `\` inside a
/// component are escaped with `\`, so distinct addresses never share an id.
fn join_id(parts: &[String], sep: char) -> String {
    let mut id = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            id.push(sep);
        }
        for c in part.chars() {
            if c == sep || c == '\\' {
                id.push('\\');
            }
            id.push(c);
        }
    }
    id
}

fn role_part(grantee: &Grantee) -> String {
    grantee.role_name().unwrap_or("public").to_owned()
}

fn require_nonempty(what: &'static str, value: &str) -> Result<(), AclError> {
    if value.is_empty() {
        return Err(AclError::validation(what, "must not be empty"));
    }
    Ok(())
}

fn require_schema(kind: ObjectKind, schema: &Option<String>) -> Result<String, AclError> {
    schema
        .clone()
        .ok_or_else(|| AclError::validation("schema", format!("required for {kind} grants")))
}

fn forbid_schema(kind: ObjectKind, schema: &Option<String>) -> Result<(), AclError> {
    match schema {
        Some(schema) => Err(AclError::validation(
            "schema",
            format!("{schema:?} cannot be set for {kind} objects"),
        )),
        None => Ok(()),
    }
}

fn require_objects(kind: ObjectKind, objects: &[String]) -> Result<(), AclError> {
    if objects.is_empty() {
        return Err(AclError::validation(
            "objects",
            format!("{kind} grants must name at least one object"),
        ));
    }
    Ok(())
}

fn forbid_objects(kind: ObjectKind, objects: &[String]) -> Result<(), AclError> {
    if !objects.is_empty() {
        return Err(AclError::validation(
            "objects",
            format!("cannot be set for {kind} grants"),
        ));
    }
    Ok(())
}
