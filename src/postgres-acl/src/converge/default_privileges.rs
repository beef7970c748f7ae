// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Default privileges: privileges a role receives on objects another role
//! creates in the future.

use postgres::{GenericClient, Transaction};
use tracing::info;

use crate::acl::{AclEntry, Grantee, RolePolicy};
use crate::catalog;
use crate::capability::CapabilitySet;
use crate::converge::{execute, is_missing_database, transact, Engine};
use crate::desc::{DefaultPrivilegesSpec, ValidatedDefaultPrivileges};
use crate::error::AclError;
use crate::impersonate::with_roles_granted;
use crate::plan::{self, diff_policies};
use crate::privilege::{ObjectKind, Privileges};

/// Default privileges as read back from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultPrivilegesState {
    pub id: String,
    pub role: String,
    pub database: String,
    pub schema: Option<String>,
    pub owner: String,
    pub object_kind: ObjectKind,
    pub privileges: Privileges,
    pub grant_options: Privileges,
}

impl Engine {
    pub fn create_default_privileges(
        &self,
        spec: &DefaultPrivilegesSpec,
    ) -> Result<DefaultPrivilegesState, AclError> {
        let mut conn = self.connect(&spec.database)?;
        let defaults = spec.validate(conn.capabilities())?;

        let (client, caps) = conn.split();
        transact(client, |tx| {
            require_address(tx, &defaults)?;
            let observed = observe_entry(tx, &defaults)?.unwrap_or_else(|| defaults.entry.clone());
            converge(tx, caps, &defaults, &observed, &defaults.entry)
        })?;
        info!(id = %defaults.id(), "created default privileges");

        self.reread_default_privileges(&defaults)
    }

    /// Returns `None` if the owner, the grantee, the schema or the database
    /// no longer exists.
    pub fn read_default_privileges(
        &self,
        spec: &DefaultPrivilegesSpec,
    ) -> Result<Option<DefaultPrivilegesState>, AclError> {
        let mut conn = match self.connect(&spec.database) {
            Ok(conn) => conn,
            Err(e) if is_missing_database(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let defaults = spec.validate(conn.capabilities())?;
        let observed = transact(conn.client(), |tx| observe_entry(tx, &defaults))?;
        Ok(observed.map(|entry| state(&defaults, &entry)))
    }

    /// Converges from `prior` to `desired`. A change of address revokes the
    /// prior defaults and grants the desired ones in one transaction.
    pub fn update_default_privileges(
        &self,
        prior: &DefaultPrivilegesSpec,
        desired: &DefaultPrivilegesSpec,
    ) -> Result<DefaultPrivilegesState, AclError> {
        if prior.database != desired.database {
            self.delete_default_privileges(prior)?;
            return self.create_default_privileges(desired);
        }
        let mut conn = self.connect(&desired.database)?;
        let prior_defaults = prior.validate(conn.capabilities())?;
        let defaults = desired.validate(conn.capabilities())?;
        if prior_defaults == defaults {
            return self.reread_default_privileges(&defaults);
        }

        let (client, caps) = conn.split();
        transact(client, |tx| {
            require_address(tx, &defaults)?;
            if prior_defaults.same_address(&defaults) {
                converge(tx, caps, &defaults, &prior_defaults.entry, &defaults.entry)
            } else {
                if address_exists(tx, &prior_defaults)? {
                    let empty = AclEntry::new(
                        prior_defaults.entry.grantee().clone(),
                        Privileges::empty(),
                        Privileges::empty(),
                    )?;
                    converge(tx, caps, &prior_defaults, &prior_defaults.entry, &empty)?;
                }
                let observed =
                    observe_entry(tx, &defaults)?.unwrap_or_else(|| defaults.entry.clone());
                converge(tx, caps, &defaults, &observed, &defaults.entry)
            }
        })?;
        info!(prior = %prior_defaults.id(), id = %defaults.id(), "updated default privileges");

        self.reread_default_privileges(&defaults)
    }

    /// Revokes the declared default privileges. Does nothing if the owner,
    /// the grantee or the schema is already gone.
    pub fn delete_default_privileges(&self, spec: &DefaultPrivilegesSpec) -> Result<(), AclError> {
        let mut conn = self.connect(&spec.database)?;
        let defaults = spec.validate(conn.capabilities())?;
        let (client, caps) = conn.split();
        transact(client, |tx| {
            if !address_exists(tx, &defaults)? {
                info!(id = %defaults.id(), "default privileges target no longer exists");
                return Ok(());
            }
            let empty = AclEntry::new(
                defaults.entry.grantee().clone(),
                Privileges::empty(),
                Privileges::empty(),
            )?;
            converge(tx, caps, &defaults, &defaults.entry, &empty)
        })?;
        info!(id = %defaults.id(), "deleted default privileges");
        Ok(())
    }

    fn reread_default_privileges(
        &self,
        defaults: &ValidatedDefaultPrivileges,
    ) -> Result<DefaultPrivilegesState, AclError> {
        let mut conn = self.connect(&defaults.database)?;
        let observed = transact(conn.client(), |tx| observe_entry(tx, defaults))?;
        observed
            .map(|entry| state(defaults, &entry))
            .ok_or_else(|| AclError::NotFound {
                kind: "default privileges",
                name: defaults.id(),
            })
    }
}

fn state(defaults: &ValidatedDefaultPrivileges, entry: &AclEntry) -> DefaultPrivilegesState {
    DefaultPrivilegesState {
        id: defaults.id(),
        role: defaults
            .entry
            .grantee()
            .role_name()
            .unwrap_or("public")
            .to_owned(),
        database: defaults.database.clone(),
        schema: defaults.schema.clone(),
        owner: defaults.owner.clone(),
        object_kind: defaults.kind,
        privileges: entry.privileges(),
        grant_options: entry.grant_options(),
    }
}

fn policy_of(entry: &AclEntry) -> RolePolicy {
    RolePolicy::from_iter([entry.clone()])
}

/// Plans and executes the change from `old` to `new` as the owner.
fn converge(
    tx: &mut Transaction<'_>,
    caps: &CapabilitySet,
    defaults: &ValidatedDefaultPrivileges,
    old: &AclEntry,
    new: &AclEntry,
) -> Result<(), AclError> {
    let diff = diff_policies(&policy_of(old), &policy_of(new));
    if diff.is_noop() {
        return Ok(());
    }
    let statements = plan::plan_policy(&diff, &defaults.target, |role| {
        catalog::role_exists(tx, role)
    })?;
    let owner = catalog::require_role_identity(tx, &defaults.owner)?;
    with_roles_granted(tx, caps, &[owner], |tx| execute(tx, &statements))
}

fn address_exists<C: GenericClient>(
    client: &mut C,
    defaults: &ValidatedDefaultPrivileges,
) -> Result<bool, AclError> {
    if !catalog::role_exists(client, &defaults.owner)? {
        return Ok(false);
    }
    if let Grantee::Role(name) = defaults.entry.grantee() {
        if !catalog::role_exists(client, name)? {
            return Ok(false);
        }
    }
    match &defaults.schema {
        Some(schema) => catalog::schema_exists(client, schema),
        None => Ok(true),
    }
}

fn require_address<C: GenericClient>(
    client: &mut C,
    defaults: &ValidatedDefaultPrivileges,
) -> Result<(), AclError> {
    catalog::require_role_identity(client, &defaults.owner)?;
    if let Grantee::Role(name) = defaults.entry.grantee() {
        catalog::require_role_identity(client, name)?;
    }
    if let Some(schema) = &defaults.schema {
        if !catalog::schema_exists(client, schema)? {
            return Err(AclError::NotFound {
                kind: "schema",
                name: schema.clone(),
            });
        }
    }
    Ok(())
}

/// The grantee's current default privileges, or `None` if the address no
/// longer exists.
fn observe_entry<C: GenericClient>(
    client: &mut C,
    defaults: &ValidatedDefaultPrivileges,
) -> Result<Option<AclEntry>, AclError> {
    if !address_exists(client, defaults)? {
        return Ok(None);
    }
    let owner = catalog::require_role_identity(client, &defaults.owner)?;
    let Some(grantee_oid) = catalog::grantee_oid(client, defaults.entry.grantee())? else {
        return Ok(None);
    };
    let (privileges, grant_options) = catalog::read_default_privileges(
        client,
        &owner,
        grantee_oid,
        defaults.schema.as_deref(),
        defaults.kind,
    )?;
    AclEntry::new(defaults.entry.grantee().clone(), privileges, grant_options).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entries_are_absent_from_policies() {
        let empty =
            AclEntry::new(Grantee::Role("r".into()), Privileges::empty(), Privileges::empty())
                .unwrap();
        assert!(policy_of(&empty).is_empty());

        let select =
            AclEntry::new(Grantee::Role("r".into()), Privileges::SELECT, Privileges::empty())
                .unwrap();
        let diff = diff_policies(&policy_of(&select), &policy_of(&empty));
        assert_eq!(diff.dropped.len(), 1);
        assert!(diff.added.is_empty());
    }
}
