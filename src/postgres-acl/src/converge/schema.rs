// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Schemas together with their owner and privilege policy.

use itertools::Itertools;
use postgres::Transaction;
use tracing::info;

use crate::acl::RolePolicy;
use crate::catalog::{self, RoleIdentity};
use crate::config::Connection;
use crate::converge::{execute, execute_ddl, is_missing_database, transact, Engine};
use crate::desc::{SchemaSpec, ValidatedSchema};
use crate::error::AclError;
use crate::impersonate::with_roles_granted;
use crate::plan::{self, diff_policies};
use crate::sql::{self, PrivilegeTarget};

/// A schema as read back from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaState {
    pub id: String,
    pub database: String,
    pub name: String,
    pub owner: String,
    /// The privileges of every role other than the owner.
    pub policy: RolePolicy,
}

impl Engine {
    pub fn create_schema(&self, spec: &SchemaSpec) -> Result<SchemaState, AclError> {
        let mut conn = self.connect(&spec.database)?;
        let schema = spec.validate(conn.capabilities())?;

        let (client, caps) = conn.split();
        transact(client, |tx| {
            let owner = resolve_owner(tx, schema.owner.as_deref())?;
            let roles = [owner.clone()];
            with_roles_granted(tx, caps, &roles, |tx| {
                execute_ddl(
                    tx,
                    &sql::create_schema(&schema.name, &owner.name, schema.if_not_exists),
                    &format!("create schema {:?}", schema.name),
                )?;
                // With IF NOT EXISTS the schema may predate this call and
                // carry privileges of its own.
                let observed = catalog::read_schema(tx, &schema.name)?
                    .map(|observed| observed.policy)
                    .unwrap_or_default();
                converge_policy(tx, &schema.name, &owner.name, &observed, &schema.policy)
            })
        })?;
        info!(id = %schema.id(), "created schema");

        self.reread_schema(&schema)
    }

    /// Returns `None` if the schema or its database does not exist.
    pub fn read_schema(&self, spec: &SchemaSpec) -> Result<Option<SchemaState>, AclError> {
        let mut conn = match self.connect(&spec.database) {
            Ok(conn) => conn,
            Err(e) if is_missing_database(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let schema = spec.validate(conn.capabilities())?;
        observe(&mut conn, &schema)
    }

    /// Renames the schema, changes its owner and converges its policy, in that
    /// order and in one transaction. Moving a schema to another database
    /// requires replacing it instead.
    pub fn update_schema(
        &self,
        prior: &SchemaSpec,
        desired: &SchemaSpec,
    ) -> Result<SchemaState, AclError> {
        if prior.database != desired.database {
            return Err(AclError::validation(
                "schema update",
                format!(
                    "cannot move schema {:?} from database {:?} to {:?}; it must be replaced",
                    prior.name, prior.database, desired.database
                ),
            ));
        }
        let mut conn = self.connect(&desired.database)?;
        let prior_schema = prior.validate(conn.capabilities())?;
        let schema = desired.validate(conn.capabilities())?;
        if prior_schema == schema {
            return self.reread_schema(&schema);
        }

        let (client, caps) = conn.split();
        transact(client, |tx| {
            let current_owner = catalog::schema_owner(tx, &prior_schema.name)?.ok_or_else(|| {
                AclError::NotFound {
                    kind: "schema",
                    name: prior_schema.name.clone(),
                }
            })?;
            let new_owner = match &schema.owner {
                Some(owner) => catalog::require_role_identity(tx, owner)?,
                None => current_owner.clone(),
            };
            let roles: Vec<_> = [current_owner.clone(), new_owner.clone()]
                .into_iter()
                .unique_by(|role| role.oid)
                .collect();

            with_roles_granted(tx, caps, &roles, |tx| {
                if prior_schema.name != schema.name {
                    execute_ddl(
                        tx,
                        &sql::rename_schema(&prior_schema.name, &schema.name),
                        &format!("rename schema {:?} to {:?}", prior_schema.name, schema.name),
                    )?;
                }
                if new_owner.oid != current_owner.oid {
                    execute_ddl(
                        tx,
                        &sql::alter_schema_owner(&schema.name, &new_owner.name),
                        &format!("change owner of schema {:?} to {:?}", schema.name, new_owner.name),
                    )?;
                }
                converge_policy(
                    tx,
                    &schema.name,
                    &new_owner.name,
                    &prior_schema.policy,
                    &schema.policy,
                )
            })
        })?;
        info!(prior = %prior_schema.id(), id = %schema.id(), "updated schema");

        self.reread_schema(&schema)
    }

    /// Drops the schema if it exists, along with its contents if
    /// `drop_cascade` is set.
    pub fn delete_schema(&self, spec: &SchemaSpec) -> Result<(), AclError> {
        let mut conn = self.connect(&spec.database)?;
        let schema = spec.validate(conn.capabilities())?;
        let (client, caps) = conn.split();
        transact(client, |tx| {
            let Some(owner) = catalog::schema_owner(tx, &schema.name)? else {
                info!(id = %schema.id(), "schema already dropped");
                return Ok(());
            };
            with_roles_granted(tx, caps, &[owner], |tx| {
                execute_ddl(
                    tx,
                    &sql::drop_schema(&schema.name, schema.drop_cascade),
                    &format!("drop schema {:?}", schema.name),
                )
            })
        })?;
        info!(id = %schema.id(), "deleted schema");
        Ok(())
    }

    fn reread_schema(&self, schema: &ValidatedSchema) -> Result<SchemaState, AclError> {
        let mut conn = self.connect(&schema.database)?;
        observe(&mut conn, schema)?.ok_or_else(|| AclError::NotFound {
            kind: "schema",
            name: schema.name.clone(),
        })
    }
}

fn resolve_owner(tx: &mut Transaction<'_>, owner: Option<&str>) -> Result<RoleIdentity, AclError> {
    match owner {
        Some(owner) => catalog::require_role_identity(tx, owner),
        None => Ok(catalog::current_role(tx)?.identity),
    }
}

/// Converges the schema's policy from `old` to `new`. The owner's own entry
/// is implicit in ownership and never planned.
fn converge_policy(
    tx: &mut Transaction<'_>,
    name: &str,
    owner: &str,
    old: &RolePolicy,
    new: &RolePolicy,
) -> Result<(), AclError> {
    let diff = diff_policies(&old.without(owner), &new.without(owner));
    if diff.is_noop() {
        return Ok(());
    }
    let target = PrivilegeTarget::Schema(name.to_owned());
    let statements = plan::plan_policy(&diff, &target, |role| catalog::role_exists(tx, role))?;
    execute(tx, &statements)
}

fn observe(
    conn: &mut Connection,
    schema: &ValidatedSchema,
) -> Result<Option<SchemaState>, AclError> {
    let observed = transact(conn.client(), |tx| catalog::read_schema(tx, &schema.name))?;
    Ok(observed.map(|observed| SchemaState {
        id: schema.id(),
        database: schema.database.clone(),
        name: schema.name.clone(),
        owner: observed.owner,
        policy: observed.policy,
    }))
}
