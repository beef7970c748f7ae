// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Privileges of one role on a set of objects.
//!
//! A grant owns every privilege its role holds on the addressed objects:
//! converging revokes all of them and grants the desired set again, inside one
//! transaction.

use itertools::Itertools;
use postgres::GenericClient;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::acl::{AclEntry, Grantee};
use crate::capability::CapabilitySet;
use crate::catalog::{self, ObservedPrivileges, RoleIdentity};
use crate::converge::{
    execute, global_read_lock, global_write_lock, is_missing_database, transact, Engine,
};
use crate::config::Connection;
use crate::desc::{GrantSpec, ValidatedGrant};
use crate::error::AclError;
use crate::impersonate::with_roles_granted;
use crate::plan::{self, Statement};
use crate::privilege::{ObjectKind, Privileges};

/// The privileges a grant's role holds, as read back from the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantState {
    pub id: String,
    pub role: String,
    pub database: String,
    pub schema: Option<String>,
    pub object_kind: ObjectKind,
    pub objects: Vec<String>,
    #[serde(with = "privilege_tokens")]
    pub privileges: Privileges,
    #[serde(with = "privilege_tokens")]
    pub grant_options: Privileges,
}

impl Engine {
    pub fn create_grant(&self, spec: &GrantSpec) -> Result<GrantState, AclError> {
        let mut conn = self.connect_for(spec)?;
        let grant = spec.validate(conn.capabilities())?;
        let _guard = grant.is_global().then(global_write_lock);

        let (client, caps) = conn.split();
        transact(client, |tx| {
            require_address(tx, &grant)?;
            let roles = impersonation_roles(tx, caps, &grant)?;
            let statements = plan::plan_replace(&grant.target, &grant.entry);
            with_roles_granted(tx, caps, &roles, |tx| execute(tx, &statements))
        })?;
        info!(id = %grant.id(), "created grant");

        observe(&mut conn, &grant)?.ok_or_else(|| AclError::NotFound {
            kind: "grant",
            name: grant.id(),
        })
    }

    /// Reads the privileges currently held. Returns `None` if the role, the
    /// schema or the database no longer exists.
    pub fn read_grant(&self, spec: &GrantSpec) -> Result<Option<GrantState>, AclError> {
        let mut conn = match self.connect_for(spec) {
            Ok(conn) => conn,
            Err(e) if is_missing_database(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let grant = spec.validate(conn.capabilities())?;
        let _guard = grant.is_global().then(global_read_lock);
        observe(&mut conn, &grant)
    }

    /// Converges from the state described by `prior` to the one described by
    /// `desired`. Issues no statements when the two are equal.
    pub fn update_grant(
        &self,
        prior: &GrantSpec,
        desired: &GrantSpec,
    ) -> Result<GrantState, AclError> {
        let mut conn = self.connect_for(desired)?;
        let prior_grant = prior.validate(conn.capabilities())?;
        let grant = desired.validate(conn.capabilities())?;
        if prior_grant == grant {
            let _guard = grant.is_global().then(global_read_lock);
            return observe(&mut conn, &grant)?.ok_or_else(|| AclError::NotFound {
                kind: "grant",
                name: grant.id(),
            });
        }
        if prior_grant.database != grant.database && !grant.is_global() {
            drop(conn);
            self.delete_grant(prior)?;
            return self.create_grant(desired);
        }
        let _guard = (prior_grant.is_global() || grant.is_global()).then(global_write_lock);

        let (client, caps) = conn.split();
        transact(client, |tx| {
            require_address(tx, &grant)?;
            let mut roles = impersonation_roles(tx, caps, &grant)?;
            let mut statements = vec![];
            if !prior_grant.same_address(&grant) && address_exists(tx, &prior_grant)? {
                roles.extend(impersonation_roles(tx, caps, &prior_grant)?);
                statements.push(revoke_all(&prior_grant));
            }
            statements.extend(plan::plan_replace(&grant.target, &grant.entry));
            let roles: Vec<_> = roles.into_iter().unique_by(|role| role.oid).collect();
            with_roles_granted(tx, caps, &roles, |tx| execute(tx, &statements))
        })?;
        info!(prior = %prior_grant.id(), id = %grant.id(), "updated grant");

        observe(&mut conn, &grant)?.ok_or_else(|| AclError::NotFound {
            kind: "grant",
            name: grant.id(),
        })
    }

    /// Revokes every privilege the role holds on the addressed objects. Does
    /// nothing if the role, the schema or the database is already gone.
    pub fn delete_grant(&self, spec: &GrantSpec) -> Result<(), AclError> {
        let mut conn = match self.connect_for(spec) {
            Ok(conn) => conn,
            Err(e) if is_missing_database(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        let grant = spec.validate(conn.capabilities())?;
        let _guard = grant.is_global().then(global_write_lock);

        let (client, caps) = conn.split();
        let revoked = transact(client, |tx| {
            if !address_exists(tx, &grant)? {
                return Ok(false);
            }
            let roles = impersonation_roles(tx, caps, &grant)?;
            let statements = [revoke_all(&grant)];
            with_roles_granted(tx, caps, &roles, |tx| execute(tx, &statements))?;
            Ok(true)
        })?;
        if revoked {
            info!(id = %grant.id(), "deleted grant");
        } else {
            info!(id = %grant.id(), "grant target no longer exists; nothing to revoke");
        }
        Ok(())
    }

    fn connect_for(&self, spec: &GrantSpec) -> Result<Connection, AclError> {
        match spec.object_kind {
            ObjectKind::Database => self.connect_maintenance(),
            _ => self.connect(&spec.database),
        }
    }
}

fn revoke_all(grant: &ValidatedGrant) -> Statement {
    Statement::revoke(&grant.target, grant.entry.grantee(), None)
}

/// Whether the grantee and the container of the addressed objects exist.
fn address_exists<C: GenericClient>(client: &mut C, grant: &ValidatedGrant) -> Result<bool, AclError> {
    if let Grantee::Role(name) = grant.entry.grantee() {
        if !catalog::role_exists(client, name)? {
            return Ok(false);
        }
    }
    match (&grant.kind, &grant.schema) {
        (ObjectKind::Database, _) => catalog::database_exists(client, &grant.database),
        (_, Some(schema)) => catalog::schema_exists(client, schema),
        (_, None) => Ok(true),
    }
}

fn require_address<C: GenericClient>(client: &mut C, grant: &ValidatedGrant) -> Result<(), AclError> {
    if let Grantee::Role(name) = grant.entry.grantee() {
        catalog::require_role_identity(client, name)?;
    }
    if grant.kind == ObjectKind::Database {
        if !catalog::database_exists(client, &grant.database)? {
            return Err(AclError::NotFound {
                kind: "database",
                name: grant.database.clone(),
            });
        }
    } else if let Some(schema) = &grant.schema {
        if !catalog::schema_exists(client, schema)? {
            return Err(AclError::NotFound {
                kind: "schema",
                name: schema.clone(),
            });
        }
    }
    Ok(())
}

/// The roles whose membership is needed to alter privileges on the
/// addressed objects.
fn impersonation_roles<C: GenericClient>(
    client: &mut C,
    caps: &CapabilitySet,
    grant: &ValidatedGrant,
) -> Result<Vec<RoleIdentity>, AclError> {
    let mut roles = vec![];
    match grant.kind {
        ObjectKind::Database => roles.extend(catalog::database_owner(client, &grant.database)?),
        ObjectKind::Schema => {
            if let Some(schema) = &grant.schema {
                roles.extend(catalog::schema_owner(client, schema)?);
            }
        }
        ObjectKind::ForeignDataWrapper | ObjectKind::ForeignServer => {
            roles.extend(catalog::object_owners(client, caps, grant.kind, None, &grant.objects)?);
        }
        _ => {
            let schema = grant.schema.as_deref();
            if let Some(schema) = schema {
                roles.extend(catalog::schema_owner(client, schema)?);
            }
            roles.extend(catalog::object_owners(
                client,
                caps,
                grant.kind,
                schema,
                &grant.objects,
            )?);
        }
    }
    Ok(roles.into_iter().unique_by(|role| role.oid).collect())
}

/// Reads the grant back from the server in its own transaction.
fn observe(conn: &mut Connection, grant: &ValidatedGrant) -> Result<Option<GrantState>, AclError> {
    let (client, caps) = conn.split();
    let observed = transact(client, |tx| {
        if !address_exists(tx, grant)? {
            return Ok(None);
        }
        let Some(oid) = catalog::grantee_oid(tx, grant.entry.grantee())? else {
            return Ok(None);
        };
        let objects = match grant.kind {
            ObjectKind::Database => vec![grant.database.clone()],
            ObjectKind::Schema => grant.schema.iter().cloned().collect(),
            _ => grant.objects.clone(),
        };
        let schema = grant.schema.as_deref().filter(|_| grant.kind.is_schema_scoped());
        let observed = catalog::read_privileges(tx, caps, grant.kind, schema, &objects, oid)?;
        Ok(Some(observed))
    })?;

    Ok(observed.map(|observed| {
        let all_in_schema = grant.kind.is_schema_scoped() && grant.objects.is_empty();
        let requested = match grant.kind {
            ObjectKind::Database | ObjectKind::Schema => 1,
            _ => grant.objects.len(),
        };
        let (privileges, grant_options) =
            reduce_observed(&grant.entry, all_in_schema, requested, &observed);
        GrantState {
            id: grant.id(),
            role: grant
                .entry
                .grantee()
                .role_name()
                .unwrap_or("public")
                .to_owned(),
            database: grant.database.clone(),
            schema: grant.schema.clone(),
            object_kind: grant.kind,
            objects: grant.objects.clone(),
            privileges,
            grant_options,
        }
    }))
}

/// Folds the privileges observed on each addressed object into one reported
/// set.
///
/// If every object carries exactly the desired privileges, the desired set is
/// reported. Otherwise the set of the first diverging object is reported, so
/// that drift on any object shows up as a difference. A named object that
/// does not exist reports nothing at all. An empty schema addressed as a
/// whole has nothing that could diverge.
pub fn reduce_observed(
    desired: &AclEntry,
    all_in_schema: bool,
    requested: usize,
    observed: &[ObservedPrivileges],
) -> (Privileges, Privileges) {
    if !all_in_schema && observed.len() < requested {
        return (Privileges::empty(), Privileges::empty());
    }
    let diverging = observed.iter().find(|object| {
        object.privileges != desired.privileges() || object.grant_options != desired.grant_options()
    });
    match diverging {
        Some(object) => (object.privileges, object.grant_options),
        None => (desired.privileges(), desired.grant_options()),
    }
}

/// Serializes a privilege set as its list of SQL keywords.
mod privilege_tokens {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::privilege::Privileges;

    pub fn serialize<S: Serializer>(privileges: &Privileges, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(privileges.tokens())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Privileges, D::Error> {
        let tokens = Vec::<String>::deserialize(deserializer)?;
        let mut privileges = Privileges::empty();
        for token in tokens {
            privileges |= Privileges::from_token(&token)
                .ok_or_else(|| D::Error::custom(format!("unknown privilege {token:?}")))?;
        }
        Ok(privileges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(name: &str, privileges: Privileges) -> ObservedPrivileges {
        ObservedPrivileges {
            name: name.into(),
            owner: RoleIdentity {
                name: "owner".into(),
                oid: 10,
            },
            privileges,
            grant_options: Privileges::empty(),
        }
    }

    fn desired() -> AclEntry {
        AclEntry::new(
            Grantee::Role("reader".into()),
            Privileges::SELECT | Privileges::INSERT,
            Privileges::empty(),
        )
        .unwrap()
    }

    #[test]
    fn reduction_reports_drift() {
        let both = Privileges::SELECT | Privileges::INSERT;
        let all = [observed("a", both), observed("b", both)];
        assert_eq!(reduce_observed(&desired(), false, 2, &all), (both, Privileges::empty()));

        let drifted = [observed("a", both), observed("b", Privileges::SELECT)];
        assert_eq!(
            reduce_observed(&desired(), false, 2, &drifted),
            (Privileges::SELECT, Privileges::empty())
        );

        let missing = [observed("a", both)];
        assert_eq!(
            reduce_observed(&desired(), false, 2, &missing),
            (Privileges::empty(), Privileges::empty())
        );

        assert_eq!(reduce_observed(&desired(), true, 0, &[]), (both, Privileges::empty()));
    }

    #[test]
    fn states_serialize_privileges_as_keywords() {
        let state = GrantState {
            id: "reader_app_public_table".into(),
            role: "reader".into(),
            database: "app".into(),
            schema: Some("public".into()),
            object_kind: ObjectKind::Table,
            objects: vec![],
            privileges: Privileges::SELECT | Privileges::UPDATE,
            grant_options: Privileges::empty(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["privileges"], serde_json::json!(["SELECT", "UPDATE"]));
        assert_eq!(json["object_kind"], "table");
        let back: GrantState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
