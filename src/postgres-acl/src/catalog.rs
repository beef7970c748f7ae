// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Read-only queries against the system catalog.
//!
//! Every function takes the caller's client or transaction so that reads
//! observe the same snapshot as the writes that follow them. Nothing read
//! here is cached.

use itertools::Itertools;
use postgres::types::{Oid, ToSql};
use postgres::GenericClient;
use serde::{Deserialize, Serialize};

use crate::acl::{AclItem, Grantee, RolePolicy};
use crate::capability::{self, CapabilitySet, ServerVersion};
use crate::error::AclError;
use crate::privilege::{ObjectKind, Privileges};

/// A role name together with its stable identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleIdentity {
    pub name: String,
    pub oid: Oid,
}

/// The role the session is authenticated as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentRole {
    pub identity: RoleIdentity,
    pub superuser: bool,
}

pub fn resolve_role_identity<C: GenericClient>(
    client: &mut C,
    name: &str,
) -> Result<Option<RoleIdentity>, AclError> {
    let row = client.query_opt(
        "SELECT oid, rolname::text FROM pg_catalog.pg_roles WHERE rolname = $1",
        &[&name],
    )?;
    Ok(row.map(|row| RoleIdentity {
        oid: row.get(0),
        name: row.get(1),
    }))
}

/// Like [`resolve_role_identity`], for roles that must exist.
pub fn require_role_identity<C: GenericClient>(
    client: &mut C,
    name: &str,
) -> Result<RoleIdentity, AclError> {
    resolve_role_identity(client, name)?.ok_or_else(|| AclError::NotFound {
        kind: "role",
        name: name.to_owned(),
    })
}

pub fn current_role<C: GenericClient>(client: &mut C) -> Result<CurrentRole, AclError> {
    let row = client.query_one(
        "SELECT oid, rolname::text, rolsuper FROM pg_catalog.pg_roles WHERE rolname = current_user",
        &[],
    )?;
    Ok(CurrentRole {
        identity: RoleIdentity {
            oid: row.get(0),
            name: row.get(1),
        },
        superuser: row.get(2),
    })
}

pub fn is_superuser<C: GenericClient>(client: &mut C, role: &str) -> Result<bool, AclError> {
    let row = client.query_opt(
        "SELECT rolsuper FROM pg_catalog.pg_roles WHERE rolname = $1",
        &[&role],
    )?;
    Ok(row.map_or(false, |row| row.get(0)))
}

/// Whether `member` is a direct member of `role` that inherits its
/// privileges.
///
/// From PostgreSQL 16 a membership row may grant only the ADMIN option, as
/// when a CREATEROLE role creates another role. Such rows do not confer the
/// role's privileges and are not counted.
pub fn is_role_member<C: GenericClient>(
    client: &mut C,
    caps: &CapabilitySet,
    role: &RoleIdentity,
    member: &RoleIdentity,
) -> Result<bool, AclError> {
    let row = client.query_one(membership_query(caps), &[&role.oid, &member.oid])?;
    Ok(row.get(0))
}

fn membership_query(caps: &CapabilitySet) -> &'static str {
    if caps.supports(&capability::MEMBERSHIP_OPTIONS) {
        "SELECT EXISTS (
            SELECT 1 FROM pg_catalog.pg_auth_members
            WHERE roleid = $1 AND member = $2 AND inherit_option
        )"
    } else {
        "SELECT EXISTS (
            SELECT 1 FROM pg_catalog.pg_auth_members WHERE roleid = $1 AND member = $2
        )"
    }
}

pub fn role_exists<C: GenericClient>(client: &mut C, name: &str) -> Result<bool, AclError> {
    exists(
        client,
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1)",
        name,
    )
}

pub fn schema_exists<C: GenericClient>(client: &mut C, name: &str) -> Result<bool, AclError> {
    exists(
        client,
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
        name,
    )
}

pub fn database_exists<C: GenericClient>(client: &mut C, name: &str) -> Result<bool, AclError> {
    exists(
        client,
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1)",
        name,
    )
}

fn exists<C: GenericClient>(client: &mut C, query: &str, name: &str) -> Result<bool, AclError> {
    Ok(client.query_one(query, &[&name])?.get(0))
}

pub fn schema_owner<C: GenericClient>(
    client: &mut C,
    name: &str,
) -> Result<Option<RoleIdentity>, AclError> {
    let row = client.query_opt(
        "SELECT nspowner, pg_catalog.pg_get_userbyid(nspowner)::text
        FROM pg_catalog.pg_namespace WHERE nspname = $1",
        &[&name],
    )?;
    Ok(row.map(|row| RoleIdentity {
        oid: row.get(0),
        name: row.get(1),
    }))
}

pub fn database_owner<C: GenericClient>(
    client: &mut C,
    name: &str,
) -> Result<Option<RoleIdentity>, AclError> {
    let row = client.query_opt(
        "SELECT datdba, pg_catalog.pg_get_userbyid(datdba)::text
        FROM pg_catalog.pg_database WHERE datname = $1",
        &[&name],
    )?;
    Ok(row.map(|row| RoleIdentity {
        oid: row.get(0),
        name: row.get(1),
    }))
}

pub fn server_version<C: GenericClient>(client: &mut C) -> Result<ServerVersion, AclError> {
    let num: i32 = client
        .query_one("SELECT current_setting('server_version_num')::int4", &[])?
        .get(0);
    ServerVersion::from_version_num(i64::from(num))
}

/// A schema's owner and the privileges others hold on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedSchema {
    pub owner: String,
    /// Excludes the owner's own entry.
    pub policy: RolePolicy,
}

pub fn read_schema<C: GenericClient>(
    client: &mut C,
    name: &str,
) -> Result<Option<ObservedSchema>, AclError> {
    let row = client.query_opt(
        "SELECT
            pg_catalog.pg_get_userbyid(nspowner)::text,
            COALESCE(nspacl, '{}'::aclitem[])::text[]
        FROM pg_catalog.pg_namespace
        WHERE nspname = $1",
        &[&name],
    )?;
    let Some(row) = row else {
        return Ok(None);
    };
    let owner: String = row.get(0);
    let acl: Vec<String> = row.get(1);
    let items = acl
        .iter()
        .map(|item| AclItem::parse(item))
        .collect::<Result<Vec<_>, _>>()?;
    let policy = RolePolicy::from_acl_items(items, Some(&owner));
    Ok(Some(ObservedSchema { owner, policy }))
}

/// The OID a grantee appears under in exploded ACLs.
pub fn grantee_oid<C: GenericClient>(
    client: &mut C,
    grantee: &Grantee,
) -> Result<Option<Oid>, AclError> {
    match grantee {
        Grantee::Public => Ok(Some(0)),
        Grantee::Role(name) => Ok(resolve_role_identity(client, name)?.map(|role| role.oid)),
    }
}

/// The default privileges `grantee_oid` receives on objects of `kind` created
/// by `owner`, in `schema` or globally.
pub fn read_default_privileges<C: GenericClient>(
    client: &mut C,
    owner: &RoleIdentity,
    grantee_oid: Oid,
    schema: Option<&str>,
    kind: ObjectKind,
) -> Result<(Privileges, Privileges), AclError> {
    let Some(code) = kind.default_acl_code() else {
        return Err(AclError::validation(
            "object type",
            format!("default privileges cannot be declared on {kind} objects"),
        ));
    };
    let rows = client.query(
        "SELECT a.privilege_type, a.is_grantable
        FROM pg_catalog.pg_default_acl AS d
            LEFT JOIN pg_catalog.pg_namespace AS n ON n.oid = d.defaclnamespace
            CROSS JOIN LATERAL pg_catalog.aclexplode(d.defaclacl) AS a
        WHERE d.defaclrole = $1
            AND d.defaclobjtype::text = $2
            AND COALESCE(n.nspname::text, '') = $3
            AND a.grantee = $4",
        &[&owner.oid, &code, &schema.unwrap_or(""), &grantee_oid],
    )?;
    let mut privileges = Privileges::empty();
    let mut grant_options = Privileges::empty();
    for row in rows {
        let privilege = decode_privilege(row.get(0))?;
        privileges |= privilege;
        if row.get::<_, bool>(1) {
            grant_options |= privilege;
        }
    }
    Ok((privileges, grant_options))
}

fn decode_privilege(name: &str) -> Result<Privileges, AclError> {
    match Privileges::from_token(name) {
        Some(privilege) => Ok(privilege),
        None => bail_generic!("server reported unknown privilege type {:?}", name),
    }
}

const RELKINDS_TABLE: &[&str] = &["r", "v", "m", "f", "p"];
const RELKINDS_SEQUENCE: &[&str] = &["S"];
const PROKINDS_FUNCTION: &[&str] = &["f", "a", "w"];
const PROKINDS_PROCEDURE: &[&str] = &["p"];

/// Where the catalog keeps the objects of one kind and their ACLs.
#[derive(Clone, Debug, PartialEq, Eq)]
struct AclSource {
    relation: &'static str,
    name: &'static str,
    owner: &'static str,
    acl: &'static str,
    namespace: Option<&'static str>,
    /// A column distinguishing this kind from others sharing the relation,
    /// and the values that select this kind.
    discriminator: Option<(&'static str, &'static [&'static str])>,
}

impl AclSource {
    fn for_kind(kind: ObjectKind, caps: &CapabilitySet) -> AclSource {
        let prokind = |values: &'static [&'static str]| {
            caps.supports(&capability::PROKIND)
                .then_some(("prokind", values))
        };
        match kind {
            ObjectKind::Database => AclSource {
                relation: "pg_catalog.pg_database",
                name: "datname",
                owner: "datdba",
                acl: "datacl",
                namespace: None,
                discriminator: None,
            },
            ObjectKind::Schema => AclSource {
                relation: "pg_catalog.pg_namespace",
                name: "nspname",
                owner: "nspowner",
                acl: "nspacl",
                namespace: None,
                discriminator: None,
            },
            ObjectKind::Table => AclSource {
                relation: "pg_catalog.pg_class",
                name: "relname",
                owner: "relowner",
                acl: "relacl",
                namespace: Some("relnamespace"),
                discriminator: Some(("relkind", RELKINDS_TABLE)),
            },
            ObjectKind::Sequence => AclSource {
                relation: "pg_catalog.pg_class",
                name: "relname",
                owner: "relowner",
                acl: "relacl",
                namespace: Some("relnamespace"),
                discriminator: Some(("relkind", RELKINDS_SEQUENCE)),
            },
            ObjectKind::Function | ObjectKind::Procedure | ObjectKind::Routine => AclSource {
                relation: "pg_catalog.pg_proc",
                name: "proname",
                owner: "proowner",
                acl: "proacl",
                namespace: Some("pronamespace"),
                discriminator: match kind {
                    ObjectKind::Function => prokind(PROKINDS_FUNCTION),
                    ObjectKind::Procedure => prokind(PROKINDS_PROCEDURE),
                    _ => None,
                },
            },
            ObjectKind::Type => AclSource {
                relation: "pg_catalog.pg_type",
                name: "typname",
                owner: "typowner",
                acl: "typacl",
                namespace: Some("typnamespace"),
                discriminator: None,
            },
            ObjectKind::ForeignDataWrapper => AclSource {
                relation: "pg_catalog.pg_foreign_data_wrapper",
                name: "fdwname",
                owner: "fdwowner",
                acl: "fdwacl",
                namespace: None,
                discriminator: None,
            },
            ObjectKind::ForeignServer => AclSource {
                relation: "pg_catalog.pg_foreign_server",
                name: "srvname",
                owner: "srvowner",
                acl: "srvacl",
                namespace: None,
                discriminator: None,
            },
        }
    }

    /// Renders the query reading the privileges one grantee holds on each
    /// addressed object. `$1` is the grantee's OID; the remaining parameters
    /// are numbered in the order the optional filters are enabled.
    fn query(&self, filter_schema: bool, filter_names: bool) -> String {
        let mut joins = String::new();
        let mut predicates = vec![];
        let mut param = 1;
        if let (Some(namespace), true) = (self.namespace, filter_schema) {
            param += 1;
            joins.push_str(&format!(
                "JOIN pg_catalog.pg_namespace AS n ON n.oid = o.{namespace}\n"
            ));
            predicates.push(format!("n.nspname = ${param}"));
        }
        if let Some((column, _)) = self.discriminator {
            param += 1;
            predicates.push(format!("o.{column}::text = ANY(${param})"));
        }
        if filter_names {
            param += 1;
            predicates.push(format!("o.{}::text = ANY(${param})", self.name));
        }
        let filter = if predicates.is_empty() {
            String::new()
        } else {
            format!("WHERE {}\n", predicates.join(" AND "))
        };
        format!(
            "SELECT
                o.{name}::text,
                o.{owner},
                pg_catalog.pg_get_userbyid(o.{owner})::text,
                COALESCE(array_agg(a.privilege_type) FILTER (WHERE a.privilege_type IS NOT NULL), '{{}}'),
                COALESCE(array_agg(a.privilege_type) FILTER (WHERE a.is_grantable), '{{}}')
            FROM {relation} AS o
            {joins}LEFT JOIN LATERAL pg_catalog.aclexplode(COALESCE(o.{acl}, '{{}}'::aclitem[])) AS a
                ON a.grantee = $1
            {filter}GROUP BY o.oid, o.{name}, o.{owner}
            ORDER BY o.{name}, o.oid",
            name = self.name,
            owner = self.owner,
            acl = self.acl,
            relation = self.relation,
        )
    }
}

/// The privileges one grantee holds on one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedPrivileges {
    pub name: String,
    pub owner: RoleIdentity,
    pub privileges: Privileges,
    pub grant_options: Privileges,
}

/// Reads the privileges `grantee_oid` holds on objects of `kind`.
///
/// For schema-scoped kinds `schema` selects the containing schema. An empty
/// `objects` addresses every object of the kind there; otherwise only the
/// named objects are read, and names that do not exist are absent from the
/// result. Objects are returned ordered by name.
pub fn read_privileges<C: GenericClient>(
    client: &mut C,
    caps: &CapabilitySet,
    kind: ObjectKind,
    schema: Option<&str>,
    objects: &[String],
    grantee_oid: Oid,
) -> Result<Vec<ObservedPrivileges>, AclError> {
    let source = AclSource::for_kind(kind, caps);
    let schema = schema.filter(|_| source.namespace.is_some());

    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&grantee_oid];
    if let Some(schema) = &schema {
        params.push(schema);
    }
    let discriminator_values: Vec<&str> = source
        .discriminator
        .map(|(_, values)| values.to_vec())
        .unwrap_or_default();
    if source.discriminator.is_some() {
        params.push(&discriminator_values);
    }
    if !objects.is_empty() {
        params.push(&objects);
    }

    let query = source.query(schema.is_some(), !objects.is_empty());
    let rows = client.query(query.as_str(), &params)?;
    rows.into_iter()
        .map(|row| -> Result<ObservedPrivileges, AclError> {
            let mut privileges = Privileges::empty();
            for name in row.get::<_, Vec<String>>(3) {
                privileges |= decode_privilege(&name)?;
            }
            let mut grant_options = Privileges::empty();
            for name in row.get::<_, Vec<String>>(4) {
                grant_options |= decode_privilege(&name)?;
            }
            Ok(ObservedPrivileges {
                name: row.get(0),
                owner: RoleIdentity {
                    oid: row.get(1),
                    name: row.get(2),
                },
                privileges,
                grant_options,
            })
        })
        .collect()
}

/// The distinct owners of the addressed objects, in order of first
/// appearance.
pub fn object_owners<C: GenericClient>(
    client: &mut C,
    caps: &CapabilitySet,
    kind: ObjectKind,
    schema: Option<&str>,
    objects: &[String],
) -> Result<Vec<RoleIdentity>, AclError> {
    let observed = read_privileges(client, caps, kind, schema, objects, 0)?;
    Ok(observed
        .into_iter()
        .map(|object| object.owner)
        .unique_by(|owner| owner.oid)
        .collect())
}
