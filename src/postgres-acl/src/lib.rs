// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Converges the access-control surface of a PostgreSQL server.
//!
//! Given a desired set of privileges, default privileges or schema policies,
//! this crate reads the server's privilege catalog, diffs it against the
//! desired state, and issues the revoke and grant statements that make the
//! two agree. Every convergence runs in a single transaction. When the
//! connecting role lacks the membership needed to alter an object, the
//! membership is granted for the duration of the work and revoked again
//! before the transaction commits.
//!
//! The entry point is [`Engine`]:
//!
//! ```no_run
//! # use mz_postgres_acl::{Config, Engine, GrantSpec, ObjectKind};
//! # fn main() -> Result<(), mz_postgres_acl::AclError> {
//! let engine = Engine::new(Config::from_url("host=localhost user=admin")?);
//! let spec = GrantSpec {
//!     role: "reader".into(),
//!     database: "app".into(),
//!     schema: Some("public".into()),
//!     object_kind: ObjectKind::Table,
//!     objects: vec![],
//!     privileges: vec!["SELECT".into()],
//!     grant_options: vec![],
//! };
//! let converged = engine.create_grant(&spec)?;
//! assert!(converged.privileges.contains(mz_postgres_acl::Privileges::SELECT));
//! # Ok(())
//! # }
//! ```

macro_rules! bail_generic {
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::AclError::Generic(anyhow::anyhow!($fmt, $($arg)*)))
    };
    ($err:expr $(,)?) => {
        return Err($crate::error::AclError::Generic(anyhow::anyhow!($err)))
    };
}

pub mod acl;
pub mod capability;
pub mod catalog;
pub mod config;
pub mod converge;
pub mod desc;
pub mod error;
pub mod impersonate;
pub mod plan;
pub mod privilege;
pub mod sql;

pub use crate::acl::{AclEntry, AclItem, Grantee, RoleKey, RolePolicy};
pub use crate::capability::{CapabilitySet, Feature, ServerVersion};
pub use crate::catalog::RoleIdentity;
pub use crate::config::{Config, Connection, EngineOptions};
pub use crate::converge::{DefaultPrivilegesState, Engine, GrantState, SchemaState};
pub use crate::desc::{DefaultPrivilegesSpec, GrantSpec, PolicyDecl, SchemaSpec};
pub use crate::error::AclError;
pub use crate::impersonate::{with_roles_granted, ImpersonationScope};
pub use crate::plan::{diff_policies, Direction, Intent, PolicyDiff, Statement};
pub use crate::privilege::{ObjectKind, Privileges};
