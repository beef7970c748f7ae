// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Convergence orchestrators.
//!
//! Every write follows the same cycle: validate the descriptor against the
//! server's capabilities, open one transaction, work out whose memberships
//! must be borrowed, run the planned revokes and grants under those
//! memberships, commit, and then report the state from a fresh catalog read.
//! No SQL is issued before validation succeeds, and a failure at any point
//! rolls back the whole transaction.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use postgres::error::SqlState;
use postgres::{Client, Transaction};
use tracing::{debug, warn};

use crate::config::{Config, Connection};
use crate::error::AclError;
use crate::plan::Statement;

mod default_privileges;
mod grant;
mod schema;

pub use default_privileges::DefaultPrivilegesState;
pub use grant::{reduce_observed, GrantState};
pub use schema::SchemaState;

/// Serializes convergence of server-global objects within this process.
///
/// Writers hold it in write mode for their whole create, update or delete
/// cycle; readers of the same objects hold it in read mode. Objects that live
/// inside one database rely on the server's own locking instead.
pub static GLOBAL_CATALOG_LOCK: RwLock<()> = RwLock::new(());

// The lock guards no data, so a panic while holding it leaves nothing
// inconsistent behind.
pub(crate) fn global_write_lock() -> RwLockWriteGuard<'static, ()> {
    GLOBAL_CATALOG_LOCK
        .write()
        .unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn global_read_lock() -> RwLockReadGuard<'static, ()> {
    GLOBAL_CATALOG_LOCK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Converges privileges on the server described by a [`Config`].
#[derive(Clone, Debug)]
pub struct Engine {
    config: Config,
}

impl Engine {
    pub fn new(config: Config) -> Engine {
        Engine { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn connect(&self, database: &str) -> Result<Connection, AclError> {
        self.config.connect(database)
    }

    pub(crate) fn connect_maintenance(&self) -> Result<Connection, AclError> {
        self.config.connect_maintenance()
    }
}

/// Whether connecting failed because the database does not exist.
pub(crate) fn is_missing_database(e: &AclError) -> bool {
    match e {
        AclError::Postgres(e) => e.code() == Some(&SqlState::INVALID_CATALOG_NAME),
        _ => false,
    }
}

/// Runs `f` in a transaction, committing if it succeeds and rolling back if
/// it fails.
pub(crate) fn transact<F, T>(client: &mut Client, f: F) -> Result<T, AclError>
where
    F: FnOnce(&mut Transaction<'_>) -> Result<T, AclError>,
{
    let mut tx = client.transaction()?;
    match f(&mut tx) {
        Ok(res) => {
            tx.commit()?;
            Ok(res)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback() {
                warn!("rolling back failed convergence: {}", rollback);
            }
            Err(e)
        }
    }
}

/// Executes privilege statements in order, stopping at the first failure.
pub(crate) fn execute(tx: &mut Transaction<'_>, statements: &[Statement]) -> Result<(), AclError> {
    for statement in statements {
        debug!(sql = %statement.sql, "executing");
        tx.batch_execute(&statement.sql)
            .map_err(|source| AclError::Statement {
                intent: statement.intent.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Executes one DDL statement, describing it as `what` if it fails.
pub(crate) fn execute_ddl(tx: &mut Transaction<'_>, sql: &str, what: &str) -> Result<(), AclError> {
    debug!(%sql, "executing");
    tx.batch_execute(sql)
        .map_err(|e| anyhow::Error::new(e).context(format!("could not {what}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_mean_a_missing_database() {
        assert!(!is_missing_database(&AclError::NotFound {
            kind: "database",
            name: "app".into(),
        }));
        assert!(!is_missing_database(&AclError::validation("database", "empty")));
    }

    #[test]
    fn poisoned_lock_is_still_usable() {
        let poisoner = std::thread::spawn(|| {
            let _guard = global_write_lock();
            panic!("poisoning the lock");
        });
        assert!(poisoner.join().is_err());
        drop(global_read_lock());
        drop(global_write_lock());
    }
}
