// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Temporary role memberships for the connecting role.
//!
//! Altering the privileges or owner of an object requires membership in the
//! object's owning role. A connecting role that is not a superuser is granted
//! the memberships it lacks for the duration of a unit of work, and the
//! memberships are revoked again before the work's transaction commits. The
//! grants and revokes run in the same transaction as the work, so no other
//! session ever observes them.

use postgres::Transaction;
use tracing::{debug, warn};

use crate::capability::CapabilitySet;
use crate::catalog::{self, RoleIdentity};
use crate::error::{AclError, MembershipAction};
use crate::sql;

/// The memberships granted to one member for one unit of work.
///
/// Only memberships this scope granted are recorded; memberships the member
/// already held are never revoked.
#[derive(Debug)]
pub struct ImpersonationScope {
    member: RoleIdentity,
    capabilities: CapabilitySet,
    granted: Vec<RoleIdentity>,
}

impl ImpersonationScope {
    pub fn new(member: RoleIdentity, capabilities: &CapabilitySet) -> ImpersonationScope {
        ImpersonationScope {
            member,
            capabilities: capabilities.clone(),
            granted: vec![],
        }
    }

    pub fn member(&self) -> &RoleIdentity {
        &self.member
    }

    /// The memberships granted so far, in the order they were granted.
    pub fn granted(&self) -> &[RoleIdentity] {
        &self.granted
    }

    /// Grants membership in `role` unless it is the member itself, was
    /// already granted by this scope, or is already held. Returns whether a
    /// membership was granted.
    pub fn acquire(&mut self, tx: &mut Transaction<'_>, role: &RoleIdentity) -> Result<bool, AclError> {
        if role.oid == self.member.oid || self.granted.iter().any(|r| r.oid == role.oid) {
            return Ok(false);
        }
        if catalog::is_role_member(tx, &self.capabilities, role, &self.member)? {
            return Ok(false);
        }
        self.alter(tx, role, MembershipAction::Grant)?;
        self.granted.push(role.clone());
        Ok(true)
    }

    /// Revokes every membership this scope granted, most recent first.
    ///
    /// Stops at the first failure. The memberships still outstanding are then
    /// undone by rolling back the enclosing transaction.
    pub fn release(mut self, tx: &mut Transaction<'_>) -> Result<(), AclError> {
        while let Some(role) = self.granted.last().cloned() {
            self.alter(tx, &role, MembershipAction::Revoke)?;
            self.granted.pop();
        }
        Ok(())
    }

    fn alter(
        &self,
        tx: &mut Transaction<'_>,
        role: &RoleIdentity,
        action: MembershipAction,
    ) -> Result<(), AclError> {
        let statement = match action {
            MembershipAction::Grant => sql::grant_membership(&role.name, &self.member.name),
            MembershipAction::Revoke => sql::revoke_membership(&role.name, &self.member.name),
        };
        debug!(%action, role = %role.name, member = %self.member.name, "altering membership");
        // A savepoint keeps the transaction usable after a failed statement,
        // so memberships granted earlier can still be revoked.
        let mut savepoint = tx.savepoint("acl_membership")?;
        savepoint
            .batch_execute(&statement)
            .map_err(|source| AclError::Impersonation {
                action,
                role: role.name.clone(),
                member: self.member.name.clone(),
                source,
            })?;
        savepoint.commit()?;
        Ok(())
    }
}

impl Drop for ImpersonationScope {
    fn drop(&mut self) {
        if !self.granted.is_empty() {
            warn!(
                member = %self.member.name,
                roles = ?self.granted.iter().map(|r| &r.name).collect::<Vec<_>>(),
                "impersonation scope dropped with memberships outstanding; \
                 they are undone only if the transaction rolls back"
            );
        }
    }
}

/// Runs `work` with the connecting role temporarily a member of every role in
/// `roles`.
///
/// Memberships the connecting role lacks are granted first. `work` runs inside
/// a savepoint, which is rolled back if `work` fails. The granted memberships
/// are then revoked whatever the outcome. If both `work` and the revocation
/// fail, both errors are reported as [`AclError::Release`].
///
/// Superusers bypass every privilege check, so for them `work` runs directly.
pub fn with_roles_granted<T, F>(
    tx: &mut Transaction<'_>,
    caps: &CapabilitySet,
    roles: &[RoleIdentity],
    work: F,
) -> Result<T, AclError>
where
    F: FnOnce(&mut Transaction<'_>) -> Result<T, AclError>,
{
    if roles.is_empty() {
        return work(tx);
    }
    let current = catalog::current_role(tx)?;
    if current.superuser {
        debug!(role = %current.identity.name, "connecting role is a superuser; not impersonating");
        return work(tx);
    }

    let mut scope = ImpersonationScope::new(current.identity, caps);
    for role in roles {
        if let Err(e) = scope.acquire(tx, role) {
            let release = scope.release(tx);
            return combine(Err(e), release);
        }
    }

    let result = run_in_savepoint(tx, work);
    let release = scope.release(tx);
    combine(result, release)
}

fn run_in_savepoint<T, F>(tx: &mut Transaction<'_>, work: F) -> Result<T, AclError>
where
    F: FnOnce(&mut Transaction<'_>) -> Result<T, AclError>,
{
    let mut savepoint = tx.savepoint("acl_impersonated_work")?;
    match work(&mut savepoint) {
        Ok(value) => {
            savepoint.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = savepoint.rollback() {
                warn!("rolling back impersonated work failed: {}", rollback);
            }
            Err(e)
        }
    }
}

fn combine<T>(work: Result<T, AclError>, release: Result<(), AclError>) -> Result<T, AclError> {
    match (work, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
        (Err(work), Err(release)) => Err(AclError::Release {
            work: Box::new(work),
            release: Box::new(release),
        }),
    }
}
