// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors produced while converging privileges.

use std::fmt;

use crate::capability::ServerVersion;
use crate::plan::Intent;
use crate::privilege::ObjectKind;

/// Whether a role membership was being granted or revoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipAction {
    Grant,
    Revoke,
}

impl fmt::Display for MembershipAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipAction::Grant => f.write_str("grant"),
            MembershipAction::Revoke => f.write_str("revoke"),
        }
    }
}

/// An error representing a failed convergence.
///
/// Validation and capability errors are raised before any SQL is issued.
/// Every other variant is raised from inside a convergence transaction, which
/// has been rolled back by the time the error reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    /// A privilege token is not part of the vocabulary of the object kind.
    #[error("invalid privilege type {token} for object type {kind}")]
    InvalidPrivilege { token: String, kind: ObjectKind },
    /// A desired-state declaration is structurally malformed.
    #[error("invalid {what}: {detail}")]
    Validation { what: &'static str, detail: String },
    /// The connected server does not support a required feature.
    #[error("{feature} is not supported on PostgreSQL {version}")]
    Unsupported {
        feature: &'static str,
        version: ServerVersion,
    },
    /// An object that must exist for a write does not.
    #[error("{kind} {name:?} does not exist")]
    NotFound { kind: &'static str, name: String },
    /// A privilege statement failed.
    #[error("could not {intent}: {source}")]
    Statement {
        intent: Intent,
        #[source]
        source: postgres::Error,
    },
    /// Temporarily granting or revoking a role membership failed.
    #[error("could not {action} membership in role {role:?} to {member:?}: {source}")]
    Impersonation {
        action: MembershipAction,
        role: String,
        member: String,
        #[source]
        source: postgres::Error,
    },
    /// Both the impersonated work and the release of its memberships failed.
    #[error("{work}; additionally, releasing impersonated roles failed: {release}")]
    Release {
        work: Box<AclError>,
        release: Box<AclError>,
    },
    /// Error communicating with the server outside of a privilege statement.
    #[error(transparent)]
    Postgres(#[from] postgres::Error),
    /// Error setting up TLS.
    #[error(transparent)]
    OpenSsl(#[from] openssl::error::ErrorStack),
    /// Any other error we bail on.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl AclError {
    pub(crate) fn validation(what: &'static str, detail: impl Into<String>) -> AclError {
        AclError::Validation {
            what,
            detail: detail.into(),
        }
    }

    /// Reports whether the error was raised before any SQL was issued.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            AclError::InvalidPrivilege { .. }
                | AclError::Validation { .. }
                | AclError::Unsupported { .. }
        )
    }
}
