// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Version-gated server capabilities.
//!
//! Each [`Feature`] is a static, type-safe declaration defined once in this
//! module, next to the version window in which the server accepts the
//! corresponding syntax. A [`CapabilitySet`] is derived once per connection
//! from the server's version and is consulted before any statement that
//! depends on a feature is planned. Syntax is never issued speculatively.
//!
//! ```
//! # use mz_postgres_acl::capability::{CapabilitySet, MAINTAIN_PRIVILEGE};
//! # use mz_postgres_acl::ServerVersion;
//! let caps = CapabilitySet::new(ServerVersion::new(16, 4));
//! assert!(!caps.supports(&MAINTAIN_PRIVILEGE));
//! assert!(caps.require(&MAINTAIN_PRIVILEGE).is_err());
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AclError;

/// A PostgreSQL server version.
///
/// For servers older than 10 the version is `major.minor` (e.g. `9.6`); from
/// 10 onwards the major version alone identifies a release, and `minor` holds
/// the patch level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32) -> ServerVersion {
        ServerVersion { major, minor }
    }

    /// Decodes the value of the `server_version_num` setting, e.g. `90603`
    /// or `150004`.
    pub fn from_version_num(num: i64) -> Result<ServerVersion, AclError> {
        let num = match u32::try_from(num) {
            Ok(num) if num >= 80000 => num,
            _ => bail_generic!("invalid server_version_num {}", num),
        };
        if num >= 100000 {
            Ok(ServerVersion::new(num / 10000, num % 10000))
        } else {
            Ok(ServerVersion::new(num / 10000, (num / 100) % 100))
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ServerVersion {
    type Err = AclError;

    /// Parses `15`, `15.2` or `9.6.24`. Anything after the second component is
    /// ignored.
    fn from_str(s: &str) -> Result<ServerVersion, AclError> {
        let mut parts = s.trim().split('.');
        let parse = |part: Option<&str>| -> Result<Option<u32>, AclError> {
            match part {
                None => Ok(None),
                Some(part) => part
                    .parse()
                    .map(Some)
                    .map_err(|_| AclError::validation("server version", format!("{s:?}"))),
            }
        };
        let major = match parse(parts.next())? {
            Some(major) => major,
            None => return Err(AclError::validation("server version", format!("{s:?}"))),
        };
        let minor = parse(parts.next())?.unwrap_or(0);
        Ok(ServerVersion::new(major, minor))
    }
}

impl TryFrom<String> for ServerVersion {
    type Error = AclError;

    fn try_from(s: String) -> Result<ServerVersion, AclError> {
        s.parse()
    }
}

impl From<ServerVersion> for String {
    fn from(version: ServerVersion) -> String {
        version.to_string()
    }
}

/// A named server capability, available in a window of server versions.
#[derive(Clone, Debug)]
pub struct Feature {
    name: &'static str,
    min: ServerVersion,
    max: Option<ServerVersion>,
    desc: &'static str,
}

impl Feature {
    /// Declares a feature available from `min` up to and including the major
    /// version of `max`, if any.
    pub const fn new(
        name: &'static str,
        min: ServerVersion,
        max: Option<ServerVersion>,
        desc: &'static str,
    ) -> Feature {
        Feature {
            name,
            min,
            max,
            desc,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn desc(&self) -> &'static str {
        self.desc
    }

    /// Reports whether a server of the given version has this feature.
    pub fn available_in(&self, version: ServerVersion) -> bool {
        if version < self.min {
            return false;
        }
        match self.max {
            // The upper bound covers every release of that major version.
            Some(max) => version.major <= max.major,
            None => true,
        }
    }
}

pub const PRIVILEGES: Feature = Feature::new(
    "privileges",
    ServerVersion::new(9, 0),
    None,
    "GRANT ... ON ALL ... IN SCHEMA, ALTER DEFAULT PRIVILEGES and aclexplode",
);

pub const SCHEMA_CREATE_IF_NOT_EXISTS: Feature = Feature::new(
    "schema_create_if_not_exists",
    ServerVersion::new(9, 3),
    None,
    "CREATE SCHEMA IF NOT EXISTS",
);

pub const DEFAULT_PRIVILEGES_ON_SCHEMAS: Feature = Feature::new(
    "default_privileges_on_schemas",
    ServerVersion::new(10, 0),
    None,
    "ALTER DEFAULT PRIVILEGES ... ON SCHEMAS",
);

pub const PROCEDURE: Feature = Feature::new(
    "procedure",
    ServerVersion::new(11, 0),
    None,
    "privileges on procedures",
);

pub const ROUTINE: Feature = Feature::new(
    "routine",
    ServerVersion::new(11, 0),
    None,
    "privileges on routines",
);

pub const PROKIND: Feature = Feature::new(
    "prokind",
    ServerVersion::new(11, 0),
    None,
    "the pg_proc.prokind column distinguishing functions from procedures",
);

pub const MAINTAIN_PRIVILEGE: Feature = Feature::new(
    "maintain_privilege",
    ServerVersion::new(17, 0),
    None,
    "the MAINTAIN table privilege",
);

pub const MEMBERSHIP_OPTIONS: Feature = Feature::new(
    "membership_options",
    ServerVersion::new(16, 0),
    None,
    "per-membership INHERIT and SET options in pg_auth_members",
);

/// Every feature known to the capability gate.
pub const ALL_FEATURES: &[&Feature] = &[
    &PRIVILEGES,
    &SCHEMA_CREATE_IF_NOT_EXISTS,
    &DEFAULT_PRIVILEGES_ON_SCHEMAS,
    &PROCEDURE,
    &ROUTINE,
    &PROKIND,
    &MAINTAIN_PRIVILEGE,
    &MEMBERSHIP_OPTIONS,
];

/// The features supported by one connected server.
///
/// Derived once when a connection is established and never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilitySet {
    version: ServerVersion,
    supported: BTreeSet<&'static str>,
}

impl CapabilitySet {
    pub fn new(version: ServerVersion) -> CapabilitySet {
        let supported = ALL_FEATURES
            .iter()
            .filter(|feature| feature.available_in(version))
            .map(|feature| feature.name)
            .collect();
        CapabilitySet { version, supported }
    }

    pub fn version(&self) -> ServerVersion {
        self.version
    }

    pub fn supports(&self, feature: &Feature) -> bool {
        self.supported.contains(feature.name)
    }

    /// Like [`CapabilitySet::supports`], for a feature named at runtime.
    /// Unknown names are unsupported.
    pub fn supports_named(&self, name: &str) -> bool {
        self.supported.contains(name)
    }

    /// Fails with [`AclError::Unsupported`] unless `feature` is supported.
    pub fn require(&self, feature: &Feature) -> Result<(), AclError> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(AclError::Unsupported {
                feature: feature.name,
                version: self.version,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_num_decoding() {
        assert_eq!(
            ServerVersion::from_version_num(90603).unwrap(),
            ServerVersion::new(9, 6)
        );
        assert_eq!(
            ServerVersion::from_version_num(150004).unwrap(),
            ServerVersion::new(15, 4)
        );
        assert_eq!(
            ServerVersion::from_version_num(100000).unwrap(),
            ServerVersion::new(10, 0)
        );
        assert!(ServerVersion::from_version_num(-1).is_err());
        assert!(ServerVersion::from_version_num(704).is_err());
    }

    #[test]
    fn version_strings() {
        assert_eq!("15".parse::<ServerVersion>().unwrap(), ServerVersion::new(15, 0));
        assert_eq!("9.6.24".parse::<ServerVersion>().unwrap(), ServerVersion::new(9, 6));
        assert!("".parse::<ServerVersion>().is_err());
        assert!("fifteen".parse::<ServerVersion>().is_err());
        assert_eq!(ServerVersion::new(9, 6).to_string(), "9.6");
        assert!(ServerVersion::new(9, 6) < ServerVersion::new(10, 0));
    }

    #[test]
    fn gate_boundaries() {
        let pg10 = CapabilitySet::new(ServerVersion::new(10, 23));
        let pg11 = CapabilitySet::new(ServerVersion::new(11, 0));
        assert!(!pg10.supports(&PROKIND));
        assert!(pg11.supports(&PROKIND));
        assert!(pg11.supports_named("procedure"));
        assert!(!pg11.supports_named("no_such_feature"));

        match pg10.require(&ROUTINE) {
            Err(AclError::Unsupported { feature, version }) => {
                assert_eq!(feature, "routine");
                assert_eq!(version, ServerVersion::new(10, 23));
            }
            other => panic!("unexpected result {other:?}"),
        }

        let pg96 = CapabilitySet::new(ServerVersion::new(9, 6));
        assert!(pg96.supports(&SCHEMA_CREATE_IF_NOT_EXISTS));
        assert!(!pg96.supports(&DEFAULT_PRIVILEGES_ON_SCHEMAS));
        assert!(!pg96.supports(&PROCEDURE));
    }

    #[test]
    fn features_with_an_upper_bound() {
        let retired = Feature::new(
            "retired",
            ServerVersion::new(9, 0),
            Some(ServerVersion::new(15, 0)),
            "removed in 16",
        );
        assert!(retired.available_in(ServerVersion::new(15, 6)));
        assert!(!retired.available_in(ServerVersion::new(16, 0)));
        assert!(!retired.available_in(ServerVersion::new(8, 4)));
    }

    #[test]
    fn membership_options_arrive_in_16() {
        assert!(!CapabilitySet::new(ServerVersion::new(15, 6)).supports(&MEMBERSHIP_OPTIONS));
        assert!(CapabilitySet::new(ServerVersion::new(16, 0)).supports(&MEMBERSHIP_OPTIONS));
    }

    #[test]
    fn feature_names_are_unique() {
        let names: BTreeSet<_> = ALL_FEATURES.iter().map(|f| f.name()).collect();
        assert_eq!(names.len(), ALL_FEATURES.len());
    }
}
