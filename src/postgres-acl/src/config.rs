// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Connection configuration.

use std::fs;
use std::path::{Path, PathBuf};

use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use postgres::config::SslMode;
use postgres::Client;
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::{self, CapabilitySet, ServerVersion};
use crate::catalog;
use crate::error::AclError;

/// Tunables of the convergence engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// The database to connect to for operations on server-global objects.
    pub maintenance_database: String,
    /// Derive capabilities from this version instead of asking the server.
    pub expected_version: Option<ServerVersion>,
    /// Applied to every statement of the session, in milliseconds.
    pub statement_timeout_ms: Option<u64>,
    /// PEM file of the certificate authority to verify the server against.
    pub ssl_root_cert: Option<PathBuf>,
    /// PEM file of the client certificate. Requires `ssl_key`.
    pub ssl_cert: Option<PathBuf>,
    /// PEM file of the client certificate's private key. Requires `ssl_cert`.
    pub ssl_key: Option<PathBuf>,
    /// Check the server certificate's host name as well as its chain.
    pub ssl_verify_hostname: bool,
}

impl Default for EngineOptions {
    fn default() -> EngineOptions {
        EngineOptions {
            maintenance_database: "postgres".into(),
            expected_version: None,
            statement_timeout_ms: None,
            ssl_root_cert: None,
            ssl_cert: None,
            ssl_key: None,
            ssl_verify_hostname: false,
        }
    }
}

/// Configuration for connections to the managed server.
#[derive(Clone, Debug)]
pub struct Config {
    inner: postgres::Config,
    options: EngineOptions,
}

impl Config {
    /// The environment variable holding the URL of a server that tests may
    /// create and drop roles and schemas on. The role it names must be a
    /// superuser.
    pub const TEST_URL_ENV: &'static str = "MZ_POSTGRES_ACL_TEST_URL";

    pub fn new(inner: postgres::Config, options: EngineOptions) -> Config {
        Config { inner, options }
    }

    /// Returns a config for the test server, or `None` if
    /// [`Config::TEST_URL_ENV`] is unset.
    pub fn new_for_test() -> Result<Option<Config>, AclError> {
        match std::env::var(Self::TEST_URL_ENV) {
            Ok(url) => Config::from_url(&url).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Parses a libpq-style connection string or URL, with default options.
    pub fn from_url(url: &str) -> Result<Config, AclError> {
        let inner = url.parse::<postgres::Config>()?;
        Ok(Config::new(inner, EngineOptions::default()))
    }

    pub fn with_options(mut self, options: EngineOptions) -> Config {
        self.options = options;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn inner(&self) -> &postgres::Config {
        &self.inner
    }

    /// The database named by the connection string, or the maintenance
    /// database if it names none.
    pub fn default_database(&self) -> &str {
        self.inner
            .get_dbname()
            .unwrap_or(&self.options.maintenance_database)
    }

    /// Connects to `database` and derives the server's capabilities.
    pub fn connect(&self, database: &str) -> Result<Connection, AclError> {
        let mut config = self.inner.clone();
        config.dbname(database);
        if let Some(timeout) = self.options.statement_timeout_ms {
            config.options(&format!("-c statement_timeout={timeout}"));
        }
        let tls = make_tls(&config, &self.options)?;
        let mut client = config.connect(tls)?;

        let version = match self.options.expected_version {
            Some(version) => version,
            None => catalog::server_version(&mut client)?,
        };
        let capabilities = CapabilitySet::new(version);
        capabilities.require(&capability::PRIVILEGES)?;
        debug!(%database, %version, "connected");

        Ok(Connection {
            client,
            capabilities,
            database: database.to_owned(),
        })
    }

    /// Connects to the maintenance database.
    pub fn connect_maintenance(&self) -> Result<Connection, AclError> {
        self.connect(&self.options.maintenance_database)
    }
}

/// A connection to one database of the managed server.
pub struct Connection {
    client: Client,
    capabilities: CapabilitySet,
    database: String,
}

impl Connection {
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    /// Borrows the client mutably alongside the capabilities.
    pub fn split(&mut self) -> (&mut Client, &CapabilitySet) {
        (&mut self.client, &self.capabilities)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("database", &self.database)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, AclError> {
    match fs::read(path) {
        Ok(pem) => Ok(pem),
        Err(e) => bail_generic!("reading {}: {}", path.display(), e),
    }
}

/// Creates a TLS connector for `config`.
pub fn make_tls(config: &postgres::Config, options: &EngineOptions) -> Result<MakeTlsConnector, AclError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    // The mode dictates whether we verify peer certs and hostnames. As with
    // libpq, sslmode=require verifies the certificate chain only when a root
    // certificate is configured.
    let (verify_mode, verify_hostname) = match config.get_ssl_mode() {
        SslMode::Disable | SslMode::Prefer => (SslVerifyMode::NONE, false),
        SslMode::Require => match options.ssl_root_cert {
            Some(_) => (SslVerifyMode::PEER, options.ssl_verify_hostname),
            None => (SslVerifyMode::NONE, false),
        },
        mode => bail_generic!("unsupported sslmode {:?}", mode),
    };

    builder.set_verify(verify_mode);

    match (&options.ssl_cert, &options.ssl_key) {
        (Some(ssl_cert), Some(ssl_key)) => {
            builder.set_certificate(&*X509::from_pem(&read_pem(ssl_cert)?)?)?;
            builder.set_private_key(&*PKey::private_key_from_pem(&read_pem(ssl_key)?)?)?;
        }
        (None, Some(_)) => {
            bail_generic!("must provide both sslcert and sslkey, but only provided sslkey")
        }
        (Some(_), None) => {
            bail_generic!("must provide both sslcert and sslkey, but only provided sslcert")
        }
        (None, None) => {}
    }
    if let Some(ssl_root_cert) = &options.ssl_root_cert {
        builder
            .cert_store_mut()
            .add_cert(X509::from_pem(&read_pem(ssl_root_cert)?)?)?;
    }

    let mut tls_connector = MakeTlsConnector::new(builder.build());

    if verify_mode == SslVerifyMode::PEER && !verify_hostname {
        tls_connector.set_callback(|connect, _| {
            connect.set_verify_hostname(false);
            Ok(())
        });
    }

    Ok(tls_connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_fill_in_defaults() {
        let options: EngineOptions =
            serde_json::from_str(r#"{"expected_version": "9.6", "statement_timeout_ms": 5000}"#)
                .unwrap();
        assert_eq!(options.maintenance_database, "postgres");
        assert_eq!(options.expected_version, Some(ServerVersion::new(9, 6)));
        assert_eq!(options.statement_timeout_ms, Some(5000));
        assert!(!options.ssl_verify_hostname);

        assert!(serde_json::from_str::<EngineOptions>(r#"{"expected_version": "nine"}"#).is_err());
    }

    #[test]
    fn client_certificates_come_in_pairs() {
        let config = Config::from_url("host=localhost user=admin sslmode=require").unwrap();
        let options = EngineOptions {
            ssl_key: Some("/nonexistent/client.key".into()),
            ..Default::default()
        };
        match make_tls(config.inner(), &options) {
            Err(err) => assert!(err.to_string().contains("only provided sslkey"), "{err}"),
            Ok(_) => panic!("a key without a certificate was accepted"),
        }

        let options = EngineOptions {
            ssl_root_cert: Some("/nonexistent/root.crt".into()),
            ..Default::default()
        };
        match make_tls(config.inner(), &options) {
            Err(err) => assert!(err.to_string().contains("/nonexistent/root.crt"), "{err}"),
            Ok(_) => panic!("a missing root certificate was accepted"),
        }

        assert!(make_tls(config.inner(), &EngineOptions::default()).is_ok());
    }

    #[test]
    fn malformed_urls_are_rejected() {
        assert!(Config::from_url("host=localhost port=notaport").is_err());
        let config = Config::from_url("postgres://admin@localhost/app").unwrap();
        assert_eq!(config.options().maintenance_database, "postgres");
    }
}
