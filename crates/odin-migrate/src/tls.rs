//! TLS and connection pooling for the Heimdall and Odin PostgreSQL databases.

use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime, Timeouts};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ConfigBuilder, DigitallySignedStruct, SignatureScheme, WantsVerifier};
use tokio_postgres::Config as PgConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};

/// Timeout for establishing a new connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the pool's liveness check on a returned connection.
const RECYCLE_TIMEOUT: Duration = Duration::from_secs(5);

/// PostgreSQL `sslmode` values supported by both pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Plain TCP.
    #[default]
    Disable,
    /// Encrypt, but accept any server certificate.
    Require,
    /// Verify the certificate chain. rustls always checks the hostname too.
    VerifyCa,
    /// Verify the certificate chain and hostname.
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disable" | "" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(MigrateError::Config(format!(
                "invalid ssl_mode '{}' (expected disable, require, verify-ca or verify-full)",
                other
            ))),
        }
    }

    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// rustls client configuration for this mode, or `None` for plain TCP.
    pub fn client_config(&self) -> Result<Option<ClientConfig>> {
        let config = match self {
            SslMode::Disable => return Ok(None),
            SslMode::Require => {
                warn!(
                    "ssl_mode=require encrypts the connection but does not verify the server \
                     certificate; use verify-full outside trusted networks"
                );
                tls_builder()?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                    .with_no_client_auth()
            }
            SslMode::VerifyCa | SslMode::VerifyFull => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                tls_builder()?
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };
        Ok(Some(config))
    }
}

fn tls_builder() -> Result<ConfigBuilder<ClientConfig, WantsVerifier>> {
    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| MigrateError::Config(format!("TLS setup failed: {}", e)))
}

/// Build a connection pool for `db` and check it with `SELECT 1`.
///
/// `label` names the database in errors and logs ("source" or "target").
/// `operation_timeout` bounds both the wait for a free connection and every
/// statement on the server (`statement_timeout`).
pub async fn connect_pool(db: &DatabaseConfig, label: &str, operation_timeout: Duration) -> Result<Pool> {
    let ssl_mode = SslMode::parse(&db.ssl_mode)?;

    let mut pg_config = PgConfig::new();
    pg_config
        .host(&db.host)
        .port(db.port)
        .dbname(&db.database)
        .user(&db.user)
        .password(&db.password)
        .keepalives(true)
        .keepalives_idle(Duration::from_secs(30))
        .connect_timeout(CONNECT_TIMEOUT)
        .options(&statement_timeout_option(operation_timeout));

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let manager = match ssl_mode.client_config()? {
        Some(tls) => Manager::from_config(pg_config, MakeRustlsConnect::new(tls), mgr_config),
        None => {
            warn!(
                "{} connection TLS is disabled; credentials travel in plaintext",
                label
            );
            Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
        }
    };

    let pool = Pool::builder(manager)
        .max_size(db.max_connections)
        .runtime(Runtime::Tokio1)
        .timeouts(Timeouts {
            wait: Some(operation_timeout),
            create: Some(CONNECT_TIMEOUT),
            recycle: Some(RECYCLE_TIMEOUT),
        })
        .build()
        .map_err(|e| MigrateError::pool(e, format!("creating {} pool", label)))?;

    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e, format!("testing {} connection", label)))?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| MigrateError::Connection(format!("{} health query: {}", label, e)))?;

    info!("Connected to {} database {}", label, db.display_target());
    Ok(pool)
}

/// Startup option making the server cancel statements that run longer than `timeout`.
fn statement_timeout_option(timeout: Duration) -> String {
    format!("-c statement_timeout={}", timeout.as_millis())
}

/// Certificate verifier for `ssl_mode=require`.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        use SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!(SslMode::parse("disable").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("REQUIRE").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("verify-ca").unwrap(), SslMode::VerifyCa);
        assert_eq!(SslMode::parse("verify-full").unwrap(), SslMode::VerifyFull);
        assert_eq!(SslMode::parse("").unwrap(), SslMode::Disable);
        assert!(SslMode::parse("prefer").is_err());
    }

    #[test]
    fn test_statement_timeout_option() {
        assert_eq!(
            statement_timeout_option(Duration::from_secs(300)),
            "-c statement_timeout=300000"
        );
    }

    #[test]
    fn test_disable_has_no_client_config() {
        assert!(!SslMode::Disable.requires_tls());
        assert!(SslMode::Disable.client_config().unwrap().is_none());
    }

    #[test]
    fn test_tls_modes_build_client_config() {
        for mode in [SslMode::Require, SslMode::VerifyCa, SslMode::VerifyFull] {
            assert!(mode.requires_tls());
            assert!(mode.client_config().unwrap().is_some(), "{:?}", mode);
        }
    }
}
