//! Local certificate authority for TLS interception
//!
//! The CA certificate and key are provisioned externally (and trusted by the
//! OS); this module only loads them and mints short-lived per-host leaves.

use chrono::{Datelike, Duration as ChronoDuration, Utc};
use lru::LruCache;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Result, TapError};

/// ALPN protocols offered to intercepted clients. HTTP/2 is not decoded.
pub const INTERCEPT_ALPN: &[&[u8]] = &[b"http/1.1"];

/// Loads the CA and issues cached leaf certificates
pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    cache: Mutex<LruCache<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Load CA certificate and key from PEM files
    pub fn load(cert_path: &Path, key_path: &Path, cache_size: usize) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            TapError::Certificate(format!(
                "Failed to read CA certificate {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            TapError::Certificate(format!(
                "Failed to read CA key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        Self::from_pem(&cert_pem, &key_pem, cache_size)
    }

    /// Build from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str, cache_size: usize) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| TapError::Certificate(format!("Invalid CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| TapError::Certificate(format!("Invalid CA certificate: {e}")))?;
        // Re-signing with the same key and subject yields an issuer that
        // verifies against the installed CA certificate.
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| TapError::Certificate(format!("Failed to load CA: {e}")))?;

        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            ca_cert,
            ca_key,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// TLS server configuration presenting a leaf certificate for `host`
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();

        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(config) = cache.get(&host) {
                return Ok(config.clone());
            }
        }

        let config = Arc::new(self.mint(&host)?);
        tracing::debug!(host = %host, "Issued leaf certificate");

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(host, config.clone());
        Ok(config)
    }

    /// Number of cached leaf configurations
    pub fn cached_leaves(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn mint(&self, host: &str) -> Result<ServerConfig> {
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| TapError::Certificate(format!("Invalid host name {host}: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let start = Utc::now() - ChronoDuration::days(1);
        let end = Utc::now() + ChronoDuration::days(365);
        params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
        params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);

        let leaf_key = KeyPair::generate()
            .map_err(|e| TapError::Certificate(format!("Failed to generate leaf key: {e}")))?;
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| TapError::Certificate(format!("Failed to sign leaf for {host}: {e}")))?;

        let cert_chain: Vec<CertificateDer<'static>> = vec![leaf.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TapError::Tls(format!("Unsupported protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| TapError::Tls(format!("Invalid leaf certificate for {host}: {e}")))?;

        config.alpn_protocols = INTERCEPT_ALPN.iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }
}
