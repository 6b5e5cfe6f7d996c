//! Certificate authority: holds the root CA and mints, caches, and re-uses
//! per-hostname leaf certificates for TLS termination toward the client
//! during MITM.

mod storage;

use crate::error::ProxyError;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::{Duration, OffsetDateTime};

const ROOT_VALIDITY: StdDuration = StdDuration::from_secs(365 * 10 * 24 * 3600);
const LEAF_VALIDITY_DAYS: i64 = 365;
const RSA_KEY_BITS: usize = 2048;

/// A minted leaf — subject, chain (leaf + root), private key, and expiry.
/// Kept behind `Arc` so cache hits clone cheaply and every concurrent
/// reader of a given cache entry shares the same certificate by identity.
pub struct CertificateEntry {
    pub hostname: String,
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub not_after: OffsetDateTime,
}

impl CertificateEntry {
    fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.not_after
    }
}

/// Root CA plus the leaf cache, shared across every connection driver as a
/// process-lifetime singleton. `DashMap` gives per-shard locking for the
/// cache: a cache miss mints under the shard lock, so a second concurrent
/// lookup for the same key blocks on the first's `entry()` call rather than
/// racing it — no two concurrent issuances for the same cache key occur.
pub struct CertificateAuthority {
    root_chain: Vec<CertificateDer<'static>>,
    issuer: Issuer<'static, KeyPair>,
    cache: DashMap<String, Arc<CertificateEntry>>,
}

impl CertificateAuthority {
    /// Root CA acquisition: load from `ca_path` if present, else generate
    /// and (if a path was given) persist the encrypted form.
    pub fn load_or_generate(
        ca_path: Option<&Path>,
        ca_password: Option<&str>,
    ) -> Result<Self, ProxyError> {
        let (cert_pem, key_pem) = match ca_path {
            Some(path) if path.exists() => {
                let password = ca_password
                    .ok_or_else(|| ProxyError::Ca("ca_path set but no ca_password given".to_string()))?;
                storage::load(path, password).map_err(|e| ProxyError::Ca(e.to_string()))?
            }
            _ => {
                let (cert_pem, key_pem) = generate_root()?;
                if let Some(path) = ca_path {
                    let password = ca_password.unwrap_or_default();
                    storage::save(path, &cert_pem, &key_pem, password)
                        .map_err(|e| ProxyError::Ca(e.to_string()))?;
                }
                (cert_pem, key_pem)
            }
        };

        Self::from_pem(&cert_pem, &key_pem)
    }

    fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, ProxyError> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| ProxyError::Ca(format!("bad CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| ProxyError::Ca(format!("bad CA cert: {e}")))?;
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Ca(format!("bad CA cert DER: {e}")))?;
        Ok(CertificateAuthority {
            root_chain: der,
            issuer,
            cache: DashMap::new(),
        })
    }

    /// The root certificate, DER-encoded, for exposing to callers that need
    /// to write it out for trust-store installation (an external concern,
    /// not handled here).
    pub fn root_certificate_der(&self) -> &[CertificateDer<'static>] {
        &self.root_chain
    }

    /// Per-host leaf issuance. Normalizes `name`, derives the wildcard
    /// cache key when eligible, and mints under that key on a cache miss.
    pub fn get_for_host(&self, name: &str) -> Result<Arc<CertificateEntry>, ProxyError> {
        let normalized = normalize_host(name);
        let cache_key = wildcard_parent(&normalized).unwrap_or_else(|| normalized.clone());

        if let Some(entry) = self.cache.get(&cache_key) {
            if !entry.is_expired() {
                return Ok(entry.clone());
            }
        }

        // `entry()` holds the shard lock for the duration of this match:
        // concurrent callers for the same key block here rather than both
        // minting, and the second sees the first's result on unblocking.
        use dashmap::mapref::entry::Entry;
        match self.cache.entry(cache_key) {
            Entry::Occupied(occupied) if !occupied.get().is_expired() => {
                Ok(occupied.get().clone())
            }
            entry => {
                let minted = match self.mint_leaf(&normalized, wildcard_parent(&normalized).as_deref()) {
                    Ok(leaf) => {
                        metrics::counter!("snitcher_leaf_mint_total", "result" => "success").increment(1);
                        Arc::new(leaf)
                    }
                    Err(e) => {
                        metrics::counter!("snitcher_leaf_mint_total", "result" => "error").increment(1);
                        return Err(e);
                    }
                };
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(minted.clone());
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(minted.clone());
                    }
                }
                Ok(minted)
            }
        }
    }

    fn mint_leaf(
        &self,
        name: &str,
        wildcard: Option<&str>,
    ) -> Result<CertificateEntry, ProxyError> {
        let is_ip = name.parse::<IpAddr>().is_ok();

        let mut params = if is_ip {
            CertificateParams::new(Vec::new())
                .map_err(|e| ProxyError::Ca(format!("cert params: {e}")))?
        } else {
            CertificateParams::new(vec![name.to_string()])
                .map_err(|e| ProxyError::Ca(format!("cert params: {e}")))?
        };

        if let Ok(ip) = name.parse::<IpAddr>() {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else if let Some(wildcard) = wildcard {
            params
                .subject_alt_names
                .push(SanType::DnsName(wildcard.to_string().try_into().unwrap()));
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + Duration::days(LEAF_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let leaf_key = generate_rsa_keypair()?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| ProxyError::Ca(format!("leaf sign failed: {e}")))?;

        let mut chain = vec![cert.der().clone()];
        chain.extend(self.root_chain.iter().cloned());

        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());

        Ok(CertificateEntry {
            hostname: name.to_string(),
            chain,
            key: PrivateKeyDer::Pkcs8(key_der),
            not_after,
        })
    }
}

/// Generate the self-signed root CA: 2048-bit RSA, CN `Snitcher Proxy CA`,
/// `keyCertSign | cRLSign`, `CA:TRUE`, 10-year validity.
fn generate_root() -> Result<(String, String), ProxyError> {
    let key_pair = generate_rsa_keypair()?;

    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Snitcher Proxy CA");
    params.distinguished_name = dn;

    let not_before = OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + Duration::seconds(ROOT_VALIDITY.as_secs() as i64);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::Ca(format!("root self-sign failed: {e}")))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// rcgen cannot generate RSA keys itself (only EC/Ed25519); the key
/// material is generated with the `rsa` crate and handed to rcgen as
/// externally-generated PKCS#8 DER, matching the 2048-bit RSA requirement.
fn generate_rsa_keypair() -> Result<KeyPair, ProxyError> {
    let private_key = rsa::RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| ProxyError::Ca(format!("rsa keygen failed: {e}")))?;
    let pkcs8 = private_key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::Ca(format!("rsa pkcs8 encode failed: {e}")))?;
    let der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    KeyPair::from_pkcs8_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| ProxyError::Ca(format!("rcgen keypair from rsa der: {e}")))
}

/// Lowercase; strip a trailing `:port`; IP literals pass through verbatim.
fn normalize_host(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    if name.parse::<IpAddr>().is_ok() {
        return name;
    }
    if let Some(rest) = name.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    match name.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => name,
    }
}

/// Derive `*.example.com` for a multi-label hostname like `api.example.com`
/// (three or more labels). TLDs and single-label names (and IP literals,
/// filtered out by the caller) are cached as themselves.
fn wildcard_parent(normalized: &str) -> Option<String> {
    if normalized.parse::<IpAddr>().is_ok() {
        return None;
    }
    let labels: Vec<&str> = normalized.split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    Some(format!("*.{}", labels[1..].join(".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_port() {
        assert_eq!(normalize_host("Example.COM:8443"), "example.com");
    }

    #[test]
    fn ip_literal_passes_through() {
        assert_eq!(normalize_host("192.168.1.1"), "192.168.1.1");
    }

    #[test]
    fn wildcard_parent_for_multi_label() {
        assert_eq!(
            wildcard_parent("api.example.com"),
            Some("*.example.com".to_string())
        );
        assert_eq!(
            wildcard_parent("cdn.example.com"),
            Some("*.example.com".to_string())
        );
    }

    #[test]
    fn no_wildcard_for_apex_or_single_label() {
        assert_eq!(wildcard_parent("example.com"), None);
        assert_eq!(wildcard_parent("localhost"), None);
    }

    #[test]
    fn root_generation_round_trips_through_pem() {
        let (cert_pem, key_pem) = generate_root().unwrap();
        let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(ca.root_chain.len(), 1);
    }

    #[test]
    fn get_for_host_shares_wildcard_leaf_across_siblings() {
        let (cert_pem, key_pem) = generate_root().unwrap();
        let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
        let first = ca.get_for_host("api.example.com").unwrap();
        let second = ca.get_for_host("cdn.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn get_for_host_returns_identical_entry_on_repeat() {
        let (cert_pem, key_pem) = generate_root().unwrap();
        let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
        let first = ca.get_for_host("standalonehost").unwrap();
        let second = ca.get_for_host("standalonehost").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
