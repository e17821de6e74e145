//! On-demand certificate authority: load/create the root key+cert, mint
//! per-host leaf certificates signed by it, and export the root in PEM or
//! PKCS#12 form for the cert-downloader app. Grounded on the
//! load-or-create flow in `tls/certs.rs` (rama's Apple transparent-proxy
//! example) and on `cloudillo-proxy`'s `build_certified_key` for turning
//! DER material into a `rustls::sign::CertifiedKey`.

mod cache;

pub use cache::LeafCertCache;

use crate::config::CaFileCache;
use crate::error::ProxyError;
use proxytap_error::ErrorContext;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, Issuer, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// `notBefore` tolerance applied to every leaf, to cover client clock skew.
const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(3600);

const ROOT_CA_LIFETIME_DAYS: i64 = 3650;

/// The root CA: a long-lived self-signed key pair used to sign leaves.
/// Not itself cached beyond this struct; leaves are the hot path.
pub struct RootCa {
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
}

impl RootCa {
    /// Load the root CA from `cache`, generating and persisting it if
    /// absent. Filesystem errors surface as [`ProxyError::Setup`].
    pub fn load_or_generate(cache: &CaFileCache, ca_name: &str) -> Result<Self, ProxyError> {
        match cache {
            CaFileCache::Path(path) => {
                if let Ok(cert_pem) = std::fs::read_to_string(path) {
                    let key_path = key_path_for(path);
                    let key_pem = std::fs::read_to_string(&key_path)
                        .context_str_field("key_path", key_path.display().to_string())
                        .map_err(ProxyError::setup)?;
                    return Self::from_pem(cert_pem, key_pem);
                }

                let (cert_pem, key_pem) = generate_root(ca_name)?;

                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .context("create root ca directory")
                        .map_err(ProxyError::setup)?;
                }
                std::fs::write(path, &cert_pem)
                    .context("write root ca cert pem")
                    .map_err(ProxyError::setup)?;
                std::fs::write(key_path_for(path), &key_pem)
                    .context("write root ca key pem")
                    .map_err(ProxyError::setup)?;

                Self::from_pem(cert_pem, key_pem)
            }
            CaFileCache::Memory(sink) => {
                let (cert_pem, key_pem) = generate_root(ca_name)?;
                *sink
                    .lock()
                    .map_err(|_| ProxyError::setup("ca memory sink lock poisoned"))? =
                    cert_pem.clone().into_bytes();
                Self::from_pem(cert_pem, key_pem)
            }
        }
    }

    fn from_pem(cert_pem: String, key_pem: String) -> Result<Self, ProxyError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .context("parse root ca cert pem")
            .map_err(ProxyError::setup)?
            .into_owned();
        Ok(Self {
            cert_pem,
            key_pem,
            cert_der,
        })
    }

    /// Root cert PEM, for the cert-downloader app.
    pub fn get_root_pem(&self) -> String {
        self.cert_pem.clone()
    }

    /// Root cert + key bundled as a password-less PKCS#12 blob, for the
    /// cert-downloader app's `/download/p12` route.
    pub fn get_root_pkcs12(&self) -> Result<Vec<u8>, ProxyError> {
        let key_pair = KeyPair::from_pem(&self.key_pem)
            .context("parse root ca key pem")
            .map_err(ProxyError::setup)?;
        let pfx = p12::PFX::new(
            self.cert_der.as_ref(),
            &key_pair.serialize_der(),
            None,
            "",
            "proxytap-ca",
        )
        .ok_or_else(|| ProxyError::setup("failed to assemble pkcs12 bundle"))?;
        Ok(pfx.to_der())
    }

    /// Mint (or fetch from `cache`) a leaf certificate for `hostname`.
    pub fn mint_leaf(
        &self,
        hostname: &str,
        wildcard: bool,
        wildcard_use_parent: bool,
        lifetime: Duration,
    ) -> Result<Leaf, ProxyError> {
        let (subject, cache_key) = effective_subject(hostname, wildcard, wildcard_use_parent);

        let mut params = CertificateParams::new(vec![]).context("new leaf params").map_err(ProxyError::setup)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.as_str());
        params.distinguished_name = dn;
        params.subject_alt_names = vec![
            san_for(&subject).context("leaf subject as SAN").map_err(ProxyError::setup)?,
        ];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::seconds(CLOCK_SKEW_TOLERANCE.as_secs() as i64);
        params.not_after = now + time::Duration::seconds(lifetime.as_secs() as i64);

        let leaf_key = KeyPair::generate().context("generate leaf key pair").map_err(ProxyError::setup)?;
        let issuer_key =
            KeyPair::from_pem(&self.key_pem).context("parse root ca key pem").map_err(ProxyError::setup)?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, issuer_key)
            .context("build issuer from root ca")
            .map_err(ProxyError::setup)?;
        let leaf_cert = params
            .signed_by(&leaf_key, &issuer)
            .context("sign leaf cert")
            .map_err(ProxyError::setup)?;

        let cert_der = CertificateDer::from(leaf_cert.der().to_vec());
        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
        let certified_key = build_certified_key(cert_der.clone(), key_der.clone_key())
            .ok_or_else(|| ProxyError::setup("failed to build rustls CertifiedKey for leaf"))?;

        Ok(Leaf {
            cache_key,
            cert_der,
            key_der,
            certified_key: Arc::new(certified_key),
        })
    }
}

/// A minted, not-persisted leaf certificate.
pub struct Leaf {
    /// LRU key: the parent domain for wildcard leaves, else the hostname.
    pub cache_key: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
    pub certified_key: Arc<CertifiedKey>,
}

impl Clone for Leaf {
    fn clone(&self) -> Self {
        Self {
            cache_key: self.cache_key.clone(),
            cert_der: self.cert_der.clone(),
            key_der: self.key_der.clone_key(),
            certified_key: Arc::clone(&self.certified_key),
        }
    }
}

/// If `wildcard` and `hostname` has >= 2 labels, collapse to `*.parent`
/// keyed by the parent domain; otherwise the literal hostname is both the
/// subject and the cache key.
pub(crate) fn effective_subject(
    hostname: &str,
    wildcard: bool,
    wildcard_use_parent: bool,
) -> (String, String) {
    if wildcard && wildcard_use_parent {
        let mut labels = hostname.split('.');
        let _first = labels.next();
        let parent: Vec<&str> = labels.collect();
        if !parent.is_empty() {
            let parent = parent.join(".");
            return (format!("*.{parent}"), parent);
        }
    }
    (hostname.to_owned(), hostname.to_owned())
}

fn san_for(subject: &str) -> Result<SanType, io::Error> {
    if let Some(wildcard_parent) = subject.strip_prefix("*.") {
        let name = format!("*.{wildcard_parent}");
        return name
            .try_into()
            .map(SanType::DnsName)
            .map_err(|e| io::Error::other(format!("invalid wildcard dns name: {e}")));
    }
    if let Ok(ip) = subject.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    subject
        .to_owned()
        .try_into()
        .map(SanType::DnsName)
        .map_err(|e| io::Error::other(format!("invalid dns name: {e}")))
}

fn build_certified_key(
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
) -> Option<CertifiedKey> {
    let provider = rustls::crypto::CryptoProvider::get_default()?;
    CertifiedKey::from_der(vec![cert_der], PrivateKeyDer::Pkcs8(key_der), provider).ok()
}

fn generate_root(ca_name: &str) -> Result<(String, String), ProxyError> {
    let mut params = CertificateParams::new(vec![]).context("new root ca params").map_err(ProxyError::setup)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ca_name);
    dn.push(DnType::OrganizationName, ca_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(ROOT_CA_LIFETIME_DAYS);

    let key_pair = KeyPair::generate().context("generate root ca key pair").map_err(ProxyError::setup)?;
    let cert = params
        .self_signed(&key_pair)
        .context("self sign root ca cert")
        .map_err(ProxyError::setup)?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn key_path_for(cert_path: &std::path::Path) -> std::path::PathBuf {
    let mut name = cert_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "proxytap-ca".to_owned());
    name.push_str("-key.pem");
    cert_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_collapses_to_parent_wildcard() {
        let (subject, cache_key) = effective_subject("www.example.com", true, true);
        assert_eq!(subject, "*.example.com");
        assert_eq!(cache_key, "example.com");
    }

    #[test]
    fn wildcard_disabled_keeps_literal_hostname() {
        let (subject, cache_key) = effective_subject("www.example.com", false, false);
        assert_eq!(subject, "www.example.com");
        assert_eq!(cache_key, "www.example.com");
    }

    #[test]
    fn single_label_host_has_no_parent_to_collapse_to() {
        let (subject, cache_key) = effective_subject("localhost", true, true);
        assert_eq!(subject, "localhost");
        assert_eq!(cache_key, "localhost");
    }
}
