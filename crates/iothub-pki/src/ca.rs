//! Root certificate authority
//!
//! The hub holds one long-lived root key pair. It is created exactly once per
//! deployment and persisted as a PEM file pair; every later start loads the
//! same pair. A root that is present but unusable is a fatal error: issuing
//! from a fresh root would strand every certificate already in the field.
//!
//! # Files
//!
//! - `ca-key.pem`: PKCS#8 private key, mode `0600`
//! - `ca-cert.pem`: self-signed root certificate, mode `0644`

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use tracing::{info, warn};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::cert::{fingerprint_der, parse_pem, CertificateInfo};
use crate::{PkiError, Result};

/// Default validity period for the root certificate (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// File name of the persisted root private key
pub const CA_KEY_FILE: &str = "ca-key.pem";

/// File name of the persisted root certificate
pub const CA_CERT_FILE: &str = "ca-cert.pem";

/// Root identity and storage location
#[derive(Debug, Clone, PartialEq)]
pub struct CaConfig {
    /// Directory holding [`CA_KEY_FILE`] and [`CA_CERT_FILE`]
    pub dir: PathBuf,
    /// Subject common name of the root
    pub common_name: String,
    /// Subject organization
    pub organization: String,
    /// Subject organizational unit
    pub organizational_unit: String,
    /// Root validity in years
    pub validity_years: i64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(iothub_common::DEFAULT_CA_DIR),
            common_name: "IoT Hub Root CA".to_string(),
            organization: "IoT Hub".to_string(),
            organizational_unit: "Certificate Authority".to_string(),
            validity_years: CA_VALIDITY_YEARS,
        }
    }
}

impl CaConfig {
    /// Config rooted at `dir` with default identity
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Path of the private key file
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILE)
    }

    /// Path of the certificate file
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }
}

/// Compute a validity window starting now, truncated to whole seconds.
///
/// X.509 times carry no sub-second part; truncating here keeps the values
/// reported to callers identical to what a parser reads back.
pub(crate) fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    (now, now + ::time::Duration::days(days))
}

/// The root CA service.
///
/// Construct once with [`CertificateAuthority::initialize`] and share it
/// behind an `Arc`.
pub struct CertificateAuthority {
    /// Root key, PEM. `KeyPair` is not `Clone`, so it is re-parsed per signature.
    ca_key_pem: Zeroizing<String>,
    /// Root certificate, PEM
    ca_cert_pem: String,
    /// Fingerprint of the root certificate
    fingerprint: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the persisted root, or create it if and only if neither file exists.
    pub fn initialize(config: &CaConfig) -> Result<Self> {
        let key_path = config.key_path();
        let cert_path = config.cert_path();

        let key_exists = probe_file(&key_path)?;
        let cert_exists = probe_file(&cert_path)?;

        match (key_exists, cert_exists) {
            (false, false) => {
                let ca = Self::generate(config)?;
                ca.persist(&config.dir)?;
                info!(
                    dir = %config.dir.display(),
                    fingerprint = %ca.fingerprint,
                    "Created new root CA"
                );
                Ok(ca)
            }
            (true, true) => {
                let key_pem = Zeroizing::new(std::fs::read_to_string(&key_path).map_err(|e| {
                    PkiError::CaMaterial(format!("cannot read {}: {}", key_path.display(), e))
                })?);
                let cert_pem = std::fs::read_to_string(&cert_path).map_err(|e| {
                    PkiError::CaMaterial(format!("cannot read {}: {}", cert_path.display(), e))
                })?;

                let ca = Self::from_pem(&cert_pem, &key_pem)?;
                info!(fingerprint = %ca.fingerprint, "Loaded existing root CA");
                Ok(ca)
            }
            (key_exists, _) => {
                let (present, missing) = if key_exists {
                    (&key_path, &cert_path)
                } else {
                    (&cert_path, &key_path)
                };
                warn!(
                    present = %present.display(),
                    missing = %missing.display(),
                    "Refusing to regenerate root CA over partial material"
                );
                Err(PkiError::CaMaterial(format!(
                    "{} exists but {} is missing",
                    present.display(),
                    missing.display()
                )))
            }
        }
    }

    /// Create a new self-signed root in memory.
    pub fn generate(config: &CaConfig) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(config.common_name.clone()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(config.organization.clone()),
        );
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(config.organizational_unit.clone()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(config.validity_years * 365);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            fingerprint: fingerprint_der(cert.der()),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a root from PEM, checking that the certificate is a CA and that
    /// the key is the one it was issued for.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::CaMaterial(format!("failed to parse CA key: {}", e)))?;

        let cert_der = parse_pem(cert_pem)
            .map_err(|e| PkiError::CaMaterial(format!("failed to parse CA cert: {}", e)))?;
        let info = CertificateInfo::from_der(&cert_der)
            .map_err(|e| PkiError::CaMaterial(e.to_string()))?;
        if !info.is_ca {
            return Err(PkiError::CaMaterial(
                "certificate is not marked as a CA".to_string(),
            ));
        }

        // Sign a throwaway certificate and check it against the root's public key
        let issuer = Issuer::from_ca_cert_pem(cert_pem, &key_pair)
            .map_err(|e| PkiError::CaMaterial(format!("failed to create issuer: {}", e)))?;
        let probe = CertificateParams::default()
            .signed_by(&key_pair, &issuer)
            .map_err(|e| PkiError::CaMaterial(format!("failed to sign with CA key: {}", e)))?;
        if !signed_by(probe.der(), &cert_der)? {
            return Err(PkiError::CaMaterial(
                "private key does not match CA certificate".to_string(),
            ));
        }

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pem.to_string()),
            ca_cert_pem: cert_pem.to_string(),
            fingerprint: info.fingerprint,
        })
    }

    /// Write the key (`0600`) and certificate (`0644`) into `dir`.
    ///
    /// Both files are written in full under staging names, then linked into
    /// place. If the pair cannot be completed the key is unlinked again.
    /// Never overwrites: an existing file is an error.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let key_path = dir.join(CA_KEY_FILE);
        let cert_path = dir.join(CA_CERT_FILE);
        let key_staged = staging_path(&key_path);
        let cert_staged = staging_path(&cert_path);

        let result = write_staged(&key_staged, self.ca_key_pem.as_bytes(), 0o600)
            .and_then(|_| write_staged(&cert_staged, self.ca_cert_pem.as_bytes(), 0o644))
            .and_then(|_| link_pair(&key_staged, &key_path, &cert_staged, &cert_path));

        for staged in [&key_staged, &cert_staged] {
            if let Err(e) = std::fs::remove_file(staged) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %staged.display(), error = %e, "Failed to remove staged CA file");
                }
            }
        }
        result
    }

    /// Root certificate in PEM format (distributed to devices and the broker)
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Root private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Fingerprint of the root certificate
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Read back the root certificate fields
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    /// Load the key pair from stored PEM
    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Sign a prepared CSR with the root key.
    pub(crate) fn sign_request(&self, csr: CertificateSigningRequestParams) -> Result<Certificate> {
        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        csr.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })
    }
}

/// Whether `cert_der` carries a signature made by the key in `issuer_der`.
pub(crate) fn signed_by(cert_der: &[u8], issuer_der: &[u8]) -> Result<bool> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    let (_, issuer) = X509Certificate::from_der(issuer_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;
    Ok(cert.verify_signature(Some(issuer.public_key())).is_ok())
}

/// `Ok(true)` if present, `Ok(false)` if absent, error if the check itself fails.
fn probe_file(path: &Path) -> Result<bool> {
    path.try_exists()
        .map_err(|e| PkiError::CaMaterial(format!("cannot stat {}: {}", path.display(), e)))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".staged");
    path.with_file_name(name)
}

/// Write a fresh staging file, discarding one left by an interrupted run.
fn write_staged(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    write_new_file(path, contents, mode)
}

/// Hard links refuse an existing target, so neither file is ever replaced.
fn link_pair(
    key_staged: &Path,
    key_path: &Path,
    cert_staged: &Path,
    cert_path: &Path,
) -> Result<()> {
    std::fs::hard_link(key_staged, key_path)?;
    if let Err(e) = std::fs::hard_link(cert_staged, cert_path) {
        if let Err(cleanup) = std::fs::remove_file(key_path) {
            warn!(path = %key_path.display(), error = %cleanup, "Failed to remove unpaired CA key");
        }
        return Err(e.into());
    }
    Ok(())
}

fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
