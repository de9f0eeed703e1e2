//! Certificate signing requests
//!
//! Devices generate their key pair locally and send only a CSR; the hub never
//! sees a device private key. [`verify_csr`] is the hub-side gate every CSR
//! passes before any signing happens.

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use zeroize::Zeroizing;

use crate::{PkiError, Result};

/// Facts extracted from a CSR whose self-signature verified
#[derive(Debug, Clone)]
pub struct VerifiedCsr {
    /// SubjectPublicKeyInfo, PEM ("PUBLIC KEY")
    pub public_key_pem: String,
    /// Common name the CSR asked for, if any. Informational only.
    pub requested_common_name: Option<String>,
}

/// Parse a CSR and check its proof of possession.
///
/// Rejects with [`PkiError::InvalidCsr`] when the data is not a CSR,
/// [`PkiError::MissingPublicKey`] when the embedded key is empty or of an
/// unknown type, and [`PkiError::CsrSignatureInvalid`] when the signature does
/// not verify against that key.
pub fn verify_csr(csr_pem: &str) -> Result<VerifiedCsr> {
    let pem_obj = ::pem::parse(csr_pem.as_bytes())
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse PEM: {}", e)))?;
    if !pem_obj.tag().ends_with("CERTIFICATE REQUEST") {
        return Err(PkiError::InvalidCsr(format!(
            "expected CERTIFICATE REQUEST, got {}",
            pem_obj.tag()
        )));
    }

    let (_, csr) = X509CertificationRequest::from_der(pem_obj.contents())
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

    let info = &csr.certification_request_info;
    let spki = &info.subject_pki;
    if spki.subject_public_key.data.is_empty() {
        return Err(PkiError::MissingPublicKey);
    }
    match spki.parsed() {
        Ok(PublicKey::Unknown(_)) | Err(_) => return Err(PkiError::MissingPublicKey),
        Ok(_) => {}
    }

    csr.verify_signature()
        .map_err(|_| PkiError::CsrSignatureInvalid)?;

    let requested_common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    Ok(VerifiedCsr {
        public_key_pem: ::pem::encode(&::pem::Pem::new("PUBLIC KEY", spki.raw.to_vec())),
        requested_common_name,
    })
}

/// Device-side key pair and CSR
pub struct DeviceCertRequest {
    /// The generated key pair PEM (never leaves the device)
    key_pem: Zeroizing<String>,
    /// CSR in PEM format (sent to the hub)
    csr_pem: String,
}

impl std::fmt::Debug for DeviceCertRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCertRequest")
            .field("csr_pem", &self.csr_pem)
            .finish_non_exhaustive()
    }
}

impl DeviceCertRequest {
    /// Generate a key pair and a CSR whose subject CN is `device_id`
    pub fn generate(device_id: &str) -> Result<Self> {
        Self::with_common_name(device_id)
    }

    /// Generate a key pair and a CSR claiming an arbitrary CN.
    ///
    /// The hub ignores the claim and binds the certificate to the device id it
    /// was submitted for.
    pub fn with_common_name(common_name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate device key: {}", e))
        })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
            csr_pem,
        })
    }

    /// CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM format (to store on the device)
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}
