//! Certificate encoding helpers: PEM decoding, fingerprints, serials, and
//! read-back of issued certificates.

use aws_lc_rs::digest::{digest, SHA256};
use chrono::{DateTime, Utc};
use x509_parser::prelude::*;

use crate::{PkiError, Result};

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// SHA-256 over `der`, rendered as uppercase colon-separated hex.
///
/// `AB:CD:...` with 32 byte groups, the form brokers print for client certs.
pub fn fingerprint_der(der: &[u8]) -> String {
    let hash = digest(&SHA256, der);
    colon_hex(hash.as_ref())
}

/// Fingerprint of a PEM certificate
pub fn fingerprint_pem(pem_data: &str) -> Result<String> {
    Ok(fingerprint_der(&parse_pem(pem_data)?))
}

/// Uppercase hex of the serial number's DER content bytes
pub fn format_serial(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{:02X}", b)).collect()
}

fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Convert an X.509 time to UTC, second precision.
fn to_utc(time: ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| PkiError::ParseError(format!("timestamp out of range: {}", time)))
}

/// Fields read back from an encoded certificate
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateInfo {
    /// Subject common name ("" when absent)
    pub common_name: String,
    /// Serial number, uppercase hex
    pub serial_number: String,
    /// SHA-256 fingerprint of the DER encoding
    pub fingerprint: String,
    /// Start of the validity window
    pub not_before: DateTime<Utc>,
    /// End of the validity window
    pub not_after: DateTime<Utc>,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// Whether basic constraints mark this as a CA
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

        Ok(Self {
            common_name,
            serial_number: format_serial(cert.raw_serial()),
            fingerprint: fingerprint_der(der),
            not_before: to_utc(cert.validity().not_before)?,
            not_after: to_utc(cert.validity().not_after)?,
            dns_names,
            is_ca,
        })
    }

    /// Whether `now` falls inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}
