//! Device and certificate records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a device's relationship to an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Registered, no owner
    Unbound,
    /// Bound to an owner
    Bound,
    /// Revoked; never valid again
    Revoked,
}

/// A device known to the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device identifier (also the certificate CN and MQTT client id)
    pub id: String,
    /// Public key of the last certified key pair, SubjectPublicKeyInfo PEM
    pub public_key: Option<String>,
    /// Current status
    pub status: DeviceStatus,
    /// Owning user, if bound
    pub owner_id: Option<String>,
    /// Hardware model reported at registration
    pub model: Option<String>,
    /// Last time the device authenticated or requested a certificate
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Firmware reported with the last CSR
    pub firmware_version: Option<String>,
    /// Hardware revision reported with the last CSR
    pub hardware_version: Option<String>,
    /// Certificate currently attached to the device
    pub certificate_id: Option<Uuid>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// A freshly registered, unbound device
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            public_key: None,
            status: DeviceStatus::Unbound,
            owner_id: None,
            model: None,
            last_seen_at: None,
            firmware_version: None,
            hardware_version: None,
            certificate_id: None,
            created_at: Utc::now(),
        }
    }

    /// Set the hardware model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Optional facts a device reports along with its CSR
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadata {
    /// Firmware version string
    pub firmware_version: Option<String>,
    /// Hardware revision string
    pub hardware_version: Option<String>,
}

/// Stored status of a certificate.
///
/// Expiry is derived from the validity window at check time; `Expired` is
/// reported by [`CertificateRecord::effective_status`], never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    /// Usable while inside its validity window
    Active,
    /// Revoked with its device
    Revoked,
    /// Past its validity window
    Expired,
}

/// A leaf certificate issued to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    /// Record identifier
    pub id: Uuid,
    /// Device this certificate was issued to
    pub device_id: String,
    /// Leaf certificate, PEM
    pub client_cert_pem: String,
    /// Root certificate that signed it, PEM
    pub ca_cert_pem: String,
    /// SHA-256 of the leaf DER, uppercase colon hex
    pub fingerprint: String,
    /// Serial number, uppercase hex
    pub serial_number: String,
    /// Stored status
    pub status: CertificateStatus,
    /// Start of validity
    pub valid_from: DateTime<Utc>,
    /// End of validity
    pub valid_to: DateTime<Utc>,
    /// Issuance time
    pub created_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// Status as of `now`, folding in expiry
    pub fn effective_status(&self, now: DateTime<Utc>) -> CertificateStatus {
        match self.status {
            CertificateStatus::Active if now > self.valid_to => CertificateStatus::Expired,
            status => status,
        }
    }
}

/// What `sign_csr` hands back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificate {
    /// Device the certificate is bound to
    pub device_id: String,
    /// Leaf certificate, PEM
    pub client_cert_pem: String,
    /// Root certificate, PEM
    pub ca_cert_pem: String,
    /// SHA-256 of the leaf DER, uppercase colon hex
    pub fingerprint: String,
    /// Serial number, uppercase hex
    pub serial_number: String,
    /// Start of validity
    pub valid_from: DateTime<Utc>,
    /// End of validity
    pub valid_to: DateTime<Utc>,
}

impl From<&CertificateRecord> for IssuedCertificate {
    fn from(record: &CertificateRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            client_cert_pem: record.client_cert_pem.clone(),
            ca_cert_pem: record.ca_cert_pem.clone(),
            fingerprint: record.fingerprint.clone(),
            serial_number: record.serial_number.clone(),
            valid_from: record.valid_from,
            valid_to: record.valid_to,
        }
    }
}
