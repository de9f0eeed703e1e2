//! Certificate admission checks
//!
//! This is the authorization hook the broker consults when a client connects.
//! Checks read only stored state: no CRL fetches, no OCSP, no network.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::{CertificateStatus, DeviceStatus};
use crate::store::CertificateStore;
use crate::Result;

/// Why a presented certificate is not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationFailure {
    /// No certificate with this fingerprint is on record
    #[error("not found")]
    #[serde(rename = "not found")]
    NotFound,
    /// The device or its certificate has been revoked
    #[error("revoked")]
    #[serde(rename = "revoked")]
    Revoked,
    /// The validity window has not started
    #[error("not yet valid")]
    #[serde(rename = "not yet valid")]
    NotYetValid,
    /// The validity window has ended
    #[error("expired")]
    #[serde(rename = "expired")]
    Expired,
    /// Claimed common name or client id differ from the device on record
    #[error("identity mismatch")]
    #[serde(rename = "identity mismatch")]
    IdentityMismatch,
}

/// Outcome of a validation check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    /// Whether the certificate is accepted
    pub valid: bool,
    /// Why not, when rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ValidationFailure>,
    /// Device the certificate belongs to, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl ValidationVerdict {
    fn accept(device_id: String) -> Self {
        Self {
            valid: true,
            reason: None,
            device_id: Some(device_id),
        }
    }

    fn reject(reason: ValidationFailure, device_id: Option<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            device_id,
        }
    }

    /// The accepted device id, or the rejection reason
    pub fn into_result(self) -> std::result::Result<String, ValidationFailure> {
        match (self.valid, self.device_id, self.reason) {
            (true, Some(device_id), _) => Ok(device_id),
            (_, _, Some(reason)) => Err(reason),
            _ => Err(ValidationFailure::NotFound),
        }
    }
}

/// Answers "is this certificate valid for this device right now"
#[derive(Clone)]
pub struct CertificateValidator {
    store: Arc<dyn CertificateStore>,
}

impl CertificateValidator {
    /// Validator over `store`
    pub fn new(store: Arc<dyn CertificateStore>) -> Self {
        Self { store }
    }

    /// Check the certificate with `fingerprint` against the current time
    pub fn validate(&self, fingerprint: &str) -> Result<ValidationVerdict> {
        self.validate_at(fingerprint, Utc::now())
    }

    /// Check the certificate with `fingerprint` as of `now`
    pub fn validate_at(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<ValidationVerdict> {
        let Some(record) = self.store.certificate_by_fingerprint(fingerprint)? else {
            debug!(fingerprint = %fingerprint, "Unknown certificate presented");
            return Ok(ValidationVerdict::reject(ValidationFailure::NotFound, None));
        };
        let device_id = record.device_id.clone();

        let Some(device) = self.store.get_device(&device_id)? else {
            return Ok(ValidationVerdict::reject(ValidationFailure::NotFound, None));
        };

        let verdict = if device.status == DeviceStatus::Revoked
            || record.status == CertificateStatus::Revoked
        {
            ValidationVerdict::reject(ValidationFailure::Revoked, Some(device_id))
        } else if now < record.valid_from {
            ValidationVerdict::reject(ValidationFailure::NotYetValid, Some(device_id))
        } else if now > record.valid_to {
            ValidationVerdict::reject(ValidationFailure::Expired, Some(device_id))
        } else {
            ValidationVerdict::accept(device_id)
        };

        if let Some(reason) = verdict.reason {
            debug!(fingerprint = %fingerprint, reason = %reason, "Certificate rejected");
        }
        Ok(verdict)
    }

    /// [`validate`](Self::validate) plus identity binding: the claimed common
    /// name and MQTT client id must both equal the device on record.
    pub fn validate_for_transport(
        &self,
        fingerprint: &str,
        common_name: &str,
        client_id: &str,
    ) -> Result<ValidationVerdict> {
        self.validate_for_transport_at(fingerprint, common_name, client_id, Utc::now())
    }

    /// [`validate_for_transport`](Self::validate_for_transport) as of `now`
    pub fn validate_for_transport_at(
        &self,
        fingerprint: &str,
        common_name: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ValidationVerdict> {
        let verdict = self.validate_at(fingerprint, now)?;
        if !verdict.valid {
            return Ok(verdict);
        }

        let device_id = verdict.device_id.unwrap_or_default();
        if common_name != device_id || client_id != device_id {
            debug!(
                device_id = %device_id,
                common_name = %common_name,
                client_id = %client_id,
                "Certificate presented under a different identity"
            );
            return Ok(ValidationVerdict::reject(
                ValidationFailure::IdentityMismatch,
                Some(device_id),
            ));
        }
        Ok(ValidationVerdict::accept(device_id))
    }
}
