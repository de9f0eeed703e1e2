//! Request/response surface for provisioning and broker authorization
//!
//! [`DeviceTrust`] bundles the issuer, validator and device directory behind
//! the two calls an outer HTTP or broker-plugin layer needs: a device posting
//! its CSR, and the broker asking whether a connecting client may proceed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use iothub_common::{DEFAULT_BROKER_URL, DEFAULT_MQTT_PORT, DEFAULT_MQTT_SECURE_PORT};

use crate::ca::CertificateAuthority;
use crate::devices::DeviceDirectory;
use crate::issuer::{CertificateIssuer, IssuerConfig};
use crate::model::DeviceMetadata;
use crate::store::CertificateStore;
use crate::validator::{CertificateValidator, ValidationVerdict};
use crate::Result;

/// Where devices should connect once they hold a certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEndpoint {
    /// Broker URL
    pub broker_url: String,
    /// Plain-TCP port
    pub mqtt_port: u16,
    /// mTLS port
    pub mqtt_secure_port: u16,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_secure_port: DEFAULT_MQTT_SECURE_PORT,
        }
    }
}

/// A device's certificate request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrSubmission {
    /// Device the certificate is for
    pub device_id: String,
    /// PKCS#10 request, PEM
    #[serde(rename = "csrPEM", alias = "csrPem")]
    pub csr_pem: String,
    /// Reported firmware version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    /// Reported hardware revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
}

/// Everything a device needs to connect after a successful CSR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrSubmissionResponse {
    /// Device the certificate is bound to
    pub device_id: String,
    /// Leaf certificate, PEM
    pub client_cert: String,
    /// Root certificate, PEM
    pub ca_cert: String,
    /// Where to connect
    #[serde(flatten)]
    pub broker: BrokerEndpoint,
    /// SHA-256 of the leaf DER
    pub fingerprint: String,
    /// Leaf serial number
    pub serial_number: String,
    /// Start of validity
    pub valid_from: DateTime<Utc>,
    /// End of validity
    pub valid_to: DateTime<Utc>,
}

/// What the broker knows about a connecting client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    /// SHA-256 fingerprint of the presented client certificate
    pub fingerprint: String,
    /// Subject CN of the presented certificate
    pub common_name: String,
    /// MQTT client id from CONNECT
    pub client_id: String,
}

/// Device trust operations over one CA and one store
#[derive(Clone)]
pub struct DeviceTrust {
    issuer: Arc<CertificateIssuer>,
    validator: CertificateValidator,
    directory: DeviceDirectory,
    broker: BrokerEndpoint,
}

impl DeviceTrust {
    /// Wire the components over a shared store
    pub fn new(
        ca: Arc<CertificateAuthority>,
        store: Arc<dyn CertificateStore>,
        issuer_config: IssuerConfig,
        broker: BrokerEndpoint,
    ) -> Self {
        Self {
            issuer: Arc::new(CertificateIssuer::new(ca, store.clone(), issuer_config)),
            validator: CertificateValidator::new(store.clone()),
            directory: DeviceDirectory::new(store),
            broker,
        }
    }

    /// Sign a device CSR and return the connection bundle
    pub fn submit_csr(&self, submission: CsrSubmission) -> Result<CsrSubmissionResponse> {
        let metadata = DeviceMetadata {
            firmware_version: submission.firmware_version,
            hardware_version: submission.hardware_version,
        };
        let issued =
            self.issuer
                .sign_csr_with(&submission.device_id, &submission.csr_pem, &metadata)?;

        Ok(CsrSubmissionResponse {
            device_id: issued.device_id,
            client_cert: issued.client_cert_pem,
            ca_cert: issued.ca_cert_pem,
            broker: self.broker.clone(),
            fingerprint: issued.fingerprint,
            serial_number: issued.serial_number,
            valid_from: issued.valid_from,
            valid_to: issued.valid_to,
        })
    }

    /// Decide whether a connecting client may use the broker.
    ///
    /// The verdict depends only on stored state. An accepted client also
    /// counts as a sighting of its device, but failing to record that never
    /// changes the verdict.
    pub fn authorize(&self, request: &AuthorizationRequest) -> Result<ValidationVerdict> {
        let verdict = self.validator.validate_for_transport(
            &request.fingerprint,
            &request.common_name,
            &request.client_id,
        )?;
        if let (true, Some(device_id)) = (verdict.valid, verdict.device_id.as_deref()) {
            debug!(device_id = %device_id, "Authorized broker client");
            if let Err(e) = self.directory.touch(device_id) {
                warn!(device_id = %device_id, error = %e, "Failed to record device sighting");
            }
        }
        Ok(verdict)
    }

    /// The issuer
    pub fn issuer(&self) -> &CertificateIssuer {
        &self.issuer
    }

    /// The validator
    pub fn validator(&self) -> &CertificateValidator {
        &self.validator
    }

    /// The device directory
    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    /// Advertised broker endpoint
    pub fn broker(&self) -> &BrokerEndpoint {
        &self.broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaConfig;
    use crate::csr::DeviceCertRequest;
    use crate::store::MemoryCertificateStore;
    use crate::validator::ValidationFailure;
    use crate::PkiError;

    fn trust() -> DeviceTrust {
        let ca = Arc::new(
            CertificateAuthority::generate(&CaConfig::default())
                .expect("CA creation should succeed"),
        );
        DeviceTrust::new(
            ca,
            Arc::new(MemoryCertificateStore::new()),
            IssuerConfig::default(),
            BrokerEndpoint::default(),
        )
    }

    fn submission(device_id: &str) -> CsrSubmission {
        let request = DeviceCertRequest::generate(device_id).expect("CSR generation should succeed");
        CsrSubmission {
            device_id: device_id.to_string(),
            csr_pem: request.csr_pem().to_string(),
            firmware_version: Some("2.4.1".to_string()),
            hardware_version: None,
        }
    }

    /// Story: a device provisions itself and then connects to the broker
    #[test]
    fn story_provision_then_connect() {
        let trust = trust();
        trust
            .directory()
            .register("dev-1", None)
            .expect("register should succeed");

        let response = trust
            .submit_csr(submission("dev-1"))
            .expect("CSR should be signed");
        assert_eq!(response.device_id, "dev-1");
        assert_eq!(response.broker.mqtt_secure_port, 8883);
        assert!(response.client_cert.contains("BEGIN CERTIFICATE"));

        let device = trust.directory().get("dev-1").expect("device exists");
        assert_eq!(device.firmware_version.as_deref(), Some("2.4.1"));

        let verdict = trust
            .authorize(&AuthorizationRequest {
                fingerprint: response.fingerprint.clone(),
                common_name: "dev-1".to_string(),
                client_id: "dev-1".to_string(),
            })
            .expect("authorization should run");
        assert!(verdict.valid);

        let impostor = trust
            .authorize(&AuthorizationRequest {
                fingerprint: response.fingerprint,
                common_name: "dev-1".to_string(),
                client_id: "dev-2".to_string(),
            })
            .expect("authorization should run");
        assert_eq!(impostor.reason, Some(ValidationFailure::IdentityMismatch));
    }

    #[test]
    fn failed_sighting_write_keeps_the_verdict() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("store.json");
        let ca = Arc::new(
            CertificateAuthority::generate(&CaConfig::default())
                .expect("CA creation should succeed"),
        );
        let store = MemoryCertificateStore::open(&path).expect("store should open");
        let trust = DeviceTrust::new(
            ca,
            Arc::new(store),
            IssuerConfig::default(),
            BrokerEndpoint::default(),
        );
        trust
            .directory()
            .register("dev-1", None)
            .expect("register should succeed");
        let response = trust
            .submit_csr(submission("dev-1"))
            .expect("CSR should be signed");
        let seen_at_issuance = trust
            .directory()
            .get("dev-1")
            .expect("device exists")
            .last_seen_at;

        // Snapshot writes now fail
        std::fs::create_dir(path.with_extension("json.tmp")).expect("dir should be created");

        let verdict = trust
            .authorize(&AuthorizationRequest {
                fingerprint: response.fingerprint,
                common_name: "dev-1".to_string(),
                client_id: "dev-1".to_string(),
            })
            .expect("authorization should not depend on the write");
        assert!(verdict.valid);
        assert_eq!(
            trust
                .directory()
                .get("dev-1")
                .expect("device exists")
                .last_seen_at,
            seen_at_issuance
        );
    }

    #[test]
    fn unregistered_device_cannot_submit() {
        let trust = trust();
        assert!(matches!(
            trust.submit_csr(submission("dev-1")),
            Err(PkiError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn wire_shapes_match_the_http_contract() {
        let parsed: CsrSubmission = serde_json::from_value(serde_json::json!({
            "deviceId": "dev-1",
            "csrPEM": "-----BEGIN CERTIFICATE REQUEST-----",
        }))
        .expect("submission should parse");
        assert_eq!(parsed.device_id, "dev-1");
        assert!(parsed.firmware_version.is_none());

        let trust = trust();
        trust
            .directory()
            .register("dev-1", None)
            .expect("register should succeed");
        let response = trust
            .submit_csr(submission("dev-1"))
            .expect("CSR should be signed");
        let json = serde_json::to_value(&response).expect("serialization should succeed");
        for key in [
            "clientCert",
            "caCert",
            "brokerUrl",
            "mqttPort",
            "mqttSecurePort",
            "validFrom",
            "validTo",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
