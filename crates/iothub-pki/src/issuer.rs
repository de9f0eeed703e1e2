//! Device certificate issuance
//!
//! The issuer turns a device CSR into a leaf certificate bound to the device
//! identifier it was submitted for. The CSR contributes only its public key:
//! subject, SANs, extensions, serial and validity are all set here, so a
//! device cannot obtain a certificate for an identity other than its own.
//!
//! Issuance is serialized per device id. Two concurrent submissions for the
//! same device run one after the other; the second replaces the first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::{
    string::Ia5String, CertificateParams, CertificateSigningRequestParams, CustomExtension,
    DistinguishedName, DnType, DnValue, IsCa, KeyUsagePurpose, SanType, SerialNumber,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use iothub_common::validate_identifier;

use crate::ca::{compute_validity, CertificateAuthority};
use crate::cert::{fingerprint_der, format_serial};
use crate::csr::verify_csr;
use crate::model::{
    CertificateRecord, CertificateStatus, DeviceMetadata, DeviceStatus, IssuedCertificate,
};
use crate::store::CertificateStore;
use crate::{PkiError, Result};

/// Default validity period for device certificates (1 year)
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Serial number length in bytes (128 bits)
pub const SERIAL_LEN: usize = 16;

/// Attempts at drawing a serial that the store has not seen
const SERIAL_ATTEMPTS: usize = 8;

/// id-ce-extKeyUsage
const OID_EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];

/// DER of `SEQUENCE { id-kp-clientAuth }`
const EKU_CLIENT_AUTH_DER: &[u8] = &[
    0x30, 0x0a, 0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x02,
];

/// Leaf certificate policy
#[derive(Debug, Clone, PartialEq)]
pub struct IssuerConfig {
    /// Adds `DNS:{device_id}.{san_domain}` next to the bare device id
    pub san_domain: Option<String>,
    /// Leaf validity in days
    pub validity_days: i64,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            san_domain: Some("devices.iothub.local".to_string()),
            validity_days: CERT_VALIDITY_DAYS,
        }
    }
}

/// Signs device CSRs with the root CA and records the result
pub struct CertificateIssuer {
    ca: Arc<CertificateAuthority>,
    store: Arc<dyn CertificateStore>,
    config: IssuerConfig,
    /// Advisory per-device locks; entries are dropped once uncontended
    device_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CertificateIssuer {
    /// Create an issuer over an initialized CA and a store
    pub fn new(
        ca: Arc<CertificateAuthority>,
        store: Arc<dyn CertificateStore>,
        config: IssuerConfig,
    ) -> Self {
        Self {
            ca,
            store,
            config,
            device_locks: DashMap::new(),
        }
    }

    /// Root certificate, PEM
    pub fn ca_cert_pem(&self) -> &str {
        self.ca.ca_cert_pem()
    }

    /// Sign `csr_pem` for `device_id`
    pub fn sign_csr(&self, device_id: &str, csr_pem: &str) -> Result<IssuedCertificate> {
        self.sign_csr_with(device_id, csr_pem, &DeviceMetadata::default())
    }

    /// Sign `csr_pem` for `device_id`, recording reported device metadata.
    ///
    /// The device must be registered and not revoked. Any certificate already
    /// on record for the device is removed before the new one is stored.
    #[instrument(skip(self, csr_pem, metadata), fields(device_id = %device_id))]
    pub fn sign_csr_with(
        &self,
        device_id: &str,
        csr_pem: &str,
        metadata: &DeviceMetadata,
    ) -> Result<IssuedCertificate> {
        validate_identifier("device id", device_id)?;

        let lock = self.device_lock(device_id);
        let result = {
            let _guard = lock.lock();
            self.issue_locked(device_id, csr_pem, metadata)
        };
        drop(lock);
        self.device_locks
            .remove_if(device_id, |_, l| Arc::strong_count(l) == 1);

        result
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_locks
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    fn issue_locked(
        &self,
        device_id: &str,
        csr_pem: &str,
        metadata: &DeviceMetadata,
    ) -> Result<IssuedCertificate> {
        let device = self
            .store
            .get_device(device_id)?
            .ok_or_else(|| PkiError::DeviceNotFound(device_id.to_string()))?;
        if device.status == DeviceStatus::Revoked {
            return Err(PkiError::DeviceRevoked(device_id.to_string()));
        }

        let verified = verify_csr(csr_pem)?;
        if let Some(requested) = &verified.requested_common_name {
            if requested != device_id {
                debug!(requested_cn = %requested, "Overriding CSR common name");
            }
        }

        let serial = self.fresh_serial()?;

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;
        // Only the public key survives from the request
        let (params, not_before, not_after) = self.leaf_params(device_id, &serial)?;
        csr_params.params = params;

        let cert = self.ca.sign_request(csr_params)?;
        let now = Utc::now();
        let record = CertificateRecord {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            client_cert_pem: cert.pem(),
            ca_cert_pem: self.ca.ca_cert_pem().to_string(),
            fingerprint: fingerprint_der(cert.der()),
            serial_number: format_serial(&serial),
            status: CertificateStatus::Active,
            valid_from: not_before,
            valid_to: not_after,
            created_at: now,
        };

        if let Some(previous) = self.store.remove_certificate(device_id)? {
            info!(
                superseded_fingerprint = %previous.fingerprint,
                superseded_serial = %previous.serial_number,
                "Replacing existing device certificate"
            );
        }
        self.store.insert_certificate(record.clone())?;
        self.store
            .record_issuance(device_id, &verified.public_key_pem, metadata, now)?;

        info!(
            fingerprint = %record.fingerprint,
            serial = %record.serial_number,
            valid_to = %record.valid_to,
            "Issued device certificate"
        );
        Ok(IssuedCertificate::from(&record))
    }

    /// Draw a positive 128-bit serial the store has not seen.
    fn fresh_serial(&self) -> Result<[u8; SERIAL_LEN]> {
        for _ in 0..SERIAL_ATTEMPTS {
            let mut serial = [0u8; SERIAL_LEN];
            aws_lc_rs::rand::fill(&mut serial).map_err(|_| {
                PkiError::CertificateGenerationFailed("random source failed".to_string())
            })?;
            // High bit clear keeps the INTEGER positive; bit 6 set avoids a
            // leading zero byte, so the encoded serial is exactly these bytes.
            serial[0] = (serial[0] & 0x7f) | 0x40;

            if !self.store.serial_in_use(&format_serial(&serial))? {
                return Ok(serial);
            }
            debug!("Serial number collision, drawing again");
        }
        Err(PkiError::SerialConflict(
            "no unused serial number after repeated draws".to_string(),
        ))
    }

    fn leaf_params(
        &self,
        device_id: &str,
        serial: &[u8],
    ) -> Result<(CertificateParams, DateTime<Utc>, DateTime<Utc>)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(device_id.to_string()),
        );
        params.distinguished_name = dn;

        // Emits basicConstraints CA:FALSE (critical) and a subject key identifier
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        let mut eku =
            CustomExtension::from_oid_content(OID_EXT_KEY_USAGE, EKU_CLIENT_AUTH_DER.to_vec());
        eku.set_criticality(true);
        params.custom_extensions = vec![eku];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let mut names = vec![device_id.to_string()];
        if let Some(domain) = &self.config.san_domain {
            names.push(format!("{}.{}", device_id, domain));
        }
        params.subject_alt_names = names
            .into_iter()
            .map(|name| {
                Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name '{}': {}",
                            name, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let (not_before, not_after) = compute_validity(self.config.validity_days);
        params.not_before = not_before;
        params.not_after = not_after;

        Ok((params, to_chrono(not_before)?, to_chrono(not_after)?))
    }
}

fn to_chrono(t: ::time::OffsetDateTime) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(t.unix_timestamp(), 0).ok_or_else(|| {
        PkiError::CertificateGenerationFailed(format!("timestamp out of range: {}", t))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaConfig;
    use crate::cert::{parse_pem, CertificateInfo};
    use crate::csr::tests::tamper;
    use crate::csr::DeviceCertRequest;
    use crate::model::Device;
    use crate::store::{MemoryCertificateStore, MockCertificateStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use x509_parser::extensions::ParsedExtension;
    use x509_parser::prelude::*;

    struct Fixture {
        ca: Arc<CertificateAuthority>,
        store: Arc<MemoryCertificateStore>,
        issuer: CertificateIssuer,
    }

    fn fixture(devices: &[&str]) -> Fixture {
        let ca = Arc::new(
            CertificateAuthority::generate(&CaConfig::default())
                .expect("CA creation should succeed"),
        );
        let store = Arc::new(MemoryCertificateStore::new());
        for id in devices {
            store
                .insert_device(Device::new(*id))
                .expect("device insert should succeed");
        }
        let issuer = CertificateIssuer::new(ca.clone(), store.clone(), IssuerConfig::default());
        Fixture { ca, store, issuer }
    }

    fn csr_for(cn: &str) -> String {
        DeviceCertRequest::with_common_name(cn)
            .expect("CSR generation should succeed")
            .csr_pem()
            .to_string()
    }

    #[test]
    fn issued_certificate_round_trips_through_a_parser() {
        let f = fixture(&["dev-1"]);
        let issued = f
            .issuer
            .sign_csr("dev-1", &csr_for("dev-1"))
            .expect("CSR signing should succeed");

        let info = CertificateInfo::from_pem(&issued.client_cert_pem)
            .expect("issued certificate should parse");
        assert_eq!(info.serial_number, issued.serial_number);
        assert_eq!(info.not_before, issued.valid_from);
        assert_eq!(info.not_after, issued.valid_to);
        assert_eq!(info.fingerprint, issued.fingerprint);
        assert_eq!(issued.serial_number.len(), SERIAL_LEN * 2);

        let lifetime = issued.valid_to - issued.valid_from;
        assert_eq!(lifetime.num_days(), CERT_VALIDITY_DAYS);
        assert_eq!(issued.ca_cert_pem, f.ca.ca_cert_pem());
    }

    /// Story: a device cannot impersonate another identity through its CSR
    #[test]
    fn story_common_name_is_forced_to_device_id() {
        let f = fixture(&["dev-1"]);

        // The device asks for someone else's name
        let issued = f
            .issuer
            .sign_csr("dev-1", &csr_for("attacker"))
            .expect("CSR signing should succeed");

        // The certificate names only the device it was submitted for
        let info = CertificateInfo::from_pem(&issued.client_cert_pem)
            .expect("issued certificate should parse");
        assert_eq!(info.common_name, "dev-1");
        assert!(info.dns_names.contains(&"dev-1".to_string()));
        assert!(info
            .dns_names
            .contains(&"dev-1.devices.iothub.local".to_string()));
        assert!(!info.dns_names.iter().any(|n| n.contains("attacker")));
    }

    #[test]
    fn leaf_carries_client_auth_profile() {
        let f = fixture(&["dev-1"]);
        let issued = f
            .issuer
            .sign_csr("dev-1", &csr_for("dev-1"))
            .expect("CSR signing should succeed");

        let der = parse_pem(&issued.client_cert_pem).expect("PEM parsing should succeed");
        let (_, cert) = X509Certificate::from_der(&der).expect("certificate should parse");

        let bc = cert
            .basic_constraints()
            .expect("basic constraints should parse")
            .expect("basic constraints present");
        assert!(bc.critical);
        assert!(!bc.value.ca);

        let ku = cert
            .key_usage()
            .expect("key usage should parse")
            .expect("key usage present");
        assert!(ku.critical);
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_encipherment());
        assert!(!ku.value.key_cert_sign());

        let eku = cert
            .extended_key_usage()
            .expect("extended key usage should parse")
            .expect("extended key usage present");
        assert!(eku.critical);
        assert!(eku.value.client_auth);
        assert!(!eku.value.server_auth);

        let parsed: Vec<_> = cert
            .extensions()
            .iter()
            .map(|e| e.parsed_extension())
            .collect();
        assert!(parsed
            .iter()
            .any(|e| matches!(e, ParsedExtension::SubjectKeyIdentifier(_))));
        assert!(parsed
            .iter()
            .any(|e| matches!(e, ParsedExtension::AuthorityKeyIdentifier(_))));

        let root = parse_pem(f.ca.ca_cert_pem()).expect("PEM parsing should succeed");
        assert!(crate::ca::signed_by(&der, &root).expect("signature check should run"));
    }

    #[test]
    fn tampered_csr_is_rejected_and_nothing_is_stored() {
        let f = fixture(&["dev-1"]);
        let forged = tamper(&csr_for("aaaaaaaa"), "aaaaaaaa", "bbbbbbbb");

        let result = f.issuer.sign_csr("dev-1", &forged);
        assert!(matches!(result, Err(PkiError::CsrSignatureInvalid)));
        assert!(f
            .store
            .certificate_for_device("dev-1")
            .expect("lookup should succeed")
            .is_none());
    }

    #[test]
    fn unknown_revoked_and_malformed_ids_are_rejected() {
        let f = fixture(&["dev-1"]);
        let csr = csr_for("dev-1");

        assert!(matches!(
            f.issuer.sign_csr("dev-404", &csr),
            Err(PkiError::DeviceNotFound(_))
        ));
        assert!(matches!(
            f.issuer.sign_csr("users/+/devices", &csr),
            Err(PkiError::InvalidDeviceId(_))
        ));

        f.store
            .revoke_device("dev-1")
            .expect("revoke should succeed");
        assert!(matches!(
            f.issuer.sign_csr("dev-1", &csr),
            Err(PkiError::DeviceRevoked(_))
        ));
    }

    /// Story: re-issuing replaces the old certificate and records metadata
    #[test]
    fn story_reissue_replaces_previous_certificate() {
        let f = fixture(&["dev-1"]);

        let first = f
            .issuer
            .sign_csr("dev-1", &csr_for("dev-1"))
            .expect("first issuance should succeed");

        // The device rotates its key and reports new firmware
        let request = DeviceCertRequest::generate("dev-1").expect("CSR generation should succeed");
        let metadata = DeviceMetadata {
            firmware_version: Some("2.1.0".to_string()),
            hardware_version: Some("rev-c".to_string()),
        };
        let second = f
            .issuer
            .sign_csr_with("dev-1", request.csr_pem(), &metadata)
            .expect("re-issuance should succeed");

        assert_ne!(first.fingerprint, second.fingerprint);
        assert_ne!(first.serial_number, second.serial_number);
        assert!(f
            .store
            .certificate_by_fingerprint(&first.fingerprint)
            .expect("lookup should succeed")
            .is_none());

        let device = f
            .store
            .get_device("dev-1")
            .expect("lookup should succeed")
            .expect("device exists");
        assert_eq!(device.firmware_version.as_deref(), Some("2.1.0"));
        assert_eq!(device.hardware_version.as_deref(), Some("rev-c"));
        assert!(device.last_seen_at.is_some());

        let expected_key = crate::csr::verify_csr(request.csr_pem())
            .expect("CSR should verify")
            .public_key_pem;
        assert_eq!(device.public_key, Some(expected_key));
    }

    #[test]
    fn concurrent_issuance_for_one_device_is_serialized() {
        let f = fixture(&["dev-1"]);
        let issuer = Arc::new(f.issuer);
        let csrs: Vec<String> = (0..4).map(|_| csr_for("dev-1")).collect();

        let handles: Vec<_> = csrs
            .into_iter()
            .map(|csr| {
                let issuer = issuer.clone();
                std::thread::spawn(move || issuer.sign_csr("dev-1", &csr))
            })
            .collect();
        let issued: Vec<_> = handles
            .into_iter()
            .map(|h| {
                h.join()
                    .expect("thread should not panic")
                    .expect("every issuance should succeed")
            })
            .collect();

        // Exactly one survives, and it is one of the issued certificates
        let attached = f
            .store
            .certificate_for_device("dev-1")
            .expect("lookup should succeed")
            .expect("a certificate is attached");
        let live: Vec<_> = issued
            .iter()
            .filter(|c| {
                f.store
                    .certificate_by_fingerprint(&c.fingerprint)
                    .expect("lookup should succeed")
                    .is_some()
            })
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].fingerprint, attached.fingerprint);
        assert!(issuer.device_locks.is_empty());
    }

    #[test]
    fn store_failure_aborts_issuance_without_touching_device() {
        let ca = Arc::new(
            CertificateAuthority::generate(&CaConfig::default())
                .expect("CA creation should succeed"),
        );
        let mut store = MockCertificateStore::new();
        store
            .expect_get_device()
            .returning(|id| Ok(Some(Device::new(id))));
        store.expect_serial_in_use().returning(|_| Ok(false));
        store.expect_remove_certificate().returning(|_| Ok(None));
        store
            .expect_insert_certificate()
            .times(1)
            .returning(|_| Err(PkiError::Storage("disk full".to_string())));
        store.expect_record_issuance().never();

        let issuer = CertificateIssuer::new(ca, Arc::new(store), IssuerConfig::default());
        let result = issuer.sign_csr("dev-1", &csr_for("dev-1"));

        assert!(matches!(result, Err(PkiError::Storage(msg)) if msg == "disk full"));
    }

    /// Binds the device the first time the issuer checks a serial, which is
    /// after it has read the device record and before it writes anything.
    struct BindDuringIssuance {
        inner: MemoryCertificateStore,
        owner: &'static str,
        fired: AtomicBool,
    }

    impl CertificateStore for BindDuringIssuance {
        fn insert_device(&self, device: Device) -> Result<()> {
            self.inner.insert_device(device)
        }
        fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
            self.inner.get_device(device_id)
        }
        fn record_issuance(
            &self,
            device_id: &str,
            public_key_pem: &str,
            metadata: &DeviceMetadata,
            at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner
                .record_issuance(device_id, public_key_pem, metadata, at)
        }
        fn touch_device(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
            self.inner.touch_device(device_id, at)
        }
        fn set_owner(&self, device_id: &str, owner_id: Option<String>) -> Result<Device> {
            self.inner.set_owner(device_id, owner_id)
        }
        fn list_devices(&self) -> Result<Vec<Device>> {
            self.inner.list_devices()
        }
        fn certificate_for_device(&self, device_id: &str) -> Result<Option<CertificateRecord>> {
            self.inner.certificate_for_device(device_id)
        }
        fn certificate_by_fingerprint(
            &self,
            fingerprint: &str,
        ) -> Result<Option<CertificateRecord>> {
            self.inner.certificate_by_fingerprint(fingerprint)
        }
        fn serial_in_use(&self, serial_number: &str) -> Result<bool> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.inner
                    .set_owner("dev-1", Some(self.owner.to_string()))?;
            }
            self.inner.serial_in_use(serial_number)
        }
        fn insert_certificate(&self, record: CertificateRecord) -> Result<()> {
            self.inner.insert_certificate(record)
        }
        fn remove_certificate(&self, device_id: &str) -> Result<Option<CertificateRecord>> {
            self.inner.remove_certificate(device_id)
        }
        fn revoke_device(&self, device_id: &str) -> Result<Option<CertificateRecord>> {
            self.inner.revoke_device(device_id)
        }
    }

    #[test]
    fn bind_during_issuance_keeps_its_owner() {
        let ca = Arc::new(
            CertificateAuthority::generate(&CaConfig::default())
                .expect("CA creation should succeed"),
        );
        let store = Arc::new(BindDuringIssuance {
            inner: MemoryCertificateStore::new(),
            owner: "user-7",
            fired: AtomicBool::new(false),
        });
        store
            .insert_device(Device::new("dev-1"))
            .expect("device insert should succeed");
        let issuer = CertificateIssuer::new(ca, store.clone(), IssuerConfig::default());

        issuer
            .sign_csr("dev-1", &csr_for("dev-1"))
            .expect("CSR signing should succeed");

        let device = store
            .get_device("dev-1")
            .expect("lookup should succeed")
            .expect("device exists");
        assert!(store.fired.load(Ordering::SeqCst));
        assert_eq!(device.status, DeviceStatus::Bound);
        assert_eq!(device.owner_id.as_deref(), Some("user-7"));
        assert!(device.public_key.is_some());
        assert!(device.certificate_id.is_some());
    }

    #[test]
    fn serial_collisions_are_redrawn_then_reported() {
        let ca = Arc::new(
            CertificateAuthority::generate(&CaConfig::default())
                .expect("CA creation should succeed"),
        );
        let mut store = MockCertificateStore::new();
        store
            .expect_get_device()
            .returning(|id| Ok(Some(Device::new(id))));
        store
            .expect_serial_in_use()
            .times(SERIAL_ATTEMPTS)
            .returning(|_| Ok(true));

        let issuer = CertificateIssuer::new(ca, Arc::new(store), IssuerConfig::default());
        let result = issuer.sign_csr("dev-1", &csr_for("dev-1"));

        assert!(matches!(result, Err(PkiError::SerialConflict(_))));
    }
}
