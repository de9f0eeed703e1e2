//! Device and certificate persistence
//!
//! [`CertificateStore`] is the seam to whatever database backs the hub. The
//! store owns the uniqueness rules: one certificate per device, unique
//! fingerprints, unique serial numbers. The issuer serializes work per device,
//! but the store is the last line of defense when two writers race.
//!
//! [`MemoryCertificateStore`] keeps everything in process and can snapshot
//! to a JSON file after every mutation, which is what the CLI uses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::model::{CertificateRecord, CertificateStatus, Device, DeviceMetadata, DeviceStatus};
use crate::{PkiError, Result};

/// Persistence for devices and their certificates
#[cfg_attr(test, mockall::automock)]
pub trait CertificateStore: Send + Sync {
    /// Add a new device; fails if the id is taken
    fn insert_device(&self, device: Device) -> Result<()>;

    /// Look up a device
    fn get_device(&self, device_id: &str) -> Result<Option<Device>>;

    /// Record the key and metadata of a just-issued certificate.
    ///
    /// Only the public key, reported versions and last-seen time change;
    /// metadata fields left as `None` keep their stored value.
    fn record_issuance(
        &self,
        device_id: &str,
        public_key_pem: &str,
        metadata: &DeviceMetadata,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Set the device's last-seen time
    fn touch_device(&self, device_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Bind the device to `owner_id`, or unbind it with `None`.
    ///
    /// Binding an already bound device, unbinding an unbound one, and any
    /// change to a revoked device are rejected.
    fn set_owner(&self, device_id: &str, owner_id: Option<String>) -> Result<Device>;

    /// All devices, in no particular order
    fn list_devices(&self) -> Result<Vec<Device>>;

    /// Certificate currently attached to a device
    fn certificate_for_device(&self, device_id: &str) -> Result<Option<CertificateRecord>>;

    /// Certificate with this fingerprint, attached or not
    fn certificate_by_fingerprint(&self, fingerprint: &str) -> Result<Option<CertificateRecord>>;

    /// Whether any stored certificate uses this serial number
    fn serial_in_use(&self, serial_number: &str) -> Result<bool>;

    /// Persist a new certificate and attach it to its device
    fn insert_certificate(&self, record: CertificateRecord) -> Result<()>;

    /// Detach and delete the device's current certificate
    fn remove_certificate(&self, device_id: &str) -> Result<Option<CertificateRecord>>;

    /// Mark the device and its certificate revoked and detach the certificate.
    ///
    /// The revoked record stays reachable by fingerprint so validation can
    /// report why it fails. Returns the revoked certificate, if any.
    fn revoke_device(&self, device_id: &str) -> Result<Option<CertificateRecord>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    devices: HashMap<String, Device>,
    certificates: HashMap<Uuid, CertificateRecord>,
    #[serde(skip)]
    by_fingerprint: HashMap<String, Uuid>,
    #[serde(skip)]
    by_serial: HashMap<String, Uuid>,
}

impl StoreState {
    fn rebuild_indexes(&mut self) -> Result<()> {
        self.by_fingerprint.clear();
        self.by_serial.clear();
        for record in self.certificates.values() {
            if self
                .by_fingerprint
                .insert(record.fingerprint.clone(), record.id)
                .is_some()
            {
                return Err(PkiError::FingerprintConflict(record.fingerprint.clone()));
            }
            if self
                .by_serial
                .insert(record.serial_number.clone(), record.id)
                .is_some()
            {
                return Err(PkiError::SerialConflict(record.serial_number.clone()));
            }
        }
        Ok(())
    }

    fn device_mut(&mut self, device_id: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| PkiError::DeviceNotFound(device_id.to_string()))
    }

    fn attached(&self, device_id: &str) -> Option<&CertificateRecord> {
        self.devices
            .get(device_id)
            .and_then(|d| d.certificate_id)
            .and_then(|id| self.certificates.get(&id))
    }

    fn insert_device(&mut self, device: Device) -> Result<()> {
        if self.devices.contains_key(&device.id) {
            return Err(PkiError::DeviceAlreadyRegistered(device.id));
        }
        self.devices.insert(device.id.clone(), device);
        Ok(())
    }

    fn record_issuance(
        &mut self,
        device_id: &str,
        public_key_pem: &str,
        metadata: &DeviceMetadata,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let device = self.device_mut(device_id)?;
        device.public_key = Some(public_key_pem.to_string());
        device.last_seen_at = Some(at);
        if let Some(firmware) = &metadata.firmware_version {
            device.firmware_version = Some(firmware.clone());
        }
        if let Some(hardware) = &metadata.hardware_version {
            device.hardware_version = Some(hardware.clone());
        }
        Ok(())
    }

    fn set_owner(&mut self, device_id: &str, owner_id: Option<String>) -> Result<Device> {
        let device = self.device_mut(device_id)?;
        if device.status == DeviceStatus::Revoked {
            return Err(PkiError::DeviceRevoked(device_id.to_string()));
        }
        match (device.owner_id.clone(), owner_id) {
            (Some(current), Some(_)) => {
                return Err(PkiError::DeviceAlreadyBound {
                    device_id: device_id.to_string(),
                    owner_id: current,
                })
            }
            (None, None) => return Err(PkiError::DeviceNotBound(device_id.to_string())),
            (_, Some(owner)) => {
                device.owner_id = Some(owner);
                device.status = DeviceStatus::Bound;
            }
            (Some(_), None) => {
                device.owner_id = None;
                device.status = DeviceStatus::Unbound;
            }
        }
        Ok(device.clone())
    }

    fn insert_certificate(&mut self, record: CertificateRecord) -> Result<()> {
        // All checks first so a rejected insert changes nothing
        let device = self
            .devices
            .get(&record.device_id)
            .ok_or_else(|| PkiError::DeviceNotFound(record.device_id.clone()))?;
        if device.certificate_id.is_some() {
            return Err(PkiError::DeviceAlreadyCertified(record.device_id));
        }
        if self.by_fingerprint.contains_key(&record.fingerprint) {
            return Err(PkiError::FingerprintConflict(record.fingerprint));
        }
        if self.by_serial.contains_key(&record.serial_number) {
            return Err(PkiError::SerialConflict(record.serial_number));
        }

        self.device_mut(&record.device_id)?.certificate_id = Some(record.id);
        self.by_fingerprint
            .insert(record.fingerprint.clone(), record.id);
        self.by_serial.insert(record.serial_number.clone(), record.id);
        self.certificates.insert(record.id, record);
        Ok(())
    }

    fn remove_certificate(&mut self, device_id: &str) -> Result<Option<CertificateRecord>> {
        let Some(cert_id) = self.device_mut(device_id)?.certificate_id.take() else {
            return Ok(None);
        };
        let removed = self.certificates.remove(&cert_id);
        if let Some(record) = &removed {
            self.by_fingerprint.remove(&record.fingerprint);
            self.by_serial.remove(&record.serial_number);
        }
        Ok(removed)
    }

    fn revoke_device(&mut self, device_id: &str) -> Result<Option<CertificateRecord>> {
        let device = self.device_mut(device_id)?;
        device.status = DeviceStatus::Revoked;
        let Some(cert_id) = device.certificate_id.take() else {
            return Ok(None);
        };
        Ok(self.certificates.get_mut(&cert_id).map(|record| {
            record.status = CertificateStatus::Revoked;
            record.clone()
        }))
    }
}

/// In-process store, optionally snapshotted to a JSON file.
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    state: RwLock<StoreState>,
    snapshot: Option<PathBuf>,
}

impl MemoryCertificateStore {
    /// Empty store with no persistence
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by the JSON file at `path`.
    ///
    /// Loads the file if it exists. Every successful mutation rewrites it;
    /// a mutation whose snapshot fails to write is rolled back.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut state = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str::<StoreState>(&json).map_err(|e| {
                PkiError::Storage(format!("cannot parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(PkiError::Storage(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        state.rebuild_indexes()?;

        debug!(
            path = %path.display(),
            devices = state.devices.len(),
            certificates = state.certificates.len(),
            "Opened certificate store"
        );
        Ok(Self {
            state: RwLock::new(state),
            snapshot: Some(path),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        f(&self.state.read())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        match &self.snapshot {
            None => f(&mut state),
            Some(path) => {
                let mut next = state.clone();
                let out = f(&mut next)?;
                write_snapshot(path, &next)?;
                *state = next;
                Ok(out)
            }
        }
    }
}

fn write_snapshot(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| PkiError::Storage(format!("cannot serialize store: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl CertificateStore for MemoryCertificateStore {
    fn insert_device(&self, device: Device) -> Result<()> {
        self.mutate(|s| s.insert_device(device))
    }

    fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.read(|s| s.devices.get(device_id).cloned()))
    }

    fn record_issuance(
        &self,
        device_id: &str,
        public_key_pem: &str,
        metadata: &DeviceMetadata,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|s| s.record_issuance(device_id, public_key_pem, metadata, at))
    }

    fn touch_device(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.mutate(|s| {
            s.device_mut(device_id)?.last_seen_at = Some(at);
            Ok(())
        })
    }

    fn set_owner(&self, device_id: &str, owner_id: Option<String>) -> Result<Device> {
        self.mutate(|s| s.set_owner(device_id, owner_id))
    }

    fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.read(|s| s.devices.values().cloned().collect()))
    }

    fn certificate_for_device(&self, device_id: &str) -> Result<Option<CertificateRecord>> {
        Ok(self.read(|s| s.attached(device_id).cloned()))
    }

    fn certificate_by_fingerprint(&self, fingerprint: &str) -> Result<Option<CertificateRecord>> {
        Ok(self.read(|s| {
            s.by_fingerprint
                .get(fingerprint)
                .and_then(|id| s.certificates.get(id))
                .cloned()
        }))
    }

    fn serial_in_use(&self, serial_number: &str) -> Result<bool> {
        Ok(self.read(|s| s.by_serial.contains_key(serial_number)))
    }

    fn insert_certificate(&self, record: CertificateRecord) -> Result<()> {
        self.mutate(|s| s.insert_certificate(record))
    }

    fn remove_certificate(&self, device_id: &str) -> Result<Option<CertificateRecord>> {
        self.mutate(|s| s.remove_certificate(device_id))
    }

    fn revoke_device(&self, device_id: &str) -> Result<Option<CertificateRecord>> {
        self.mutate(|s| s.revoke_device(device_id))
    }
}
