//! Device registry and ownership

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use iothub_common::validate_identifier;

use crate::model::{CertificateRecord, Device};
use crate::store::CertificateStore;
use crate::{PkiError, Result};

/// Registration, ownership and revocation of devices
#[derive(Clone)]
pub struct DeviceDirectory {
    store: Arc<dyn CertificateStore>,
}

impl DeviceDirectory {
    /// Directory over `store`
    pub fn new(store: Arc<dyn CertificateStore>) -> Self {
        Self { store }
    }

    /// Register a new, unbound device
    pub fn register(&self, device_id: &str, model: Option<&str>) -> Result<Device> {
        validate_identifier("device id", device_id)?;

        let mut device = Device::new(device_id);
        if let Some(model) = model {
            device = device.with_model(model);
        }
        self.store.insert_device(device.clone())?;

        info!(device_id = %device_id, "Registered device");
        Ok(device)
    }

    /// Look up a registered device
    pub fn get(&self, device_id: &str) -> Result<Device> {
        self.store
            .get_device(device_id)?
            .ok_or_else(|| PkiError::DeviceNotFound(device_id.to_string()))
    }

    /// All registered devices, sorted by id
    pub fn list(&self) -> Result<Vec<Device>> {
        let mut devices = self.store.list_devices()?;
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    /// Bind a device to a user
    pub fn bind(&self, device_id: &str, owner_id: &str) -> Result<Device> {
        validate_identifier("user id", owner_id)?;
        let device = self.store.set_owner(device_id, Some(owner_id.to_string()))?;
        info!(device_id = %device_id, owner_id = %owner_id, "Bound device");
        Ok(device)
    }

    /// Release a device from its owner
    pub fn unbind(&self, device_id: &str) -> Result<Device> {
        let device = self.store.set_owner(device_id, None)?;
        info!(device_id = %device_id, "Unbound device");
        Ok(device)
    }

    /// Record that the device was just seen
    pub fn touch(&self, device_id: &str) -> Result<()> {
        self.store.touch_device(device_id, Utc::now())
    }

    /// Revoke a device and its certificate.
    ///
    /// Irreversible. The device can no longer authenticate, be bound, or get
    /// a new certificate.
    pub fn revoke(&self, device_id: &str) -> Result<Option<CertificateRecord>> {
        let revoked = self.store.revoke_device(device_id)?;
        match &revoked {
            Some(cert) => warn!(
                device_id = %device_id,
                fingerprint = %cert.fingerprint,
                serial = %cert.serial_number,
                "Revoked device and certificate"
            ),
            None => warn!(device_id = %device_id, "Revoked device with no certificate"),
        }
        Ok(revoked)
    }
}
