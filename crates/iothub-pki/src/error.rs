//! Certificate and device errors

use iothub_common::IdentifierError;
use thiserror::Error;

/// Errors raised by the CA, issuer, store, and device directory.
///
/// Every variant aborts only the operation that produced it; records belonging
/// to other devices are never touched on an error path.
#[derive(Debug, Error)]
pub enum PkiError {
    /// CA not initialized
    #[error("CA not initialized")]
    CaNotInitialized,

    /// Persisted CA material is partial, unreadable, or inconsistent
    #[error("CA material unusable: {0}")]
    CaMaterial(String),

    /// CSR could not be parsed
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// CSR self-signature does not verify against its embedded key
    #[error("CSR signature does not verify against its public key")]
    CsrSignatureInvalid,

    /// CSR carries no usable public key
    #[error("CSR carries no usable public key")]
    MissingPublicKey,

    /// Device identifier is not acceptable
    #[error("invalid device id: {0}")]
    InvalidDeviceId(#[from] IdentifierError),

    /// Device is not registered
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device id is already registered
    #[error("device already registered: {0}")]
    DeviceAlreadyRegistered(String),

    /// Device has been revoked
    #[error("device revoked: {0}")]
    DeviceRevoked(String),

    /// Device already has a certificate on record
    #[error("device already has a certificate: {0}")]
    DeviceAlreadyCertified(String),

    /// Device is already bound to an owner
    #[error("device {device_id} is already bound to {owner_id}")]
    DeviceAlreadyBound {
        /// Device being bound
        device_id: String,
        /// Current owner
        owner_id: String,
    },

    /// Device has no owner to unbind from
    #[error("device is not bound: {0}")]
    DeviceNotBound(String),

    /// Another certificate already uses this fingerprint
    #[error("certificate fingerprint already in use: {0}")]
    FingerprintConflict(String),

    /// Another certificate already uses this serial number
    #[error("certificate serial number already in use: {0}")]
    SerialConflict(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Backing store failed to load or persist
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
