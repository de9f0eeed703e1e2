//! Device trust for iothub
//!
//! This crate owns device identity: the root CA, certificate issuance from
//! device CSRs, certificate storage, and the validation hook the broker uses
//! to admit clients.
//!
//! # Public API
//!
//! ## CA and issuance
//! - [`CertificateAuthority`]: loads or bootstraps the root key and certificate
//! - [`CertificateIssuer`]: signs CSRs into leaf certificates bound to a device id
//! - [`DeviceCertRequest`]: device-side key pair and CSR generation
//!
//! ## Storage and validation
//! - [`CertificateStore`], [`MemoryCertificateStore`]: persistence seam and
//!   the in-process implementation
//! - [`CertificateValidator`]: fingerprint, revocation, validity and identity checks
//! - [`DeviceDirectory`]: registration, ownership, revocation
//!
//! ## Facade
//! - [`DeviceTrust`]: CSR submission and broker authorization

#![deny(missing_docs)]

pub mod ca;
pub mod cert;
pub mod csr;
pub mod devices;
pub mod error;
pub mod issuer;
pub mod model;
pub mod service;
pub mod store;
pub mod validator;

pub use ca::{CaConfig, CertificateAuthority};
pub use cert::{fingerprint_pem, CertificateInfo};
pub use csr::{verify_csr, DeviceCertRequest, VerifiedCsr};
pub use devices::DeviceDirectory;
pub use error::{PkiError, Result};
pub use issuer::{CertificateIssuer, IssuerConfig};
pub use model::{
    CertificateRecord, CertificateStatus, Device, DeviceMetadata, DeviceStatus, IssuedCertificate,
};
pub use service::{
    AuthorizationRequest, BrokerEndpoint, CsrSubmission, CsrSubmissionResponse, DeviceTrust,
};
pub use store::{CertificateStore, MemoryCertificateStore};
pub use validator::{CertificateValidator, ValidationFailure, ValidationVerdict};
