//! Trust-plane commands: CA, device records, CSRs, admission checks

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use serde_json::json;
use tracing::info;

use iothub_pki::{
    AuthorizationRequest, BrokerEndpoint, CaConfig, CertificateAuthority, CsrSubmission,
    DeviceCertRequest, DeviceTrust, IssuerConfig, MemoryCertificateStore,
};

use super::{print_json, read_text, write_text};
use crate::GlobalArgs;

/// A single device id
#[derive(Args, Debug)]
pub struct DeviceArg {
    /// Device id
    pub device_id: String,
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Device id
    pub device_id: String,

    /// Hardware model
    #[arg(long)]
    pub model: Option<String>,
}

#[derive(Args, Debug)]
pub struct BindArgs {
    /// Device id
    pub device_id: String,

    /// Owning user id
    pub owner_id: String,
}

#[derive(Args, Debug)]
pub struct DeviceCsrArgs {
    /// Device id, used as the CSR subject
    pub device_id: String,

    /// Where to write <id>.key.pem and <id>.csr.pem
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct SignCsrArgs {
    /// Device id the certificate is bound to
    pub device_id: String,

    /// CSR file, PEM
    #[arg(long)]
    pub csr: PathBuf,

    /// Reported firmware version
    #[arg(long)]
    pub firmware_version: Option<String>,

    /// Reported hardware revision
    #[arg(long)]
    pub hardware_version: Option<String>,

    /// Where to write <id>.cert.pem and ca-cert.pem
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Broker URL advertised to the device
    #[arg(long, env = "IOTHUB_BROKER_URL", default_value = iothub_common::DEFAULT_BROKER_URL)]
    pub broker_url: String,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Certificate fingerprint, colon-separated hex
    pub fingerprint: String,

    /// Certificate subject CN presented at connect; enables the identity check
    #[arg(long, requires = "client_id")]
    pub common_name: Option<String>,

    /// MQTT client id presented at connect
    #[arg(long, requires = "common_name")]
    pub client_id: Option<String>,
}

fn open_trust(global: &GlobalArgs, broker: BrokerEndpoint) -> anyhow::Result<DeviceTrust> {
    let ca = CertificateAuthority::initialize(&CaConfig::in_dir(&global.ca_dir))
        .context("failed to load the root CA")?;
    let store = MemoryCertificateStore::open(&global.store)
        .with_context(|| format!("failed to open store {}", global.store.display()))?;
    Ok(DeviceTrust::new(
        Arc::new(ca),
        Arc::new(store),
        IssuerConfig::default(),
        broker,
    ))
}

pub fn init_ca(global: &GlobalArgs) -> anyhow::Result<()> {
    let config = CaConfig::in_dir(&global.ca_dir);
    let ca = CertificateAuthority::initialize(&config).context("failed to initialize the root CA")?;
    let info = ca.cert_info()?;
    print_json(&json!({
        "caCert": config.cert_path(),
        "fingerprint": ca.fingerprint(),
        "subject": info.common_name,
        "validTo": info.not_after,
    }))
}

pub fn register(global: &GlobalArgs, args: RegisterArgs) -> anyhow::Result<()> {
    let trust = open_trust(global, BrokerEndpoint::default())?;
    let device = trust
        .directory()
        .register(&args.device_id, args.model.as_deref())?;
    print_json(&device)
}

pub fn list(global: &GlobalArgs) -> anyhow::Result<()> {
    let trust = open_trust(global, BrokerEndpoint::default())?;
    print_json(&trust.directory().list()?)
}

pub fn bind(global: &GlobalArgs, args: BindArgs) -> anyhow::Result<()> {
    let trust = open_trust(global, BrokerEndpoint::default())?;
    print_json(&trust.directory().bind(&args.device_id, &args.owner_id)?)
}

pub fn unbind(global: &GlobalArgs, args: DeviceArg) -> anyhow::Result<()> {
    let trust = open_trust(global, BrokerEndpoint::default())?;
    print_json(&trust.directory().unbind(&args.device_id)?)
}

pub fn device_csr(args: DeviceCsrArgs) -> anyhow::Result<()> {
    let request = DeviceCertRequest::generate(&args.device_id)?;
    let key_path = args.out_dir.join(format!("{}.key.pem", args.device_id));
    let csr_path = args.out_dir.join(format!("{}.csr.pem", args.device_id));
    write_text(&key_path, request.private_key_pem())?;
    write_text(&csr_path, request.csr_pem())?;
    info!(key = %key_path.display(), csr = %csr_path.display(), "Generated device key and CSR");
    Ok(())
}

pub fn sign_csr(global: &GlobalArgs, args: SignCsrArgs) -> anyhow::Result<()> {
    let broker = BrokerEndpoint {
        broker_url: args.broker_url,
        ..Default::default()
    };
    let trust = open_trust(global, broker)?;
    let response = trust.submit_csr(CsrSubmission {
        device_id: args.device_id.clone(),
        csr_pem: read_text(&args.csr)?,
        firmware_version: args.firmware_version,
        hardware_version: args.hardware_version,
    })?;

    if let Some(dir) = args.out_dir {
        write_text(
            &dir.join(format!("{}.cert.pem", args.device_id)),
            &response.client_cert,
        )?;
        write_text(&dir.join(iothub_pki::ca::CA_CERT_FILE), &response.ca_cert)?;
    }
    print_json(&response)
}

pub fn validate(global: &GlobalArgs, args: ValidateArgs) -> anyhow::Result<()> {
    let trust = open_trust(global, BrokerEndpoint::default())?;
    let verdict = match (args.common_name, args.client_id) {
        (Some(common_name), Some(client_id)) => trust.authorize(&AuthorizationRequest {
            fingerprint: args.fingerprint,
            common_name,
            client_id,
        })?,
        _ => trust.validator().validate(&args.fingerprint)?,
    };
    print_json(&verdict)
}

pub fn revoke(global: &GlobalArgs, args: DeviceArg) -> anyhow::Result<()> {
    let trust = open_trust(global, BrokerEndpoint::default())?;
    let revoked = trust.directory().revoke(&args.device_id)?;
    print_json(&json!({
        "deviceId": args.device_id,
        "revokedCertificate": revoked.map(|cert| cert.fingerprint),
    }))
}
