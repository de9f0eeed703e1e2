//! iothub command line
//!
//! Operator tooling for the device trust plane (CA, device records, CSR
//! signing, admission checks) and for talking to devices over RPC.

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use iothub_common::telemetry::{LogFormat, TelemetryConfig};

/// iothub - device trust and command-control plane
#[derive(Parser, Debug)]
#[command(name = "iothub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command
#[derive(clap::Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding ca-key.pem and ca-cert.pem
    #[arg(long, env = "IOTHUB_CA_DIR", default_value = iothub_common::DEFAULT_CA_DIR, global = true)]
    pub ca_dir: PathBuf,

    /// JSON file holding device and certificate records
    #[arg(long, env = "IOTHUB_STORE", default_value = "iothub-store.json", global = true)]
    pub store: PathBuf,

    /// Log line format
    #[arg(long, env = "IOTHUB_LOG_FORMAT", value_enum, default_value_t = LogOutput::Compact, global = true)]
    pub log_format: LogOutput,

    /// Log filter directive, overrides RUST_LOG
    #[arg(long, env = "IOTHUB_LOG", global = true)]
    pub log: Option<String>,
}

/// Log output selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogOutput {
    /// One JSON object per line
    Json,
    /// Human-readable
    Compact,
}

impl GlobalArgs {
    /// Telemetry settings for this invocation
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "iothub".to_string(),
            format: match self.log_format {
                LogOutput::Json => LogFormat::Json,
                LogOutput::Compact => LogFormat::Compact,
            },
            filter: self.log.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load the root CA, creating it on first use
    InitCa,

    /// Add a device record
    RegisterDevice(commands::pki::RegisterArgs),

    /// List device records
    ListDevices,

    /// Assign a device to an owner
    Bind(commands::pki::BindArgs),

    /// Release a device from its owner
    Unbind(commands::pki::DeviceArg),

    /// Generate a device key pair and CSR
    DeviceCsr(commands::pki::DeviceCsrArgs),

    /// Sign a device CSR and write the connection bundle
    SignCsr(commands::pki::SignCsrArgs),

    /// Check a certificate fingerprint the way the broker does
    Validate(commands::pki::ValidateArgs),

    /// Revoke a device and its certificate
    Revoke(commands::pki::DeviceArg),

    /// Send an RPC command to a device
    Send(commands::rpc::SendArgs),

    /// Run a simulated device that answers RPC commands
    SimulateDevice(commands::rpc::SimulateArgs),
}

impl Cli {
    /// Run the selected command
    pub async fn run(self) -> anyhow::Result<()> {
        let global = self.global;
        match self.command {
            Commands::InitCa => commands::pki::init_ca(&global),
            Commands::RegisterDevice(args) => commands::pki::register(&global, args),
            Commands::ListDevices => commands::pki::list(&global),
            Commands::Bind(args) => commands::pki::bind(&global, args),
            Commands::Unbind(args) => commands::pki::unbind(&global, args),
            Commands::DeviceCsr(args) => commands::pki::device_csr(args),
            Commands::SignCsr(args) => commands::pki::sign_csr(&global, args),
            Commands::Validate(args) => commands::pki::validate(&global, args),
            Commands::Revoke(args) => commands::pki::revoke(&global, args),
            Commands::Send(args) => commands::rpc::send(args).await,
            Commands::SimulateDevice(args) => commands::rpc::simulate(args).await,
        }
    }
}
