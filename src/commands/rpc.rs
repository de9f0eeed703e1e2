//! RPC commands: sending to devices and simulating one

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;
use serde_json::{json, Value};
use tracing::{info, warn};
use zeroize::Zeroizing;

use iothub_common::{retry_with_backoff, RetryConfig, DEFAULT_BROKER_URL};
use iothub_device::{status_payload, DeviceCommandExecutor, SimulatedDevice};
use iothub_rpc::topics::status_topic;
use iothub_rpc::{BrokerLink, MqttConfig, MqttLink, MqttTls, RpcConfig, RpcTransport};

use super::{print_json, read_text};

/// Bound on each wait for the broker's CONNACK
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker connection options
#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Broker URL (mqtt://, mqtts://)
    #[arg(long, env = "IOTHUB_BROKER_URL", default_value = DEFAULT_BROKER_URL)]
    pub broker_url: String,

    /// CA certificate that signed the broker's certificate
    #[arg(long, env = "IOTHUB_MQTT_CA")]
    pub ca_cert: Option<PathBuf>,

    /// Client certificate for mTLS
    #[arg(long, env = "IOTHUB_MQTT_CERT")]
    pub client_cert: Option<PathBuf>,

    /// Client private key for mTLS
    #[arg(long, env = "IOTHUB_MQTT_KEY")]
    pub client_key: Option<PathBuf>,

    /// Broker username
    #[arg(long, env = "IOTHUB_MQTT_USERNAME")]
    pub username: Option<String>,

    /// Broker password
    #[arg(long, env = "IOTHUB_MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 5)]
    pub connect_attempts: u32,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Owning user id
    #[arg(long, env = "IOTHUB_USER_ID")]
    pub user: String,

    /// Target device id
    #[arg(long)]
    pub device: String,

    /// Method name, e.g. getSensors
    pub method: String,

    /// Method params as a JSON object
    #[arg(long, default_value = "{}")]
    pub params: String,

    /// Response deadline in milliseconds (at most 30000)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Publish and return without waiting for the device
    #[arg(long)]
    pub no_response: bool,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Owning user id
    #[arg(long, env = "IOTHUB_USER_ID")]
    pub user: String,

    /// Device id; also the MQTT client id
    #[arg(long, env = "IOTHUB_DEVICE_ID")]
    pub device: String,

    /// Delay before answering each command, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub response_delay_ms: u64,
}

fn read_bytes(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

impl BrokerArgs {
    fn mqtt_config(&self, client_id: &str) -> anyhow::Result<MqttConfig> {
        let mut config = MqttConfig::from_url(&self.broker_url, client_id)?;
        match (&self.ca_cert, &self.client_cert, &self.client_key) {
            (Some(ca), Some(cert), Some(key)) => {
                config = config.with_tls(MqttTls {
                    ca_pem: read_bytes(ca)?,
                    client_cert_pem: read_bytes(cert)?,
                    client_key_pem: Zeroizing::new(read_bytes(key)?),
                });
            }
            (None, None, None) => {}
            _ => bail!("--ca-cert, --client-cert and --client-key must be given together"),
        }
        if let Some(username) = &self.username {
            config = config.with_credentials(username, self.password.clone().unwrap_or_default());
        }
        Ok(config)
    }

    fn retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.connect_attempts.max(1))
    }
}

pub async fn send(args: SendArgs) -> anyhow::Result<()> {
    let params: Value =
        serde_json::from_str(&args.params).context("--params is not valid JSON")?;

    let client_id = format!("iothub-cli-{}", std::process::id());
    let (link, inbound) = MqttLink::start(args.broker.mqtt_config(&client_id)?)?;
    let transport = RpcTransport::new(Arc::new(link), inbound, RpcConfig::default());
    retry_with_backoff(&args.broker.retry(), "connect to broker", || {
        transport.connect()
    })
    .await?;

    if args.no_response {
        let id = transport
            .send_command_no_response(&args.user, &args.device, &args.method, params)
            .await?;
        return print_json(&json!({ "id": id }));
    }

    let response = transport
        .send_command_with_response(
            &args.user,
            &args.device,
            &args.method,
            params,
            args.timeout_ms.map(Duration::from_millis),
        )
        .await?;
    print_json(&response)
}

pub async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let mut config = args.broker.mqtt_config(&args.device)?;
    // Devices log in as themselves; the password is their certificate fingerprint
    if config.credentials.is_none() {
        if let Some(cert) = &args.broker.client_cert {
            let fingerprint = iothub_pki::fingerprint_pem(&read_text(cert)?)?;
            config = config.with_credentials(&args.device, fingerprint);
        }
    }
    let status = status_topic(&args.user, &args.device);
    let config = config.with_last_will(&status, status_payload(false));

    let (link, inbound) = MqttLink::start(config)?;
    let link: Arc<dyn BrokerLink> = Arc::new(link);
    retry_with_backoff(&args.broker.retry(), "connect to broker", || {
        link.wait_connected(CONNECT_ATTEMPT_TIMEOUT)
    })
    .await?;

    let device = SimulatedDevice::new(&args.device)
        .with_response_delay(Duration::from_millis(args.response_delay_ms));
    let executor =
        DeviceCommandExecutor::new(link.clone(), &args.user, &args.device, Arc::new(device))?;
    let serving = executor.start(inbound).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!(device_id = %args.device, "Shutting down simulated device");
        }
        result = serving => {
            if let Err(e) = result {
                warn!(error = %e, "Executor task ended abnormally");
            }
        }
    }

    if let Err(e) = link.publish(&status, status_payload(false)).await {
        warn!(error = %e, "Failed to announce device offline");
    }
    Ok(())
}
