//! Simulated device
//!
//! A [`CommandHandler`] with drifting sensor readings and an in-memory
//! configuration table, for running the device side without hardware.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::info;

use iothub_rpc::{MethodParams, RpcCall, RpcMethod};

use crate::handler::{CommandHandler, HandlerError};

/// How long a simulated reboot keeps the device unavailable
pub const REBOOT_DURATION: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
struct Readings {
    temperature: f64,
    humidity: f64,
    pressure: f64,
}

impl Default for Readings {
    fn default() -> Self {
        Self {
            temperature: 23.5,
            humidity: 45.2,
            pressure: 1013.25,
        }
    }
}

impl Readings {
    fn drift(&mut self, rng: &mut impl Rng) {
        self.temperature = round1(self.temperature + rng.gen_range(-0.5..0.5));
        self.humidity = round1((self.humidity + rng.gen_range(-2.0..2.0)).clamp(0.0, 100.0));
        self.pressure = round1(self.pressure + rng.gen_range(-0.25..0.25));
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Configured items of one kind, keyed by id
type Table = BTreeMap<String, Map<String, Value>>;

struct State {
    readings: Readings,
    booted_at: Instant,
    rebooting_until: Option<Instant>,
    discrete_timers: Table,
    analog_timers: Table,
    discrete_regulators: Table,
    analog_regulators: Table,
    irrigators: Table,
}

/// In-memory stand-in for a device's command surface
pub struct SimulatedDevice {
    device_id: String,
    response_delay: Duration,
    state: Mutex<State>,
}

impl SimulatedDevice {
    /// Fresh device with default readings and empty tables
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            response_delay: Duration::ZERO,
            state: Mutex::new(State {
                readings: Readings::default(),
                booted_at: Instant::now(),
                rebooting_until: None,
                discrete_timers: Table::new(),
                analog_timers: Table::new(),
                discrete_regulators: Table::new(),
                analog_regulators: Table::new(),
                irrigators: Table::new(),
            }),
        }
    }

    /// Wait this long before answering each command
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    fn sensors(&self) -> Value {
        let mut state = self.state.lock();
        state.readings.drift(&mut rand::thread_rng());
        let r = state.readings;
        json!({
            "temperature": r.temperature,
            "humidity": r.humidity,
            "pressure": r.pressure,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    fn device_state(&self) -> Value {
        let sensors = self.sensors();
        let state = self.state.lock();
        let values = |table: &Table| -> Vec<Value> {
            table.values().cloned().map(Value::Object).collect()
        };
        json!({
            "deviceId": self.device_id,
            "status": "online",
            "uptime": state.booted_at.elapsed().as_millis() as u64,
            "sensors": sensors,
            "discreteTimers": values(&state.discrete_timers),
            "analogTimers": values(&state.analog_timers),
            "discreteRegulators": values(&state.discrete_regulators),
            "analogRegulators": values(&state.analog_regulators),
            "irrigators": values(&state.irrigators),
            "lastUpdate": Utc::now().to_rfc3339(),
        })
    }

    fn reboot(&self) -> Value {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.booted_at = now;
        state.rebooting_until = Some(now + REBOOT_DURATION);
        info!(device_id = %self.device_id, "Simulating reboot");
        json!({ "success": true, "message": "device is rebooting" })
    }

    fn update(&self, call: &RpcCall) -> Result<Value, HandlerError> {
        let Value::Object(params) = call.params() else {
            return Err(HandlerError::Failed("params must be an object".to_string()));
        };
        let id = match call.typed() {
            MethodParams::DiscreteTimer(p) => &p.id,
            MethodParams::AnalogTimer(p) => &p.id,
            MethodParams::DiscreteRegulator(p) => &p.id,
            MethodParams::AnalogRegulator(p) => &p.id,
            MethodParams::Irrigator(p) => &p.id,
            MethodParams::Empty => {
                return Err(HandlerError::Failed(format!(
                    "{} carries no item id",
                    call.method()
                )))
            }
        };

        let mut state = self.state.lock();
        let table = match call.method() {
            RpcMethod::UpdateDiscreteTimer => &mut state.discrete_timers,
            RpcMethod::UpdateAnalogTimer => &mut state.analog_timers,
            RpcMethod::UpdateDiscreteRegulator => &mut state.discrete_regulators,
            RpcMethod::UpdateAnalogRegulator => &mut state.analog_regulators,
            RpcMethod::UpdateIrrigator => &mut state.irrigators,
            other => return Err(HandlerError::Failed(format!("{other} is not an update"))),
        };
        let entry = table.entry(id.clone()).or_default();
        entry.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut result = entry.clone();
        result.insert("updated".to_string(), Value::Bool(true));
        Ok(Value::Object(result))
    }

    fn ensure_available(&self) -> Result<(), HandlerError> {
        let mut state = self.state.lock();
        match state.rebooting_until {
            Some(until) if Instant::now() < until => {
                Err(HandlerError::Unavailable("device is rebooting".to_string()))
            }
            Some(_) => {
                state.rebooting_until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CommandHandler for SimulatedDevice {
    async fn handle(&self, call: RpcCall) -> Result<Value, HandlerError> {
        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }
        self.ensure_available()?;

        match call.method() {
            RpcMethod::GetSensors => Ok(self.sensors()),
            RpcMethod::GetDeviceState => Ok(self.device_state()),
            RpcMethod::Reboot => Ok(self.reboot()),
            _ => self.update(&call),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iothub_rpc::registry::validate_params;

    fn call(method: RpcMethod, params: Value) -> RpcCall {
        validate_params(method, params).expect("params should be valid")
    }

    #[tokio::test]
    async fn sensors_stay_in_plausible_ranges() {
        let device = SimulatedDevice::new("dev-1");
        for _ in 0..50 {
            let reading = device
                .handle(call(RpcMethod::GetSensors, Value::Null))
                .await
                .expect("sensors should read");
            let humidity = reading["humidity"].as_f64().expect("humidity is a number");
            assert!((0.0..=100.0).contains(&humidity));
            assert!(reading["temperature"].is_f64());
            assert!(reading["timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn updates_merge_and_show_up_in_device_state() {
        let device = SimulatedDevice::new("dev-1");

        let first = device
            .handle(call(
                RpcMethod::UpdateDiscreteTimer,
                json!({ "id": "t1", "enabled": true, "startTime": 360 }),
            ))
            .await
            .expect("update should succeed");
        assert_eq!(first["updated"], json!(true));

        let second = device
            .handle(call(
                RpcMethod::UpdateDiscreteTimer,
                json!({ "id": "t1", "endTime": 720 }),
            ))
            .await
            .expect("update should succeed");
        assert_eq!(second["startTime"], json!(360));
        assert_eq!(second["endTime"], json!(720));

        let state = device
            .handle(call(RpcMethod::GetDeviceState, json!({})))
            .await
            .expect("state should read");
        assert_eq!(state["deviceId"], json!("dev-1"));
        let timers = state["discreteTimers"].as_array().expect("timers array");
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0]["id"], json!("t1"));
        assert!(state["irrigators"].as_array().is_some_and(Vec::is_empty));
    }

    #[tokio::test]
    async fn reboot_makes_the_device_briefly_unavailable() {
        let device = SimulatedDevice::new("dev-1");
        let result = device
            .handle(call(RpcMethod::Reboot, json!({})))
            .await
            .expect("reboot should be accepted");
        assert_eq!(result["success"], json!(true));

        let err = device
            .handle(call(RpcMethod::GetSensors, json!({})))
            .await
            .expect_err("device should be rebooting");
        assert!(matches!(err, HandlerError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn response_delay_is_applied() {
        let device =
            SimulatedDevice::new("dev-1").with_response_delay(Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        device
            .handle(call(RpcMethod::GetSensors, json!({})))
            .await
            .expect("sensors should read");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
