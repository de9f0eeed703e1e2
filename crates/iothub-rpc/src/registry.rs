//! Method catalogue and parameter validation
//!
//! Both ends validate against the same table: the hub before publishing, the
//! device before dispatching to its handler. Unknown fields are ignored.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Last minute of the day, for time-of-day fields
pub const LAST_MINUTE_OF_DAY: f64 = 1439.0;

/// Every method a device can be asked to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RpcMethod {
    /// Full internal state snapshot
    GetDeviceState,
    /// Current sensor readings
    GetSensors,
    /// Restart the device
    Reboot,
    /// Change an on/off timer
    UpdateDiscreteTimer,
    /// Change a dimming timer
    UpdateAnalogTimer,
    /// Change a hysteresis regulator
    UpdateDiscreteRegulator,
    /// Change a PID regulator
    UpdateAnalogRegulator,
    /// Change an irrigation schedule
    UpdateIrrigator,
}

impl RpcMethod {
    /// All methods in catalogue order
    pub const ALL: [RpcMethod; 8] = [
        RpcMethod::GetDeviceState,
        RpcMethod::GetSensors,
        RpcMethod::Reboot,
        RpcMethod::UpdateDiscreteTimer,
        RpcMethod::UpdateAnalogTimer,
        RpcMethod::UpdateDiscreteRegulator,
        RpcMethod::UpdateAnalogRegulator,
        RpcMethod::UpdateIrrigator,
    ];

    /// Wire name
    pub const fn as_str(self) -> &'static str {
        match self {
            RpcMethod::GetDeviceState => "getDeviceState",
            RpcMethod::GetSensors => "getSensors",
            RpcMethod::Reboot => "reboot",
            RpcMethod::UpdateDiscreteTimer => "updateDiscreteTimer",
            RpcMethod::UpdateAnalogTimer => "updateAnalogTimer",
            RpcMethod::UpdateDiscreteRegulator => "updateDiscreteRegulator",
            RpcMethod::UpdateAnalogRegulator => "updateAnalogRegulator",
            RpcMethod::UpdateIrrigator => "updateIrrigator",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RpcMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownMethod(s.to_string()))
    }
}

/// Operating mode for timers and regulators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchMode {
    /// Forced on
    On,
    /// Forced off
    Off,
    /// Follows its schedule or setpoint
    Auto,
}

/// Operating mode for irrigators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrrigatorMode {
    /// Forced on
    On,
    /// Forced off
    Off,
    /// Follows start/end time
    Auto,
    /// Follows the preset windows
    Preset,
}

/// Kind of output a regulator drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// On/off output
    Digital,
    /// Proportional output
    Analog,
}

/// Regulator alarm thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegulatorAlarm {
    /// Alarm above this value
    pub upper_limit: f64,
    /// Alarm below this value
    pub lower_limit: f64,
}

/// One irrigation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationWindow {
    /// Minutes after midnight
    pub start_time: f64,
    /// Minutes after midnight
    pub end_time: f64,
}

/// Params of `updateDiscreteTimer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDiscreteTimer {
    /// Timer id
    pub id: String,
    /// Display name
    pub name: Option<String>,
    /// Whether the timer runs
    pub enabled: Option<bool>,
    /// Mode
    pub mode: Option<SwitchMode>,
    /// Minutes after midnight
    pub start_time: Option<f64>,
    /// Minutes after midnight
    pub end_time: Option<f64>,
    /// Output id it drives
    pub output: Option<String>,
}

/// Params of `updateAnalogTimer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAnalogTimer {
    /// Timer id
    pub id: String,
    /// Display name
    pub name: Option<String>,
    /// Whether the timer runs
    pub enabled: Option<bool>,
    /// Mode
    pub mode: Option<SwitchMode>,
    /// Minutes after midnight
    pub sunrise_time: Option<f64>,
    /// Minutes after midnight
    pub sunset_time: Option<f64>,
    /// Peak level, 0 to 1
    pub max_light_level: Option<f64>,
    /// Fade duration
    pub fade_time: Option<f64>,
    /// Output id it drives
    pub output: Option<String>,
}

/// Params of `updateDiscreteRegulator`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDiscreteRegulator {
    /// Regulator id
    pub id: String,
    /// Display name
    pub name: Option<String>,
    /// Mode
    pub mode: Option<SwitchMode>,
    /// Sensor parameter being regulated
    pub parameter: Option<String>,
    /// Target value
    pub setpoint: Option<f64>,
    /// Dead band, 0 to 10
    pub hysteresis: Option<f64>,
    /// Alarm thresholds
    pub alarm: Option<RegulatorAlarm>,
    /// Output id it drives
    pub output: Option<String>,
}

/// Params of `updateAnalogRegulator`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAnalogRegulator {
    /// Regulator id
    pub id: String,
    /// Display name
    pub name: Option<String>,
    /// Mode
    pub mode: Option<SwitchMode>,
    /// Output kind
    #[serde(rename = "type")]
    pub output_type: Option<OutputType>,
    /// Sensor parameter being regulated
    pub parameter: Option<String>,
    /// Target value
    pub setpoint: Option<f64>,
    /// Proportional gain, 0 to 100
    #[serde(rename = "Kp")]
    pub kp: Option<f64>,
    /// Integral gain, 0 to 100
    #[serde(rename = "Ki")]
    pub ki: Option<f64>,
    /// Derivative gain, 0 to 100
    #[serde(rename = "Kd")]
    pub kd: Option<f64>,
    /// Alarm thresholds
    pub alarm: Option<RegulatorAlarm>,
    /// Output id it drives
    pub output: Option<String>,
}

/// Params of `updateIrrigator`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateIrrigator {
    /// Irrigator id
    pub id: String,
    /// Display name
    pub name: Option<String>,
    /// Whether the irrigator runs
    pub enabled: Option<bool>,
    /// Mode
    pub mode: Option<IrrigatorMode>,
    /// Windows used in preset mode
    pub preset: Option<Vec<IrrigationWindow>>,
    /// Minutes after midnight
    pub start_time: Option<f64>,
    /// Minutes after midnight
    pub end_time: Option<f64>,
    /// Irrigations per window
    pub numb_irrigations: Option<u32>,
    /// Length of one irrigation
    #[serde(rename = "irrigationwindow")]
    pub irrigation_window: Option<u32>,
    /// Switch back to auto after a manual override
    pub auto_manual_off: Option<bool>,
    /// Delay before switching back to auto
    pub auto_manual_off_interval: Option<u32>,
    /// Output id it drives
    pub output: Option<String>,
}

#[derive(Deserialize)]
struct NoParams {}

/// Typed params of a validated call
#[derive(Debug, Clone, PartialEq)]
pub enum MethodParams {
    /// `getDeviceState`, `getSensors`, `reboot`
    Empty,
    /// `updateDiscreteTimer`
    DiscreteTimer(UpdateDiscreteTimer),
    /// `updateAnalogTimer`
    AnalogTimer(UpdateAnalogTimer),
    /// `updateDiscreteRegulator`
    DiscreteRegulator(UpdateDiscreteRegulator),
    /// `updateAnalogRegulator`
    AnalogRegulator(UpdateAnalogRegulator),
    /// `updateIrrigator`
    Irrigator(UpdateIrrigator),
}

/// A method and params that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    method: RpcMethod,
    params: Value,
    typed: MethodParams,
}

impl RpcCall {
    /// Method being called
    pub fn method(&self) -> RpcMethod {
        self.method
    }

    /// Params as they go on the wire; `null` is normalized to `{}`
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Params as a typed value
    pub fn typed(&self) -> &MethodParams {
        &self.typed
    }
}

/// Set of methods an endpoint accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMethodRegistry {
    methods: BTreeSet<RpcMethod>,
}

impl Default for RpcMethodRegistry {
    fn default() -> Self {
        Self::with_methods(RpcMethod::ALL)
    }
}

impl RpcMethodRegistry {
    /// Registry accepting only `methods`
    pub fn with_methods(methods: impl IntoIterator<Item = RpcMethod>) -> Self {
        Self {
            methods: methods.into_iter().collect(),
        }
    }

    /// Whether `method` is accepted
    pub fn contains(&self, method: RpcMethod) -> bool {
        self.methods.contains(&method)
    }

    /// Accepted methods in catalogue order
    pub fn methods(&self) -> impl Iterator<Item = RpcMethod> + '_ {
        self.methods.iter().copied()
    }

    /// Resolve a method name
    pub fn lookup(&self, name: &str) -> Result<RpcMethod, ValidationError> {
        let method = RpcMethod::from_str(name)?;
        if !self.contains(method) {
            return Err(ValidationError::UnknownMethod(name.to_string()));
        }
        Ok(method)
    }

    /// Resolve a method name and validate its params
    pub fn resolve(&self, name: &str, params: Value) -> Result<RpcCall, ValidationError> {
        let method = self.lookup(name)?;
        validate_params(method, params)
    }
}

/// Validate `params` against `method`'s shape
pub fn validate_params(method: RpcMethod, params: Value) -> Result<RpcCall, ValidationError> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        other => {
            return Err(invalid(
                method,
                format!("params must be an object, got {}", json_kind(&other)),
            ))
        }
    };

    let typed = match method {
        RpcMethod::GetDeviceState | RpcMethod::GetSensors | RpcMethod::Reboot => {
            parse::<NoParams>(method, &params)?;
            MethodParams::Empty
        }
        RpcMethod::UpdateDiscreteTimer => {
            let p: UpdateDiscreteTimer = parse(method, &params)?;
            check_id(method, &p.id)?;
            check_minutes(method, "startTime", p.start_time)?;
            check_minutes(method, "endTime", p.end_time)?;
            MethodParams::DiscreteTimer(p)
        }
        RpcMethod::UpdateAnalogTimer => {
            let p: UpdateAnalogTimer = parse(method, &params)?;
            check_id(method, &p.id)?;
            check_minutes(method, "sunriseTime", p.sunrise_time)?;
            check_minutes(method, "sunsetTime", p.sunset_time)?;
            check_range(method, "maxLightLevel", p.max_light_level, 0.0, 1.0)?;
            check_range(method, "fadeTime", p.fade_time, 0.0, f64::MAX)?;
            MethodParams::AnalogTimer(p)
        }
        RpcMethod::UpdateDiscreteRegulator => {
            let p: UpdateDiscreteRegulator = parse(method, &params)?;
            check_id(method, &p.id)?;
            check_range(method, "hysteresis", p.hysteresis, 0.0, 10.0)?;
            MethodParams::DiscreteRegulator(p)
        }
        RpcMethod::UpdateAnalogRegulator => {
            let p: UpdateAnalogRegulator = parse(method, &params)?;
            check_id(method, &p.id)?;
            check_range(method, "Kp", p.kp, 0.0, 100.0)?;
            check_range(method, "Ki", p.ki, 0.0, 100.0)?;
            check_range(method, "Kd", p.kd, 0.0, 100.0)?;
            MethodParams::AnalogRegulator(p)
        }
        RpcMethod::UpdateIrrigator => {
            let p: UpdateIrrigator = parse(method, &params)?;
            check_id(method, &p.id)?;
            check_minutes(method, "startTime", p.start_time)?;
            check_minutes(method, "endTime", p.end_time)?;
            for window in p.preset.iter().flatten() {
                check_minutes(method, "preset.startTime", Some(window.start_time))?;
                check_minutes(method, "preset.endTime", Some(window.end_time))?;
            }
            MethodParams::Irrigator(p)
        }
    };

    Ok(RpcCall {
        method,
        params,
        typed,
    })
}

fn parse<T: DeserializeOwned>(method: RpcMethod, params: &Value) -> Result<T, ValidationError> {
    T::deserialize(params).map_err(|e| invalid(method, e.to_string()))
}

fn invalid(method: RpcMethod, reason: String) -> ValidationError {
    ValidationError::InvalidParams {
        method: method.as_str().to_string(),
        reason,
    }
}

fn check_id(method: RpcMethod, id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(invalid(method, "id must not be empty".to_string()));
    }
    Ok(())
}

fn check_minutes(
    method: RpcMethod,
    field: &str,
    value: Option<f64>,
) -> Result<(), ValidationError> {
    check_range(method, field, value, 0.0, LAST_MINUTE_OF_DAY)
}

fn check_range(
    method: RpcMethod,
    field: &str,
    value: Option<f64>,
    min: f64,
    max: f64,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.is_finite() || v < min || v > max => Err(invalid(
            method,
            format!("{} is out of range: {}", field, v),
        )),
        _ => Ok(()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn method_names_round_trip() {
        for method in RpcMethod::ALL {
            assert_eq!(method.as_str().parse::<RpcMethod>(), Ok(method));
        }
        assert_eq!(
            "turnOnLed".parse::<RpcMethod>(),
            Err(ValidationError::UnknownMethod("turnOnLed".to_string()))
        );
    }

    #[test]
    fn empty_methods_accept_null_and_empty_object() {
        let registry = RpcMethodRegistry::default();
        let call = registry
            .resolve("getSensors", Value::Null)
            .expect("null params should be accepted");
        assert_eq!(call.params(), &json!({}));
        assert_eq!(call.typed(), &MethodParams::Empty);

        assert!(registry.resolve("reboot", json!({})).is_ok());
        let call = registry
            .resolve("reboot", json!({"force": true}))
            .expect("unknown keys should be ignored");
        assert_eq!(call.typed(), &MethodParams::Empty);
        assert!(matches!(
            registry.resolve("reboot", json!([1, 2])),
            Err(ValidationError::InvalidParams { .. })
        ));
    }

    #[test]
    fn restricted_registry_rejects_other_methods() {
        let registry = RpcMethodRegistry::with_methods([RpcMethod::GetSensors]);
        assert!(registry.lookup("getSensors").is_ok());
        assert!(matches!(
            registry.lookup("reboot"),
            Err(ValidationError::UnknownMethod(_))
        ));
    }

    #[test]
    fn update_params_are_typed() {
        let call = validate_params(
            RpcMethod::UpdateAnalogRegulator,
            json!({"id": "reg-1", "type": "analog", "Kp": 2.5, "alarm": {"upperLimit": 30, "lowerLimit": 10}}),
        )
        .expect("params should validate");

        let MethodParams::AnalogRegulator(p) = call.typed() else {
            panic!("expected analog regulator params");
        };
        assert_eq!(p.output_type, Some(OutputType::Analog));
        assert_eq!(p.kp, Some(2.5));
        assert_eq!(
            p.alarm,
            Some(RegulatorAlarm {
                upper_limit: 30.0,
                lower_limit: 10.0
            })
        );
    }

    #[rstest]
    #[case(RpcMethod::UpdateDiscreteTimer, json!({"id": "t1", "startTime": 0, "endTime": 1439, "mode": "auto"}))]
    #[case(RpcMethod::UpdateAnalogTimer, json!({"id": "t2", "maxLightLevel": 1.0, "fadeTime": 0}))]
    #[case(RpcMethod::UpdateDiscreteRegulator, json!({"id": "r1", "hysteresis": 10}))]
    #[case(RpcMethod::UpdateIrrigator, json!({"id": "i1", "mode": "preset", "preset": [{"startTime": 360, "endTime": 420}], "irrigationwindow": 5}))]
    #[case(RpcMethod::UpdateDiscreteTimer, json!({"id": "t1", "startTime": 480.0}))]
    #[case(RpcMethod::UpdateDiscreteTimer, json!({"id": "t1", "colour": "red"}))]
    #[case(RpcMethod::GetSensors, json!({"extra": 1}))]
    fn accepts_boundary_values(#[case] method: RpcMethod, #[case] params: Value) {
        assert!(validate_params(method, params).is_ok());
    }

    #[rstest]
    #[case(RpcMethod::UpdateDiscreteTimer, json!({"startTime": 10}))]
    #[case(RpcMethod::UpdateDiscreteTimer, json!({"id": "t1", "startTime": 1440}))]
    #[case(RpcMethod::UpdateDiscreteTimer, json!({"id": "t1", "mode": "sometimes"}))]
    #[case(RpcMethod::UpdateDiscreteTimer, json!({"id": "t1", "startTime": -1}))]
    #[case(RpcMethod::UpdateAnalogTimer, json!({"id": "t2", "sunsetTime": 1439.5}))]
    #[case(RpcMethod::UpdateAnalogTimer, json!({"id": "t2", "maxLightLevel": 1.5}))]
    #[case(RpcMethod::UpdateAnalogTimer, json!({"id": "t2", "fadeTime": -1}))]
    #[case(RpcMethod::UpdateDiscreteRegulator, json!({"id": "r1", "hysteresis": 11}))]
    #[case(RpcMethod::UpdateAnalogRegulator, json!({"id": "r2", "Kd": 101}))]
    #[case(RpcMethod::UpdateAnalogRegulator, json!({"id": "r2", "type": "pwm"}))]
    #[case(RpcMethod::UpdateIrrigator, json!({"id": "i1", "preset": [{"startTime": 0, "endTime": 2000}]}))]
    #[case(RpcMethod::UpdateIrrigator, json!({"id": "i1", "numbIrrigations": -2}))]
    #[case(RpcMethod::UpdateIrrigator, json!({"id": ""}))]
    fn rejects_out_of_shape_params(#[case] method: RpcMethod, #[case] params: Value) {
        assert!(matches!(
            validate_params(method, params),
            Err(ValidationError::InvalidParams { .. })
        ));
    }
}
