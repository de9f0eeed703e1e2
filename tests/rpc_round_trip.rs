//! Hub-to-device RPC over the in-process broker
//!
//! Wires a hub-side `RpcTransport` and a device-side `DeviceCommandExecutor`
//! to one `MemoryBroker` and checks the request/response contract end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use iothub_device::{CommandHandler, DeviceCommandExecutor, HandlerError, SimulatedDevice};
use iothub_rpc::{MemoryBroker, RpcCall, RpcConfig, RpcError, RpcMethod, RpcTransport};

/// Answers `getSensors` after a fixed delay
struct SlowThermometer {
    delay: Duration,
}

#[async_trait]
impl CommandHandler for SlowThermometer {
    async fn handle(&self, call: RpcCall) -> Result<Value, HandlerError> {
        tokio::time::sleep(self.delay).await;
        match call.method() {
            RpcMethod::GetSensors => Ok(json!({ "temperature": 21.3 })),
            other => Err(HandlerError::Failed(format!("{other} not wired"))),
        }
    }
}

async fn hub(broker: &MemoryBroker) -> RpcTransport {
    let (link, inbound) = broker.connect("backend");
    let transport = RpcTransport::new(Arc::new(link), inbound, RpcConfig::default());
    transport.connect().await.expect("hub should connect");
    transport
}

async fn start_device(
    broker: &MemoryBroker,
    user: &str,
    id: &str,
    handler: Arc<dyn CommandHandler>,
) {
    let (link, inbound) = broker.connect(id);
    DeviceCommandExecutor::new(Arc::new(link), user, id, handler)
        .expect("ids should be valid")
        .start(inbound)
        .await
        .expect("device should start");
}

#[tokio::test(start_paused = true)]
async fn get_sensors_round_trip_within_deadline() {
    let broker = MemoryBroker::new();
    let transport = hub(&broker).await;
    start_device(
        &broker,
        "u1",
        "dev-1",
        Arc::new(SlowThermometer {
            delay: Duration::from_millis(100),
        }),
    )
    .await;

    let started = tokio::time::Instant::now();
    let response = transport
        .send_command_with_response(
            "u1",
            "dev-1",
            "getSensors",
            json!({}),
            Some(Duration::from_millis(2000)),
        )
        .await
        .expect("call should settle with a response");

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_millis(2000));
    assert_eq!(response.result_value(), Some(&json!({ "temperature": 21.3 })));
    assert_eq!(transport.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_device_times_out() {
    let broker = MemoryBroker::new();
    let transport = hub(&broker).await;
    start_device(
        &broker,
        "u1",
        "dev-1",
        Arc::new(SlowThermometer {
            delay: Duration::from_secs(10),
        }),
    )
    .await;

    let err = transport
        .send_command_with_response(
            "u1",
            "dev-1",
            "getSensors",
            json!({}),
            Some(Duration::from_millis(500)),
        )
        .await
        .expect_err("device is too slow");

    assert!(matches!(err, RpcError::Timeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(transport.pending_calls(), 0);
}

#[tokio::test]
async fn simulated_device_answers_every_method() {
    let broker = MemoryBroker::new();
    let transport = hub(&broker).await;
    start_device(&broker, "u1", "sim-1", Arc::new(SimulatedDevice::new("sim-1"))).await;

    let calls = [
        ("getSensors", json!({})),
        ("getDeviceState", json!({})),
        ("updateDiscreteTimer", json!({ "id": "t1", "startTime": 420 })),
        ("updateAnalogTimer", json!({ "id": "a1", "maxLightLevel": 0.8 })),
        ("updateDiscreteRegulator", json!({ "id": "r1", "hysteresis": 1.5 })),
        ("updateAnalogRegulator", json!({ "id": "r2", "Kp": 10, "type": "analog" })),
        ("updateIrrigator", json!({ "id": "i1", "mode": "preset", "numbIrrigations": 3 })),
    ];
    for (method, params) in calls {
        let response = transport
            .send_command_with_response("u1", "sim-1", method, params, None)
            .await
            .unwrap_or_else(|e| panic!("{method} should get a response: {e}"));
        assert!(response.is_ok(), "{method} failed: {response:?}");
    }

    let state = transport
        .send_command_with_response("u1", "sim-1", "getDeviceState", Value::Null, None)
        .await
        .expect("state should be returned");
    let state = state.result_value().expect("state is a result");
    assert_eq!(state["discreteTimers"][0]["startTime"], json!(420));
}

#[tokio::test]
async fn two_devices_share_a_broker_without_cross_talk() {
    let broker = MemoryBroker::new();
    let transport = Arc::new(hub(&broker).await);
    start_device(&broker, "u1", "dev-a", Arc::new(SimulatedDevice::new("dev-a"))).await;
    start_device(&broker, "u2", "dev-b", Arc::new(SimulatedDevice::new("dev-b"))).await;

    let a = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .send_command_with_response("u1", "dev-a", "getDeviceState", json!({}), None)
                .await
        })
    };
    let b = transport
        .send_command_with_response("u2", "dev-b", "getDeviceState", json!({}), None)
        .await
        .expect("dev-b should answer");
    let a = a
        .await
        .expect("task should not panic")
        .expect("dev-a should answer");

    assert_eq!(a.result_value().map(|v| &v["deviceId"]), Some(&json!("dev-a")));
    assert_eq!(b.result_value().map(|v| &v["deviceId"]), Some(&json!("dev-b")));
}
