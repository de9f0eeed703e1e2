//! Pending-call table
//!
//! Each outgoing request with a response registers here under its
//! correlation id. Three things can settle an entry: the device's response,
//! the call's deadline, or a publish failure. Whichever removes the entry from
//! the map first wins; the others find nothing and do nothing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{RpcError, TransportError};
use crate::protocol::RpcResponse;
use crate::registry::RpcMethod;

/// What a waiting caller eventually receives
pub type Settlement = Result<RpcResponse, RpcError>;

/// Why a response could not be delivered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No call with this id is waiting (unknown, settled, or timed out)
    #[error("no pending call with this id")]
    NoPendingCall,
    /// The response came from a device other than the one called
    #[error("response came from {actual}, call was sent to {expected}")]
    DeviceMismatch {
        /// Device the call was sent to
        expected: String,
        /// Device whose topic carried the response
        actual: String,
    },
    /// The caller stopped waiting
    #[error("caller dropped")]
    ReceiverDropped,
}

struct PendingCall {
    reply: oneshot::Sender<Settlement>,
    device_id: String,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn finish(self, settlement: Settlement) -> Result<(), DispatchError> {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.reply
            .send(settlement)
            .map_err(|_| DispatchError::ReceiverDropped)
    }
}

/// Handle a caller awaits for its settlement
#[derive(Debug)]
pub struct PendingReply {
    request_id: String,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingReply {
    /// Correlation id of the call
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response, the deadline, or a send failure
    pub async fn wait(self) -> Settlement {
        self.rx
            .await
            .unwrap_or(Err(RpcError::Transport(TransportError::Closed)))
    }
}

/// Correlates responses with the calls waiting for them
#[derive(Default)]
pub struct RpcCorrelator {
    pending: Arc<DashMap<String, PendingCall>>,
}

impl RpcCorrelator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and start its deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        request_id: String,
        device_id: &str,
        method: RpcMethod,
        timeout: Duration,
    ) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        debug!(request_id = %request_id, device_id = %device_id, method = %method, "Registering pending call");
        self.pending.insert(
            request_id.clone(),
            PendingCall {
                reply: tx,
                device_id: device_id.to_string(),
                timer: None,
            },
        );

        let timer = tokio::spawn(expire(
            self.pending.clone(),
            request_id.clone(),
            method,
            timeout,
        ));
        match self.pending.get_mut(&request_id) {
            Some(mut call) => call.timer = Some(timer.abort_handle()),
            // Settled before the timer was attached
            None => timer.abort(),
        }

        PendingReply { request_id, rx }
    }

    /// Deliver a response that arrived on `origin_device`'s response topic.
    ///
    /// A response whose topic names a different device than the call was sent
    /// to leaves the call pending.
    pub fn settle(&self, origin_device: &str, response: RpcResponse) -> Result<(), DispatchError> {
        let request_id = response.id.clone();
        match self
            .pending
            .remove_if(&request_id, |_, call| call.device_id == origin_device)
        {
            Some((_, call)) => {
                debug!(request_id = %request_id, device_id = %origin_device, "Dispatching response");
                call.finish(Ok(response))
            }
            None => match self.pending.get(&request_id) {
                Some(call) => {
                    let expected = call.device_id.clone();
                    drop(call);
                    warn!(
                        request_id = %request_id,
                        expected = %expected,
                        actual = %origin_device,
                        "Ignoring response from a different device"
                    );
                    Err(DispatchError::DeviceMismatch {
                        expected,
                        actual: origin_device.to_string(),
                    })
                }
                None => {
                    debug!(request_id = %request_id, "No pending call for response, discarding");
                    Err(DispatchError::NoPendingCall)
                }
            },
        }
    }

    /// Fail a pending call with `error`. Returns false if it was already settled.
    pub fn fail(&self, request_id: &str, error: RpcError) -> bool {
        match self.pending.remove(request_id) {
            Some((_, call)) => {
                let _ = call.finish(Err(error));
                true
            }
            None => false,
        }
    }

    /// Number of calls still waiting
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

async fn expire(
    pending: Arc<DashMap<String, PendingCall>>,
    request_id: String,
    method: RpcMethod,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    if let Some((_, call)) = pending.remove(&request_id) {
        warn!(
            request_id = %request_id,
            device_id = %call.device_id,
            method = %method,
            timeout_ms = timeout.as_millis() as u64,
            "RPC call timed out"
        );
        let error = RpcError::Timeout {
            request_id,
            device_id: call.device_id.clone(),
            method: method.as_str().to_string(),
            timeout,
        };
        // The timer is this task; nothing to abort
        let _ = call.reply.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register(correlator: &RpcCorrelator, id: &str, device: &str, ms: u64) -> PendingReply {
        correlator.register(
            id.to_string(),
            device,
            RpcMethod::GetSensors,
            Duration::from_millis(ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn response_settles_the_matching_call() {
        let correlator = RpcCorrelator::new();
        let reply = register(&correlator, "r1", "dev-1", 1000);

        correlator
            .settle("dev-1", RpcResponse::result("r1", json!({"ok": true})))
            .expect("response should be delivered");
        assert_eq!(correlator.pending_count(), 0);

        let response = reply.wait().await.expect("call should succeed");
        assert_eq!(response.result_value(), Some(&json!({"ok": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_settles_with_timeout_and_late_response_is_discarded() {
        let correlator = RpcCorrelator::new();
        let reply = register(&correlator, "r1", "dev-1", 50);

        let err = reply.wait().await.expect_err("call should time out");
        assert!(matches!(err, RpcError::Timeout { ref request_id, .. } if request_id == "r1"));
        assert_eq!(correlator.pending_count(), 0);

        assert_eq!(
            correlator.settle("dev-1", RpcResponse::result("r1", json!(1))),
            Err(DispatchError::NoPendingCall)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn response_from_another_device_does_not_settle() {
        let correlator = RpcCorrelator::new();
        let reply = register(&correlator, "r1", "dev-1", 1000);

        assert!(matches!(
            correlator.settle("dev-2", RpcResponse::result("r1", json!(1))),
            Err(DispatchError::DeviceMismatch { .. })
        ));
        assert_eq!(correlator.pending_count(), 1);

        correlator
            .settle("dev-1", RpcResponse::result("r1", json!(2)))
            .expect("genuine response should be delivered");
        let response = reply.wait().await.expect("call should succeed");
        assert_eq!(response.result_value(), Some(&json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn interleaved_calls_get_their_own_responses() {
        let correlator = RpcCorrelator::new();
        let a = register(&correlator, "a", "dev-1", 1000);
        let b = register(&correlator, "b", "dev-1", 1000);

        correlator
            .settle("dev-1", RpcResponse::result("b", json!("B")))
            .expect("b should be delivered");
        correlator
            .settle("dev-1", RpcResponse::result("a", json!("A")))
            .expect("a should be delivered");

        assert_eq!(
            a.wait().await.expect("a should succeed").result_value(),
            Some(&json!("A"))
        );
        assert_eq!(
            b.wait().await.expect("b should succeed").result_value(),
            Some(&json!("B"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fail_wins_once() {
        let correlator = RpcCorrelator::new();
        let reply = register(&correlator, "r1", "dev-1", 1000);

        assert!(correlator.fail("r1", RpcError::Transport(TransportError::NotConnected)));
        assert!(!correlator.fail("r1", RpcError::NotReady));

        assert!(matches!(
            reply.wait().await,
            Err(RpcError::Transport(TransportError::NotConnected))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_call_does_not_time_out_later() {
        let correlator = RpcCorrelator::new();
        let reply = register(&correlator, "r1", "dev-1", 100);
        assert_eq!(reply.request_id(), "r1");
        correlator
            .settle("dev-1", RpcResponse::result("r1", json!(null)))
            .expect("response should be delivered");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(reply.wait().await.is_ok());
    }
}
