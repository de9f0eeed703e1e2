//! MQTT topic layout
//!
//! Every device gets a request/response pair scoped under its owner:
//! `users/{user_id}/devices/{device_id}/rpc/{request|response}`.

/// Subscription that catches every device response
pub const RESPONSE_WILDCARD: &str = "users/+/devices/+/rpc/response";

/// Topic the hub publishes commands on
pub fn request_topic(user_id: &str, device_id: &str) -> String {
    format!("users/{}/devices/{}/rpc/request", user_id, device_id)
}

/// Topic a device answers on
pub fn response_topic(user_id: &str, device_id: &str) -> String {
    format!("users/{}/devices/{}/rpc/response", user_id, device_id)
}

/// Connection status topic, used for the device last will
pub fn status_topic(user_id: &str, device_id: &str) -> String {
    format!("users/{}/devices/{}/status", user_id, device_id)
}

/// Split a response topic into `(user_id, device_id)`
pub fn parse_response_topic(topic: &str) -> Option<(&str, &str)> {
    parse_rpc_topic(topic, "response")
}

/// Split a request topic into `(user_id, device_id)`
pub fn parse_request_topic(topic: &str) -> Option<(&str, &str)> {
    parse_rpc_topic(topic, "request")
}

fn parse_rpc_topic<'a>(topic: &'a str, direction: &str) -> Option<(&'a str, &'a str)> {
    let mut parts = topic.split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("users"), Some(user), Some("devices"), Some(device), Some("rpc"), Some(dir), None)
            if dir == direction && !user.is_empty() && !device.is_empty() =>
        {
            Some((user, device))
        }
        _ => None,
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
