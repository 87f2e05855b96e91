use serde::Deserialize;
use serde_json::{Value, json};

use crate::Result;

pub fn auth_message(access_token: &str) -> Value {
    json!({
        "type": "auth",
        "access_token": access_token,
    })
}

pub fn subscribe_events_message(id: u64) -> Value {
    json!({
        "id": id,
        "type": "subscribe_events",
        "event_type": "state_changed",
    })
}

pub fn get_states_message(id: u64) -> Value {
    json!({
        "id": id,
        "type": "get_states",
    })
}

pub fn call_service_message(id: u64, domain: &str, service: &str, service_data: Value) -> Value {
    json!({
        "id": id,
        "type": "call_service",
        "domain": domain,
        "service": service,
        "service_data": service_data,
    })
}

/// One entity snapshot as reported by `get_states` and inside
/// `state_changed` events.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
}

#[derive(Debug, Clone)]
pub struct StateChanged {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: Option<EntityState>,
}

/// Extract a state_changed payload from an `event` message body.
/// Returns None for other event types or malformed payloads.
pub fn parse_state_changed(event: &Value) -> Option<StateChanged> {
    if event.get("event_type").and_then(|v| v.as_str()) != Some("state_changed") {
        return None;
    }
    let data = event.get("data")?;
    let entity_id = data.get("entity_id")?.as_str()?.to_string();
    let old_state = data
        .get("old_state")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let new_state = data
        .get("new_state")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    Some(StateChanged {
        entity_id,
        old_state,
        new_state,
    })
}

#[derive(Debug, Clone)]
pub enum ServerMessage {
    AuthRequired,
    AuthOk,
    AuthInvalid { message: String },
    Result { id: u64, success: bool, payload: Value },
    Event { event: Value },
    Unknown { msg_type: String },
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage> {
    let value: Value = serde_json::from_str(text)?;
    let msg_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    let message = match msg_type {
        "auth_required" => ServerMessage::AuthRequired,
        "auth_ok" => ServerMessage::AuthOk,
        "auth_invalid" => ServerMessage::AuthInvalid {
            message: value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("authentication failed")
                .to_string(),
        },
        "result" => {
            let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
                // A result we cannot correlate is useless; drop it upstream.
                return Ok(ServerMessage::Unknown {
                    msg_type: "result-without-id".to_string(),
                });
            };
            let success = value
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let payload = if success {
                value.get("result").cloned().unwrap_or(Value::Null)
            } else {
                value.get("error").cloned().unwrap_or(Value::Null)
            };
            ServerMessage::Result {
                id,
                success,
                payload,
            }
        }
        "event" => ServerMessage::Event {
            event: value.get("event").cloned().unwrap_or(Value::Null),
        },
        other => ServerMessage::Unknown {
            msg_type: other.to_string(),
        },
    };
    Ok(message)
}
