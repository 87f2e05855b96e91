use chrono::{Datelike, Local, Timelike};
use tracing::trace;

use crate::client::HubHandle;
use crate::protocol::StateChanged;
use crate::{Error, Result};

/// Well-known outdoor temperature entity provided by the hub's weather
/// integration. Failure to read it is non-fatal; the controller carries
/// on without outdoor context.
pub const OUTDOOR_TEMP_ENTITY: &str = "sensor.outdoor_temperature";

/// Parse an entity state string as a temperature in °C. Strict: the
/// whole string must be a float, and the hub's "unavailable"/"unknown"
/// sentinels are format errors, not values.
pub fn parse_temperature(entity_id: &str, state: &str) -> Result<f64> {
    match state {
        "" | "unavailable" | "unknown" => Err(Error::SensorFormat {
            entity_id: entity_id.to_string(),
            state: state.to_string(),
        }),
        s => s.parse::<f64>().map_err(|_| Error::SensorFormat {
            entity_id: entity_id.to_string(),
            state: s.to_string(),
        }),
    }
}

/// Read a named entity's scalar state as a temperature.
pub async fn read_temperature(hub: &HubHandle, entity_id: &str) -> Result<f64> {
    match hub.get_entity_state(entity_id).await? {
        None => Err(Error::SensorNotFound(entity_id.to_string())),
        Some(snapshot) => parse_temperature(entity_id, &snapshot.state),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionsDelta {
    pub indoor_c: f64,
    pub hour: u32,
    pub is_weekday: bool,
}

/// Extract an indoor temperature update from a state_changed event.
/// Events for other entities, or with unparseable states, yield None.
pub fn conditions_delta(change: &StateChanged, temp_sensor: &str) -> Option<ConditionsDelta> {
    if change.entity_id != temp_sensor {
        return None;
    }
    let new_state = change.new_state.as_ref()?;
    let indoor_c = match parse_temperature(&change.entity_id, &new_state.state) {
        Ok(value) => value,
        Err(e) => {
            trace!(error = %e, "ignoring sensor update");
            return None;
        }
    };
    let (hour, is_weekday) = local_clock();
    Some(ConditionsDelta {
        indoor_c,
        hour,
        is_weekday,
    })
}

/// Current wall-clock hour and weekday flag (Mon-Fri).
pub fn local_clock() -> (u32, bool) {
    let now = Local::now();
    (now.hour(), now.weekday().number_from_monday() <= 5)
}
