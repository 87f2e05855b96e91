use std::time::Instant;

use crate::config::{ActiveHours, DefrostParams, HvacOptions, SystemMode, Thresholds};
use crate::fsm::{HvacEvent, HvacState};

/// Snapshot of everything the engine decides on. Refreshed by the
/// controller; read-only here.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Conditions {
    pub indoor_c: Option<f64>,
    pub outdoor_c: Option<f64>,
    pub hour: u32,
    pub is_weekday: bool,
}

/// Defrost bookkeeping owned by the state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefrostClock {
    pub last_defrost: Option<Instant>,
    pub defrost_started: Option<Instant>,
}

/// Pure decision function: (state, conditions, configuration) to the
/// next event, or None when nothing should change. Absent indoor or
/// outdoor readings make the temperature predicates false and the
/// engine declines to act on partial data.
pub fn evaluate(
    state: HvacState,
    conditions: &Conditions,
    options: &HvacOptions,
    clock: &DefrostClock,
    now: Instant,
) -> Option<HvacEvent> {
    match state {
        HvacState::Initial => return Some(HvacEvent::Initialize),
        HvacState::Stopped => return None,
        HvacState::Defrost => {
            if let Some(started) = clock.defrost_started
                && now.duration_since(started).as_secs()
                    >= options.heating.defrost.duration_seconds
            {
                let resume = operable_now(conditions, &options.active_hours)
                    && should_heat(conditions, &options.heating.thresholds);
                return Some(if resume {
                    HvacEvent::ResumeHeating
                } else {
                    HvacEvent::CompleteDefrost
                });
            }
        }
        _ => {}
    }

    // An explicit off configuration stops the system no matter what the
    // sensors say.
    if options.system_mode == SystemMode::Off {
        return stop_event_for(state);
    }

    if conditions.indoor_c.is_none() || conditions.outdoor_c.is_none() {
        return None;
    }

    let effective = match options.system_mode {
        SystemMode::Auto => auto_mode(conditions, options),
        mode => mode,
    };

    match effective {
        SystemMode::HeatOnly => {
            if !operable_now(conditions, &options.active_hours) {
                return stop_event_for(state);
            }
            let heating = &options.heating;
            if state == HvacState::Heating
                && need_defrost(state, conditions, &heating.defrost, clock.last_defrost, now)
            {
                Some(HvacEvent::StartDefrost)
            } else if state == HvacState::Idle && should_heat(conditions, &heating.thresholds) {
                Some(HvacEvent::StartHeating)
            } else if state == HvacState::Heating && !should_heat(conditions, &heating.thresholds)
            {
                Some(HvacEvent::StopHeating)
            } else {
                None
            }
        }
        SystemMode::CoolOnly => {
            let thresholds = &options.cooling.thresholds;
            if !operable_now(conditions, &options.active_hours) {
                return (state == HvacState::Cooling).then_some(HvacEvent::StopCooling);
            }
            if state == HvacState::Idle && should_cool(conditions, thresholds) {
                Some(HvacEvent::StartCooling)
            } else if state == HvacState::Cooling && !should_cool(conditions, thresholds) {
                Some(HvacEvent::StopCooling)
            } else {
                None
            }
        }
        SystemMode::Off => stop_event_for(state),
        SystemMode::Auto => unreachable!("auto is resolved above"),
    }
}

/// Resolve `auto` into a concrete mode. Callers guarantee both
/// readings are present.
fn auto_mode(conditions: &Conditions, options: &HvacOptions) -> SystemMode {
    let indoor = conditions.indoor_c.expect("checked by caller");
    let outdoor = conditions.outdoor_c.expect("checked by caller");
    let heating = &options.heating.thresholds;
    let cooling = &options.cooling.thresholds;
    let operable = operable_now(conditions, &options.active_hours);

    if indoor < heating.indoor_min {
        return if outdoor_in_range(outdoor, heating) && operable {
            SystemMode::HeatOnly
        } else {
            SystemMode::Off
        };
    }
    if indoor > cooling.indoor_max {
        return if outdoor_in_range(outdoor, cooling) && operable {
            SystemMode::CoolOnly
        } else {
            SystemMode::Off
        };
    }

    let heat_ok = outdoor_in_range(outdoor, heating) && operable;
    let cool_ok = outdoor_in_range(outdoor, cooling) && operable;
    match (heat_ok, cool_ok) {
        (true, true) => {
            let midpoint = (heating.outdoor_max + cooling.outdoor_min) / 2.0;
            if outdoor <= midpoint {
                SystemMode::HeatOnly
            } else {
                SystemMode::CoolOnly
            }
        }
        (true, false) => SystemMode::HeatOnly,
        (false, true) => SystemMode::CoolOnly,
        (false, false) => SystemMode::Off,
    }
}

fn stop_event_for(state: HvacState) -> Option<HvacEvent> {
    match state {
        HvacState::Heating => Some(HvacEvent::StopHeating),
        HvacState::Cooling => Some(HvacEvent::StopCooling),
        HvacState::Defrost => Some(HvacEvent::CompleteDefrost),
        _ => None,
    }
}

/// Active-hours gate, inclusive on both ends. Hours only; outdoor
/// bounds belong to the mode predicates.
pub fn operable_now(conditions: &Conditions, hours: &ActiveHours) -> bool {
    let start = if conditions.is_weekday {
        hours.start_weekday
    } else {
        hours.start
    };
    conditions.hour >= start && conditions.hour <= hours.end_hour
}

pub fn should_heat(conditions: &Conditions, thresholds: &Thresholds) -> bool {
    let (Some(indoor), Some(outdoor)) = (conditions.indoor_c, conditions.outdoor_c) else {
        return false;
    };
    indoor < thresholds.indoor_min && outdoor_in_range(outdoor, thresholds)
}

pub fn should_cool(conditions: &Conditions, thresholds: &Thresholds) -> bool {
    let (Some(indoor), Some(outdoor)) = (conditions.indoor_c, conditions.outdoor_c) else {
        return false;
    };
    indoor > thresholds.indoor_max && outdoor_in_range(outdoor, thresholds)
}

pub fn need_defrost(
    state: HvacState,
    conditions: &Conditions,
    defrost: &DefrostParams,
    last_defrost: Option<Instant>,
    now: Instant,
) -> bool {
    if state != HvacState::Heating {
        return false;
    }
    let Some(outdoor) = conditions.outdoor_c else {
        return false;
    };
    outdoor <= defrost.temperature_threshold_c
        && last_defrost
            .is_none_or(|t| now.duration_since(t).as_secs() >= defrost.period_seconds)
}

fn outdoor_in_range(outdoor: f64, thresholds: &Thresholds) -> bool {
    outdoor >= thresholds.outdoor_min && outdoor <= thresholds.outdoor_max
}
