mod client;
mod config;
mod controller;
mod decision;
mod error;
mod fsm;
mod protocol;
mod sensor;

pub use client::{HubClient, HubHandle};
pub use config::{
    ActiveHours, Config, CoolingParams, DefrostParams, Entity, HeatingParams, HubOptions,
    HvacOptions, SystemMode, Thresholds,
};
pub use controller::{Controller, Status};
pub use decision::{Conditions, DefrostClock, evaluate};
pub use error::{Error, Result};
pub use fsm::{HvacEvent, HvacState, TICK_INTERVAL, transition};
pub use protocol::{EntityState, StateChanged};
pub use sensor::{OUTDOOR_TEMP_ENTITY, parse_temperature};
