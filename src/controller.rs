use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{HubClient, HubHandle};
use crate::config::Config;
use crate::decision::Conditions;
use crate::fsm::{self, FsmHandle, HvacState};
use crate::protocol::StateChanged;
use crate::sensor;
use crate::{Error, Result};

/// Plain status record for the CLI surface.
#[derive(Debug, Clone)]
pub struct Status {
    pub state: HvacState,
    pub connected: bool,
    pub entity_count: usize,
    pub temp_sensor: String,
}

#[derive(Debug)]
pub struct Controller {
    config: Arc<Config>,
    hub: HubHandle,
    fsm: FsmHandle,
    client_task: JoinHandle<Result<()>>,
    fsm_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
}

impl Controller {
    /// Connect to the hub, start the state machine, and begin feeding
    /// it conditions. Configuration and auth failures surface here.
    pub async fn start(config: Config) -> Result<Controller> {
        config.validate()?;
        let config = Arc::new(config);

        let client = HubClient::connect(&config.hass_options).await?;
        let hub = client.handle();
        let events = hub.subscribe_state_changed().await?;

        let (fsm, fsm_task) = fsm::spawn(config.clone(), hub.clone());

        let event_task = tokio::spawn(event_loop(
            config.clone(),
            hub.clone(),
            fsm.clone(),
            events,
        ));

        info!(
            sensor = %config.hvac_options.temp_sensor,
            entities = config.hvac_options.entities.len(),
            mode = %config.hvac_options.system_mode,
            "controller started"
        );

        Ok(Controller {
            config,
            hub,
            fsm,
            client_task: client.into_task(),
            fsm_task,
            event_task,
        })
    }

    pub async fn status(&self) -> Status {
        let state = self.fsm.state().await.unwrap_or(HvacState::Stopped);
        Status {
            state,
            connected: self.hub.is_connected().await,
            entity_count: self.config.hvac_options.entities.len(),
            temp_sensor: self.config.hvac_options.temp_sensor.clone(),
        }
    }

    /// Force a conditions refresh and an immediate evaluation.
    pub async fn trigger_evaluation(&self) -> Result<()> {
        let conditions = refresh_conditions(&self.hub, &self.config).await;
        self.fsm.update_conditions(conditions).await;
        self.fsm.trigger_evaluation().await;
        Ok(())
    }

    /// Block until the protocol client dies (reconnect exhaustion or
    /// another fatal session failure).
    pub async fn run(&mut self) -> Result<()> {
        match (&mut self.client_task).await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Orderly shutdown: stop the machine (mode off everywhere), then
    /// close the socket.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.fsm.shutdown().await {
            warn!(error = %e, "state machine shutdown failed");
        }
        self.hub.disconnect().await;
        self.event_task.abort();
        let _ = self.fsm_task.await;
        let _ = self.client_task.await;
        info!("controller stopped");
        Ok(())
    }
}

/// Long-lived task: indoor-sensor events and the periodic refresh both
/// end up as conditions snapshots pushed into the state machine.
async fn event_loop(
    config: Arc<Config>,
    hub: HubHandle,
    fsm: FsmHandle,
    mut events: mpsc::Receiver<StateChanged>,
) {
    let mut refresh = tokio::time::interval(Duration::from_millis(
        config.hass_options.state_check_interval_ms,
    ));

    loop {
        tokio::select! {
            change = events.recv() => match change {
                None => {
                    debug!("event subscription closed");
                    break;
                }
                Some(change) => {
                    let Some(delta) =
                        sensor::conditions_delta(&change, &config.hvac_options.temp_sensor)
                    else {
                        continue;
                    };
                    let outdoor_c = read_outdoor(&hub).await;
                    fsm.update_conditions(Conditions {
                        indoor_c: Some(delta.indoor_c),
                        outdoor_c,
                        hour: delta.hour,
                        is_weekday: delta.is_weekday,
                    })
                    .await;
                }
            },
            _ = refresh.tick() => {
                let conditions = refresh_conditions(&hub, &config).await;
                fsm.update_conditions(conditions).await;
            }
        }
    }
}

async fn refresh_conditions(hub: &HubHandle, config: &Config) -> Conditions {
    let indoor_c = match sensor::read_temperature(hub, &config.hvac_options.temp_sensor).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(sensor = %config.hvac_options.temp_sensor, error = %e, "indoor read failed");
            None
        }
    };
    let outdoor_c = read_outdoor(hub).await;
    let (hour, is_weekday) = sensor::local_clock();
    Conditions {
        indoor_c,
        outdoor_c,
        hour,
        is_weekday,
    }
}

async fn read_outdoor(hub: &HubHandle) -> Option<f64> {
    match sensor::read_temperature(hub, sensor::OUTDOOR_TEMP_ENTITY).await {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(error = %e, "no outdoor reading");
            None
        }
    }
}
