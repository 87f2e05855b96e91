use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::HubHandle;
use crate::config::Config;
use crate::decision::{self, Conditions, DefrostClock};
use crate::{Error, Result};

pub const TICK_INTERVAL: Duration = Duration::from_secs(5);
const INBOX_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacState {
    Initial,
    Idle,
    Heating,
    Cooling,
    Defrost,
    Stopped,
}

impl HvacState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HvacState::Initial => "initial",
            HvacState::Idle => "idle",
            HvacState::Heating => "heating",
            HvacState::Cooling => "cooling",
            HvacState::Defrost => "defrost",
            HvacState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HvacState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacEvent {
    Initialize,
    StartHeating,
    StartCooling,
    StartDefrost,
    StopHeating,
    StopCooling,
    CompleteDefrost,
    ResumeHeating,
    Shutdown,
}

impl HvacEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HvacEvent::Initialize => "initialize",
            HvacEvent::StartHeating => "start_heating",
            HvacEvent::StartCooling => "start_cooling",
            HvacEvent::StartDefrost => "start_defrost",
            HvacEvent::StopHeating => "stop_heating",
            HvacEvent::StopCooling => "stop_cooling",
            HvacEvent::CompleteDefrost => "complete_defrost",
            HvacEvent::ResumeHeating => "resume_heating",
            HvacEvent::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for HvacEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table. Everything not listed here is rejected.
pub fn transition(state: HvacState, event: HvacEvent) -> Option<HvacState> {
    use HvacEvent::*;
    use HvacState::*;

    match (state, event) {
        (Initial, Initialize) => Some(Idle),
        (Idle, StartHeating) => Some(Heating),
        (Idle, StartCooling) => Some(Cooling),
        (Idle, StartDefrost) => Some(Defrost),
        (Heating, StopHeating) => Some(Idle),
        (Heating, StartDefrost) => Some(Defrost),
        (Cooling, StopCooling) => Some(Idle),
        (Defrost, CompleteDefrost) => Some(Idle),
        (Defrost, ResumeHeating) => Some(Heating),
        (Idle | Heating | Cooling | Defrost, Shutdown) => Some(Stopped),
        _ => None,
    }
}

pub(crate) enum FsmMsg {
    Conditions(Conditions),
    Evaluate,
    State { reply: oneshot::Sender<HvacState> },
    Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Debug, Clone)]
pub struct FsmHandle {
    tx: mpsc::Sender<FsmMsg>,
}

impl FsmHandle {
    pub async fn update_conditions(&self, conditions: Conditions) {
        let _ = self.tx.send(FsmMsg::Conditions(conditions)).await;
    }

    /// Force an evaluation without waiting for the next tick.
    pub async fn trigger_evaluation(&self) {
        let _ = self.tx.send(FsmMsg::Evaluate).await;
    }

    pub async fn state(&self) -> Result<HvacState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FsmMsg::State { reply })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Transition to stopped (mode off everywhere) and end the task.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FsmMsg::Shutdown { reply })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)
    }
}

pub fn spawn(config: Arc<Config>, hub: HubHandle) -> (FsmHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(INBOX_BUFFER);
    let fsm = Fsm::new(config, hub, rx);
    let task = tokio::spawn(fsm.run());
    (FsmHandle { tx }, task)
}

struct Fsm {
    config: Arc<Config>,
    hub: HubHandle,
    inbox: mpsc::Receiver<FsmMsg>,
    state: HvacState,
    conditions: Option<Conditions>,
    clock: DefrostClock,
}

impl Fsm {
    fn new(config: Arc<Config>, hub: HubHandle, inbox: mpsc::Receiver<FsmMsg>) -> Fsm {
        Fsm {
            config,
            hub,
            inbox,
            state: HvacState::Initial,
            conditions: None,
            clock: DefrostClock::default(),
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    None => break,
                    Some(FsmMsg::Conditions(conditions)) => {
                        debug!(?conditions, "conditions updated");
                        self.conditions = Some(conditions);
                    }
                    Some(FsmMsg::Evaluate) => self.evaluate_and_apply().await,
                    Some(FsmMsg::State { reply }) => {
                        let _ = reply.send(self.state);
                    }
                    Some(FsmMsg::Shutdown { reply }) => {
                        if let Err(e) = self.apply_event(HvacEvent::Shutdown).await {
                            warn!(error = %e, "shutdown side effects incomplete");
                        }
                        let _ = reply.send(());
                        break;
                    }
                },
                _ = tick.tick() => self.evaluate_and_apply().await,
            }
            if self.state == HvacState::Stopped {
                break;
            }
        }
        debug!("hvac state machine stopped");
    }

    async fn evaluate_and_apply(&mut self) {
        // No decision before the controller has injected a snapshot.
        let Some(conditions) = self.conditions else {
            return;
        };
        let event = decision::evaluate(
            self.state,
            &conditions,
            &self.config.hvac_options,
            &self.clock,
            Instant::now(),
        );
        if let Some(event) = event
            && let Err(e) = self.apply_event(event).await
        {
            warn!(state = %self.state, event = %event, error = %e, "transition not committed");
        }
    }

    /// Run the side effects for `event` and commit the transition.
    /// A side-effect failure leaves the machine in the source state;
    /// the next tick re-evaluates.
    async fn apply_event(&mut self, event: HvacEvent) -> Result<()> {
        let Some(next) = transition(self.state, event) else {
            return Err(Error::TransitionRejected {
                state: self.state.as_str(),
                event: event.as_str(),
            });
        };

        match event {
            HvacEvent::Initialize => {}
            HvacEvent::StartHeating | HvacEvent::ResumeHeating => {
                let params = &self.config.hvac_options.heating;
                self.enter_active("heat", &params.preset_mode, params.setpoint_c)
                    .await?;
            }
            HvacEvent::StartCooling => {
                let params = &self.config.hvac_options.cooling;
                self.enter_active("cool", &params.preset_mode, params.setpoint_c)
                    .await?;
            }
            HvacEvent::StartDefrost => self.enter_defrost().await?,
            HvacEvent::StopHeating | HvacEvent::StopCooling | HvacEvent::CompleteDefrost => {
                self.all_entities_off().await?;
            }
            HvacEvent::Shutdown => {
                // Best effort: shutdown must not be blocked by a dead entity.
                if let Err(e) = self.all_entities_off().await {
                    warn!(error = %e, "mode off during shutdown failed");
                }
            }
        }

        match event {
            HvacEvent::StartDefrost => self.clock.defrost_started = Some(Instant::now()),
            HvacEvent::CompleteDefrost | HvacEvent::ResumeHeating => {
                self.clock.last_defrost = Some(Instant::now());
                self.clock.defrost_started = None;
            }
            _ => {}
        }

        info!(from = %self.state, to = %next, event = %event, "hvac transition");
        self.state = next;
        Ok(())
    }

    /// Heating/cooling entry: mode, preset, setpoint on every enabled
    /// entity, in that order. Commits only if all entities succeed.
    async fn enter_active(&self, mode: &str, preset: &str, setpoint_c: f64) -> Result<()> {
        let mut failed = Vec::new();
        for entity in self.config.enabled_entities() {
            let result = async {
                self.hub
                    .call_service(
                        "climate",
                        "set_hvac_mode",
                        json!({"entity_id": entity.entity_id, "hvac_mode": mode}),
                    )
                    .await?;
                self.hub
                    .call_service(
                        "climate",
                        "set_preset_mode",
                        json!({"entity_id": entity.entity_id, "preset_mode": preset}),
                    )
                    .await?;
                self.hub
                    .call_service(
                        "climate",
                        "set_temperature",
                        json!({"entity_id": entity.entity_id, "temperature": setpoint_c}),
                    )
                    .await?;
                Ok::<(), Error>(())
            }
            .await;
            if let Err(e) = result {
                warn!(entity_id = %entity.entity_id, error = %e, "entity setup failed");
                failed.push(entity.entity_id.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialEntityFailure { failed })
        }
    }

    /// The hub drives heat-pump defrost by forcing cool mode on the
    /// defrost-capable units.
    async fn enter_defrost(&self) -> Result<()> {
        let mut failed = Vec::new();
        for entity in self
            .config
            .enabled_entities()
            .filter(|e| e.defrost_capable)
        {
            if let Err(e) = self
                .hub
                .call_service(
                    "climate",
                    "set_hvac_mode",
                    json!({"entity_id": entity.entity_id, "hvac_mode": "cool"}),
                )
                .await
            {
                warn!(entity_id = %entity.entity_id, error = %e, "defrost entry failed");
                failed.push(entity.entity_id.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialEntityFailure { failed })
        }
    }

    async fn all_entities_off(&self) -> Result<()> {
        let mut failed = Vec::new();
        for entity in self.config.enabled_entities() {
            if let Err(e) = self
                .hub
                .call_service(
                    "climate",
                    "set_hvac_mode",
                    json!({"entity_id": entity.entity_id, "hvac_mode": "off"}),
                )
                .await
            {
                warn!(entity_id = %entity.entity_id, error = %e, "mode off failed");
                failed.push(entity.entity_id.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialEntityFailure { failed })
        }
    }
}
