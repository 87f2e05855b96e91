use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::config::HubOptions;
use crate::protocol::{self, EntityState, ServerMessage, StateChanged};
use crate::{Error, Result};

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub(crate) enum RequestPayload {
    GetStates,
    CallService {
        domain: String,
        service: String,
        data: Value,
    },
}

pub(crate) enum Command {
    Request {
        payload: RequestPayload,
        reply: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::Receiver<StateChanged>>,
    },
    IsConnected {
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the session task. All shared state (request ids,
/// pending waiters, subscriber list) lives in the task; the handle only
/// sends typed commands.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
}

impl HubHandle {
    async fn request(&self, payload: RequestPayload) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Request { payload, reply })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    pub async fn get_states(&self) -> Result<Vec<EntityState>> {
        let payload = self.request(RequestPayload::GetStates).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Snapshot one entity. A missing entity is `Ok(None)`, not an error.
    pub async fn get_entity_state(&self, entity_id: &str) -> Result<Option<EntityState>> {
        let states = self.get_states().await?;
        Ok(states.into_iter().find(|s| s.entity_id == entity_id))
    }

    pub async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<Value> {
        self.request(RequestPayload::CallService {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        })
        .await
    }

    /// Register a state_changed listener. Events arrive on a buffered
    /// channel the caller drains; a slow listener loses events rather
    /// than blocking the receive loop.
    pub async fn subscribe_state_changed(&self) -> Result<mpsc::Receiver<StateChanged>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe { reply })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    pub async fn is_connected(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::IsConnected { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn stub(buffer: usize) -> (HubHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(buffer);
        (HubHandle { tx }, rx)
    }
}

#[derive(Debug)]
pub struct HubClient {
    handle: HubHandle,
    task: JoinHandle<Result<()>>,
}

impl HubClient {
    /// Dial the hub and run the auth handshake. `auth_invalid` is fatal
    /// and surfaces here; transport problems after this point are handled
    /// by the session's bounded reconnect.
    pub async fn connect(options: &HubOptions) -> Result<HubClient> {
        let ws = dial_and_authenticate(options).await?;
        info!(url = %options.ws_url, "connected to hub");

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let session = Session::new(options.clone(), ws, rx);
        let task = tokio::spawn(session.run());
        Ok(HubClient {
            handle: HubHandle { tx },
            task,
        })
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Wait for the session to end. An error here means reconnect
    /// exhaustion or another fatal session failure.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected),
        }
    }

    pub(crate) fn into_task(self) -> JoinHandle<Result<()>> {
        self.task
    }
}

async fn dial_and_authenticate(options: &HubOptions) -> Result<WsStream> {
    debug!(url = %options.ws_url, "dialing hub");
    let (mut ws, _) = connect_async(options.ws_url.as_str()).await?;

    loop {
        match next_server_message(&mut ws).await? {
            ServerMessage::AuthRequired => {
                let msg = protocol::auth_message(&options.access_token);
                ws.send(Message::Text(msg.to_string())).await?;
            }
            ServerMessage::AuthOk => return Ok(ws),
            ServerMessage::AuthInvalid { message } => {
                let _ = ws.close(None).await;
                return Err(Error::AuthInvalid(message));
            }
            other => trace!(message = ?other, "ignoring message during auth"),
        }
    }
}

async fn next_server_message(ws: &mut WsStream) -> Result<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(REQUEST_TIMEOUT, ws.next())
            .await
            .map_err(|_| Error::RequestTimeout)?;
        match frame {
            Some(Ok(Message::Text(text))) => return protocol::parse_server_message(&text),
            Some(Ok(Message::Close(_))) | None => return Err(Error::Disconnected),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

struct Waiter {
    reply: oneshot::Sender<Result<Value>>,
    deadline: Instant,
}

struct Session {
    options: HubOptions,
    ws: WsStream,
    commands: mpsc::Receiver<Command>,
    next_id: u64,
    pending: HashMap<u64, Waiter>,
    subscribe_id: Option<u64>,
    subscribers: Vec<mpsc::Sender<StateChanged>>,
    connected: bool,
}

impl Session {
    fn new(options: HubOptions, ws: WsStream, commands: mpsc::Receiver<Command>) -> Session {
        Session {
            options,
            ws,
            commands,
            next_id: 1,
            pending: HashMap::new(),
            subscribe_id: None,
            subscribers: Vec::new(),
            connected: true,
        }
    }

    async fn run(mut self) -> Result<()> {
        if let Err(e) = self.send_subscribe().await {
            warn!(error = %e, "initial event subscription failed");
            self.reconnect().await?;
        }

        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        // All handles dropped; close cleanly.
                        let _ = self.ws.close(None).await;
                        return Ok(());
                    }
                    Some(Command::Disconnect { reply }) => {
                        self.fail_pending();
                        let _ = self.ws.close(None).await;
                        self.connected = false;
                        let _ = reply.send(());
                        return Ok(());
                    }
                    Some(command) => {
                        if let Err(e) = self.handle_command(command).await {
                            warn!(error = %e, "send failed, reconnecting");
                            self.reconnect().await?;
                        }
                    }
                },
                frame = self.ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_incoming(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("hub closed the connection");
                        self.reconnect().await?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error, reconnecting");
                        self.reconnect().await?;
                    }
                },
                _ = sweep.tick() => self.reap_expired(),
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Request { payload, reply } => {
                let id = self.take_id();
                let message = match &payload {
                    RequestPayload::GetStates => protocol::get_states_message(id),
                    RequestPayload::CallService {
                        domain,
                        service,
                        data,
                    } => protocol::call_service_message(id, domain, service, data.clone()),
                };
                self.pending.insert(
                    id,
                    Waiter {
                        reply,
                        deadline: Instant::now() + REQUEST_TIMEOUT,
                    },
                );
                trace!(id, payload = ?payload, "sending request");
                self.ws.send(Message::Text(message.to_string())).await?;
            }
            Command::Subscribe { reply } => {
                let (tx, rx) = mpsc::channel(EVENT_BUFFER);
                self.subscribers.push(tx);
                let _ = reply.send(rx);
            }
            Command::IsConnected { reply } => {
                let _ = reply.send(self.connected);
            }
            Command::Disconnect { .. } => unreachable!("handled in run loop"),
        }
        Ok(())
    }

    fn handle_incoming(&mut self, text: &str) {
        let message = match protocol::parse_server_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable message from hub");
                return;
            }
        };

        match message {
            ServerMessage::Result {
                id,
                success,
                payload,
            } => {
                if self.subscribe_id == Some(id) {
                    if !success {
                        warn!(payload = %payload, "event subscription rejected");
                    }
                    return;
                }
                match self.pending.remove(&id) {
                    Some(waiter) => {
                        let outcome = if success {
                            Ok(payload)
                        } else {
                            Err(Error::ServiceCall {
                                message: payload
                                    .get("message")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("request failed")
                                    .to_string(),
                            })
                        };
                        let _ = waiter.reply.send(outcome);
                    }
                    None => debug!(id, "result for unknown id, dropping"),
                }
            }
            ServerMessage::Event { event } => {
                if let Some(change) = protocol::parse_state_changed(&event) {
                    self.dispatch_event(change);
                }
            }
            ServerMessage::Unknown { msg_type } => {
                trace!(msg_type, "ignoring unrecognized message type");
            }
            other => trace!(message = ?other, "ignoring auth-phase message"),
        }
    }

    fn dispatch_event(&mut self, change: StateChanged) {
        self.subscribers.retain(|subscriber| {
            match subscriber.try_send(change.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(entity_id = %change.entity_id, "subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn send_subscribe(&mut self) -> Result<()> {
        let id = self.take_id();
        self.subscribe_id = Some(id);
        let message = protocol::subscribe_events_message(id);
        self.ws.send(Message::Text(message.to_string())).await?;
        Ok(())
    }

    fn fail_pending(&mut self) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.reply.send(Err(Error::Disconnected));
        }
    }

    fn reap_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, waiter)| waiter.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(waiter) = self.pending.remove(&id) {
                debug!(id, "request timed out");
                let _ = waiter.reply.send(Err(Error::RequestTimeout));
            }
        }
    }

    /// Tear down the failed session and dial a fresh one. Request ids
    /// restart at 1, pending waiters fail with Disconnected, subscriber
    /// channels survive. Retry exhaustion ends the session task.
    async fn reconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.fail_pending();
        self.next_id = 1;
        self.subscribe_id = None;

        let delay = Duration::from_millis(self.options.retry_delay_ms);
        let mut last_error = Error::Disconnected;

        for attempt in 1..=self.options.max_retries {
            tokio::time::sleep(delay).await;
            info!(attempt, max = self.options.max_retries, "reconnecting to hub");
            match dial_and_authenticate(&self.options).await {
                Ok(ws) => {
                    self.ws = ws;
                    self.connected = true;
                    self.send_subscribe().await?;
                    info!("reconnected to hub");
                    return Ok(());
                }
                Err(e @ Error::AuthInvalid(_)) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
