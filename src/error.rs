use std::fmt;

#[derive(Debug)]
pub enum Error {
    Config(String),
    Transport(tokio_tungstenite::tungstenite::Error),
    AuthInvalid(String),
    Disconnected,
    RequestTimeout,
    ServiceCall { message: String },
    PartialEntityFailure { failed: Vec<String> },
    SensorNotFound(String),
    SensorFormat { entity_id: String, state: String },
    TransitionRejected { state: &'static str, event: &'static str },
    Json(serde_json::Error),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::AuthInvalid(msg) => write!(f, "hub rejected access token: {msg}"),
            Error::Disconnected => write!(f, "disconnected from hub"),
            Error::RequestTimeout => write!(f, "hub request timed out"),
            Error::ServiceCall { message } => write!(f, "service call failed: {message}"),
            Error::PartialEntityFailure { failed } => write!(
                f,
                "service calls failed for entities: {}",
                failed.join(", ")
            ),
            Error::SensorNotFound(entity_id) => write!(f, "sensor not found: {entity_id}"),
            Error::SensorFormat { entity_id, state } => write!(
                f,
                "sensor {entity_id} state is not a temperature: {state:?}"
            ),
            Error::TransitionRejected { state, event } => {
                write!(f, "event {event} not allowed in state {state}")
            }
            Error::Json(e) => write!(f, "JSON error: {e}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
