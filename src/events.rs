/// Host lifecycle events, decoded from the bus envelope
/// `{"type": "...", "properties": {...}}`.
use serde::Deserialize;
use serde_json::Value;

pub const MESSAGE_UPDATED: &str = "message.updated";
pub const SESSION_IDLE: &str = "session.idle";

/// The events the hook reacts to. Everything else is `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    /// A message in the session was created or changed.
    MessageUpdated { session_id: String },
    /// The session finished processing and awaits input.
    SessionIdle { session_id: String },
    Other { kind: String },
}

impl HookEvent {
    pub fn kind(&self) -> &str {
        match self {
            HookEvent::MessageUpdated { .. } => MESSAGE_UPDATED,
            HookEvent::SessionIdle { .. } => SESSION_IDLE,
            HookEvent::Other { kind } => kind,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Value,
}

#[derive(Debug, Deserialize)]
struct MessageUpdatedProperties {
    info: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionIdleProperties {
    #[serde(rename = "sessionID")]
    session_id: String,
}

/// Errors decoding an event line.
#[derive(Debug)]
pub enum EventError {
    /// Not a JSON envelope with a `type` field.
    Envelope { source: serde_json::Error },
    /// A known event type whose properties lack the session id.
    Properties {
        kind: String,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventError::Envelope { source } => write!(f, "malformed event: {source}"),
            EventError::Properties { kind, source } => {
                write!(f, "malformed {kind} properties: {source}")
            }
        }
    }
}

impl std::error::Error for EventError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EventError::Envelope { source } => Some(source),
            EventError::Properties { source, .. } => Some(source),
        }
    }
}

/// Decode one JSON event line.
pub fn parse_event(line: &str) -> Result<HookEvent, EventError> {
    let envelope: Envelope =
        serde_json::from_str(line).map_err(|e| EventError::Envelope { source: e })?;
    let props_err = |e| EventError::Properties {
        kind: envelope.kind.clone(),
        source: e,
    };

    match envelope.kind.as_str() {
        MESSAGE_UPDATED => {
            let props: MessageUpdatedProperties =
                serde_json::from_value(envelope.properties.clone()).map_err(props_err)?;
            Ok(HookEvent::MessageUpdated {
                session_id: props.info.session_id,
            })
        }
        SESSION_IDLE => {
            let props: SessionIdleProperties =
                serde_json::from_value(envelope.properties.clone()).map_err(props_err)?;
            Ok(HookEvent::SessionIdle {
                session_id: props.session_id,
            })
        }
        _ => Ok(HookEvent::Other {
            kind: envelope.kind.clone(),
        }),
    }
}
