use crate::model::{Command, Layout};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Client requests. Unrecognised `type` values land in `Unknown` so the
/// dispatcher can answer them in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Init,
    FetchCommands,
    SwitchContext { context: String },
    Run { context: String, uuid: String },
    Unknown(String),
}

impl Request {
    pub fn kind(&self) -> &str {
        match self {
            Request::Init => "init",
            Request::FetchCommands => "fetch_commands",
            Request::SwitchContext { .. } => "switch_context",
            Request::Run { .. } => "run",
            Request::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing or invalid type field")]
    MissingType,
    #[error("{request}: missing field {field}")]
    MissingField {
        request: &'static str,
        field: &'static str,
    },
    #[error("{request}: field {field} must be a string")]
    InvalidField {
        request: &'static str,
        field: &'static str,
    },
}

impl ProtocolError {
    pub fn to_response(&self) -> Response {
        match self {
            ProtocolError::InvalidJson(_) => Response::failure("Invalid JSON format"),
            ProtocolError::MissingType => Response::invalid("Missing or invalid 'type' field"),
            ProtocolError::MissingField {
                request: "switch_context",
                ..
            }
            | ProtocolError::InvalidField {
                request: "switch_context",
                ..
            } => Response::failure("Invalid context name"),
            ProtocolError::MissingField { field, .. } | ProtocolError::InvalidField { field, .. } => {
                Response::failure(format!("Missing required parameters: {field}"))
            }
        }
    }
}

pub fn decode_request(raw: &[u8]) -> Result<Request, ProtocolError> {
    if raw.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::InvalidJson(format!(
            "message exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }
    let value: Value =
        serde_json::from_slice(raw).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
    let Value::Object(object) = value else {
        return Err(ProtocolError::InvalidJson("expected an object".to_string()));
    };
    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind.as_str(),
        _ => return Err(ProtocolError::MissingType),
    };
    match kind {
        "init" => Ok(Request::Init),
        "fetch_commands" => Ok(Request::FetchCommands),
        "switch_context" => Ok(Request::SwitchContext {
            context: string_field(&object, "switch_context", "context")?,
        }),
        "run" => Ok(Request::Run {
            context: string_field(&object, "run", "context")?,
            uuid: string_field(&object, "run", "uuid")?,
        }),
        other => Ok(Request::Unknown(other.to_string())),
    }
}

fn string_field(
    object: &Map<String, Value>,
    request: &'static str,
    field: &'static str,
) -> Result<String, ProtocolError> {
    match object.get(field) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(ProtocolError::InvalidField { request, field }),
        None => Err(ProtocolError::MissingField { request, field }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Commands {
        #[serde(skip_serializing_if = "Option::is_none")]
        layout: Option<Layout>,
        commands: Vec<Command>,
    },
    Success {
        success: bool,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Success { success: true }
    }

    /// Error that also reports `"success": false`.
    pub fn failure(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
            success: Some(false),
        }
    }

    /// Bare validation error with only the `error` key.
    pub fn invalid(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
            success: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(text) => text,
            Err(_) => r#"{"error":"Internal server error","success":false}"#.to_string(),
        }
    }
}
