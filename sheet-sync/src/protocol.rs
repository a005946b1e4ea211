use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// The first whitespace-delimited token of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    LookUp,
    UpdateValue,
    UpdateConfig,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::LookUp => "look-up",
            Verb::UpdateValue => "update-value",
            Verb::UpdateConfig => "update-config",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "look-up" => Ok(Verb::LookUp),
            "update-value" => Ok(Verb::UpdateValue),
            "update-config" => Ok(Verb::UpdateConfig),
            other => Err(DecodeError::UnknownVerb(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPos {
    pub row: i64,
    pub col: i64,
}

impl CellPos {
    pub fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }
}

/// Inclusive rectangular range request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookUpRequest {
    pub from: CellPos,
    pub to: CellPos,
}

impl LookUpRequest {
    /// Converts the inclusive request into half-open bounds: `from` is clamped
    /// at zero on both axes and `to` is moved one past the requested corner.
    pub fn bounds(&self) -> (CellPos, CellPos) {
        let from = CellPos::new(self.from.row.max(0), self.from.col.max(0));
        let to = CellPos::new(self.to.row.saturating_add(1), self.to.col.saturating_add(1));
        (from, to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateValueRequest {
    pub value: String,
    pub row: i64,
    pub col: i64,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    LookUp(LookUpRequest),
    UpdateValue(UpdateValueRequest),
    /// Accepted and logged; carries the raw payload text untouched.
    UpdateConfig(String),
    /// The frame could not be decoded. Forwarded so the coordinator answers in order.
    Malformed(DecodeError),
}

impl Request {
    pub fn verb(&self) -> Option<Verb> {
        match self {
            Request::LookUp(_) => Some(Verb::LookUp),
            Request::UpdateValue(_) => Some(Verb::UpdateValue),
            Request::UpdateConfig(_) => Some(Verb::UpdateConfig),
            Request::Malformed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown command")]
    UnknownVerb(String),
    #[error("invalid {verb} payload: {reason}")]
    Payload { verb: Verb, reason: String },
}

/// Splits a raw text frame into its verb and payload.
///
/// Newlines are collapsed to spaces and surrounding whitespace is trimmed, so
/// a payload pretty-printed over several lines is still one command.
pub fn split_frame(raw: &str) -> (String, String) {
    let flattened = raw.replace(['\r', '\n'], " ");
    let trimmed = flattened.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((verb, payload)) => (verb.to_string(), payload.trim().to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

/// Decodes one inbound frame.
///
/// Returns `None` for frames that need no answer: an empty `look-up` is
/// silently ignored, as is a frame with no text at all.
pub fn decode_frame(raw: &str) -> Option<Request> {
    let (verb, payload) = split_frame(raw);
    if verb.is_empty() {
        return None;
    }

    let verb = match verb.parse::<Verb>() {
        Ok(verb) => verb,
        Err(err) => return Some(Request::Malformed(err)),
    };

    let request = match verb {
        Verb::LookUp if payload.is_empty() => return None,
        Verb::LookUp => parse_payload(verb, &payload).map(Request::LookUp),
        Verb::UpdateValue => parse_payload(verb, &payload).map(Request::UpdateValue),
        Verb::UpdateConfig => Ok(Request::UpdateConfig(payload)),
    };

    Some(request.unwrap_or_else(Request::Malformed))
}

fn parse_payload<T>(verb: Verb, payload: &str) -> Result<T, DecodeError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_str(payload).map_err(|err| DecodeError::Payload {
        verb,
        reason: err.to_string(),
    })
}

/// Stable machine-readable error classes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Decode,
    UnknownVerb,
    Address,
    MissingTable,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
    pub code: ErrorCode,
}

impl From<&DecodeError> for ErrorReply {
    fn from(err: &DecodeError) -> Self {
        let code = match err {
            DecodeError::UnknownVerb(_) => ErrorCode::UnknownVerb,
            DecodeError::Payload { .. } => ErrorCode::Decode,
        };
        Self {
            error: err.to_string(),
            code,
        }
    }
}

impl From<&StoreError> for ErrorReply {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::Address { .. } => Self {
                error: err.to_string(),
                code: ErrorCode::Address,
            },
            StoreError::MissingTable(_) => Self {
                error: "table does not exist".to_string(),
                code: ErrorCode::MissingTable,
            },
            // Backend detail stays in the server log.
            StoreError::Storage(_) => Self {
                error: "storage unavailable".to_string(),
                code: ErrorCode::Storage,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookUpResponse {
    pub from: CellPos,
    pub to: CellPos,
    pub items: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub row: i64,
    pub col: i64,
    pub value: String,
}

/// Every JSON object the server sends on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    LookUp(LookUpResponse),
    Updated { updated: CellUpdate },
    Error(ErrorReply),
}

impl Reply {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses one reply; used by clients and tests.
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl From<ErrorReply> for Reply {
    fn from(reply: ErrorReply) -> Self {
        Reply::Error(reply)
    }
}
