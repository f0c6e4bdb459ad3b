use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::peer::PeerRecord;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "candidate" => Ok(SignalKind::Candidate),
            other => Err(other.to_string()),
        }
    }
}

/// One handshake message parked in a recipient's mailbox.
///
/// On the wire the fields are `type`, `data` and `timestamp`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(rename = "data", default)]
    pub payload: serde_json::Value,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl SignalMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Body of `POST /signal`. Every field is optional here so that a missing one
/// becomes a 400 with a useful message instead of a generic decode failure.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SignalRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRejection {
    MissingFields,
    UnknownKind(String),
}

impl fmt::Display for SignalRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalRejection::MissingFields => f.write_str("Missing required fields: from, to, type"),
            SignalRejection::UnknownKind(kind) => write!(f, "Unknown signal type: {}", kind),
        }
    }
}

impl SignalRequest {
    pub fn new(from: &str, to: &str, kind: SignalKind, data: serde_json::Value) -> Self {
        Self {
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            kind: Some(kind.as_str().to_string()),
            data,
        }
    }

    /// Turns the request into a mailbox message, or says why it can't.
    pub fn into_message(self) -> Result<SignalMessage, SignalRejection> {
        let present = |field: Option<String>| field.filter(|value| !value.is_empty());
        let (Some(from), Some(to), Some(kind)) =
            (present(self.from), present(self.to), present(self.kind))
        else {
            return Err(SignalRejection::MissingFields);
        };
        let kind = kind.parse::<SignalKind>().map_err(SignalRejection::UnknownKind)?;
        Ok(SignalMessage::new(from, to, kind, self.data))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SignalAck {
    pub success: bool,
    pub message_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DrainResponse {
    pub messages: Vec<SignalMessage>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub error: String,
}

/// The device this process announces.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocalDevice {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
    pub is_local: bool,
}

impl From<&PeerRecord> for PeerSummary {
    fn from(record: &PeerRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.display_name.clone(),
            ip: record.address.clone(),
            port: record.port,
            last_seen: record.last_seen_at,
            is_local: record.is_local(),
        }
    }
}

/// Response of `GET /peers`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerListing {
    pub local_device: LocalDevice,
    pub peers: Vec<PeerSummary>,
    pub count: usize,
}

/// Response of `GET /status` and `GET /test`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: String,
    pub local_device: LocalDevice,
    pub peers_count: usize,
    /// Seconds since the surface started.
    pub uptime: f64,
}
