use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Lifecycle of one connection.
///
/// ```text
/// connecting -> connected -> disconnected
///      |            |
///      +--> error <-+          (any live state) -> disconnected on close
/// ```
///
/// `disconnected` and `error` are terminal; retrying means a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Own,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: String,
    pub text: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

/// What travels over the data channel for one chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatFrame {
    pub fn new(text: &str) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            text: text.to_string(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn into_entry(self, direction: Direction) -> ChatEntry {
        ChatEntry {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            text: self.text,
            direction,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// Read-only view of a connection held by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub id: String,
    pub peer_id: String,
    pub peer_display_name: String,
    pub role: Role,
    pub state: ConnectionState,
    pub messages: Vec<ChatEntry>,
}

impl Connection {
    pub fn connection_id(local_id: &str, peer_id: &str, role: Role) -> String {
        match role {
            Role::Initiator => format!("{}-{}", local_id, peer_id),
            Role::Responder => format!("{}-{}", peer_id, local_id),
        }
    }
}
