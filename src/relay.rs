//! How a connection manager reaches the signaling mailbox.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mailbox::SignalMailbox;
use crate::protocol::{SignalMessage, SignalRequest};

#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Parks one message in the recipient's mailbox and returns its id.
    async fn send_signal(&self, request: SignalRequest) -> Result<String>;

    /// Drains everything waiting for `recipient`.
    async fn drain_signals(&self, recipient: &str) -> Result<Vec<SignalMessage>>;
}

/// In-process relay, used when the manager runs next to the mailbox it talks
/// to.
#[async_trait]
impl SignalRelay for Arc<SignalMailbox> {
    async fn send_signal(&self, request: SignalRequest) -> Result<String> {
        let message = request
            .into_message()
            .map_err(|rejection| Error::InvalidState(rejection.to_string()))?;
        let id = message.id.clone();
        let to = message.to.clone();
        self.append(&to, message);
        Ok(id)
    }

    async fn drain_signals(&self, recipient: &str) -> Result<Vec<SignalMessage>> {
        Ok(self.drain_all(recipient))
    }
}
