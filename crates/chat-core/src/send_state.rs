use serde::{Deserialize, Serialize};

use crate::{error::ChatError, types::Message};

/// Delivery state of an optimistic message.
///
/// A confirmed message has no delivery state at all; the entry leaves this
/// machine by being replaced with its server counterpart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SendState {
    /// Request issued, nothing heard back yet.
    Pending,
    /// Send endpoint accepted the message; waiting for the real-time echo.
    Acknowledged { confirmed: Box<Message> },
    /// Send failed or timed out; the user may retry or discard.
    Failed { reason: String },
}

impl SendState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged { .. } => "acknowledged",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What a pending-send timeout resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Timer belonged to an earlier attempt, or the send already failed.
    Stale,
    /// No acknowledgement arrived in time; the entry is now failed.
    MarkedFailed,
    /// Acknowledged but never echoed; the caller should show the server copy.
    Promote(Box<Message>),
}

/// Per-message send lifecycle with attempt tracking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingDelivery {
    state: SendState,
    attempt: u32,
}

impl Default for PendingDelivery {
    fn default() -> Self {
        Self {
            state: SendState::Pending,
            attempt: 1,
        }
    }
}

impl PendingDelivery {
    pub fn state(&self) -> &SendState {
        &self.state
    }

    /// Attempt number, starting at 1 and bumped on every retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Server id learned from the send acknowledgement.
    pub fn server_id(&self) -> Option<&str> {
        match &self.state {
            SendState::Acknowledged { confirmed } => Some(confirmed.id.as_str()),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SendState::Failed { .. })
    }

    /// Record the server's copy of the message.
    ///
    /// A late acknowledgement may rescue an entry that already timed out.
    pub fn acknowledge(&mut self, confirmed: Message) -> Result<(), ChatError> {
        match self.state {
            SendState::Pending | SendState::Failed { .. } => {
                self.state = SendState::Acknowledged {
                    confirmed: Box::new(confirmed),
                };
                Ok(())
            }
            SendState::Acknowledged { .. } => {
                Err(ChatError::invalid_state(self.state.label(), "acknowledge"))
            }
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ChatError> {
        match self.state {
            SendState::Pending => {
                self.state = SendState::Failed {
                    reason: reason.into(),
                };
                Ok(())
            }
            _ => Err(ChatError::invalid_state(self.state.label(), "fail")),
        }
    }

    /// Resolve the timeout armed for `attempt`.
    pub fn expire(&mut self, attempt: u32) -> ExpiryOutcome {
        if attempt != self.attempt {
            return ExpiryOutcome::Stale;
        }
        match &self.state {
            SendState::Pending => {
                self.state = SendState::Failed {
                    reason: "timed out waiting for the server".to_owned(),
                };
                ExpiryOutcome::MarkedFailed
            }
            SendState::Acknowledged { confirmed } => ExpiryOutcome::Promote(confirmed.clone()),
            SendState::Failed { .. } => ExpiryOutcome::Stale,
        }
    }

    /// Move a failed entry back to pending for another attempt.
    pub fn retry(&mut self) -> Result<u32, ChatError> {
        if !self.is_failed() {
            return Err(ChatError::invalid_state(self.state.label(), "retry"));
        }
        self.state = SendState::Pending;
        self.attempt += 1;
        Ok(self.attempt)
    }
}
