use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    error::{ChatError, ChatErrorCategory},
    send_state::{ExpiryOutcome, PendingDelivery},
    types::{MediaKind, MemberEntry, Message, OutgoingMessage},
};

pub const TEMPORARY_ID_PREFIX: &str = "temp-";
pub const DEFAULT_RECONCILE_WINDOW_MS: u64 = 5_000;

/// Errors that can occur while updating optimistic entries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineError {
    /// No temporary message with this id is in the timeline.
    #[error("temporary message '{0}' was not found")]
    MissingTemporary(String),
    /// The entry's send state does not allow the operation.
    #[error(transparent)]
    Transition(#[from] ChatError),
}

/// How an incoming server message was merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// New message added at the head.
    Inserted,
    /// Replaced the temporary entry with this id.
    Reconciled { temp_id: String },
    /// A confirmed entry with the same id already exists.
    Duplicate,
    /// Message belongs to another room.
    ForeignRoom,
}

/// Result of recording a send acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Temporary entry now knows its server id.
    Acknowledged,
    /// The echo won the race; the temporary entry was dropped.
    AlreadyConfirmed,
}

/// Generate a synthetic id for an optimistic message.
pub fn new_temporary_id() -> String {
    format!("{TEMPORARY_ID_PREFIX}{}", Uuid::new_v4())
}

/// Build the optimistic entry shown while `outgoing` is in flight.
pub fn temporary_message(
    outgoing: &OutgoingMessage,
    media: Option<MediaKind>,
    now_ms: u64,
) -> Message {
    Message {
        id: new_temporary_id(),
        room_id: outgoing.room_id.clone(),
        sender: outgoing.sender.clone(),
        content: outgoing.content.clone(),
        sent_at_ms: now_ms,
        is_read: true,
        kind: outgoing.kind,
        media,
        delivery: Some(PendingDelivery::default()),
        sender_name: None,
        sender_avatar: None,
    }
}

/// Messages of one room, newest first, including optimistic entries.
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    room_id: String,
    items: Vec<Message>,
    reconcile_window_ms: u64,
}

impl MessageTimeline {
    pub fn new(room_id: impl Into<String>, reconcile_window_ms: u64) -> Self {
        Self {
            room_id: room_id.into(),
            items: Vec::new(),
            reconcile_window_ms: reconcile_window_ms.max(1),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Current items, newest first.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn temporaries(&self) -> impl Iterator<Item = &Message> {
        self.items.iter().filter(|item| item.is_temporary())
    }

    /// Show an optimistic entry at the head.
    pub fn push_temporary(&mut self, message: Message) {
        debug_assert!(message.is_temporary());
        trace!(room_id = %self.room_id, temp_id = %message.id, "pushing temporary message");
        self.items.insert(0, message);
    }

    /// Replace confirmed history with a freshly fetched newest page.
    ///
    /// Unreconciled temporary entries stay at the head unless the page
    /// already contains their server counterpart; the ids of temporaries
    /// the page settled are returned. Confirmed entries newer than the
    /// page's oldest message survive when the page lacks them, since they
    /// arrived in real time after the server built the page.
    pub fn replace_confirmed(&mut self, page: Vec<Message>) -> Vec<String> {
        let oldest_in_page = page.iter().map(|message| message.sent_at_ms).min();
        let (temporaries, previous): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(Message::is_temporary);
        self.items = temporaries;

        let mut settled = Vec::new();
        let mut confirmed: Vec<Message> = Vec::with_capacity(page.len());
        for message in page {
            if let Some(index) = self.matching_temporary(&message) {
                let temp = self.items.remove(index);
                trace!(temp_id = %temp.id, message_id = %message.id, "page contained temporary message");
                settled.push(temp.id);
            }
            if !confirmed.iter().any(|item| item.id == message.id) {
                confirmed.push(message);
            }
        }

        for message in previous {
            let newer = oldest_in_page.is_none_or(|oldest| message.sent_at_ms > oldest);
            if newer && !confirmed.iter().any(|item| item.id == message.id) {
                trace!(message_id = %message.id, "keeping message missing from page");
                confirmed.push(message);
            }
        }
        confirmed.sort_by(|a, b| b.sent_at_ms.cmp(&a.sent_at_ms));
        self.items.extend(confirmed);
        settled
    }

    /// Add an older page at the tail, skipping ids already present.
    pub fn append_older(&mut self, older: Vec<Message>) -> usize {
        let before = self.items.len();
        for message in older {
            if !self.contains_confirmed(&message.id) {
                self.items.push(message);
            }
        }
        self.items.len() - before
    }

    /// Merge a server message, reconciling it with an optimistic entry.
    ///
    /// Matching prefers the server id learned from the send acknowledgement.
    /// Otherwise a temporary entry matches when content and sender are equal
    /// and the timestamps differ by less than the reconcile window; the
    /// oldest such entry wins so each one pairs with at most one echo.
    pub fn apply_incoming(&mut self, mut incoming: Message) -> IncomingOutcome {
        if incoming.room_id != self.room_id {
            return IncomingOutcome::ForeignRoom;
        }
        if self.contains_confirmed(&incoming.id) {
            trace!(message_id = %incoming.id, "ignoring duplicate message");
            return IncomingOutcome::Duplicate;
        }

        match self.matching_temporary(&incoming) {
            Some(index) => {
                let temp = &self.items[index];
                if incoming.sender_name.is_none() {
                    incoming.sender_name = temp.sender_name.clone();
                }
                if incoming.sender_avatar.is_none() {
                    incoming.sender_avatar = temp.sender_avatar.clone();
                }
                let temp = std::mem::replace(&mut self.items[index], incoming);
                debug!(temp_id = %temp.id, room_id = %self.room_id, "reconciled temporary message");
                IncomingOutcome::Reconciled { temp_id: temp.id }
            }
            None => {
                self.items.insert(0, incoming);
                IncomingOutcome::Inserted
            }
        }
    }

    /// Record the send endpoint's response for a temporary entry.
    pub fn acknowledge(
        &mut self,
        temp_id: &str,
        confirmed: Message,
    ) -> Result<AckOutcome, TimelineError> {
        let index = self.temporary_index(temp_id)?;
        if self.contains_confirmed(&confirmed.id) {
            self.items.remove(index);
            return Ok(AckOutcome::AlreadyConfirmed);
        }
        self.delivery_mut(index)?.acknowledge(confirmed)?;
        Ok(AckOutcome::Acknowledged)
    }

    pub fn fail(&mut self, temp_id: &str, reason: impl Into<String>) -> Result<(), TimelineError> {
        let index = self.temporary_index(temp_id)?;
        self.delivery_mut(index)?.fail(reason)?;
        Ok(())
    }

    /// Resolve the send timeout armed for `attempt`.
    pub fn expire(&mut self, temp_id: &str, attempt: u32) -> Result<ExpiryOutcome, TimelineError> {
        let index = self.temporary_index(temp_id)?;
        let outcome = self.delivery_mut(index)?.expire(attempt);
        if let ExpiryOutcome::Promote(confirmed) = &outcome {
            if self.contains_confirmed(&confirmed.id) {
                self.items.remove(index);
            } else {
                let mut promoted = confirmed.as_ref().clone();
                let temp = &self.items[index];
                if promoted.sender_name.is_none() {
                    promoted.sender_name = temp.sender_name.clone();
                }
                self.items[index] = promoted;
            }
        }
        Ok(outcome)
    }

    /// Reset a failed entry for another attempt; returns the attempt number.
    pub fn retry(&mut self, temp_id: &str, now_ms: u64) -> Result<u32, TimelineError> {
        let index = self.temporary_index(temp_id)?;
        let attempt = self.delivery_mut(index)?.retry()?;
        self.items[index].sent_at_ms = now_ms;
        Ok(attempt)
    }

    /// Drop a failed entry.
    pub fn discard(&mut self, temp_id: &str) -> Result<Message, TimelineError> {
        let index = self.temporary_index(temp_id)?;
        let delivery = self.delivery_mut(index)?;
        if !delivery.is_failed() {
            return Err(ChatError::invalid_state(delivery.state().label(), "discard").into());
        }
        Ok(self.items.remove(index))
    }

    /// Fill in sender name/avatar on messages from `entry.key` that lack them.
    pub fn backfill_sender(&mut self, entry: &MemberEntry) -> usize {
        let mut updated = 0;
        for item in self.items.iter_mut().filter(|item| item.sender == entry.key) {
            let mut touched = false;
            if item.sender_name.is_none() {
                item.sender_name = Some(entry.display_name.clone());
                touched = true;
            }
            if item.sender_avatar.is_none() && entry.avatar.is_some() {
                item.sender_avatar = entry.avatar.clone();
                touched = true;
            }
            if touched {
                updated += 1;
            }
        }
        updated
    }

    fn contains_confirmed(&self, id: &str) -> bool {
        self.items
            .iter()
            .any(|item| !item.is_temporary() && item.id == id)
    }

    fn matching_temporary(&self, incoming: &Message) -> Option<usize> {
        let by_server_id = self.items.iter().position(|item| {
            item.delivery
                .as_ref()
                .and_then(PendingDelivery::server_id)
                == Some(incoming.id.as_str())
        });
        if by_server_id.is_some() {
            return by_server_id;
        }

        self.items
            .iter()
            .enumerate()
            .rev()
            .find(|(_, item)| {
                item.delivery
                    .as_ref()
                    .is_some_and(|delivery| delivery.server_id().is_none())
                    && item.content == incoming.content
                    && item.sender == incoming.sender
                    && item.sent_at_ms.abs_diff(incoming.sent_at_ms) < self.reconcile_window_ms
            })
            .map(|(index, _)| index)
    }

    fn temporary_index(&self, temp_id: &str) -> Result<usize, TimelineError> {
        self.items
            .iter()
            .position(|item| item.is_temporary() && item.id == temp_id)
            .ok_or_else(|| TimelineError::MissingTemporary(temp_id.to_owned()))
    }

    fn delivery_mut(&mut self, index: usize) -> Result<&mut PendingDelivery, TimelineError> {
        self.items[index].delivery.as_mut().ok_or_else(|| {
            ChatError::new(
                ChatErrorCategory::Internal,
                "not_temporary",
                "message has no pending delivery",
            )
            .into()
        })
    }
}
