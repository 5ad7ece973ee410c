//! Chat state reducer owned by the runtime task.

use std::collections::HashMap;

use chat_core::{
    AckOutcome, Attachment, ChatError, ChatErrorCategory, ChatSnapshot, ExpiryOutcome,
    IncomingOutcome, MemberEntry, Message, MessageKind, MessagePage, MessageTimeline, Normalizer,
    OutgoingMessage, RoomList, Sender, ServerChatRoom, ServerMessage, TimelineError,
    temporary_message,
};
use tracing::{debug, trace, warn};

use crate::{config::ChatConfig, directory::MemberDirectory};

/// History fetch the runtime should issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub room_id: String,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u16,
    /// Room selection the request was issued for.
    pub generation: u64,
}

/// Send the runtime should issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub temp_id: String,
    pub attempt: u32,
    pub outgoing: OutgoingMessage,
}

/// Result of committing a fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Committed { added: usize },
    /// The room was deselected or reselected while the fetch was in flight.
    Stale,
    Failed(ChatError),
}

/// Result of applying a send response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Acknowledged,
    AlreadyConfirmed,
    Failed(ChatError),
    /// The entry was already reconciled or discarded.
    Ignored,
}

/// What a real-time message changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingReport {
    pub room_id: String,
    pub outcome: IncomingOutcome,
    /// Sender with no known display name; worth a directory lookup.
    pub unknown_sender: Option<Sender>,
    /// The open room gained a visible message.
    pub scroll: bool,
}

#[derive(Debug, Clone, Copy)]
struct PageCursor {
    next_page: u32,
    has_more: bool,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            next_page: 1,
            has_more: false,
        }
    }
}

/// Rooms, per-room timelines, selection and in-flight sends.
#[derive(Debug)]
pub struct ChatSession {
    identity: Sender,
    page_size: u16,
    reconcile_window_ms: u64,
    normalizer: Normalizer,
    rooms: RoomList,
    timelines: HashMap<String, MessageTimeline>,
    cursors: HashMap<String, PageCursor>,
    outgoing: HashMap<String, OutgoingMessage>,
    selected_room_id: Option<String>,
    selection_generation: u64,
    loading: bool,
}

impl ChatSession {
    pub fn new(identity: Sender, config: &ChatConfig, normalizer: Normalizer) -> Self {
        Self {
            identity,
            page_size: config.page_size.max(1),
            reconcile_window_ms: config.reconcile_window_ms,
            normalizer,
            rooms: RoomList::new(config.preview_labels.clone()),
            timelines: HashMap::new(),
            cursors: HashMap::new(),
            outgoing: HashMap::new(),
            selected_room_id: None,
            selection_generation: 0,
            loading: false,
        }
    }

    pub fn identity(&self) -> &Sender {
        &self.identity
    }

    pub fn selected_room_id(&self) -> Option<&str> {
        self.selected_room_id.as_deref()
    }

    /// Current immutable snapshot for rendering.
    pub fn snapshot(&self) -> ChatSnapshot {
        let selected = self.selected_room_id.as_deref();
        ChatSnapshot {
            rooms: self.rooms.rooms().to_vec(),
            selected_room_id: self.selected_room_id.clone(),
            messages: selected
                .and_then(|room_id| self.timelines.get(room_id))
                .map(|timeline| timeline.items().to_vec())
                .unwrap_or_default(),
            loading: self.loading,
            has_older: selected
                .and_then(|room_id| self.cursors.get(room_id))
                .is_some_and(|cursor| cursor.has_more),
        }
    }

    /// Replace the room list; returns the room ids to subscribe to.
    pub fn replace_rooms(&mut self, rooms: Vec<ServerChatRoom>) -> Vec<String> {
        let labels = self.rooms.labels().clone();
        let rooms = rooms
            .into_iter()
            .map(|room| self.normalizer.room(room, &labels))
            .collect();
        self.rooms.replace(rooms);

        if let Some(selected_room_id) = &self.selected_room_id
            && !self.rooms.contains(selected_room_id)
        {
            warn!(room_id = %selected_room_id, "selected room disappeared from room list");
            self.selected_room_id = None;
            self.selection_generation += 1;
            self.loading = false;
        }
        self.rooms.room_ids()
    }

    /// Open a room and request its newest page.
    pub fn select_room(&mut self, room_id: String) -> PageRequest {
        debug!(%room_id, "session selected room");
        self.selection_generation += 1;
        self.selected_room_id = Some(room_id.clone());
        self.timelines
            .entry(room_id.clone())
            .or_insert_with(|| MessageTimeline::new(room_id.clone(), self.reconcile_window_ms));
        self.cursors.insert(room_id.clone(), PageCursor::default());
        self.loading = true;

        PageRequest {
            room_id,
            page: 1,
            page_size: self.page_size,
            generation: self.selection_generation,
        }
    }

    /// Request the next older page of the open room, if there is one.
    pub fn load_older(&mut self) -> Option<PageRequest> {
        if self.loading {
            return None;
        }
        let room_id = self.selected_room_id.clone()?;
        let cursor = self.cursors.get(&room_id).copied().unwrap_or_default();
        if !cursor.has_more {
            return None;
        }
        self.loading = true;
        Some(PageRequest {
            room_id,
            page: cursor.next_page,
            page_size: self.page_size,
            generation: self.selection_generation,
        })
    }

    /// Commit a fetched page unless the selection changed since it was requested.
    pub fn commit_page(
        &mut self,
        request: &PageRequest,
        result: Result<MessagePage, ChatError>,
        now_ms: u64,
        directory: &MemberDirectory,
    ) -> PageOutcome {
        if !self.is_current(request) {
            debug!(
                room_id = %request.room_id,
                page = request.page,
                "discarding stale page result"
            );
            return PageOutcome::Stale;
        }
        self.loading = false;

        let page = match result {
            Ok(page) => page,
            Err(err) => return PageOutcome::Failed(err),
        };
        let mut messages = self.normalizer.messages(page.items, now_ms);
        directory.upsert_from_messages(&messages);
        for message in messages.iter_mut().filter(|m| m.sender_name.is_none()) {
            if let Some(entry) = directory.cached(&message.sender) {
                message.sender_name = Some(entry.display_name);
                message.sender_avatar = message.sender_avatar.take().or(entry.avatar);
            }
        }

        let timeline = self
            .timelines
            .entry(request.room_id.clone())
            .or_insert_with(|| {
                MessageTimeline::new(request.room_id.clone(), self.reconcile_window_ms)
            });
        let added = if request.page <= 1 {
            let count = messages.len();
            for temp_id in timeline.replace_confirmed(messages) {
                self.outgoing.remove(&temp_id);
            }
            count
        } else {
            timeline.append_older(messages)
        };
        self.cursors.insert(
            request.room_id.clone(),
            PageCursor {
                next_page: request.page + 1,
                has_more: page.has_next_page,
            },
        );
        trace!(room_id = %request.room_id, page = request.page, added, "committed page");
        PageOutcome::Committed { added }
    }

    /// Show an optimistic text message in the open room.
    pub fn begin_send_text(
        &mut self,
        content: String,
        now_ms: u64,
        directory: &MemberDirectory,
    ) -> Result<SendRequest, ChatError> {
        let content = content.trim().to_owned();
        if content.is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "empty_message",
                "cannot send an empty message",
            ));
        }
        self.begin_send(content, MessageKind::Text, None, now_ms, directory)
    }

    /// Show an optimistic file message in the open room.
    pub fn begin_send_attachment(
        &mut self,
        attachment: Attachment,
        now_ms: u64,
        directory: &MemberDirectory,
    ) -> Result<SendRequest, ChatError> {
        if attachment.file_name.trim().is_empty() || attachment.data.is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "empty_attachment",
                "attachment needs a file name and content",
            ));
        }
        let content = attachment.file_name.clone();
        self.begin_send(content, MessageKind::File, Some(attachment), now_ms, directory)
    }

    fn begin_send(
        &mut self,
        content: String,
        kind: MessageKind,
        attachment: Option<Attachment>,
        now_ms: u64,
        directory: &MemberDirectory,
    ) -> Result<SendRequest, ChatError> {
        let Some(room_id) = self.selected_room_id.clone() else {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "no_room_selected",
                "select a room before sending",
            ));
        };

        let declared = match kind {
            MessageKind::Text => "TEXT",
            MessageKind::File => "FILE",
        };
        let content_type = attachment
            .as_ref()
            .and_then(|attachment| attachment.content_type.clone());
        let (kind, media) =
            self.normalizer
                .infer_kind(Some(declared), &content, content_type.as_deref());
        let outgoing = OutgoingMessage {
            room_id: room_id.clone(),
            sender: self.identity.clone(),
            content,
            kind,
            attachment,
        };

        let mut temp = temporary_message(&outgoing, media, now_ms);
        if let Some(entry) = directory.cached(&self.identity) {
            temp.sender_name = Some(entry.display_name);
            temp.sender_avatar = entry.avatar;
        }
        let temp_id = temp.id.clone();
        self.rooms.apply_latest_message(&temp);
        self.timelines
            .entry(room_id.clone())
            .or_insert_with(|| MessageTimeline::new(room_id.clone(), self.reconcile_window_ms))
            .push_temporary(temp);
        self.outgoing.insert(temp_id.clone(), outgoing.clone());
        debug!(%room_id, %temp_id, "optimistic message queued");

        Ok(SendRequest {
            temp_id,
            attempt: 1,
            outgoing,
        })
    }

    /// Apply the send endpoint's response for a temporary entry.
    pub fn apply_send_result(
        &mut self,
        room_id: &str,
        temp_id: &str,
        result: Result<ServerMessage, ChatError>,
        now_ms: u64,
    ) -> SendOutcome {
        let Some(timeline) = self.timelines.get_mut(room_id) else {
            return SendOutcome::Ignored;
        };

        let outcome = match result {
            Ok(raw) => match self.normalizer.message(raw, now_ms) {
                Ok(confirmed) => timeline
                    .acknowledge(temp_id, confirmed)
                    .map(|outcome| match outcome {
                        AckOutcome::Acknowledged => SendOutcome::Acknowledged,
                        AckOutcome::AlreadyConfirmed => SendOutcome::AlreadyConfirmed,
                    }),
                Err(err) => {
                    warn!(%temp_id, error = %err, "send response could not be normalized");
                    Ok(SendOutcome::Ignored)
                }
            },
            Err(err) => timeline
                .fail(temp_id, err.message.clone())
                .map(|()| SendOutcome::Failed(err)),
        };

        match outcome {
            Ok(outcome) => {
                if outcome == SendOutcome::AlreadyConfirmed {
                    self.outgoing.remove(temp_id);
                }
                outcome
            }
            Err(err) => {
                debug!(%temp_id, error = %err, "send result for settled message ignored");
                SendOutcome::Ignored
            }
        }
    }

    /// Resolve a send timeout; `None` when the entry is gone.
    pub fn expire_send(&mut self, room_id: &str, temp_id: &str, attempt: u32) -> Option<ExpiryOutcome> {
        let timeline = self.timelines.get_mut(room_id)?;
        match timeline.expire(temp_id, attempt) {
            Ok(outcome) => {
                if matches!(outcome, ExpiryOutcome::Promote(_)) {
                    self.outgoing.remove(temp_id);
                }
                Some(outcome)
            }
            Err(err) => {
                trace!(%temp_id, error = %err, "send timeout for settled message ignored");
                None
            }
        }
    }

    /// Re-arm a failed message and return the request to reissue.
    pub fn retry_send(&mut self, temp_id: &str, now_ms: u64) -> Result<SendRequest, ChatError> {
        let outgoing = self
            .outgoing
            .get(temp_id)
            .cloned()
            .ok_or_else(|| unknown_temporary(temp_id))?;
        let timeline = self
            .timelines
            .get_mut(&outgoing.room_id)
            .ok_or_else(|| unknown_temporary(temp_id))?;
        let attempt = timeline
            .retry(temp_id, now_ms)
            .map_err(|err| timeline_error(temp_id, err))?;
        Ok(SendRequest {
            temp_id: temp_id.to_owned(),
            attempt,
            outgoing,
        })
    }

    /// Drop a failed message.
    pub fn discard_failed(&mut self, temp_id: &str) -> Result<(), ChatError> {
        let room_id = self
            .outgoing
            .get(temp_id)
            .map(|outgoing| outgoing.room_id.clone())
            .ok_or_else(|| unknown_temporary(temp_id))?;
        let timeline = self
            .timelines
            .get_mut(&room_id)
            .ok_or_else(|| unknown_temporary(temp_id))?;
        timeline
            .discard(temp_id)
            .map_err(|err| timeline_error(temp_id, err))?;
        self.outgoing.remove(temp_id);
        Ok(())
    }

    /// Merge a real-time message into room list and timeline.
    pub fn apply_incoming(
        &mut self,
        raw: ServerMessage,
        now_ms: u64,
        directory: &MemberDirectory,
    ) -> Option<IncomingReport> {
        let mut message = match self.normalizer.message(raw, now_ms) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping malformed real-time message");
                return None;
            }
        };

        directory.upsert_from_messages([&message]);
        let mut unknown_sender = None;
        if message.sender_name.is_none() {
            match directory.cached(&message.sender) {
                Some(entry) => {
                    message.sender_name = Some(entry.display_name);
                    message.sender_avatar = message.sender_avatar.take().or(entry.avatar);
                }
                None => unknown_sender = Some(message.sender.clone()),
            }
        }

        self.rooms.apply_latest_message(&message);
        let room_id = message.room_id.clone();
        let outcome = match self.timelines.get_mut(&room_id) {
            Some(timeline) => timeline.apply_incoming(message),
            None => IncomingOutcome::ForeignRoom,
        };
        if let IncomingOutcome::Reconciled { temp_id } = &outcome {
            self.outgoing.remove(temp_id);
        }

        let scroll = self.selected_room_id.as_deref() == Some(room_id.as_str())
            && matches!(
                outcome,
                IncomingOutcome::Inserted | IncomingOutcome::Reconciled { .. }
            );
        Some(IncomingReport {
            room_id,
            outcome,
            unknown_sender,
            scroll,
        })
    }

    /// Apply a resolved directory entry to every loaded timeline.
    pub fn apply_member(&mut self, entry: &MemberEntry) -> usize {
        self.timelines
            .values_mut()
            .map(|timeline| timeline.backfill_sender(entry))
            .sum()
    }

    /// Messages of a room, newest first.
    pub fn messages(&self, room_id: &str) -> &[Message] {
        self.timelines
            .get(room_id)
            .map(MessageTimeline::items)
            .unwrap_or(&[])
    }

    fn is_current(&self, request: &PageRequest) -> bool {
        self.selected_room_id.as_deref() == Some(request.room_id.as_str())
            && request.generation == self.selection_generation
    }
}

fn unknown_temporary(temp_id: &str) -> ChatError {
    ChatError::new(
        ChatErrorCategory::NotFound,
        "unknown_message",
        format!("no unsent message with id '{temp_id}'"),
    )
}

fn timeline_error(temp_id: &str, err: TimelineError) -> ChatError {
    match err {
        TimelineError::MissingTemporary(_) => unknown_temporary(temp_id),
        TimelineError::Transition(err) => err,
    }
}
