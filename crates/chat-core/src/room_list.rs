use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ChatRoom, MediaKind, Message, MessageKind};

/// Localizable placeholder labels used instead of raw file URLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewLabels {
    pub image: String,
    pub video: String,
    pub attachment: String,
}

impl Default for PreviewLabels {
    fn default() -> Self {
        Self {
            image: "📷 Image".to_owned(),
            video: "🎬 Video".to_owned(),
            attachment: "📎 Attachment".to_owned(),
        }
    }
}

/// Room-list preview text for a message.
pub fn preview_text(
    kind: MessageKind,
    media: Option<MediaKind>,
    content: &str,
    labels: &PreviewLabels,
) -> String {
    match (kind, media) {
        (_, Some(MediaKind::Image)) => labels.image.clone(),
        (_, Some(MediaKind::Video)) => labels.video.clone(),
        (MessageKind::File, None) => labels.attachment.clone(),
        (MessageKind::Text, None) => content.to_owned(),
    }
}

/// Room list kept live with the newest message of every room.
#[derive(Debug, Clone, Default)]
pub struct RoomList {
    rooms: Vec<ChatRoom>,
    labels: PreviewLabels,
}

impl RoomList {
    pub fn new(labels: PreviewLabels) -> Self {
        Self {
            rooms: Vec::new(),
            labels,
        }
    }

    pub fn rooms(&self) -> &[ChatRoom] {
        &self.rooms
    }

    pub fn labels(&self) -> &PreviewLabels {
        &self.labels
    }

    pub fn get(&self, room_id: &str) -> Option<&ChatRoom> {
        self.rooms.iter().find(|room| room.id == room_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.get(room_id).is_some()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|room| room.id.clone()).collect()
    }

    /// Replace the list while preserving API ordering.
    pub fn replace(&mut self, rooms: Vec<ChatRoom>) {
        self.rooms = rooms;
        debug!(room_count = self.rooms.len(), "room list replaced");
    }

    /// Overwrite the preview of the message's room.
    ///
    /// Applies to every processed message, whether or not its room is open.
    /// Returns `false` when the room is not in the list.
    pub fn apply_latest_message(&mut self, message: &Message) -> bool {
        let Some(room) = self
            .rooms
            .iter_mut()
            .find(|room| room.id == message.room_id)
        else {
            debug!(room_id = %message.room_id, "latest message for unknown room ignored");
            return false;
        };

        room.latest_message = Some(preview_text(
            message.kind,
            message.media,
            &message.content,
            &self.labels,
        ));
        room.latest_message_at_ms = Some(message.sent_at_ms);
        true
    }
}
