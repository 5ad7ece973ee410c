use serde::{Deserialize, Deserializer, Serialize};

use crate::send_state::PendingDelivery;

/// Author of a message: a personal account or a startup page.
///
/// Exactly one identity is ever set, which is why this is an enum rather than
/// a pair of optional ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Sender {
    /// Personal account id.
    Account(String),
    /// Startup id; members of the startup post on its behalf.
    Startup(String),
}

impl Sender {
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::Account(id) => Some(id),
            Self::Startup(_) => None,
        }
    }

    pub fn startup_id(&self) -> Option<&str> {
        match self {
            Self::Account(_) => None,
            Self::Startup(id) => Some(id),
        }
    }

    pub fn is_startup(&self) -> bool {
        matches!(self, Self::Startup(_))
    }

    /// Directory key: the account id, or `startup_{id}` for startups.
    pub fn directory_key(&self) -> String {
        match self {
            Self::Account(id) => id.clone(),
            Self::Startup(id) => format!("startup_{id}"),
        }
    }
}

/// Display type of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Text,
    /// Any uploaded file; images and videos are a rendering subtype.
    File,
}

/// Rendering subtype of a `MessageKind::File` message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Canonical message view model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server id, or a `temp-` prefixed id for optimistic entries.
    pub id: String,
    pub room_id: String,
    pub sender: Sender,
    /// Text body or file URL.
    pub content: String,
    /// Milliseconds since Unix epoch.
    pub sent_at_ms: u64,
    pub is_read: bool,
    pub kind: MessageKind,
    pub media: Option<MediaKind>,
    /// Present while the message is a local optimistic entry.
    pub delivery: Option<PendingDelivery>,
    pub sender_name: Option<String>,
    pub sender_avatar: Option<String>,
}

impl Message {
    pub fn is_temporary(&self) -> bool {
        self.delivery.is_some()
    }
}

/// Chat room row shown in the room list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRoom {
    pub id: String,
    pub counterpart_name: String,
    pub counterpart_avatar: Option<String>,
    /// Display-ready preview of the newest message.
    pub latest_message: Option<String>,
    pub latest_message_at_ms: Option<u64>,
}

/// Cached display metadata for a sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberEntry {
    pub key: Sender,
    pub display_name: String,
    pub avatar: Option<String>,
    pub is_startup: bool,
}

/// Timestamp as sent by the API: epoch millis or an ISO-8601 string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    Text(String),
}

/// Message payload as returned by the API.
///
/// The paginated fetch endpoint and the real-time push use different field
/// names for the same data; both spellings are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(
        default,
        alias = "messageId",
        alias = "chatMessageId",
        deserialize_with = "de_opt_id"
    )]
    pub id: Option<String>,
    #[serde(
        default,
        alias = "chatRoomId",
        alias = "roomID",
        deserialize_with = "de_opt_id"
    )]
    pub room_id: Option<String>,
    #[serde(
        default,
        alias = "senderId",
        alias = "accountId",
        deserialize_with = "de_opt_id"
    )]
    pub sender_account_id: Option<String>,
    #[serde(default, alias = "startupId", deserialize_with = "de_opt_id")]
    pub sender_startup_id: Option<String>,
    #[serde(default)]
    pub content: String,
    /// Declared type (`TEXT`, `FILE`, `IMAGE`, `VIDEO`).
    #[serde(default, alias = "type")]
    pub message_type: Option<String>,
    /// MIME type when the API knows it.
    #[serde(default, alias = "mimeType")]
    pub content_type: Option<String>,
    #[serde(default, alias = "createdAt", alias = "timestamp")]
    pub sent_at: Option<RawTimestamp>,
    #[serde(default, alias = "read")]
    pub is_read: bool,
    #[serde(default, alias = "fullName", alias = "startupName")]
    pub sender_name: Option<String>,
    #[serde(default, alias = "avatarUrl", alias = "logo")]
    pub sender_avatar: Option<String>,
}

/// One page of room history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default)]
    pub items: Vec<ServerMessage>,
    #[serde(default)]
    pub has_next_page: bool,
}

/// Room summary as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerChatRoom {
    #[serde(alias = "chatRoomId", deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, alias = "name", alias = "displayName")]
    pub counterpart_name: Option<String>,
    #[serde(default, alias = "avatar", alias = "avatarUrl")]
    pub counterpart_avatar: Option<String>,
    #[serde(default, alias = "latestMessage")]
    pub last_message: Option<String>,
    #[serde(default, alias = "lastMessageType")]
    pub last_message_type: Option<String>,
    #[serde(default, alias = "latestMessageAt", alias = "lastMessageTime")]
    pub last_message_at: Option<RawTimestamp>,
}

/// File attached to an outgoing message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Payload handed to the send endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub room_id: String,
    pub sender: Sender,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
}

/// Account profile returned by the profile lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountProfile {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default, alias = "avatarUrl")]
    pub avatar: Option<String>,
}

/// Startup profile returned by the startup lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartupProfile {
    #[serde(default)]
    pub startup_name: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
}

/// Opaque handle for a real-time subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Fetch the room list and subscribe to all rooms in it.
    LoadRooms,
    /// Open a room and fetch its newest page.
    SelectRoom { room_id: String },
    /// Fetch the next older page of the selected room.
    LoadOlder,
    /// Send a text message to the selected room.
    SendText { content: String },
    /// Upload and send a file to the selected room.
    SendAttachment { attachment: Attachment },
    /// Resend a failed optimistic message.
    RetrySend { temp_id: String },
    /// Drop a failed optimistic message.
    DiscardFailed { temp_id: String },
}

/// User-visible transient notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    /// Stable machine-readable code.
    pub code: String,
    pub message: String,
}

/// Immutable UI snapshot emitted after every state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatSnapshot {
    pub rooms: Vec<ChatRoom>,
    pub selected_room_id: Option<String>,
    /// Messages of the selected room, newest first.
    pub messages: Vec<Message>,
    pub loading: bool,
    pub has_older: bool,
}

/// Event channel output emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    Snapshot(ChatSnapshot),
    Notification(Notification),
    /// The open room received a message the view should scroll to.
    ScrollToBottom { room_id: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Text(value) => value,
            Self::Number(value) => value.to_string(),
        }
    }
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawId>::deserialize(deserializer)?;
    Ok(raw
        .map(RawId::into_string)
        .filter(|value| !value.trim().is_empty()))
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(RawId::into_string)
}
