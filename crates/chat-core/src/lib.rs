//! Client-side chat core shared between the runtime and view consumers.
//!
//! This crate defines the command/event protocol, the message normalizer,
//! optimistic-send reconciliation, the room-list synchronizer and common
//! error/channel abstractions. Everything here is synchronous, in-memory
//! logic; network collaborators live behind the `chat-platform` traits.

/// Async command/event channel primitives.
pub mod channel;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Server payload to view-model mapping and media-type inference.
pub mod normalization;
/// Room list preview synchronization.
pub mod room_list;
/// Per-message optimistic send lifecycle.
pub mod send_state;
/// Message list with optimistic-entry reconciliation.
pub mod timeline;
/// View-facing protocol types (commands, events, payloads).
pub mod types;

pub use channel::{ChatChannelError, ChatChannels, ChatEvents, EventStream};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{
    MediaClassifier, NormalizeError, Normalizer, SuffixClassifier, timestamp_ms,
};
pub use room_list::{PreviewLabels, RoomList, preview_text};
pub use send_state::{ExpiryOutcome, PendingDelivery, SendState};
pub use timeline::{
    AckOutcome, DEFAULT_RECONCILE_WINDOW_MS, IncomingOutcome, MessageTimeline, TimelineError,
    temporary_message,
};
pub use types::{
    AccountProfile, Attachment, ChatCommand, ChatEvent, ChatRoom, ChatSnapshot, MediaKind,
    MemberEntry, Message, MessageKind, MessagePage, Notification, OutgoingMessage, RawTimestamp,
    Sender, ServerChatRoom, ServerMessage, StartupProfile, SubscriptionHandle,
};
