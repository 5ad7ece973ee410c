use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use thiserror::Error;
use tracing::warn;

use crate::{
    room_list::{PreviewLabels, preview_text},
    types::{
        ChatRoom, MediaKind, Message, MessageKind, RawTimestamp, Sender, ServerChatRoom,
        ServerMessage,
    },
};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi", "mkv"];

/// Decides whether message content should render as an image or a video.
pub trait MediaClassifier: Send + Sync {
    fn classify(&self, content: &str, content_type: Option<&str>) -> Option<MediaKind>;
}

/// MIME-first classifier that falls back to file-extension matching.
///
/// The extension check only looks at the end of the content (ignoring URL
/// query strings and fragments), so media URLs without a recognizable suffix
/// stay text.
#[derive(Debug, Clone)]
pub struct SuffixClassifier {
    image_extensions: Vec<String>,
    video_extensions: Vec<String>,
}

impl Default for SuffixClassifier {
    fn default() -> Self {
        Self::with_extensions(IMAGE_EXTENSIONS, VIDEO_EXTENSIONS)
    }
}

impl SuffixClassifier {
    pub fn with_extensions(image: &[&str], video: &[&str]) -> Self {
        let normalize = |exts: &[&str]| {
            exts.iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        };
        Self {
            image_extensions: normalize(image),
            video_extensions: normalize(video),
        }
    }

    fn suffix_matches(extensions: &[String], path: &str) -> bool {
        extensions.iter().any(|ext| {
            path.len() > ext.len()
                && path.ends_with(ext.as_str())
                && path.as_bytes()[path.len() - ext.len() - 1] == b'.'
        })
    }
}

impl MediaClassifier for SuffixClassifier {
    fn classify(&self, content: &str, content_type: Option<&str>) -> Option<MediaKind> {
        if let Some(mime) = content_type
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            let mime = mime.to_ascii_lowercase();
            return if mime.starts_with("image/") {
                Some(MediaKind::Image)
            } else if mime.starts_with("video/") {
                Some(MediaKind::Video)
            } else {
                None
            };
        }

        let lowered = content.trim().to_ascii_lowercase();
        let path = strip_url_tail(&lowered);
        if Self::suffix_matches(&self.image_extensions, path) {
            Some(MediaKind::Image)
        } else if Self::suffix_matches(&self.video_extensions, path) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

/// Reasons a server payload cannot become a view-model message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("message has no id")]
    MissingId,
    #[error("message '{0}' has no room id")]
    MissingRoom(String),
    #[error("message '{0}' has neither an account nor a startup sender")]
    MissingSender(String),
}

/// Maps server payloads into canonical view models.
#[derive(Clone)]
pub struct Normalizer {
    classifier: Arc<dyn MediaClassifier>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Arc::new(SuffixClassifier::default()))
    }
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer").finish_non_exhaustive()
    }
}

impl Normalizer {
    pub fn new(classifier: Arc<dyn MediaClassifier>) -> Self {
        Self { classifier }
    }

    /// Normalize one message. `received_at_ms` stands in for a missing or
    /// unparseable server timestamp.
    pub fn message(&self, raw: ServerMessage, received_at_ms: u64) -> Result<Message, NormalizeError> {
        let id = raw.id.ok_or(NormalizeError::MissingId)?;
        let room_id = raw
            .room_id
            .ok_or_else(|| NormalizeError::MissingRoom(id.clone()))?;
        let sender = match (raw.sender_startup_id, raw.sender_account_id) {
            (Some(startup_id), _) => Sender::Startup(startup_id),
            (None, Some(account_id)) => Sender::Account(account_id),
            (None, None) => return Err(NormalizeError::MissingSender(id)),
        };
        let (kind, media) = self.infer_kind(
            raw.message_type.as_deref(),
            &raw.content,
            raw.content_type.as_deref(),
        );
        let sent_at_ms = raw
            .sent_at
            .as_ref()
            .and_then(timestamp_ms)
            .unwrap_or(received_at_ms);

        Ok(Message {
            id,
            room_id,
            sender,
            content: raw.content,
            sent_at_ms,
            is_read: raw.is_read,
            kind,
            media,
            delivery: None,
            sender_name: non_blank(raw.sender_name),
            sender_avatar: non_blank(raw.sender_avatar),
        })
    }

    /// Normalize a batch, dropping (and logging) payloads that cannot be shaped.
    pub fn messages(&self, raw: Vec<ServerMessage>, received_at_ms: u64) -> Vec<Message> {
        raw.into_iter()
            .filter_map(|item| match self.message(item, received_at_ms) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(error = %err, "dropping malformed server message");
                    None
                }
            })
            .collect()
    }

    pub fn room(&self, raw: ServerChatRoom, labels: &PreviewLabels) -> ChatRoom {
        let latest_message = raw.last_message.as_deref().map(|content| {
            let (kind, media) = self.infer_kind(raw.last_message_type.as_deref(), content, None);
            preview_text(kind, media, content, labels)
        });
        let counterpart_name = raw
            .counterpart_name
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| raw.id.clone());

        ChatRoom {
            id: raw.id,
            counterpart_name,
            counterpart_avatar: non_blank(raw.counterpart_avatar),
            latest_message,
            latest_message_at_ms: raw.last_message_at.as_ref().and_then(timestamp_ms),
        }
    }

    /// Resolve display type from the declared type and the content.
    ///
    /// Content classified as media always becomes `File`; otherwise the
    /// declared type decides, defaulting to `Text`.
    pub fn infer_kind(
        &self,
        declared: Option<&str>,
        content: &str,
        content_type: Option<&str>,
    ) -> (MessageKind, Option<MediaKind>) {
        if let Some(media) = self.classifier.classify(content, content_type) {
            return (MessageKind::File, Some(media));
        }

        match declared
            .map(|value| value.trim().to_ascii_uppercase())
            .as_deref()
        {
            Some("IMAGE") => (MessageKind::File, Some(MediaKind::Image)),
            Some("VIDEO") => (MessageKind::File, Some(MediaKind::Video)),
            Some("FILE") => (MessageKind::File, None),
            _ => (MessageKind::Text, None),
        }
    }
}

/// Convert an API timestamp to epoch millis.
///
/// Zone-less ISO strings are read as UTC.
pub fn timestamp_ms(raw: &RawTimestamp) -> Option<u64> {
    let millis = match raw {
        RawTimestamp::Millis(value) => *value,
        RawTimestamp::Text(text) => {
            let text = text.trim();
            if let Ok(value) = text.parse::<i64>() {
                value
            } else if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                parsed.timestamp_millis()
            } else {
                ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                    .iter()
                    .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())?
                    .and_utc()
                    .timestamp_millis()
            }
        }
    };
    u64::try_from(millis).ok()
}

fn strip_url_tail(content: &str) -> &str {
    if !content.contains("://") {
        return content;
    }
    content
        .split(['?', '#'])
        .next()
        .unwrap_or(content)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
