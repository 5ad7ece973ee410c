//! Network collaborator seams consumed by the chat runtime, plus an
//! in-memory backend used by tests and the smoke binary.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use chat_core::{
    AccountProfile, ChatError, ChatErrorCategory, MessageKind, MessagePage, OutgoingMessage,
    RawTimestamp, Sender, ServerChatRoom, ServerMessage, StartupProfile, SubscriptionHandle,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const FILE_BASE_URL: &str = "https://files.venturechat.test";

/// REST surface for rooms and messages.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_rooms(&self, member: &Sender) -> Result<Vec<ServerChatRoom>, ChatError>;

    /// Fetch one page of history, newest first. Pages start at 1.
    async fn fetch_messages(
        &self,
        room_id: &str,
        page: u32,
        page_size: u16,
    ) -> Result<MessagePage, ChatError>;

    async fn send_message(&self, message: OutgoingMessage) -> Result<ServerMessage, ChatError>;
}

/// Profile lookups used to resolve sender display metadata.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn lookup_profile(&self, account_id: &str) -> Result<AccountProfile, ChatError>;

    async fn lookup_startup(&self, startup_id: &str) -> Result<StartupProfile, ChatError>;
}

/// Real-time push transport.
#[async_trait]
pub trait RealtimeSource: Send + Sync {
    /// Deliver every new message for `room_ids` into `sink` until unsubscribed.
    async fn subscribe(
        &self,
        room_ids: &[String],
        sink: mpsc::Sender<ServerMessage>,
    ) -> Result<SubscriptionHandle, ChatError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), ChatError>;
}

/// Collaborators handed to the runtime.
#[derive(Clone)]
pub struct ChatServices {
    pub api: Arc<dyn ChatApi>,
    pub profiles: Arc<dyn ProfileSource>,
    pub realtime: Arc<dyn RealtimeSource>,
}

impl ChatServices {
    /// Use one backend value for every collaborator.
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: ChatApi + ProfileSource + RealtimeSource + Clone + 'static,
    {
        Self {
            api: Arc::new(backend.clone()),
            profiles: Arc::new(backend.clone()),
            realtime: Arc::new(backend),
        }
    }
}

struct Subscription {
    room_ids: HashSet<String>,
    sink: mpsc::Sender<ServerMessage>,
}

#[derive(Default)]
struct BackendData {
    rooms: Vec<ServerChatRoom>,
    history: HashMap<String, Vec<ServerMessage>>,
    profiles: HashMap<String, AccountProfile>,
    startups: HashMap<String, StartupProfile>,
    subscriptions: HashMap<u64, Subscription>,
    next_message_id: u64,
    next_handle: u64,
    fetch_delays: HashMap<String, Duration>,
    lookup_delay: Option<Duration>,
    lookup_calls: HashMap<String, usize>,
    failing_lookups: HashSet<String>,
    send_failure: Option<ChatError>,
    echo_suppressed: bool,
}

impl BackendData {
    fn sender_name(&self, sender: &Sender) -> Option<String> {
        match sender {
            Sender::Account(id) => self.profiles.get(id).and_then(|profile| {
                profile.full_name.clone().or_else(|| {
                    let joined = [profile.first_name.as_deref(), profile.last_name.as_deref()]
                        .into_iter()
                        .flatten()
                        .collect::<Vec<_>>()
                        .join(" ");
                    (!joined.is_empty()).then_some(joined)
                })
            }),
            Sender::Startup(id) => self
                .startups
                .get(id)
                .and_then(|startup| startup.startup_name.clone()),
        }
    }

    fn store(&mut self, message: ServerMessage) -> Vec<mpsc::Sender<ServerMessage>> {
        let room_id = message.room_id.clone().unwrap_or_default();
        if let Some(room) = self.rooms.iter_mut().find(|room| room.id == room_id) {
            room.last_message = Some(message.content.clone());
            room.last_message_type = message.message_type.clone();
            room.last_message_at = message.sent_at.clone();
        }
        self.history
            .entry(room_id.clone())
            .or_default()
            .push(message);

        if self.echo_suppressed {
            return Vec::new();
        }
        self.subscriptions
            .values()
            .filter(|sub| sub.room_ids.contains(&room_id))
            .map(|sub| sub.sink.clone())
            .collect()
    }

    fn build_message(
        &mut self,
        room_id: &str,
        sender: &Sender,
        content: String,
        message_type: &str,
        content_type: Option<String>,
        sent_at_ms: u64,
    ) -> ServerMessage {
        self.next_message_id += 1;
        ServerMessage {
            id: Some(self.next_message_id.to_string()),
            room_id: Some(room_id.to_owned()),
            sender_account_id: sender.account_id().map(ToOwned::to_owned),
            sender_startup_id: sender.startup_id().map(ToOwned::to_owned),
            content,
            message_type: Some(message_type.to_owned()),
            content_type,
            sent_at: Some(RawTimestamp::Millis(sent_at_ms as i64)),
            is_read: false,
            sender_name: self.sender_name(sender),
            sender_avatar: None,
        }
    }
}

/// Thread-safe in-memory chat server.
///
/// Stores history per room, assigns sequential ids, paginates newest first
/// and echoes stored messages to matching subscribers. Delays and failures
/// can be injected to exercise slow or broken networks.
#[derive(Clone, Default)]
pub struct InMemoryChatBackend {
    data: Arc<Mutex<BackendData>>,
}

impl InMemoryChatBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_room(&self, room: ServerChatRoom) {
        self.data().rooms.push(room);
    }

    pub fn add_profile(&self, account_id: impl Into<String>, profile: AccountProfile) {
        self.data().profiles.insert(account_id.into(), profile);
    }

    pub fn add_startup(&self, startup_id: impl Into<String>, profile: StartupProfile) {
        self.data().startups.insert(startup_id.into(), profile);
    }

    /// Store a historical message without notifying subscribers.
    pub fn seed_message(
        &self,
        room_id: &str,
        sender: &Sender,
        content: impl Into<String>,
        sent_at_ms: u64,
    ) -> ServerMessage {
        let mut data = self.data();
        let message =
            data.build_message(room_id, sender, content.into(), "TEXT", None, sent_at_ms);
        data.history
            .entry(room_id.to_owned())
            .or_default()
            .push(message.clone());
        message
    }

    /// Store a message from another participant and push it to subscribers.
    pub async fn deliver(
        &self,
        room_id: &str,
        sender: &Sender,
        content: impl Into<String>,
    ) -> ServerMessage {
        let (message, sinks) = {
            let mut data = self.data();
            let message =
                data.build_message(room_id, sender, content.into(), "TEXT", None, now_millis());
            let sinks = data.store(message.clone());
            (message, sinks)
        };
        push_to(&sinks, &message).await;
        message
    }

    /// Push a raw payload to subscribers of its room without storing it.
    pub async fn push_raw(&self, message: ServerMessage) {
        let sinks: Vec<_> = {
            let data = self.data();
            let room_id = message.room_id.clone().unwrap_or_default();
            data.subscriptions
                .values()
                .filter(|sub| sub.room_ids.contains(&room_id))
                .map(|sub| sub.sink.clone())
                .collect()
        };
        push_to(&sinks, &message).await;
    }

    pub fn set_fetch_delay(&self, room_id: impl Into<String>, delay: Duration) {
        self.data().fetch_delays.insert(room_id.into(), delay);
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        self.data().lookup_delay = Some(delay);
    }

    /// Make the next `send_message` call fail with `error`.
    pub fn fail_next_send(&self, error: ChatError) {
        self.data().send_failure = Some(error);
    }

    /// Make profile/startup lookups for `id` fail.
    pub fn fail_lookups_for(&self, id: impl Into<String>) {
        self.data().failing_lookups.insert(id.into());
    }

    /// Stop pushing stored messages to subscribers (a lost echo).
    pub fn suppress_echo(&self, suppressed: bool) {
        self.data().echo_suppressed = suppressed;
    }

    pub fn lookup_calls(&self, id: &str) -> usize {
        self.data().lookup_calls.get(id).copied().unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.data().subscriptions.len()
    }

    /// Stored history of a room, oldest first.
    pub fn history(&self, room_id: &str) -> Vec<ServerMessage> {
        self.data().history.get(room_id).cloned().unwrap_or_default()
    }

    fn data(&self) -> MutexGuard<'_, BackendData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn begin_lookup(&self, id: &str) -> Result<(), ChatError> {
        let (delay, failing) = {
            let mut data = self.data();
            *data.lookup_calls.entry(id.to_owned()).or_default() += 1;
            (data.lookup_delay, data.failing_lookups.contains(id))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(ChatError::from_http_status(503, "profile service unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for InMemoryChatBackend {
    async fn fetch_rooms(&self, member: &Sender) -> Result<Vec<ServerChatRoom>, ChatError> {
        trace!(member = %member.directory_key(), "fetching rooms");
        Ok(self.data().rooms.clone())
    }

    async fn fetch_messages(
        &self,
        room_id: &str,
        page: u32,
        page_size: u16,
    ) -> Result<MessagePage, ChatError> {
        let delay = self.data().fetch_delays.get(room_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let data = self.data();
        if !data.rooms.iter().any(|room| room.id == room_id) {
            return Err(room_not_found(room_id));
        }
        let history = data.history.get(room_id).map(Vec::as_slice).unwrap_or(&[]);
        let page_size = usize::from(page_size.max(1));
        let skip = (page.max(1) as usize - 1) * page_size;
        let items: Vec<_> = history
            .iter()
            .rev()
            .skip(skip)
            .take(page_size)
            .cloned()
            .collect();
        let has_next_page = history.len() > skip + items.len();
        debug!(%room_id, page, returned = items.len(), has_next_page, "served message page");

        Ok(MessagePage {
            items,
            has_next_page,
        })
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<ServerMessage, ChatError> {
        let (stored, sinks) = {
            let mut data = self.data();
            if let Some(error) = data.send_failure.take() {
                return Err(error);
            }
            if !data.rooms.iter().any(|room| room.id == message.room_id) {
                return Err(room_not_found(&message.room_id));
            }

            let OutgoingMessage {
                room_id,
                sender,
                content,
                kind,
                attachment,
            } = message;
            let next_id = data.next_message_id + 1;
            let (content, message_type, content_type) = match (kind, attachment) {
                (_, Some(attachment)) => (
                    format!("{FILE_BASE_URL}/{next_id}/{}", attachment.file_name),
                    "FILE",
                    attachment.content_type,
                ),
                (MessageKind::File, None) => (content, "FILE", None),
                (MessageKind::Text, None) => (content, "TEXT", None),
            };
            let stored = data.build_message(
                &room_id,
                &sender,
                content,
                message_type,
                content_type,
                now_millis(),
            );
            let sinks = data.store(stored.clone());
            (stored, sinks)
        };

        push_to(&sinks, &stored).await;
        Ok(stored)
    }
}

#[async_trait]
impl ProfileSource for InMemoryChatBackend {
    async fn lookup_profile(&self, account_id: &str) -> Result<AccountProfile, ChatError> {
        self.begin_lookup(account_id).await?;
        self.data()
            .profiles
            .get(account_id)
            .cloned()
            .ok_or_else(|| not_found("profile_not_found", account_id))
    }

    async fn lookup_startup(&self, startup_id: &str) -> Result<StartupProfile, ChatError> {
        self.begin_lookup(startup_id).await?;
        self.data()
            .startups
            .get(startup_id)
            .cloned()
            .ok_or_else(|| not_found("startup_not_found", startup_id))
    }
}

#[async_trait]
impl RealtimeSource for InMemoryChatBackend {
    async fn subscribe(
        &self,
        room_ids: &[String],
        sink: mpsc::Sender<ServerMessage>,
    ) -> Result<SubscriptionHandle, ChatError> {
        let mut data = self.data();
        data.next_handle += 1;
        let handle = data.next_handle;
        data.subscriptions.insert(
            handle,
            Subscription {
                room_ids: room_ids.iter().cloned().collect(),
                sink,
            },
        );
        debug!(handle, room_count = room_ids.len(), "subscribed to rooms");
        Ok(SubscriptionHandle(handle))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), ChatError> {
        if self.data().subscriptions.remove(&handle.0).is_none() {
            return Err(not_found(
                "subscription_not_found",
                &handle.0.to_string(),
            ));
        }
        debug!(handle = handle.0, "unsubscribed");
        Ok(())
    }
}

async fn push_to(sinks: &[mpsc::Sender<ServerMessage>], message: &ServerMessage) {
    for sink in sinks {
        // A closed sink means the subscriber went away without unsubscribing.
        let _ = sink.send(message.clone()).await;
    }
}

fn room_not_found(room_id: &str) -> ChatError {
    not_found("room_not_found", room_id)
}

fn not_found(code: &str, id: &str) -> ChatError {
    ChatError::new(ChatErrorCategory::NotFound, code, format!("'{id}' does not exist"))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use chat_core::Attachment;

    use super::*;

    fn backend_with_room(room_id: &str) -> InMemoryChatBackend {
        let backend = InMemoryChatBackend::new();
        backend.add_room(ServerChatRoom {
            id: room_id.to_owned(),
            counterpart_name: Some("Acme Robotics".to_owned()),
            ..ServerChatRoom::default()
        });
        backend
    }

    fn alice() -> Sender {
        Sender::Account("alice".to_owned())
    }

    #[tokio::test]
    async fn paginates_newest_first() {
        let backend = backend_with_room("r1");
        for i in 0..5 {
            backend.seed_message("r1", &alice(), format!("m{i}"), 1_000 + i);
        }

        let first = backend.fetch_messages("r1", 1, 2).await.expect("page 1");
        let contents: Vec<_> = first.items.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3"]);
        assert!(first.has_next_page);

        let last = backend.fetch_messages("r1", 3, 2).await.expect("page 3");
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].content, "m0");
        assert!(!last.has_next_page);
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let backend = InMemoryChatBackend::new();
        let err = backend
            .fetch_messages("nope", 1, 10)
            .await
            .expect_err("room does not exist");
        assert_eq!(err.category, ChatErrorCategory::NotFound);
    }

    #[tokio::test]
    async fn send_echoes_only_to_room_subscribers() {
        let backend = backend_with_room("r1");
        backend.add_room(ServerChatRoom {
            id: "r2".to_owned(),
            ..ServerChatRoom::default()
        });
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        backend.subscribe(&["r1".to_owned()], tx1).await.expect("sub r1");
        backend.subscribe(&["r2".to_owned()], tx2).await.expect("sub r2");

        let stored = backend
            .send_message(OutgoingMessage {
                room_id: "r1".to_owned(),
                sender: alice(),
                content: "hi".to_owned(),
                kind: MessageKind::Text,
                attachment: None,
            })
            .await
            .expect("send");

        let echo = rx1.recv().await.expect("r1 subscriber gets echo");
        assert_eq!(echo, stored);
        assert!(rx2.try_recv().is_err());
        assert_eq!(backend.history("r1").len(), 1);
    }

    #[tokio::test]
    async fn attachments_are_stored_as_file_urls() {
        let backend = backend_with_room("r1");
        let stored = backend
            .send_message(OutgoingMessage {
                room_id: "r1".to_owned(),
                sender: Sender::Startup("s1".to_owned()),
                content: "deck.pdf".to_owned(),
                kind: MessageKind::File,
                attachment: Some(Attachment {
                    file_name: "deck.pdf".to_owned(),
                    content_type: Some("application/pdf".to_owned()),
                    data: vec![1, 2, 3],
                }),
            })
            .await
            .expect("send");

        assert!(stored.content.starts_with(FILE_BASE_URL));
        assert!(stored.content.ends_with("/deck.pdf"));
        assert_eq!(stored.message_type.as_deref(), Some("FILE"));
        assert_eq!(stored.sender_startup_id.as_deref(), Some("s1"));
        assert_eq!(stored.sender_account_id, None);
    }

    #[tokio::test]
    async fn injected_send_failure_is_returned_once() {
        let backend = backend_with_room("r1");
        backend.fail_next_send(ChatError::from_http_status(500, "boom"));
        let outgoing = OutgoingMessage {
            room_id: "r1".to_owned(),
            sender: alice(),
            content: "hi".to_owned(),
            kind: MessageKind::Text,
            attachment: None,
        };

        let err = backend
            .send_message(outgoing.clone())
            .await
            .expect_err("first send fails");
        assert_eq!(err.code, "http_500");
        backend.send_message(outgoing).await.expect("second send works");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let backend = backend_with_room("r1");
        let (tx, mut rx) = mpsc::channel(4);
        let handle = backend.subscribe(&["r1".to_owned()], tx).await.expect("sub");
        backend.unsubscribe(handle).await.expect("unsub");
        assert_eq!(backend.subscription_count(), 0);

        backend.deliver("r1", &alice(), "hello").await;
        assert!(rx.try_recv().is_err());

        let err = backend
            .unsubscribe(handle)
            .await
            .expect_err("double unsubscribe fails");
        assert_eq!(err.code, "subscription_not_found");
    }

    #[tokio::test]
    async fn lookups_count_calls_and_fail_on_demand() {
        let backend = InMemoryChatBackend::new();
        backend.add_profile(
            "alice",
            AccountProfile {
                first_name: Some("Alice".to_owned()),
                last_name: Some("Nguyen".to_owned()),
                ..AccountProfile::default()
            },
        );
        backend.fail_lookups_for("s9");

        let profile = backend.lookup_profile("alice").await.expect("profile");
        assert_eq!(profile.first_name.as_deref(), Some("Alice"));
        assert!(backend.lookup_startup("s9").await.is_err());
        assert_eq!(backend.lookup_calls("alice"), 1);
        assert_eq!(backend.lookup_calls("s9"), 1);
    }

    #[tokio::test]
    async fn echo_carries_known_sender_name() {
        let backend = backend_with_room("r1");
        backend.add_profile(
            "alice",
            AccountProfile {
                full_name: Some("Alice Nguyen".to_owned()),
                ..AccountProfile::default()
            },
        );
        let delivered = backend.deliver("r1", &alice(), "yo").await;
        assert_eq!(delivered.sender_name.as_deref(), Some("Alice Nguyen"));
    }
}
