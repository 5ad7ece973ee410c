use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_core::{
    AccountProfile, Attachment, ChatCommand, ChatError, ChatEvent, ChatSnapshot, EventStream,
    MediaKind, MessagePage, Notification, OutgoingMessage, RawTimestamp, SendState, Sender,
    ServerChatRoom, ServerMessage,
};
use chat_platform::{ChatApi, ChatServices, InMemoryChatBackend};
use chat_runtime::{ChatConfig, ChatRuntimeHandle, spawn_runtime};
use tokio::{sync::broadcast::error::TryRecvError, time::timeout};

const WAIT: Duration = Duration::from_secs(3);

fn me() -> Sender {
    Sender::Account("me".to_owned())
}

fn bob() -> Sender {
    Sender::Account("bob".to_owned())
}

fn backend_with_rooms(room_ids: &[&str]) -> InMemoryChatBackend {
    let backend = InMemoryChatBackend::new();
    for room_id in room_ids {
        backend.add_room(ServerChatRoom {
            id: (*room_id).to_owned(),
            counterpart_name: Some(format!("Founders {room_id}")),
            ..ServerChatRoom::default()
        });
    }
    backend.add_profile(
        "me",
        AccountProfile {
            full_name: Some("Minh Vo".to_owned()),
            ..AccountProfile::default()
        },
    );
    backend
}

struct Harness {
    handle: ChatRuntimeHandle,
    events: EventStream,
}

impl Harness {
    async fn start(config: ChatConfig, backend: &InMemoryChatBackend) -> Self {
        Self::start_with(config, ChatServices::from_backend(backend.clone()), backend).await
    }

    async fn start_with(
        config: ChatConfig,
        services: ChatServices,
        backend: &InMemoryChatBackend,
    ) -> Self {
        let handle = spawn_runtime(config, services, me());
        let events = handle.subscribe();
        let mut harness = Self { handle, events };

        harness.send(ChatCommand::LoadRooms).await;
        harness.snapshot_where(|s| !s.rooms.is_empty()).await;
        wait_until(|| backend.subscription_count() == 1).await;
        harness
    }

    async fn open(&mut self, room_id: &str) -> ChatSnapshot {
        self.send(ChatCommand::SelectRoom {
            room_id: room_id.to_owned(),
        })
        .await;
        self.snapshot_where(|s| s.selected_room_id.as_deref() == Some(room_id) && !s.loading)
            .await
    }

    async fn send(&self, command: ChatCommand) {
        self.handle
            .send(command)
            .await
            .expect("command should enqueue");
    }

    async fn next_event(&mut self) -> ChatEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("event timeout")
            .expect("event receive")
    }

    async fn snapshot_where(
        &mut self,
        mut predicate: impl FnMut(&ChatSnapshot) -> bool,
    ) -> ChatSnapshot {
        loop {
            if let ChatEvent::Snapshot(snapshot) = self.next_event().await
                && predicate(&snapshot)
            {
                return snapshot;
            }
        }
    }

    async fn notification(&mut self) -> Notification {
        loop {
            if let ChatEvent::Notification(notification) = self.next_event().await {
                return notification;
            }
        }
    }

    fn drain(&mut self) -> Vec<ChatEvent> {
        let mut drained = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => drained.push(event),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
                Err(TryRecvError::Lagged(skipped)) => panic!("lagged by {skipped} events"),
            }
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition timeout");
}

fn single_confirmed(snapshot: &ChatSnapshot, content: &str) -> bool {
    snapshot.messages.len() == 1
        && !snapshot.messages[0].is_temporary()
        && snapshot.messages[0].content == content
}

fn is_failed(snapshot: &ChatSnapshot) -> bool {
    snapshot.messages.first().is_some_and(|message| {
        matches!(
            message.delivery.as_ref().map(|delivery| delivery.state()),
            Some(SendState::Failed { .. })
        )
    })
}

#[tokio::test]
async fn sent_message_is_reconciled_with_its_echo() {
    let backend = backend_with_rooms(&["r1"]);
    let mut harness = Harness::start(ChatConfig::default(), &backend).await;
    harness.open("r1").await;

    harness
        .send(ChatCommand::SendText {
            content: "hello".to_owned(),
        })
        .await;

    let optimistic = harness.snapshot_where(|s| !s.messages.is_empty()).await;
    assert!(optimistic.messages[0].is_temporary());
    assert_eq!(optimistic.messages[0].sender_name.as_deref(), Some("Minh Vo"));

    loop {
        let ChatEvent::Snapshot(snapshot) = harness.next_event().await else {
            continue;
        };
        assert!(
            snapshot.messages.len() <= 1,
            "send must never show two entries: {:?}",
            snapshot.messages
        );
        if single_confirmed(&snapshot, "hello") {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for event in harness.drain() {
        if let ChatEvent::Snapshot(snapshot) = event {
            assert_eq!(snapshot.messages.len(), 1);
        }
    }
    assert_eq!(backend.history("r1").len(), 1);
}

#[tokio::test]
async fn failed_send_notifies_and_can_be_retried() {
    let backend = backend_with_rooms(&["r1"]);
    let mut harness = Harness::start(ChatConfig::default(), &backend).await;
    harness.open("r1").await;
    backend.fail_next_send(ChatError::from_http_status(503, "service unavailable"));

    harness
        .send(ChatCommand::SendText {
            content: "hello".to_owned(),
        })
        .await;

    let failed = harness.snapshot_where(is_failed).await;
    let notification = harness.notification().await;
    assert_eq!(notification.code, "http_503");

    harness
        .send(ChatCommand::RetrySend {
            temp_id: failed.messages[0].id.clone(),
        })
        .await;
    harness
        .snapshot_where(|s| single_confirmed(s, "hello"))
        .await;
    assert_eq!(backend.history("r1").len(), 1);
}

#[tokio::test]
async fn failed_send_can_be_discarded() {
    let backend = backend_with_rooms(&["r1"]);
    let mut harness = Harness::start(ChatConfig::default(), &backend).await;
    harness.open("r1").await;
    backend.fail_next_send(ChatError::from_http_status(500, "boom"));

    harness
        .send(ChatCommand::SendText {
            content: "draft".to_owned(),
        })
        .await;
    let failed = harness.snapshot_where(is_failed).await;

    harness
        .send(ChatCommand::DiscardFailed {
            temp_id: failed.messages[0].id.clone(),
        })
        .await;
    harness.snapshot_where(|s| s.messages.is_empty()).await;
}

#[tokio::test]
async fn acknowledged_send_without_echo_is_promoted_after_timeout() {
    let backend = backend_with_rooms(&["r1"]);
    let config = ChatConfig {
        pending_timeout_ms: 300,
        ..ChatConfig::default()
    };
    let mut harness = Harness::start(config, &backend).await;
    harness.open("r1").await;
    backend.suppress_echo(true);

    harness
        .send(ChatCommand::SendText {
            content: "anyone there?".to_owned(),
        })
        .await;

    let promoted = harness
        .snapshot_where(|s| single_confirmed(s, "anyone there?"))
        .await;
    assert_eq!(promoted.messages[0].id, "1");
}

/// Send endpoint that never answers; everything else goes to the backend.
struct SilentSendApi(InMemoryChatBackend);

#[async_trait]
impl ChatApi for SilentSendApi {
    async fn fetch_rooms(&self, member: &Sender) -> Result<Vec<ServerChatRoom>, ChatError> {
        self.0.fetch_rooms(member).await
    }

    async fn fetch_messages(
        &self,
        room_id: &str,
        page: u32,
        page_size: u16,
    ) -> Result<MessagePage, ChatError> {
        self.0.fetch_messages(room_id, page, page_size).await
    }

    async fn send_message(&self, _message: OutgoingMessage) -> Result<ServerMessage, ChatError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn unanswered_send_fails_after_timeout() {
    let backend = backend_with_rooms(&["r1"]);
    let services = ChatServices {
        api: Arc::new(SilentSendApi(backend.clone())),
        profiles: Arc::new(backend.clone()),
        realtime: Arc::new(backend.clone()),
    };
    let config = ChatConfig {
        pending_timeout_ms: 200,
        ..ChatConfig::default()
    };
    let mut harness = Harness::start_with(config, services, &backend).await;
    harness.open("r1").await;

    harness
        .send(ChatCommand::SendText {
            content: "hello?".to_owned(),
        })
        .await;

    let failed = harness.snapshot_where(is_failed).await;
    assert_eq!(failed.messages.len(), 1);
    assert_eq!(harness.notification().await.code, "send_timeout");
}

#[tokio::test]
async fn attachment_is_reconciled_through_acknowledged_id() {
    let backend = backend_with_rooms(&["r1"]);
    let mut harness = Harness::start(ChatConfig::default(), &backend).await;
    harness.open("r1").await;

    harness
        .send(ChatCommand::SendAttachment {
            attachment: Attachment {
                file_name: "pitch.png".to_owned(),
                content_type: Some("image/png".to_owned()),
                data: vec![0x89, 0x50, 0x4e, 0x47],
            },
        })
        .await;

    let settled = harness
        .snapshot_where(|s| s.messages.len() == 1 && !s.messages[0].is_temporary())
        .await;
    let message = &settled.messages[0];
    assert_eq!(message.media, Some(MediaKind::Image));
    assert!(message.content.ends_with("/pitch.png"));
    assert_eq!(
        settled.rooms[0].latest_message.as_deref(),
        Some("📷 Image")
    );
}

#[tokio::test]
async fn slow_page_for_previous_room_never_replaces_current_room() {
    let backend = backend_with_rooms(&["a", "b"]);
    backend.seed_message("a", &bob(), "from a", 1_000);
    backend.seed_message("b", &bob(), "from b", 2_000);
    backend.set_fetch_delay("a", Duration::from_millis(300));
    let mut harness = Harness::start(ChatConfig::default(), &backend).await;

    harness
        .send(ChatCommand::SelectRoom {
            room_id: "a".to_owned(),
        })
        .await;
    let current = harness.open("b").await;
    assert_eq!(current.messages.len(), 1);
    assert_eq!(current.messages[0].content, "from b");

    tokio::time::sleep(Duration::from_millis(500)).await;
    for event in harness.drain() {
        if let ChatEvent::Snapshot(snapshot) = event {
            assert_eq!(snapshot.selected_room_id.as_deref(), Some("b"));
            assert!(snapshot.messages.iter().all(|m| m.room_id == "b"));
        }
    }
}

#[tokio::test]
async fn nameless_incoming_message_is_backfilled_from_profile() {
    let backend = backend_with_rooms(&["r1"]);
    backend.add_profile(
        "bob",
        AccountProfile {
            first_name: Some("Bob".to_owned()),
            last_name: Some("Tran".to_owned()),
            ..AccountProfile::default()
        },
    );
    let mut harness = Harness::start(ChatConfig::default(), &backend).await;
    harness.open("r1").await;

    backend
        .push_raw(ServerMessage {
            id: Some("900".to_owned()),
            room_id: Some("r1".to_owned()),
            sender_account_id: Some("bob".to_owned()),
            content: "are you free tomorrow?".to_owned(),
            sent_at: Some(RawTimestamp::Text("2024-05-01T10:00:00Z".to_owned())),
            ..ServerMessage::default()
        })
        .await;

    let named = harness
        .snapshot_where(|s| {
            s.messages
                .first()
                .is_some_and(|m| m.sender_name.as_deref() == Some("Bob Tran"))
        })
        .await;
    assert_eq!(named.messages[0].sent_at_ms, 1_714_557_600_000);
    assert_eq!(backend.lookup_calls("bob"), 1);
}

#[tokio::test]
async fn incoming_message_scrolls_open_room() {
    let backend = backend_with_rooms(&["r1", "r2"]);
    let mut harness = Harness::start(ChatConfig::default(), &backend).await;
    harness.open("r1").await;

    backend.deliver("r2", &bob(), "elsewhere").await;
    let preview = harness
        .snapshot_where(|s| s.rooms[1].latest_message.as_deref() == Some("elsewhere"))
        .await;
    assert!(preview.messages.is_empty());

    backend.deliver("r1", &bob(), "here").await;
    loop {
        match harness.next_event().await {
            ChatEvent::ScrollToBottom { room_id } => {
                assert_eq!(room_id, "r1");
                break;
            }
            ChatEvent::Snapshot(_) | ChatEvent::Notification(_) => {}
        }
    }
}

#[tokio::test]
async fn older_pages_are_appended_newest_first() {
    let backend = backend_with_rooms(&["r1"]);
    for (at, content) in [(1_000, "one"), (2_000, "two"), (3_000, "three")] {
        backend.seed_message("r1", &bob(), content, at);
    }
    let config = ChatConfig {
        page_size: 2,
        ..ChatConfig::default()
    };
    let mut harness = Harness::start(config, &backend).await;

    let first = harness.open("r1").await;
    assert_eq!(first.messages.len(), 2);
    assert!(first.has_older);

    harness.send(ChatCommand::LoadOlder).await;
    let all = harness
        .snapshot_where(|s| s.messages.len() == 3 && !s.loading)
        .await;
    let contents: Vec<_> = all.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["three", "two", "one"]);
    assert!(!all.has_older);
}

#[tokio::test]
async fn shutdown_releases_subscription() {
    let backend = backend_with_rooms(&["r1"]);
    let harness = Harness::start(ChatConfig::default(), &backend).await;

    harness.handle.shutdown();
    wait_until(|| backend.subscription_count() == 0).await;
}
