use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chat_core::{
    ChatChannelError, ChatChannels, ChatCommand, ChatError, ChatErrorCategory, ChatEvents,
    EventStream,
    ExpiryOutcome, MemberEntry, MessagePage, Normalizer, Sender, ServerChatRoom, ServerMessage,
    SubscriptionHandle,
};
use chat_platform::ChatServices;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ChatConfig,
    directory::MemberDirectory,
    session::{ChatSession, PageOutcome, PageRequest, SendOutcome, SendRequest},
};

const REALTIME_BUFFER: usize = 256;

/// Handle to a running chat runtime. Dropping it stops the runtime.
#[derive(Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
    stop: CancellationToken,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Stop the runtime loop and its timers; the subscription is released.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

impl Drop for ChatRuntimeHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Start the runtime task for `identity` on the current tokio runtime.
pub fn spawn_runtime(
    config: ChatConfig,
    services: ChatServices,
    identity: Sender,
) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(config.command_buffer, config.event_buffer);
    let stop = CancellationToken::new();
    let runtime = ChatRuntime::new(
        &config,
        channels.events(),
        command_rx,
        services,
        identity,
        stop.child_token(),
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle { channels, stop }
}

/// Results of spawned network work and timers, fed back into the loop.
enum Completion {
    Rooms(Result<Vec<ServerChatRoom>, ChatError>),
    Subscribed {
        generation: u64,
        result: Result<SubscriptionHandle, ChatError>,
    },
    Page {
        request: PageRequest,
        result: Result<MessagePage, ChatError>,
    },
    Sent {
        room_id: String,
        temp_id: String,
        result: Result<ServerMessage, ChatError>,
    },
    SendExpired {
        room_id: String,
        temp_id: String,
        attempt: u32,
    },
    MemberResolved {
        sender: Sender,
        entry: Option<MemberEntry>,
    },
}

struct ChatRuntime {
    events: ChatEvents,
    command_rx: mpsc::Receiver<ChatCommand>,
    services: ChatServices,
    directory: Arc<MemberDirectory>,
    session: ChatSession,
    pending_timeout: Duration,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    realtime_tx: mpsc::Sender<ServerMessage>,
    realtime_rx: mpsc::Receiver<ServerMessage>,
    subscription: Option<SubscriptionHandle>,
    subscribe_generation: u64,
    lookups_in_flight: HashSet<Sender>,
    stop: CancellationToken,
}

impl ChatRuntime {
    fn new(
        config: &ChatConfig,
        events: ChatEvents,
        command_rx: mpsc::Receiver<ChatCommand>,
        services: ChatServices,
        identity: Sender,
        stop: CancellationToken,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (realtime_tx, realtime_rx) = mpsc::channel(REALTIME_BUFFER);
        Self {
            events,
            command_rx,
            directory: Arc::new(MemberDirectory::new(services.profiles.clone())),
            services,
            session: ChatSession::new(identity, config, Normalizer::default()),
            pending_timeout: Duration::from_millis(config.pending_timeout_ms),
            completion_tx,
            completion_rx,
            realtime_tx,
            realtime_rx,
            subscription: None,
            subscribe_generation: 0,
            lookups_in_flight: HashSet::new(),
            stop,
        }
    }

    async fn run(mut self) {
        info!(member = %self.session.identity().directory_key(), "chat runtime started");
        self.spawn_lookup(self.session.identity().clone());
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle is gone.
                    None => break,
                },
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
                Some(message) = self.realtime_rx.recv() => self.handle_incoming(message),
            }
        }

        if let Some(handle) = self.subscription.take()
            && let Err(err) = self.services.realtime.unsubscribe(handle).await
        {
            warn!(handle = handle.0, error = %err, "unsubscribe on shutdown failed");
        }
        info!("chat runtime stopped");
    }

    fn handle_command(&mut self, command: ChatCommand) {
        debug!(command = command_name(&command), "handling chat command");
        match command {
            ChatCommand::LoadRooms => {
                let api = self.services.api.clone();
                let identity = self.session.identity().clone();
                self.spawn_task(async move { Completion::Rooms(api.fetch_rooms(&identity).await) });
            }
            ChatCommand::SelectRoom { room_id } => {
                let request = self.session.select_room(room_id);
                self.emit_snapshot();
                self.spawn_fetch(request);
            }
            ChatCommand::LoadOlder => {
                if let Some(request) = self.session.load_older() {
                    self.emit_snapshot();
                    self.spawn_fetch(request);
                }
            }
            ChatCommand::SendText { content } => {
                let result = self
                    .session
                    .begin_send_text(content, now_millis(), &self.directory);
                self.start_send(result);
            }
            ChatCommand::SendAttachment { attachment } => {
                let result =
                    self.session
                        .begin_send_attachment(attachment, now_millis(), &self.directory);
                self.start_send(result);
            }
            ChatCommand::RetrySend { temp_id } => {
                let result = self.session.retry_send(&temp_id, now_millis());
                self.start_send(result);
            }
            ChatCommand::DiscardFailed { temp_id } => {
                match self.session.discard_failed(&temp_id) {
                    Ok(()) => self.emit_snapshot(),
                    Err(err) => self.notify("discard rejected", &err),
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Rooms(Ok(rooms)) => {
                let room_ids = self.session.replace_rooms(rooms);
                self.emit_snapshot();
                self.resubscribe(room_ids);
            }
            Completion::Rooms(Err(err)) => self.notify("room list fetch failed", &err),
            Completion::Subscribed { generation, result } => match result {
                Ok(handle) if generation == self.subscribe_generation => {
                    debug!(handle = handle.0, "real-time subscription active");
                    self.subscription = Some(handle);
                }
                Ok(handle) => {
                    debug!(handle = handle.0, "releasing superseded subscription");
                    let realtime = self.services.realtime.clone();
                    tokio::spawn(async move {
                        if let Err(err) = realtime.unsubscribe(handle).await {
                            warn!(handle = handle.0, error = %err, "unsubscribe failed");
                        }
                    });
                }
                Err(err) => self.notify("real-time subscription failed", &err),
            },
            Completion::Page { request, result } => {
                match self
                    .session
                    .commit_page(&request, result, now_millis(), &self.directory)
                {
                    PageOutcome::Committed { .. } => {
                        self.emit_snapshot();
                        if request.page == 1 {
                            self.events.scroll_to_bottom(request.room_id.clone());
                        }
                        self.resolve_nameless_senders(&request.room_id);
                    }
                    PageOutcome::Stale => {}
                    PageOutcome::Failed(err) => {
                        self.emit_snapshot();
                        self.notify("message fetch failed", &err);
                    }
                }
            }
            Completion::Sent {
                room_id,
                temp_id,
                result,
            } => match self
                .session
                .apply_send_result(&room_id, &temp_id, result, now_millis())
            {
                SendOutcome::Acknowledged | SendOutcome::AlreadyConfirmed => self.emit_snapshot(),
                SendOutcome::Failed(err) => {
                    self.emit_snapshot();
                    self.notify("send failed", &err);
                }
                SendOutcome::Ignored => {}
            },
            Completion::SendExpired {
                room_id,
                temp_id,
                attempt,
            } => match self.session.expire_send(&room_id, &temp_id, attempt) {
                Some(ExpiryOutcome::MarkedFailed) => {
                    self.emit_snapshot();
                    self.notify(
                        "send timed out",
                        &ChatError::new(
                            ChatErrorCategory::Network,
                            "send_timeout",
                            "the message was not confirmed in time",
                        ),
                    );
                }
                Some(ExpiryOutcome::Promote(confirmed)) => {
                    debug!(%temp_id, message_id = %confirmed.id, "promoted unechoed message");
                    self.emit_snapshot();
                }
                Some(ExpiryOutcome::Stale) | None => {}
            },
            Completion::MemberResolved { sender, entry } => {
                self.lookups_in_flight.remove(&sender);
                if let Some(entry) = entry
                    && self.session.apply_member(&entry) > 0
                {
                    self.emit_snapshot();
                }
            }
        }
    }

    fn handle_incoming(&mut self, message: ServerMessage) {
        let Some(report) = self
            .session
            .apply_incoming(message, now_millis(), &self.directory)
        else {
            return;
        };
        self.emit_snapshot();
        if report.scroll {
            self.events.scroll_to_bottom(report.room_id);
        }
        if let Some(sender) = report.unknown_sender {
            self.spawn_lookup(sender);
        }
    }

    fn start_send(&mut self, result: Result<SendRequest, ChatError>) {
        let request = match result {
            Ok(request) => request,
            Err(err) => {
                self.notify("send rejected", &err);
                return;
            }
        };
        let room_id = request.outgoing.room_id.clone();
        self.emit_snapshot();
        self.events.scroll_to_bottom(room_id.clone());

        let SendRequest {
            temp_id,
            attempt,
            outgoing,
        } = request;
        let api = self.services.api.clone();
        let (task_room_id, task_temp_id) = (room_id.clone(), temp_id.clone());
        self.spawn_task(async move {
            Completion::Sent {
                room_id: task_room_id,
                temp_id: task_temp_id,
                result: api.send_message(outgoing).await,
            }
        });

        let timeout = self.pending_timeout;
        let stop = self.stop.child_token();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(Completion::SendExpired {
                        room_id,
                        temp_id,
                        attempt,
                    });
                }
            }
        });
    }

    fn spawn_fetch(&self, request: PageRequest) {
        let api = self.services.api.clone();
        self.spawn_task(async move {
            let result = api
                .fetch_messages(&request.room_id, request.page, request.page_size)
                .await;
            Completion::Page { request, result }
        });
    }

    fn resubscribe(&mut self, room_ids: Vec<String>) {
        self.subscribe_generation += 1;
        let generation = self.subscribe_generation;
        let previous = self.subscription.take();
        let realtime = self.services.realtime.clone();
        let sink = self.realtime_tx.clone();
        self.spawn_task(async move {
            if let Some(previous) = previous
                && let Err(err) = realtime.unsubscribe(previous).await
            {
                warn!(handle = previous.0, error = %err, "unsubscribe failed");
            }
            Completion::Subscribed {
                generation,
                result: realtime.subscribe(&room_ids, sink).await,
            }
        });
    }

    fn resolve_nameless_senders(&mut self, room_id: &str) {
        let senders: HashSet<Sender> = self
            .session
            .messages(room_id)
            .iter()
            .filter(|message| message.sender_name.is_none())
            .map(|message| message.sender.clone())
            .collect();
        for sender in senders {
            self.spawn_lookup(sender);
        }
    }

    fn spawn_lookup(&mut self, sender: Sender) {
        if !self.lookups_in_flight.insert(sender.clone()) {
            return;
        }
        let directory = self.directory.clone();
        self.spawn_task(async move {
            let entry = directory.lookup_or_fetch(&sender).await;
            Completion::MemberResolved { sender, entry }
        });
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let stop = self.stop.child_token();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                completion = task => {
                    let _ = tx.send(completion);
                }
            }
        });
    }

    fn emit_snapshot(&self) {
        self.events.emit_snapshot(self.session.snapshot());
    }

    fn notify(&self, context: &str, err: &ChatError) {
        warn!(code = %err.code, category = ?err.category, error = %err.message, "{context}");
        self.events.notify(err);
    }
}

fn command_name(command: &ChatCommand) -> &'static str {
    match command {
        ChatCommand::LoadRooms => "load_rooms",
        ChatCommand::SelectRoom { .. } => "select_room",
        ChatCommand::LoadOlder => "load_older",
        ChatCommand::SendText { .. } => "send_text",
        ChatCommand::SendAttachment { .. } => "send_attachment",
        ChatCommand::RetrySend { .. } => "retry_send",
        ChatCommand::DiscardFailed { .. } => "discard_failed",
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use chat_core::{ChatEvent, ChatSnapshot, Notification};
    use chat_platform::InMemoryChatBackend;
    use tokio::time::timeout;

    use super::*;

    async fn next_snapshot(events: &mut EventStream) -> ChatSnapshot {
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("event receive");
            if let ChatEvent::Snapshot(snapshot) = event {
                return snapshot;
            }
        }
    }

    #[tokio::test]
    async fn send_without_selected_room_emits_notification() {
        let backend = InMemoryChatBackend::new();
        let handle = spawn_runtime(
            ChatConfig::default(),
            ChatServices::from_backend(backend),
            Sender::Account("me".to_owned()),
        );
        let mut events = handle.subscribe();

        handle
            .send(ChatCommand::SendText {
                content: "hello".to_owned(),
            })
            .await
            .expect("command should enqueue");

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("event receive");
        match event {
            ChatEvent::Notification(notification) => {
                assert_eq!(notification.code, "no_room_selected");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn selecting_missing_room_reports_not_found() {
        let backend = InMemoryChatBackend::new();
        let handle = spawn_runtime(
            ChatConfig::default(),
            ChatServices::from_backend(backend),
            Sender::Account("me".to_owned()),
        );
        let mut events = handle.subscribe();

        handle
            .send(ChatCommand::SelectRoom {
                room_id: "ghost".to_owned(),
            })
            .await
            .expect("command should enqueue");

        let loading = next_snapshot(&mut events).await;
        assert!(loading.loading);

        let settled = next_snapshot(&mut events).await;
        assert!(!settled.loading);
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("event receive");
        assert!(matches!(
            event,
            ChatEvent::Notification(Notification { ref code, .. }) if code == "room_not_found"
        ));
    }
}
