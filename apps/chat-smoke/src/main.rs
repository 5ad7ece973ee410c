mod logging;

use std::{env, process, time::Duration};

use chat_core::{
    AccountProfile, ChatCommand, ChatEvent, ChatSnapshot, EventStream, Sender, ServerChatRoom,
    StartupProfile,
};
use chat_platform::{ChatServices, InMemoryChatBackend};
use chat_runtime::{ChatConfig, ChatRuntimeHandle, spawn_runtime};
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

const ROOM_ID: &str = "demo-room";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ChatConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(1);
        }
    };
    let identity = Sender::Account(
        env::var("VENTURECHAT_SMOKE_ACCOUNT").unwrap_or_else(|_| "founder-1".to_owned()),
    );

    let backend = seeded_backend(&identity);
    let handle = spawn_runtime(config, ChatServices::from_backend(backend.clone()), identity);
    let mut events = handle.subscribe();

    match run(&handle, &mut events, &backend).await {
        Ok(()) => println!("Smoke run finished: send reconciled, reply received."),
        Err(err) => {
            eprintln!("Smoke run failed: {err}");
            process::exit(1);
        }
    }
    handle.shutdown();
}

fn seeded_backend(identity: &Sender) -> InMemoryChatBackend {
    let backend = InMemoryChatBackend::new();
    backend.add_room(ServerChatRoom {
        id: ROOM_ID.to_owned(),
        counterpart_name: Some("Northwind Ventures".to_owned()),
        ..ServerChatRoom::default()
    });
    if let Some(account_id) = identity.account_id() {
        backend.add_profile(
            account_id,
            AccountProfile {
                first_name: Some("Smoke".to_owned()),
                last_name: Some("Founder".to_owned()),
                ..AccountProfile::default()
            },
        );
    }
    backend.add_startup(
        "northwind",
        StartupProfile {
            startup_name: Some("Northwind Ventures".to_owned()),
            logo: None,
        },
    );
    backend.seed_message(
        ROOM_ID,
        &Sender::Startup("northwind".to_owned()),
        "Thanks for the deck, let's talk next week.",
        1_714_557_600_000,
    );
    backend
}

async fn run(
    handle: &ChatRuntimeHandle,
    events: &mut EventStream,
    backend: &InMemoryChatBackend,
) -> Result<(), String> {
    send(handle, ChatCommand::LoadRooms).await?;
    let rooms = wait_for(events, "room list", |s| !s.rooms.is_empty()).await?;
    info!(room_count = rooms.rooms.len(), "rooms loaded");

    let deadline = Instant::now() + STEP_TIMEOUT;
    while backend.subscription_count() == 0 {
        if Instant::now() >= deadline {
            return Err("real-time subscription was never established".to_owned());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    send(
        handle,
        ChatCommand::SelectRoom {
            room_id: ROOM_ID.to_owned(),
        },
    )
    .await?;
    let opened = wait_for(events, "room history", |s| {
        s.selected_room_id.as_deref() == Some(ROOM_ID) && !s.loading
    })
    .await?;
    info!(messages = opened.messages.len(), "room opened");

    let text = "Hello from the smoke run";
    send(
        handle,
        ChatCommand::SendText {
            content: text.to_owned(),
        },
    )
    .await?;
    let confirmed = wait_for(events, "reconciled send", |s| {
        s.messages
            .first()
            .is_some_and(|m| m.content == text && !m.is_temporary())
    })
    .await?;
    let copies = confirmed.messages.iter().filter(|m| m.content == text).count();
    if copies != 1 {
        return Err(format!("expected one copy of the sent message, found {copies}"));
    }
    info!(message_id = %confirmed.messages[0].id, "send reconciled");

    let reply = "Great, Tuesday works.";
    backend
        .deliver(ROOM_ID, &Sender::Startup("northwind".to_owned()), reply)
        .await;
    let replied = wait_for(events, "incoming reply", |s| {
        s.messages.first().is_some_and(|m| m.content == reply)
    })
    .await?;
    info!(
        sender = replied.messages[0].sender_name.as_deref().unwrap_or("unknown"),
        "reply received"
    );
    Ok(())
}

async fn send(handle: &ChatRuntimeHandle, command: ChatCommand) -> Result<(), String> {
    handle
        .send(command)
        .await
        .map_err(|err| format!("failed to enqueue command: {err}"))
}

async fn wait_for(
    events: &mut EventStream,
    what: &str,
    mut predicate: impl FnMut(&ChatSnapshot) -> bool,
) -> Result<ChatSnapshot, String> {
    let deadline = Instant::now() + STEP_TIMEOUT;
    loop {
        let event = timeout_at(deadline, events.recv())
            .await
            .map_err(|_| format!("timed out waiting for {what}"))?
            .map_err(|err| format!("event stream failed while waiting for {what}: {err}"))?;
        match event {
            ChatEvent::Snapshot(snapshot) if predicate(&snapshot) => return Ok(snapshot),
            ChatEvent::Notification(notification) => {
                warn!(code = %notification.code, "{}", notification.message);
            }
            ChatEvent::Snapshot(_) | ChatEvent::ScrollToBottom { .. } => {}
        }
    }
}
