use thiserror::Error;
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TrySendError},
};
use tracing::trace;

use crate::{
    error::ChatError,
    types::{ChatCommand, ChatEvent, ChatSnapshot, Notification},
};

/// Receiver half handed to each view that renders chat state.
pub type EventStream = broadcast::Receiver<ChatEvent>;

#[derive(Debug, Error)]
pub enum ChatChannelError {
    /// The runtime has stopped and dropped its command receiver.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The runtime is behind; the command was not queued.
    #[error("command channel is full")]
    CommandChannelFull,
}

/// Views push `ChatCommand`s in; the runtime fans `ChatEvent`s out.
///
/// Commands go through a bounded queue so a flooding view gets
/// backpressure. Events are broadcast; a subscriber that falls more than
/// `event_buffer` events behind skips ahead, which is safe because every
/// snapshot is complete on its own.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    commands: mpsc::Sender<ChatCommand>,
    events: ChatEvents,
}

impl ChatChannels {
    /// Build the pair; the runtime keeps the returned command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<ChatCommand>) {
        let (commands, command_rx) = mpsc::channel(command_buffer.max(1));
        let (events, _) = broadcast::channel(event_buffer.max(1));
        let events = ChatEvents { events };
        (Self { commands, events }, command_rx)
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Event half only. Holding it does not keep the command queue open.
    pub fn events(&self) -> ChatEvents {
        self.events.clone()
    }

    /// Queue a command, waiting for room in the buffer.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatChannelError::CommandChannelClosed)
    }

    /// Queue a command without waiting, for callers on a UI thread.
    pub fn try_send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => ChatChannelError::CommandChannelFull,
            TrySendError::Closed(_) => ChatChannelError::CommandChannelClosed,
        })
    }

    /// Broadcast an event; returns how many views received it.
    pub fn emit(&self, event: ChatEvent) -> usize {
        self.events.emit(event)
    }
}

/// Broadcasting side of [`ChatChannels`], owned by the runtime.
#[derive(Clone, Debug)]
pub struct ChatEvents {
    events: broadcast::Sender<ChatEvent>,
}

impl ChatEvents {
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Broadcast an event; returns how many views received it.
    pub fn emit(&self, event: ChatEvent) -> usize {
        match self.events.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("chat event dropped, no subscribers");
                0
            }
        }
    }

    pub fn emit_snapshot(&self, snapshot: ChatSnapshot) -> usize {
        self.emit(ChatEvent::Snapshot(snapshot))
    }

    /// Surface an error to the user as a transient notification.
    pub fn notify(&self, err: &ChatError) -> usize {
        self.emit(ChatEvent::Notification(Notification {
            code: err.code.clone(),
            message: err.message.clone(),
        }))
    }

    pub fn scroll_to_bottom(&self, room_id: impl Into<String>) -> usize {
        self.emit(ChatEvent::ScrollToBottom {
            room_id: room_id.into(),
        })
    }
}
