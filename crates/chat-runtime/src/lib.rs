//! Async runtime that drives chat state from view commands.
//!
//! The runtime owns the room list, per-room timelines and the member
//! directory. Network calls run on spawned tasks; their results are fed back
//! into a single loop that applies them and emits snapshots.

/// Environment-backed tuning knobs.
pub mod config;
/// Sender display-name cache with coalesced profile lookups.
pub mod directory;
/// Runtime task, command handling and handle type.
pub mod runtime;
/// State reducer applied by the runtime loop.
pub mod session;

pub use config::{ChatConfig, ConfigError};
pub use directory::{MemberDirectory, account_display_name, startup_display_name};
pub use runtime::{ChatRuntimeHandle, spawn_runtime};
pub use session::{
    ChatSession, IncomingReport, PageOutcome, PageRequest, SendOutcome, SendRequest,
};
