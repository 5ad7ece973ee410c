//! Session-lifetime cache of sender display metadata.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chat_core::{AccountProfile, ChatError, MemberEntry, Message, Sender, StartupProfile};
use chat_platform::ProfileSource;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub const ACCOUNT_FALLBACK_NAME: &str = "User";
pub const STARTUP_FALLBACK_NAME: &str = "Startup";

type Slot = Arc<OnceCell<MemberEntry>>;

/// Maps senders to display names and avatars.
///
/// Entries come from message payloads that carry a sender name, or from
/// profile lookups. Each key owns one `OnceCell`, so concurrent lookups for
/// the same sender share a single request. A failed lookup leaves the cell
/// empty and the next caller tries again.
pub struct MemberDirectory {
    profiles: Arc<dyn ProfileSource>,
    slots: Mutex<HashMap<Sender, Slot>>,
}

impl MemberDirectory {
    pub fn new(profiles: Arc<dyn ProfileSource>) -> Self {
        Self {
            profiles,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Cached entry, without triggering a lookup.
    pub fn cached(&self, key: &Sender) -> Option<MemberEntry> {
        self.slots()
            .get(key)
            .and_then(|slot| slot.get().cloned())
    }

    /// Number of resolved entries.
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Learn names from messages that carry one; nameless messages are skipped.
    ///
    /// Returns the number of entries written.
    pub fn upsert_from_messages<'a, I>(&self, messages: I) -> usize
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut slots = self.slots();
        let mut written = 0;
        for message in messages {
            let Some(display_name) = message
                .sender_name
                .as_deref()
                .filter(|name| !name.trim().is_empty())
            else {
                continue;
            };
            let entry = MemberEntry {
                key: message.sender.clone(),
                display_name: display_name.to_owned(),
                avatar: message.sender_avatar.clone(),
                is_startup: message.sender.is_startup(),
            };
            if slots
                .get(&entry.key)
                .and_then(|slot| slot.get())
                .is_some_and(|existing| *existing == entry)
            {
                continue;
            }
            slots.insert(entry.key.clone(), Arc::new(OnceCell::new_with(Some(entry))));
            written += 1;
        }
        written
    }

    /// Return the cached entry or resolve it through the profile service.
    ///
    /// Lookup failures are logged and reported as `None`.
    pub async fn lookup_or_fetch(&self, key: &Sender) -> Option<MemberEntry> {
        let slot = self.slots().entry(key.clone()).or_default().clone();
        match slot.get_or_try_init(|| self.fetch(key)).await {
            Ok(entry) => Some(entry.clone()),
            Err(err) => {
                warn!(member = %key.directory_key(), error = %err, "member lookup failed");
                None
            }
        }
    }

    async fn fetch(&self, key: &Sender) -> Result<MemberEntry, ChatError> {
        debug!(member = %key.directory_key(), "fetching member profile");
        let (display_name, avatar) = match key {
            Sender::Account(id) => {
                let profile = self.profiles.lookup_profile(id).await?;
                (account_display_name(&profile), profile.avatar)
            }
            Sender::Startup(id) => {
                let profile = self.profiles.lookup_startup(id).await?;
                (startup_display_name(&profile), profile.logo)
            }
        };
        Ok(MemberEntry {
            key: key.clone(),
            display_name,
            avatar: avatar.filter(|value| !value.trim().is_empty()),
            is_startup: key.is_startup(),
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Sender, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Full name, else first and last name joined, else a generic label.
pub fn account_display_name(profile: &AccountProfile) -> String {
    if let Some(full_name) = non_blank(profile.full_name.as_deref()) {
        return full_name.to_owned();
    }
    let joined = [profile.first_name.as_deref(), profile.last_name.as_deref()]
        .into_iter()
        .filter_map(non_blank)
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        ACCOUNT_FALLBACK_NAME.to_owned()
    } else {
        joined
    }
}

pub fn startup_display_name(profile: &StartupProfile) -> String {
    non_blank(profile.startup_name.as_deref())
        .unwrap_or(STARTUP_FALLBACK_NAME)
        .to_owned()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
