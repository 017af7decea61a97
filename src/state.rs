use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::gateway::session::Session;
use crate::status::ServerStatus;

/// One watched server, keyed by the id of the status message kept updated
/// in its channel. `last_update` holds the last rendered message payload
/// so unchanged statuses skip the edit; `last_status` feeds the failure
/// embed's title when a later query errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedServer {
    pub host: String,
    pub port: u16,
    pub msg_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub last_status: Option<ServerStatus>,
    #[serde(default)]
    pub last_update: serde_json::Value,
}

/// The bot's persisted state: watched messages plus the gateway session
/// snapshot used for resuming after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotState {
    #[serde(default)]
    pub messages: HashMap<String, WatchedServer>,
    #[serde(default)]
    pub session: Session,
}

/// Mutex-guarded state with write-through persistence to a JSON file.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<BotState>,
}

impl StateStore {
    /// Load the state file, falling back to an empty state when it is
    /// missing or unreadable (first run, or a corrupt file).
    pub fn load(path: PathBuf) -> Self {
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Mutate the state under the lock, then persist it.
    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut BotState),
    {
        let snapshot = match self.state.lock() {
            Ok(mut state) => {
                mutate(&mut state);
                state.clone()
            }
            Err(_) => return,
        };
        self.persist(&snapshot);
    }

    pub fn session(&self) -> Session {
        self.state
            .lock()
            .map(|s| s.session.clone())
            .unwrap_or_default()
    }

    pub fn watched(&self, msg_id: &str) -> Option<WatchedServer> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.messages.get(msg_id).cloned())
    }

    pub fn watched_all(&self) -> Vec<WatchedServer> {
        self.state
            .lock()
            .map(|s| s.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    fn persist(&self, state: &BotState) {
        match serde_json::to_string(state) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw) {
                    tracing::error!("failed to write state file {:?}: {e}", self.path);
                }
            }
            Err(e) => tracing::error!("failed to serialize state: {e}"),
        }
    }

    /// Persist the current state as-is.
    pub fn save(&self) {
        if let Ok(state) = self.state.lock() {
            self.persist(&state.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("blockwatch-state-{}.json", rand::random::<u64>()));
        path
    }

    #[test]
    fn test_missing_file_loads_default() {
        let store = StateStore::load(temp_state_path());
        assert!(store.watched_all().is_empty());
        assert!(store.session().id.is_none());
    }

    #[test]
    fn test_update_round_trips_through_disk() {
        let path = temp_state_path();
        let store = StateStore::load(path.clone());
        store.update(|state| {
            state.session = Session::new(Some("sess-9".into()), 123);
            state.messages.insert(
                "42".into(),
                WatchedServer {
                    host: "mc.example.com".into(),
                    port: 25565,
                    msg_id: "42".into(),
                    channel_id: "7".into(),
                    last_status: None,
                    last_update: serde_json::json!({}),
                },
            );
        });

        let reloaded = StateStore::load(path.clone());
        assert_eq!(reloaded.session().id.as_deref(), Some("sess-9"));
        assert_eq!(reloaded.session().sequence, 123);
        let watched = reloaded.watched("42").unwrap();
        assert_eq!(watched.host, "mc.example.com");
        assert_eq!(watched.port, 25565);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_corrupt_file_loads_default() {
        let path = temp_state_path();
        std::fs::write(&path, "{not json").unwrap();
        let store = StateStore::load(path.clone());
        assert!(store.watched_all().is_empty());
        std::fs::remove_file(&path).ok();
    }
}
