use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::rest::RestClient;
use crate::state::StateStore;
use crate::status::{query_status, ServerStatus};

const EMBED_COLOR: u32 = 0xEA02BC;

/// Render a server status as a message payload.
pub fn status_message(status: &ServerStatus, address: &str) -> serde_json::Value {
    let mut players: Vec<String> = status
        .players
        .sample
        .iter()
        .map(|p| format!("• {}", p.name))
        .collect();
    players.sort();
    let player_list = if players.is_empty() {
        "None".to_string()
    } else {
        players.join("\n")
    };
    json!({
        "embed": {
            "title": status.description.text,
            "description": format!("`{address}`"),
            "color": EMBED_COLOR,
            "fields": [
                { "name": "Version", "value": status.version.name, "inline": true },
                {
                    "name": "Online",
                    "value": format!("{} / {}", status.players.online, status.players.max),
                    "inline": true
                },
                { "name": "Players", "value": player_list, "inline": false },
            ]
        }
    })
}

/// Render the payload shown when a status query fails.
pub fn status_fail_message(title: &str, address: &str) -> serde_json::Value {
    json!({
        "embed": {
            "title": title,
            "color": EMBED_COLOR,
            "description": format!("`{address}`\n[An error occured]"),
        }
    })
}

/// Keeps one update task alive per watched message. Each task owns its
/// timer; stopping a watch aborts the task explicitly rather than leaving
/// it to be found later.
pub struct Watcher {
    rest: Arc<RestClient>,
    store: Arc<StateStore>,
    update_interval: Duration,
    status_timeout: Duration,
    tasks: DashMap<String, JoinHandle<()>>,
    weak: Weak<Watcher>,
}

impl Watcher {
    pub fn new(
        rest: Arc<RestClient>,
        store: Arc<StateStore>,
        update_interval: Duration,
        status_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            rest,
            store,
            update_interval,
            status_timeout,
            tasks: DashMap::new(),
            weak: weak.clone(),
        })
    }

    /// Start (or restart) the periodic update task for a watched message.
    /// The first update runs immediately.
    pub fn start(&self, msg_id: &str) {
        let Some(watcher) = self.weak.upgrade() else {
            return;
        };
        let id = msg_id.to_string();
        let period = self.update_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                watcher.update(&id).await;
            }
        });
        if let Some(old) = self.tasks.insert(msg_id.to_string(), task) {
            old.abort();
        }
    }

    /// Start update tasks for every watch in the persisted state.
    pub fn resume_all(&self) {
        for watched in self.store.watched_all() {
            tracing::info!(
                "resuming watch on {}:{} (message {})",
                watched.host,
                watched.port,
                watched.msg_id
            );
            self.start(&watched.msg_id);
        }
    }

    /// Stop watching: abort the update task and drop the state entry.
    pub fn stop(&self, msg_id: &str) {
        if let Some((_, task)) = self.tasks.remove(msg_id) {
            task.abort();
        }
        self.store.update(|state| {
            state.messages.remove(msg_id);
        });
    }

    /// Query the watched server and edit the status message if its
    /// rendering changed. A 404 on the edit means the message is gone and
    /// the watch is discontinued.
    pub async fn update(&self, msg_id: &str) {
        let Some(watched) = self.store.watched(msg_id) else {
            return;
        };
        let address = format!("{}:{}", watched.host, watched.port);

        let (status, payload) =
            match query_status(&watched.host, watched.port, self.status_timeout).await {
                Ok(status) => {
                    let payload = status_message(&status, &address);
                    (Some(status), payload)
                }
                Err(e) => {
                    tracing::warn!("status query for {address} failed: {e}");
                    let title = watched
                        .last_status
                        .as_ref()
                        .map(|s| s.description.text.clone())
                        .unwrap_or_else(|| address.clone());
                    (None, status_fail_message(&title, &address))
                }
            };

        if payload == watched.last_update {
            return;
        }
        self.store.update(|state| {
            if let Some(entry) = state.messages.get_mut(msg_id) {
                if let Some(ref status) = status {
                    entry.last_status = Some(status.clone());
                }
                entry.last_update = payload.clone();
            }
        });

        tracing::info!("updating status message {msg_id}");
        match self
            .rest
            .edit_message(&watched.channel_id, &watched.msg_id, &payload)
            .await
        {
            Ok(resp) if resp.status == 404 => {
                tracing::info!("status message {msg_id} was deleted, discontinuing updates");
                self.stop(msg_id);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("failed to edit status message {msg_id}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{Description, Players, PlayerSample, Version};

    fn sample_status(names: &[&str]) -> ServerStatus {
        ServerStatus {
            description: Description {
                text: "A Server".to_string(),
            },
            version: Version {
                name: "1.17".to_string(),
            },
            players: Players {
                online: names.len() as u32,
                max: 20,
                sample: names
                    .iter()
                    .map(|n| PlayerSample {
                        name: n.to_string(),
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn test_status_message_fields() {
        let payload = status_message(&sample_status(&[]), "mc.example.com:25565");
        let embed = &payload["embed"];
        assert_eq!(embed["title"], "A Server");
        assert_eq!(embed["description"], "`mc.example.com:25565`");
        assert_eq!(embed["color"], 0xEA02BC);
        assert_eq!(embed["fields"][0]["value"], "1.17");
        assert_eq!(embed["fields"][1]["value"], "0 / 20");
        assert_eq!(embed["fields"][2]["value"], "None");
    }

    #[test]
    fn test_player_list_is_sorted() {
        let payload = status_message(&sample_status(&["zoe", "alex"]), "h:1");
        assert_eq!(payload["embed"]["fields"][2]["value"], "• alex\n• zoe");
    }

    #[test]
    fn test_fail_message() {
        let payload = status_fail_message("A Server", "h:1");
        let embed = &payload["embed"];
        assert_eq!(embed["title"], "A Server");
        assert_eq!(embed["description"], "`h:1`\n[An error occured]");
        assert_eq!(embed["color"], 0xEA02BC);
    }

    #[test]
    fn test_identical_payloads_compare_equal() {
        let a = status_message(&sample_status(&["alex"]), "h:1");
        let b = status_message(&sample_status(&["alex"]), "h:1");
        assert_eq!(a, b);
    }
}
