use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::json;

use crate::rest::RestClient;
use crate::state::{StateStore, WatchedServer};
use crate::status::query_status;
use crate::watcher::{status_message, Watcher};

/// A chat command recognized by the bot.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Watch { host: String, port: u16 },
    Stop { msg_id: String },
}

fn watch_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"!!watchmcserver +(?P<host>[^:\s]+):(?P<port>\d+)\b")
            .expect("watch command pattern")
    })
}

fn stop_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"!!stopwatching +(?P<msgid>\d+)\b").expect("stop command pattern")
    })
}

/// Match message content against the command grammar; first match wins.
pub fn parse(content: &str) -> Option<Command> {
    if let Some(caps) = watch_pattern().captures(content) {
        let port: u16 = caps["port"].parse().ok()?;
        return Some(Command::Watch {
            host: caps["host"].to_string(),
            port,
        });
    }
    if let Some(caps) = stop_pattern().captures(content) {
        return Some(Command::Stop {
            msg_id: caps["msgid"].to_string(),
        });
    }
    None
}

/// Everything a command handler needs.
pub struct CommandContext {
    pub rest: Arc<RestClient>,
    pub store: Arc<StateStore>,
    pub watcher: Arc<Watcher>,
    pub status_timeout: Duration,
}

/// Handle one MESSAGE_CREATE payload.
pub async fn handle_message(ctx: Arc<CommandContext>, data: serde_json::Value) {
    let content = data.get("content").and_then(|v| v.as_str()).unwrap_or("");
    let channel_id = data
        .get("channel_id")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match parse(content) {
        Some(Command::Watch { host, port }) => {
            tracing::info!("handling watch command for {host}:{port}");
            handle_watch(&ctx, channel_id, &host, port).await;
        }
        Some(Command::Stop { msg_id }) => {
            tracing::info!("handling stop command for message {msg_id}");
            handle_stop(&ctx, &msg_id).await;
        }
        None => {}
    }
}

async fn handle_watch(ctx: &CommandContext, channel_id: &str, host: &str, port: u16) {
    let address = format!("{host}:{port}");
    let status = match query_status(host, port, ctx.status_timeout).await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!("status query for {address} failed: {e}");
            send_error_reply(ctx, channel_id).await;
            return;
        }
    };

    let payload = status_message(&status, &address);
    let created = match ctx.rest.create_message(channel_id, &payload).await {
        Ok(resp) if resp.status == 200 => resp,
        Ok(resp) => {
            tracing::warn!("creating status message returned {}", resp.status);
            send_error_reply(ctx, channel_id).await;
            return;
        }
        Err(e) => {
            tracing::warn!("failed to create status message: {e}");
            send_error_reply(ctx, channel_id).await;
            return;
        }
    };

    let msg_id = created.data.get("id").and_then(|v| v.as_str());
    let msg_channel = created.data.get("channel_id").and_then(|v| v.as_str());
    let (Some(msg_id), Some(msg_channel)) = (msg_id, msg_channel) else {
        tracing::warn!("create message response missing id fields");
        send_error_reply(ctx, channel_id).await;
        return;
    };

    ctx.store.update(|state| {
        state.messages.insert(
            msg_id.to_string(),
            WatchedServer {
                host: host.to_string(),
                port,
                msg_id: msg_id.to_string(),
                channel_id: msg_channel.to_string(),
                last_status: Some(status.clone()),
                last_update: payload.clone(),
            },
        );
    });
    ctx.watcher.start(msg_id);
}

async fn handle_stop(ctx: &CommandContext, msg_id: &str) {
    let Some(watched) = ctx.store.watched(msg_id) else {
        return;
    };
    ctx.watcher.stop(msg_id);
    if let Err(e) = ctx.rest.delete_message(&watched.channel_id, msg_id).await {
        tracing::warn!("failed to delete status message {msg_id}: {e}");
    }
}

async fn send_error_reply(ctx: &CommandContext, channel_id: &str) {
    let reply = json!({ "content": "Something went wrong :/" });
    if let Err(e) = ctx.rest.create_message(channel_id, &reply).await {
        tracing::warn!("failed to send error reply: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch_command() {
        let cmd = parse("!!watchmcserver mc.example.com:25565 please");
        assert_eq!(
            cmd,
            Some(Command::Watch {
                host: "mc.example.com".to_string(),
                port: 25565,
            })
        );
    }

    #[test]
    fn test_parse_stop_command() {
        let cmd = parse("!!stopwatching 123456789");
        assert_eq!(
            cmd,
            Some(Command::Stop {
                msg_id: "123456789".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_requires_host_and_port() {
        assert_eq!(parse("!!watchmcserver mc.example.com"), None);
        assert_eq!(parse("!!watchmcserver :25565"), None);
    }

    #[test]
    fn test_parse_rejects_out_of_range_port() {
        assert_eq!(parse("!!watchmcserver h:99999"), None);
    }

    #[test]
    fn test_parse_ignores_ordinary_chat() {
        assert_eq!(parse("has anyone seen the server lately?"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn test_watch_matches_before_stop() {
        let cmd = parse("!!watchmcserver h:1 and also !!stopwatching 2");
        assert!(matches!(cmd, Some(Command::Watch { .. })));
    }
}
