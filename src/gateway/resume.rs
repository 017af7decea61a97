use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use super::events::{event, opcode, GatewayMessage};
use super::registry::SubscriptionRegistry;
use super::GatewayError;

/// Outcome of a resume attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The gateway confirmed the resume; the session is retained.
    Resumed,
    /// The gateway rejected the session; the id must be discarded and the
    /// next connection identifies fresh.
    Invalidated,
}

/// Attempt to resume an existing session on a freshly opened socket.
///
/// Sends the resume frame, then races a single-shot wait for the RESUMED
/// acknowledgement against one for the invalid-session opcode. Whichever
/// arrives first wins; the loser's wait is aborted and produces no further
/// side effects even if the gateway later sends its signal too.
pub async fn negotiate(
    registry: &Arc<SubscriptionRegistry>,
    outbound: &mpsc::UnboundedSender<GatewayMessage>,
    token: &str,
    session_id: &str,
    sequence: u64,
) -> Result<ResumeOutcome, GatewayError> {
    let mut resumed = registry.await_event(event::RESUMED);
    let mut invalid = registry.await_opcode(opcode::INVALID_SESSION);

    tracing::info!("attempting to resume session {session_id} at sequence {sequence}");
    let payload = json!({
        "token": token,
        "session_id": session_id,
        "seq": sequence,
    });
    outbound
        .send(GatewayMessage::new(opcode::RESUME, payload))
        .map_err(|_| GatewayError::ConnectionClosed)?;

    tokio::select! {
        frame = resumed.wait() => {
            invalid.abort();
            match frame {
                Some(_) => {
                    tracing::info!("resumed session {session_id}");
                    Ok(ResumeOutcome::Resumed)
                }
                None => Err(GatewayError::ConnectionClosed),
            }
        }
        frame = invalid.wait() => {
            resumed.abort();
            match frame {
                Some(_) => {
                    tracing::warn!("gateway rejected session {session_id}");
                    Ok(ResumeOutcome::Invalidated)
                }
                None => Err(GatewayError::ConnectionClosed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::events::Frame;

    fn dispatch_event(registry: &SubscriptionRegistry, name: &str) {
        registry.dispatch(&Frame {
            opcode: opcode::DISPATCH,
            data: serde_json::json!({}),
            sequence: None,
            event: Some(name.to_string()),
        });
    }

    fn dispatch_opcode(registry: &SubscriptionRegistry, op: u8) {
        registry.dispatch(&Frame {
            opcode: op,
            data: serde_json::json!({}),
            sequence: None,
            event: None,
        });
    }

    #[tokio::test]
    async fn test_resume_frame_carries_session_and_sequence() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reg = Arc::clone(&registry);
        let race = tokio::spawn(async move { negotiate(&reg, &tx, "tok", "sess-1", 42).await });

        let sent = rx.recv().await.expect("resume frame sent");
        assert_eq!(sent.op, opcode::RESUME);
        let d = sent.d.expect("payload");
        assert_eq!(d["session_id"], "sess-1");
        assert_eq!(d["seq"], 42);
        assert_eq!(d["token"], "tok");

        dispatch_event(&registry, event::RESUMED);
        assert_eq!(race.await.unwrap().unwrap(), ResumeOutcome::Resumed);
    }

    #[tokio::test]
    async fn test_resumed_wins_and_aborts_invalid_wait() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reg = Arc::clone(&registry);
        let race = tokio::spawn(async move { negotiate(&reg, &tx, "tok", "sess", 7).await });
        let _ = rx.recv().await;

        dispatch_event(&registry, event::RESUMED);
        assert_eq!(race.await.unwrap().unwrap(), ResumeOutcome::Resumed);

        // A late invalid-session signal has no waiter left to hit.
        dispatch_opcode(&registry, opcode::INVALID_SESSION);
    }

    #[tokio::test]
    async fn test_invalid_session_wins_and_aborts_resume_wait() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reg = Arc::clone(&registry);
        let race = tokio::spawn(async move { negotiate(&reg, &tx, "tok", "sess", 7).await });
        let _ = rx.recv().await;

        dispatch_opcode(&registry, opcode::INVALID_SESSION);
        assert_eq!(race.await.unwrap().unwrap(), ResumeOutcome::Invalidated);

        // The losing RESUMED wait is gone too.
        dispatch_event(&registry, event::RESUMED);
    }

    #[tokio::test]
    async fn test_closed_outbound_is_an_error() {
        let registry = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let result = negotiate(&registry, &tx, "tok", "sess", 0).await;
        assert!(matches!(result, Err(GatewayError::ConnectionClosed)));
    }
}
