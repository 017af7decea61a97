use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::events::{opcode, GatewayMessage};
use super::registry::SubscriptionRegistry;

/// Periodic keep-alive loop bound to one gateway connection.
///
/// Each period the monitor sends a heartbeat frame, unless the previous one
/// went unacknowledged — then it fires the timeout signal exactly once and
/// stops. The acknowledgement subscription is registered on spawn and torn
/// down with the monitor, so a reconnect never has two loops racing on one
/// connection.
pub struct HeartbeatMonitor {
    handle: JoinHandle<()>,
    registry: Arc<SubscriptionRegistry>,
    ack_sub: String,
}

impl HeartbeatMonitor {
    /// Spawn the loop with the interval requested by the hello frame.
    /// Returns the monitor and a receiver that fires if a heartbeat goes
    /// unacknowledged for a full period.
    pub fn spawn(
        interval: Duration,
        registry: &Arc<SubscriptionRegistry>,
        outbound: mpsc::UnboundedSender<GatewayMessage>,
    ) -> (Self, oneshot::Receiver<()>) {
        let acknowledged = Arc::new(AtomicBool::new(true));
        let (timeout_tx, timeout_rx) = oneshot::channel();

        let flag = Arc::clone(&acknowledged);
        let ack_sub = registry.add_opcodes(vec![opcode::HEARTBEAT_ACK], move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !acknowledged.load(Ordering::SeqCst) {
                    tracing::warn!("heartbeat went unacknowledged for a full period");
                    let _ = timeout_tx.send(());
                    return;
                }
                let beat = GatewayMessage::new(opcode::HEARTBEAT, serde_json::json!({}));
                if outbound.send(beat).is_err() {
                    return;
                }
                acknowledged.store(false, Ordering::SeqCst);
            }
        });

        (
            Self {
                handle,
                registry: Arc::clone(registry),
                ack_sub,
            },
            timeout_rx,
        )
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.handle.abort();
        self.registry.remove(&self.ack_sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::events::Frame;
    use tokio::time::timeout;

    fn ack_frame() -> Frame {
        Frame {
            opcode: opcode::HEARTBEAT_ACK,
            data: serde_json::json!({}),
            sequence: None,
            event: None,
        }
    }

    #[tokio::test]
    async fn test_sends_heartbeats_while_acknowledged() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_monitor, mut timed_out) =
            HeartbeatMonitor::spawn(Duration::from_millis(20), &registry, tx);

        for _ in 0..3 {
            let beat = timeout(Duration::from_millis(200), rx.recv())
                .await
                .expect("expected a heartbeat")
                .expect("channel open");
            assert_eq!(beat.op, opcode::HEARTBEAT);
            registry.dispatch(&ack_frame());
        }
        assert!(timed_out.try_recv().is_err(), "no timeout when acks arrive");
    }

    #[tokio::test]
    async fn test_times_out_after_one_missed_ack() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_monitor, timed_out) =
            HeartbeatMonitor::spawn(Duration::from_millis(20), &registry, tx);

        // First heartbeat goes out; nobody acknowledges it.
        let beat = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("expected a heartbeat")
            .expect("channel open");
        assert_eq!(beat.op, opcode::HEARTBEAT);

        timeout(Duration::from_millis(200), timed_out)
            .await
            .expect("expected a timeout signal")
            .expect("signal sent");

        // The loop stopped: no further heartbeats.
        assert!(!matches!(
            timeout(Duration::from_millis(60), rx.recv()).await,
            Ok(Some(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_stops_loop_and_removes_ack_subscription() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (monitor, _timed_out) =
            HeartbeatMonitor::spawn(Duration::from_millis(20), &registry, tx);

        let _ = timeout(Duration::from_millis(200), rx.recv()).await;
        drop(monitor);

        // Ack subscription is gone; dispatching an ack delivers to nobody.
        registry.dispatch(&ack_frame());
        assert!(!matches!(
            timeout(Duration::from_millis(60), rx.recv()).await,
            Ok(Some(_))
        ));
    }
}
