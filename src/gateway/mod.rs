pub mod events;
pub mod heartbeat;
pub mod registry;
pub mod resume;
pub mod session;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use events::{event, opcode, Frame, GatewayMessage};
use heartbeat::HeartbeatMonitor;
use registry::{PendingWait, SubscriptionRegistry};
use resume::ResumeOutcome;
use session::Session;

#[derive(Debug)]
pub enum GatewayError {
    Connect(tokio_tungstenite::tungstenite::Error),
    NotStarted,
    NotConnected,
    ConnectionClosed,
    Protocol(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Connect(e) => write!(f, "gateway connect failed: {e}"),
            GatewayError::NotStarted => write!(f, "gateway client was never started"),
            GatewayError::NotConnected => write!(f, "gateway connection is not open"),
            GatewayError::ConnectionClosed => write!(f, "gateway connection closed"),
            GatewayError::Protocol(msg) => write!(f, "gateway protocol violation: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Connection lifecycle. Terminal only on explicit shutdown; every failure
/// loops back through `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    AwaitingHello,
    Authenticating,
    Established,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: String,
    pub intents: u64,
}

enum ConnectionEnd {
    Shutdown,
    Restart(&'static str),
}

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Client for the gateway: owns one logical session, drives the
/// connect → hello → identify-or-resume → established state machine, and
/// fans inbound frames out to subscribers.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: GatewayConfig,
    registry: Arc<SubscriptionRegistry>,
    session: Mutex<Session>,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<GatewayMessage>>>,
    ready_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl GatewayClient {
    /// Create a client. Pass a `Session` with an id to attempt a resume on
    /// the first connection; `Session::default()` identifies fresh. No IO
    /// happens until `start`.
    pub fn new(config: GatewayConfig, session: Session) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                registry: SubscriptionRegistry::new(),
                session: Mutex::new(session),
                state: Mutex::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                ready_tx,
                shutdown_tx,
                started: AtomicBool::new(false),
            }),
        };

        // The gateway may request an immediate heartbeat at any time.
        let weak = Arc::downgrade(&client.inner);
        client
            .inner
            .registry
            .add_opcodes(vec![opcode::HEARTBEAT], move |_| {
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!("gateway requested an immediate heartbeat");
                    let _ = inner.queue(GatewayMessage::new(opcode::HEARTBEAT, json!({})));
                }
            });

        client
    }

    /// Spawn the connection loop. The returned handle completes only after
    /// `shutdown`.
    pub fn start(&self) -> JoinHandle<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("gateway client already started");
            return tokio::spawn(async {});
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run().await })
    }

    /// Request the connection loop to stop after tearing down the socket.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Serialize and write one frame. No acknowledgement is awaited.
    pub fn send(&self, op: u8, data: serde_json::Value) -> Result<(), GatewayError> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(GatewayError::NotStarted);
        }
        self.inner.queue(GatewayMessage::new(op, data))
    }

    pub fn subscribe_opcodes<F>(&self, opcodes: Vec<u8>, callback: F) -> String
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.inner.registry.add_opcodes(opcodes, callback)
    }

    pub fn subscribe_events<F>(&self, events: Vec<String>, callback: F) -> String
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.inner.registry.add_events(events, callback)
    }

    pub fn unsubscribe(&self, id: &str) {
        self.inner.registry.remove(id);
    }

    /// Cancellable single-shot wait for the next frame with `op`.
    pub fn await_opcode(&self, op: u8) -> PendingWait {
        self.inner.registry.await_opcode(op)
    }

    /// Cancellable single-shot wait for the next dispatch frame named `name`.
    pub fn await_event(&self, name: &str) -> PendingWait {
        self.inner.registry.await_event(name)
    }

    /// Wait until the connection first reaches `Established`. Completes
    /// immediately on every later call.
    pub async fn ready(&self) -> Result<(), GatewayError> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(GatewayError::NotStarted);
        }
        let mut rx = self.inner.ready_tx.subscribe();
        while !*rx.borrow_and_update() {
            rx.changed()
                .await
                .map_err(|_| GatewayError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Snapshot of the current session (id + sequence), for persistence.
    pub fn session(&self) -> Session {
        self.inner.session()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }
}

impl ClientInner {
    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut delay = RECONNECT_BASE_DELAY;
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match Arc::clone(&self).run_connection().await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Restart(reason)) => {
                    tracing::warn!("gateway connection lost ({reason}), reconnecting");
                    delay = RECONNECT_BASE_DELAY;
                }
                Err(e) => {
                    tracing::warn!("gateway connection failed: {e}, retrying in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("gateway client stopped");
    }

    /// One socket lifetime: connect, drive the handshake, stay until a
    /// restart condition. Teardown (socket, writer, pump, heartbeat) is
    /// unconditional on the way out, so no two sockets are ever live for
    /// the same logical connection.
    async fn run_connection(self: Arc<Self>) -> Result<ConnectionEnd, GatewayError> {
        self.set_state(ConnectionState::AwaitingHello);
        let (ws, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(GatewayError::Connect)?;
        tracing::debug!("gateway socket open");
        let (mut sink, mut stream) = ws.split();

        // Fresh outbound channel per socket; the single writer task keeps
        // at most one frame in flight.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<GatewayMessage>();
        self.set_outbound(Some(out_tx.clone()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        // Register before the pump starts so a fast hello cannot slip by.
        let hello_wait = self.registry.await_opcode(opcode::HELLO);

        let pump_inner = Arc::clone(&self);
        let mut pump = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => pump_inner.handle_frame(&text),
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        let mut heartbeat = None;
        let result = self
            .drive(&mut pump, hello_wait, out_tx, &mut heartbeat)
            .await;

        drop(heartbeat);
        pump.abort();
        writer.abort();
        self.set_outbound(None);
        self.set_state(ConnectionState::Disconnected);
        result
    }

    async fn drive(
        &self,
        pump: &mut JoinHandle<()>,
        mut hello_wait: PendingWait,
        out_tx: mpsc::UnboundedSender<GatewayMessage>,
        heartbeat: &mut Option<HeartbeatMonitor>,
    ) -> Result<ConnectionEnd, GatewayError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(ConnectionEnd::Shutdown);
        }

        let hello = tokio::select! {
            frame = hello_wait.wait() => frame.ok_or(GatewayError::ConnectionClosed)?,
            _ = &mut *pump => return Ok(ConnectionEnd::Restart("socket closed awaiting hello")),
            _ = shutdown.changed() => return Ok(ConnectionEnd::Shutdown),
        };
        let interval = hello
            .data
            .get("heartbeat_interval")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                GatewayError::Protocol("hello frame missing heartbeat_interval".into())
            })?;
        if interval == 0 {
            return Err(GatewayError::Protocol(
                "hello heartbeat_interval must be positive".into(),
            ));
        }
        tracing::debug!("gateway says hello, heartbeat interval {interval}ms");

        self.set_state(ConnectionState::Authenticating);
        let (monitor, mut hb_timeout) = HeartbeatMonitor::spawn(
            Duration::from_millis(interval),
            &self.registry,
            out_tx.clone(),
        );
        *heartbeat = Some(monitor);

        let session = self.session();
        if let Some(session_id) = session.id {
            let negotiation = resume::negotiate(
                &self.registry,
                &out_tx,
                &self.config.token,
                &session_id,
                session.sequence,
            );
            tokio::pin!(negotiation);
            let outcome = tokio::select! {
                outcome = &mut negotiation => outcome?,
                _ = &mut *pump => return Ok(ConnectionEnd::Restart("socket closed during resume")),
                _ = &mut hb_timeout => return Ok(ConnectionEnd::Restart("heartbeat timeout")),
                _ = shutdown.changed() => return Ok(ConnectionEnd::Shutdown),
            };
            if outcome == ResumeOutcome::Invalidated {
                self.clear_session_id();
                return Ok(ConnectionEnd::Restart("session invalidated during resume"));
            }
        } else {
            let mut ready_wait = self.registry.await_event(event::READY);
            out_tx
                .send(identify(&self.config))
                .map_err(|_| GatewayError::ConnectionClosed)?;
            let ready = tokio::select! {
                frame = ready_wait.wait() => frame.ok_or(GatewayError::ConnectionClosed)?,
                _ = &mut *pump => return Ok(ConnectionEnd::Restart("socket closed during identify")),
                _ = &mut hb_timeout => return Ok(ConnectionEnd::Restart("heartbeat timeout")),
                _ = shutdown.changed() => return Ok(ConnectionEnd::Shutdown),
            };
            let session_id = ready
                .data
                .get("session_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::Protocol("ready frame missing session_id".into()))?
                .to_string();
            tracing::info!("established new session {session_id}");
            self.set_session_id(session_id);
        }

        self.set_state(ConnectionState::Established);
        self.ready_tx.send_replace(true);

        // An unsolicited invalid-session while established forces a fresh
        // identify on the next connection.
        let mut invalid_wait = self.registry.await_opcode(opcode::INVALID_SESSION);
        let end = tokio::select! {
            _ = &mut *pump => ConnectionEnd::Restart("socket closed"),
            _ = &mut hb_timeout => ConnectionEnd::Restart("heartbeat timeout"),
            frame = invalid_wait.wait() => {
                if frame.is_some() {
                    self.clear_session_id();
                }
                ConnectionEnd::Restart("session invalidated")
            }
            _ = shutdown.changed() => ConnectionEnd::Shutdown,
        };
        Ok(end)
    }

    /// Decode one inbound frame, track its sequence number, then fan out.
    /// Sequence tracking happens exactly once, before dispatch, so every
    /// subscriber observes a consistent session snapshot.
    fn handle_frame(&self, text: &str) {
        let msg: GatewayMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("ignoring undecodable gateway frame: {e}");
                return;
            }
        };
        if let Some(seq) = msg.s {
            if let Ok(mut session) = self.session.lock() {
                session.sequence = seq;
            }
        }
        self.registry.dispatch(&Frame::from(msg));
    }

    fn queue(&self, msg: GatewayMessage) -> Result<(), GatewayError> {
        match self.outbound.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx.send(msg).map_err(|_| GatewayError::NotConnected),
                None => Err(GatewayError::NotConnected),
            },
            Err(_) => Err(GatewayError::NotConnected),
        }
    }

    fn session(&self) -> Session {
        self.session.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_session_id(&self, id: String) {
        if let Ok(mut session) = self.session.lock() {
            session.id = Some(id);
        }
    }

    fn clear_session_id(&self) {
        if let Ok(mut session) = self.session.lock() {
            session.id = None;
        }
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<GatewayMessage>>) {
        if let Ok(mut guard) = self.outbound.lock() {
            *guard = tx;
        }
    }
}

fn identify(config: &GatewayConfig) -> GatewayMessage {
    GatewayMessage::new(
        opcode::IDENTIFY,
        json!({
            "token": config.token,
            "intents": config.intents,
            "properties": {
                "$os": std::env::consts::OS,
                "$browser": env!("CARGO_PKG_NAME"),
                "$device": env!("CARGO_PKG_NAME"),
            },
        }),
    )
}
