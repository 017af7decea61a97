use serde::{Deserialize, Serialize};

/// Opcodes for gateway messages.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RESUME: u8 = 6;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Dispatch event names the client cares about.
pub mod event {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
}

/// Gateway message envelope. `s` and `t` are only present on
/// dispatch-class frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    pub fn new(op: u8, data: serde_json::Value) -> Self {
        Self {
            op,
            d: Some(data),
            s: None,
            t: None,
        }
    }
}

/// A decoded inbound message, as handed to subscribers. Constructed per
/// frame and never retained beyond dispatch.
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: u8,
    pub data: serde_json::Value,
    pub sequence: Option<u64>,
    pub event: Option<String>,
}

impl From<GatewayMessage> for Frame {
    fn from(msg: GatewayMessage) -> Self {
        Frame {
            opcode: msg.op,
            data: msg.d.unwrap_or_else(|| serde_json::json!({})),
            sequence: msg.s,
            event: msg.t,
        }
    }
}
