use serde::{Deserialize, Serialize};

/// A resumable logical conversation with the gateway. `id` is absent until
/// a session is established; `sequence` tracks the last dispatch frame's
/// server-assigned counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub id: Option<String>,
    #[serde(default)]
    pub sequence: u64,
}

impl Session {
    pub fn new(id: Option<String>, sequence: u64) -> Self {
        Self { id, sequence }
    }
}
