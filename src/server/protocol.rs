//! WebSocket event framing: every frame is `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::broadcast::LogItem;
use crate::error::BuildError;
use crate::models::{BuildRequest, SessionId};

/// Events a client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StartBuild(BuildRequest),
    Cancel,
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ClientEvent {
    /// Parse one text frame. The error is a client-facing description.
    pub fn parse(text: &str) -> Result<ClientEvent, String> {
        let frame: RawFrame =
            serde_json::from_str(text).map_err(|e| format!("malformed frame: {}", e))?;
        match frame.event.as_str() {
            "start_build" => {
                let data = if frame.data.is_null() {
                    serde_json::Value::Object(Default::default())
                } else {
                    frame.data
                };
                serde_json::from_value::<BuildRequest>(data)
                    .map(ClientEvent::StartBuild)
                    .map_err(|e| format!("malformed start_build payload: {}", e))
            }
            "cancel" => Ok(ClientEvent::Cancel),
            other => Err(format!("unknown event '{}'", other)),
        }
    }
}

/// Events the server emits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Started { session_id: SessionId },
    Log { log: String },
    /// Terminal. `zip_url` is set only when the session reached `Done`
    Done { zip_url: Option<String> },
    Rejected { error: String, message: String },
}

impl ServerEvent {
    pub fn rejected(err: &BuildError) -> Self {
        ServerEvent::Rejected {
            error: err.kind().to_string(),
            message: err.user_message(),
        }
    }

    pub fn from_log(item: LogItem) -> Self {
        match item {
            LogItem::Chunk(chunk) => ServerEvent::Log { log: chunk.text },
            LogItem::Lagged { skipped } => ServerEvent::Log {
                log: format!("[log] {} earlier chunks dropped, output continues\n", skipped),
            },
        }
    }

    pub fn to_json(&self) -> String {
        // Plain enum of strings and options; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
