//! Agent event stream decoding.
//!
//! The agent writes newline-delimited JSON on stdout. Each line decodes into a
//! tagged [`AgentEvent`]; unknown event types map to [`AgentEvent::Other`] and
//! lines that are not JSON at all are counted as malformed and dropped.

use serde::Deserialize;
use serde_json::Value;

/// Item kinds that represent one tool invocation by the agent.
const TOOL_ITEM_KINDS: &[&str] = &[
    "command_execution",
    "file_change",
    "mcp_tool_call",
    "web_search",
    "tool_call",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "thread.started", alias = "session.started")]
    SessionStarted {
        #[serde(alias = "session_id")]
        thread_id: String,
    },
    #[serde(rename = "turn.started")]
    TurnStarted {},
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<Value>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(rename = "item.started")]
    ItemStarted { item: EventItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: EventItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: EventItem },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Payload of `item.*` events. Only the fields the runner reads are modelled.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EventItem {
    #[serde(default, rename = "type", alias = "item_type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub changes: Vec<FileChange>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub kind: Option<String>,
}

impl AgentEvent {
    /// True for events that mark completed work (resets the stall timer).
    pub fn is_progress(&self) -> bool {
        matches!(self, Self::ItemCompleted { .. } | Self::TurnCompleted { .. })
    }

    /// True when this event closes one tool invocation.
    pub fn is_tool_call(&self) -> bool {
        match self {
            Self::ItemCompleted { item } => TOOL_ITEM_KINDS.contains(&item.kind.as_str()),
            _ => false,
        }
    }
}

/// Result of decoding one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(AgentEvent),
    Blank,
    Malformed,
}

pub fn decode_line(line: &str) -> Decoded {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Decoded::Blank;
    }
    match serde_json::from_str::<AgentEvent>(trimmed) {
        Ok(event) => Decoded::Event(event),
        Err(_) => Decoded::Malformed,
    }
}

/// Facts accumulated from the event stream of one agent run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub session_id: Option<String>,
    pub events: u32,
    pub malformed: u32,
    pub tool_calls: u32,
    pub progress_events: u32,
    /// Paths from `file_change` items in first-seen order, deduplicated.
    pub files_modified: Vec<String>,
    pub last_message: Option<String>,
    pub errors: Vec<String>,
}

impl StreamSummary {
    /// Fold one decoded line into the summary.
    pub fn observe(&mut self, decoded: &Decoded) {
        let event = match decoded {
            Decoded::Event(event) => event,
            Decoded::Malformed => {
                self.malformed += 1;
                return;
            }
            Decoded::Blank => return,
        };
        self.events += 1;
        if event.is_progress() {
            self.progress_events += 1;
        }
        if event.is_tool_call() {
            self.tool_calls += 1;
        }
        match event {
            AgentEvent::SessionStarted { thread_id } => {
                self.session_id = Some(thread_id.clone());
            }
            AgentEvent::ItemCompleted { item } => {
                for change in &item.changes {
                    if !self.files_modified.contains(&change.path) {
                        self.files_modified.push(change.path.clone());
                    }
                }
                if item.kind == "agent_message"
                    && let Some(text) = &item.text
                {
                    self.last_message = Some(text.clone());
                }
            }
            AgentEvent::TurnFailed { error: Some(error) } => {
                self.errors.push(error.to_string());
            }
            AgentEvent::Error { message } if !message.is_empty() => {
                self.errors.push(message.clone());
            }
            _ => {}
        }
    }
}

/// Command text carried by a `command_execution` item, if any.
pub fn command_text(event: &AgentEvent) -> Option<&str> {
    match event {
        AgentEvent::ItemStarted { item } if item.kind == "command_execution" => {
            item.command.as_deref()
        }
        _ => None,
    }
}
