use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Identifies a relay conversation or a pipeline task.
///
/// This is the session registry's primary key. It stays stable for the
/// lifetime of the conversation (or task), across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKey {
    /// A chat conversation. `thread` is the root message timestamp, or `None`
    /// for the top level of a direct-message channel.
    Thread {
        channel: String,
        thread: Option<String>,
    },
    /// A scheduled or event-driven pipeline task, keyed by task name.
    Task(String),
}

impl ConversationKey {
    pub fn thread(channel: impl Into<String>, thread: Option<String>) -> Self {
        Self::Thread {
            channel: channel.into(),
            thread,
        }
    }

    pub fn task(name: impl Into<String>) -> Self {
        Self::Task(name.into())
    }

    pub fn is_task(&self) -> bool {
        matches!(self, Self::Task(_))
    }

    /// Where replies for this conversation go. Tasks have no chat target.
    pub fn reply_target(&self) -> Option<ReplyTarget> {
        match self {
            Self::Thread { channel, thread } => Some(ReplyTarget {
                channel: channel.clone(),
                thread_ts: thread.clone(),
            }),
            Self::Task(_) => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread {
                channel,
                thread: Some(thread),
            } => write!(f, "slack:{channel}:{thread}"),
            Self::Thread {
                channel,
                thread: None,
            } => write!(f, "slack:{channel}"),
            Self::Task(name) => write!(f, "task:{name}"),
        }
    }
}

/// A chat destination: a channel, optionally narrowed to one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub channel: String,
    pub thread_ts: Option<String>,
}

// ---------------------------------------------------------------------------
// Transport messages
// ---------------------------------------------------------------------------

/// How an inbound message addressed the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundKind {
    /// A plain message event (DMs, thread replies, bot chatter).
    Message,
    /// An explicit mention of the relay's bot user.
    Mention,
}

/// One inbound event, already acknowledged at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform event identifier, used for replay detection.
    pub event_id: String,
    pub kind: InboundKind,
    /// Sender user id. Absent for some bot and system messages.
    pub sender: Option<String>,
    /// Set when the platform marks the sender as a bot integration.
    pub bot_id: Option<String>,
    /// Platform message subtype (`bot_message`, `message_changed`, ...).
    pub subtype: Option<String>,
    pub channel: String,
    pub is_direct: bool,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// An outbound message to be posted through a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub thread_ts: Option<String>,
    pub text: String,
}

impl OutboundMessage {
    pub fn reply(target: &ReplyTarget, text: impl Into<String>) -> Self {
        Self {
            channel: target.channel.clone(),
            thread_ts: target.thread_ts.clone(),
            text: text.into(),
        }
    }
}

/// Health status of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelHealth {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

// ---------------------------------------------------------------------------
// Agent subprocess
// ---------------------------------------------------------------------------

/// How the agent binary was invoked for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationMode {
    /// New session; `session_id` is the fresh identifier handed to the binary.
    Start { session_id: String },
    /// Continuation of an existing session.
    Resume { session_id: String },
}

impl InvocationMode {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Start { session_id } | Self::Resume { session_id } => session_id,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start { .. })
    }
}

/// Which termination signal ended a stopped process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopSignal {
    Graceful,
    Forceful,
}

/// How the agent process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// Set when the process was stopped on request rather than exiting on its own.
    pub stopped_by: Option<StopSignal>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.stopped_by.is_none() && self.code == Some(0)
    }
}

/// Terminal usage/cost summary emitted once per turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TurnSummary {
    pub result: Option<String>,
    pub cost_usd: f64,
    pub is_error: bool,
    pub session_id: Option<String>,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
}

/// One typed event from the agent's line-delimited output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The binary announced (or echoed) its session identifier.
    SessionStarted { session_id: String },
    /// Partial text increment.
    TextDelta(String),
    /// A complete user-facing text block.
    Text(String),
    ToolUse { name: String },
    Completed(TurnSummary),
    /// Always the last event of a turn.
    Exited(ExitReport),
}

/// Input for one agent turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Existing session to resume; `None` starts a new session.
    pub session_id: Option<String>,
    pub prompt: String,
    pub allowed_tools: Vec<String>,
    /// Cancelled by the stop command; the runner terminates the process group.
    pub cancel: CancellationToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_display() {
        let dm = ConversationKey::thread("D123", None);
        let thread = ConversationKey::thread("C9", Some("1700000000.000100".to_owned()));
        let task = ConversationKey::task("news-brief");

        assert_eq!(dm.to_string(), "slack:D123");
        assert_eq!(thread.to_string(), "slack:C9:1700000000.000100");
        assert_eq!(task.to_string(), "task:news-brief");
    }

    #[test]
    fn task_keys_have_no_reply_target() {
        assert!(ConversationKey::task("x").reply_target().is_none());

        let target = ConversationKey::thread("C1", Some("1.2".to_owned()))
            .reply_target()
            .expect("thread target");
        assert_eq!(target.channel, "C1");
        assert_eq!(target.thread_ts.as_deref(), Some("1.2"));
    }

    #[test]
    fn exit_report_success_requires_clean_exit() {
        assert!(
            ExitReport {
                code: Some(0),
                stopped_by: None
            }
            .success()
        );
        assert!(
            !ExitReport {
                code: Some(0),
                stopped_by: Some(StopSignal::Graceful)
            }
            .success()
        );
        assert!(!ExitReport::default().success());
    }
}
