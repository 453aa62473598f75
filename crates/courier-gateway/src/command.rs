use crate::registry::{SessionRegistry, SessionStatus};
use courier_core::ConversationKey;

/// In-band control directives. Anything else is a normal message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Status,
    Stop,
    New,
    Help,
}

impl Command {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "#status" => Some(Self::Status),
            "#stop" => Some(Self::Stop),
            "#new" => Some(Self::New),
            "#help" => Some(Self::Help),
            _ => None,
        }
    }
}

/// Remove leading `<@U…>` mention tokens and surrounding whitespace.
pub(crate) fn strip_mentions(text: &str) -> &str {
    let mut rest = text.trim();
    while let Some(after) = rest.strip_prefix("<@") {
        let Some(end) = after.find('>') else {
            break;
        };
        rest = after[end + 1..].trim_start();
    }
    rest.trim_end()
}

/// The directive at the start of `text`, which must already be stripped of
/// mentions. Matching is exact and case-sensitive.
pub(crate) fn parse_command(text: &str) -> Option<Command> {
    let first = text.split_whitespace().next()?;
    Command::from_token(first)
}

/// Apply `command` to the conversation and produce the reply text.
pub(crate) fn execute(command: Command, registry: &SessionRegistry, key: &ConversationKey) -> String {
    match command {
        Command::Status => format_status(&registry.status(key)),
        Command::Stop => {
            if registry.stop(key) {
                "Stopping the agent…".to_owned()
            } else {
                "No active turn to stop.".to_owned()
            }
        }
        Command::New => {
            if registry.reset(key) {
                "Stopped the running turn and started a new session. Your next message begins fresh."
                    .to_owned()
            } else {
                "Started a new session. Your next message begins fresh.".to_owned()
            }
        }
        Command::Help => help_text().to_owned(),
    }
}

fn format_status(status: &SessionStatus) -> String {
    let session = &status.session;
    format!(
        "Conversation: {}\nSession: {}\nMessages: {}\nCost: ${:.4}\nBusy: {}\nLast activity: {}",
        session.key,
        session.session_id.as_deref().unwrap_or("none"),
        session.message_count,
        session.total_cost_usd,
        if status.busy { "yes" } else { "no" },
        session.last_activity.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

fn help_text() -> &'static str {
    "Available commands:\n\
     #status - show session info\n\
     #stop - stop the running agent turn\n\
     #new - start a fresh session\n\
     #help - show this message"
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::InvocationMode;
    use std::sync::Arc;

    #[test]
    fn strips_leading_mentions() {
        assert_eq!(strip_mentions("<@UBOT> #status"), "#status");
        assert_eq!(strip_mentions("  <@UBOT>  <@U2> hi there "), "hi there");
        assert_eq!(strip_mentions("hi <@UBOT>"), "hi <@UBOT>");
        assert_eq!(strip_mentions("<@UBOT>"), "");
        assert_eq!(strip_mentions("<@broken"), "<@broken");
    }

    #[test]
    fn recognizes_directives_at_start() {
        assert_eq!(parse_command("#status"), Some(Command::Status));
        assert_eq!(parse_command("#stop now please"), Some(Command::Stop));
        assert_eq!(parse_command("#new"), Some(Command::New));
        assert_eq!(parse_command("#help"), Some(Command::Help));
    }

    #[test]
    fn other_text_is_not_a_command() {
        assert_eq!(parse_command("#STATUS"), None);
        assert_eq!(parse_command("#statusx"), None);
        assert_eq!(parse_command("#deploy prod"), None);
        assert_eq!(parse_command("what is #status"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn status_reports_session_fields() {
        let registry = Arc::new(SessionRegistry::in_memory());
        let key = ConversationKey::thread("C1", Some("1.1".to_owned()));
        let guard = registry.mark_busy(&key).unwrap();
        guard.record_start(&InvocationMode::Start {
            session_id: "sess-9".to_owned(),
        });
        guard.add_cost(0.125);

        let reply = execute(Command::Status, &registry, &key);
        assert!(reply.contains("Conversation: slack:C1:1.1"));
        assert!(reply.contains("Session: sess-9"));
        assert!(reply.contains("Messages: 1"));
        assert!(reply.contains("Cost: $0.1250"));
        assert!(reply.contains("Busy: yes"));
    }

    #[test]
    fn stop_without_turn_is_a_noop() {
        let registry = SessionRegistry::in_memory();
        let key = ConversationKey::thread("D1", None);
        assert_eq!(
            execute(Command::Stop, &registry, &key),
            "No active turn to stop."
        );
        assert!(!registry.status(&key).busy);
    }

    #[test]
    fn help_lists_every_command() {
        let registry = SessionRegistry::in_memory();
        let reply = execute(Command::Help, &registry, &ConversationKey::thread("D1", None));
        for token in ["#status", "#stop", "#new", "#help"] {
            assert!(reply.contains(token), "{token}");
        }
    }
}
