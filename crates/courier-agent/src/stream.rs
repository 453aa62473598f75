//! Parsing for the agent binary's line-delimited `stream-json` output.

use courier_core::{AgentEvent, TurnSummary};
use serde_json::Value;
use tracing::{debug, trace};

/// Parse one output line into zero or more agent events.
///
/// A single assistant line can carry several content blocks (text and tool
/// use), so one line may yield multiple events. Lines that are not JSON, or
/// JSON of a type we don't relay, yield nothing.
pub fn parse_line(line: &str) -> Vec<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }

    let Ok(value) = serde_json::from_str::<Value>(line) else {
        debug!(line, "non-JSON agent output");
        return Vec::new();
    };

    match value.get("type").and_then(Value::as_str) {
        Some("system") => parse_system(&value).into_iter().collect(),
        Some("assistant") => parse_assistant(&value),
        Some("stream_event") => parse_stream_event(&value).into_iter().collect(),
        Some("result") => vec![AgentEvent::Completed(parse_result(&value))],
        other => {
            trace!(kind = ?other, "ignoring agent output line");
            Vec::new()
        }
    }
}

fn parse_system(value: &Value) -> Option<AgentEvent> {
    if value.get("subtype").and_then(Value::as_str) != Some("init") {
        return None;
    }
    let session_id = value.get("session_id").and_then(Value::as_str)?;
    Some(AgentEvent::SessionStarted {
        session_id: session_id.to_owned(),
    })
}

fn parse_assistant(value: &Value) -> Vec<AgentEvent> {
    let Some(blocks) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => block
                .get("text")
                .and_then(Value::as_str)
                .filter(|text| !text.trim().is_empty())
                .map(|text| AgentEvent::Text(text.to_owned())),
            Some("tool_use") => Some(AgentEvent::ToolUse {
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_owned(),
            }),
            _ => None,
        })
        .collect()
}

fn parse_stream_event(value: &Value) -> Option<AgentEvent> {
    let delta = value.get("event")?.get("delta")?;
    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
        return None;
    }
    delta
        .get("text")
        .and_then(Value::as_str)
        .map(|text| AgentEvent::TextDelta(text.to_owned()))
}

fn parse_result(value: &Value) -> TurnSummary {
    TurnSummary {
        result: value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_owned),
        cost_usd: value
            .get("total_cost_usd")
            .or_else(|| value.get("cost_usd"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        session_id: value
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_owned),
        num_turns: value
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_line() {
        let events = parse_line(r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#);
        assert_eq!(
            events,
            vec![AgentEvent::SessionStarted {
                session_id: "abc-123".to_owned()
            }]
        );
    }

    #[test]
    fn non_init_system_lines_are_ignored() {
        assert!(parse_line(r#"{"type":"system","subtype":"compact","session_id":"x"}"#).is_empty());
    }

    #[test]
    fn parse_assistant_blocks_in_order() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Looking at the diff."},
            {"type":"tool_use","name":"Bash","input":{"command":"git diff"}},
            {"type":"text","text":"   "}
        ]}}"#
            .replace('\n', "");
        let events = parse_line(&line);
        assert_eq!(
            events,
            vec![
                AgentEvent::Text("Looking at the diff.".to_owned()),
                AgentEvent::ToolUse {
                    name: "Bash".to_owned()
                },
            ]
        );
    }

    #[test]
    fn parse_text_delta() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}"#;
        assert_eq!(
            parse_line(line),
            vec![AgentEvent::TextDelta("Hel".to_owned())]
        );
    }

    #[test]
    fn parse_result_summary() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","total_cost_usd":0.0421,"num_turns":3,"duration_ms":5120,"session_id":"abc-123"}"#;
        let events = parse_line(line);
        let [AgentEvent::Completed(summary)] = events.as_slice() else {
            panic!("expected one Completed event, got {events:?}");
        };
        assert_eq!(summary.result.as_deref(), Some("done"));
        assert!((summary.cost_usd - 0.0421).abs() < f64::EPSILON);
        assert_eq!(summary.num_turns, Some(3));
        assert_eq!(summary.duration_ms, Some(5120));
        assert_eq!(summary.session_id.as_deref(), Some("abc-123"));
        assert!(!summary.is_error);
    }

    #[test]
    fn result_without_cost_defaults_to_zero() {
        let events = parse_line(r#"{"type":"result","is_error":true}"#);
        let [AgentEvent::Completed(summary)] = events.as_slice() else {
            panic!("expected Completed");
        };
        assert!(summary.is_error);
        assert!(summary.cost_usd.abs() < f64::EPSILON);
    }

    #[test]
    fn plain_text_and_unknown_lines_yield_nothing() {
        assert!(parse_line("warning: something").is_empty());
        assert!(parse_line(r#"{"type":"user","message":{}}"#).is_empty());
        assert!(parse_line("   ").is_empty());
    }
}
