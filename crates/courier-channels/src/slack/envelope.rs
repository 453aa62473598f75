//! Socket Mode frame parsing.

use anyhow::{Context, Result};
use chrono::Utc;
use courier_core::{InboundKind, InboundMessage};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Hello,
    /// The server is about to close the socket (refresh, maintenance).
    Disconnect { reason: Option<String> },
    /// Anything carrying an `envelope_id`. Must be acknowledged even when it
    /// holds no event we relay.
    Envelope {
        envelope_id: String,
        message: Option<Box<InboundMessage>>,
    },
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    envelope_id: Option<String>,
    reason: Option<String>,
    payload: Option<RawPayload>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    event_id: Option<String>,
    event: Option<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    user: Option<String>,
    bot_id: Option<String>,
    subtype: Option<String>,
    #[serde(default)]
    text: String,
    channel: Option<String>,
    channel_type: Option<String>,
    ts: Option<String>,
    thread_ts: Option<String>,
}

pub(crate) fn parse_frame(text: &str) -> Result<Frame> {
    let raw: RawFrame = serde_json::from_str(text).context("invalid socket mode frame")?;

    match (raw.kind.as_str(), raw.envelope_id) {
        ("hello", _) => Ok(Frame::Hello),
        ("disconnect", _) => Ok(Frame::Disconnect { reason: raw.reason }),
        (kind, Some(envelope_id)) => {
            let message = if kind == "events_api" {
                raw.payload.and_then(inbound_from_payload).map(Box::new)
            } else {
                None
            };
            Ok(Frame::Envelope {
                envelope_id,
                message,
            })
        }
        (kind, None) => Ok(Frame::Unknown(kind.to_owned())),
    }
}

/// Acknowledgment for one envelope.
pub(crate) fn ack_payload(envelope_id: &str) -> String {
    json!({ "envelope_id": envelope_id }).to_string()
}

fn inbound_from_payload(payload: RawPayload) -> Option<InboundMessage> {
    let event = payload.event?;
    let kind = match event.kind.as_str() {
        "message" => InboundKind::Message,
        "app_mention" => InboundKind::Mention,
        _ => return None,
    };
    let channel = event.channel?;
    let ts = event.ts?;
    let event_id = payload
        .event_id
        .unwrap_or_else(|| format!("{channel}:{ts}"));

    Some(InboundMessage {
        event_id,
        kind,
        sender: event.user,
        bot_id: event.bot_id,
        subtype: event.subtype,
        is_direct: event.channel_type.as_deref() == Some("im"),
        channel,
        ts,
        thread_ts: event.thread_ts,
        text: event.text,
        received_at: Utc::now(),
    })
}
