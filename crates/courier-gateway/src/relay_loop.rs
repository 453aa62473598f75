use anyhow::Result;
use courier_core::{
    AgentRunner, Channel, ConversationKey, InboundKind, InboundMessage, OutboundMessage,
    OutboundSender, ReplyTarget,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::command::{self, parse_command, strip_mentions};
use crate::dedup::DedupFilter;
use crate::delivery::{ChunkedDelivery, DeliveryLimits};
use crate::executor::{ThreadOutput, run_turn};
use crate::loop_guard::is_self_originated;
use crate::registry::SessionRegistry;

pub(crate) const BUSY_NOTICE: &str =
    "Still working on the previous message. Send #stop to cancel it.";

/// Everything the relay needs besides the channel itself.
pub(crate) struct RelayContext {
    pub registry: Arc<SessionRegistry>,
    pub runner: Arc<dyn AgentRunner>,
    pub dedup: DedupFilter,
    pub allowed_tools: Vec<String>,
    pub limits: DeliveryLimits,
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("allowed_tools", &self.allowed_tools)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

pub(crate) async fn run_relay_loop<C: Channel>(
    mut channel: C,
    ctx: Arc<RelayContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let sender = channel.sender();
    let self_user_id = channel.self_user_id().map(str::to_owned);
    info!(channel = channel.id(), self_user_id = ?self_user_id, "relay loop listening");

    // Each conversation has at most one turn in flight; different
    // conversations run concurrently.
    let mut turns = JoinSet::new();

    loop {
        let inbound = tokio::select! {
            result = channel.recv() => match result {
                Ok(inbound) => inbound,
                Err(error) => {
                    warn!(error = %error, "relay channel closed");
                    break;
                }
            },
            Some(joined) = turns.join_next(), if !turns.is_empty() => {
                if let Err(error) = joined {
                    warn!(error = %error, "relay turn task failed");
                }
                continue;
            }
            () = shutdown.cancelled() => {
                info!(in_flight = turns.len(), "relay loop shutting down");
                turns.shutdown().await;
                return Ok(());
            }
        };

        handle_inbound(&ctx, &sender, self_user_id.as_deref(), inbound, &mut turns).await;
    }

    while let Some(joined) = turns.join_next().await {
        if let Err(error) = joined {
            warn!(error = %error, "relay turn task failed");
        }
    }
    Ok(())
}

async fn handle_inbound(
    ctx: &Arc<RelayContext>,
    sender: &Arc<dyn OutboundSender>,
    self_user_id: Option<&str>,
    inbound: InboundMessage,
    turns: &mut JoinSet<()>,
) {
    if !ctx.dedup.admit(&inbound.event_id) {
        trace_inbound("duplicate event dropped", &inbound);
        return;
    }
    if is_self_originated(&inbound, self_user_id) {
        trace_inbound("self-originated event dropped", &inbound);
        return;
    }
    let Some(key) = conversation_key(&inbound, self_user_id, &ctx.registry) else {
        trace_inbound("event outside any conversation dropped", &inbound);
        return;
    };
    let Some(target) = key.reply_target() else {
        return;
    };

    let text = strip_mentions(&inbound.text);
    if text.is_empty() {
        trace_inbound("empty message dropped", &inbound);
        return;
    }

    // Commands act immediately, even while a turn is running. Replies go
    // out from the task set so a slow post never stalls intake.
    if let Some(command) = parse_command(text) {
        info!(session = %key, command = ?command, "relay command");
        let reply = command::execute(command, &ctx.registry, &key);
        spawn_reply(turns, sender, target, reply);
        return;
    }

    ctx.registry.resolve(&key);
    let Some(guard) = ctx.registry.mark_busy(&key) else {
        info!(session = %key, event_id = %inbound.event_id, "session busy, message not run");
        spawn_reply(turns, sender, target, BUSY_NOTICE);
        return;
    };

    trace_inbound("relay message dispatched", &inbound);
    let span = info_span!("relay_turn", session = %key, event_id = %inbound.event_id);
    let ctx = Arc::clone(ctx);
    let sender = Arc::clone(sender);
    let prompt = text.to_owned();
    turns.spawn(
        async move {
            let mut output = ThreadOutput::new(ChunkedDelivery::new(sender, target, ctx.limits));
            run_turn(
                ctx.runner.as_ref(),
                guard,
                prompt,
                ctx.allowed_tools.clone(),
                &mut output,
            )
            .await;
        }
        .instrument(span),
    );
}

/// Map an inbound message to the conversation it belongs to.
///
/// Mentions open (or continue) a thread conversation rooted at the mentioned
/// message. Direct messages are keyed by thread, or by the whole DM channel
/// at top level. Plain channel replies only count inside threads the relay
/// already has a session for; replies that mention the relay are left to the
/// matching mention event.
pub(crate) fn conversation_key(
    msg: &InboundMessage,
    self_user_id: Option<&str>,
    registry: &SessionRegistry,
) -> Option<ConversationKey> {
    match msg.kind {
        InboundKind::Mention => Some(ConversationKey::thread(
            &msg.channel,
            Some(msg.thread_ts.clone().unwrap_or_else(|| msg.ts.clone())),
        )),
        InboundKind::Message if msg.is_direct => {
            Some(ConversationKey::thread(&msg.channel, msg.thread_ts.clone()))
        }
        InboundKind::Message => {
            let thread = msg.thread_ts.as_ref()?;
            if let Some(own) = self_user_id
                && msg.text.contains(&format!("<@{own}>"))
            {
                return None;
            }
            let key = ConversationKey::thread(&msg.channel, Some(thread.clone()));
            registry.contains(&key).then_some(key)
        }
    }
}

fn spawn_reply(
    turns: &mut JoinSet<()>,
    sender: &Arc<dyn OutboundSender>,
    target: ReplyTarget,
    text: impl Into<String>,
) {
    let sender = Arc::clone(sender);
    let message = OutboundMessage::reply(&target, text);
    turns.spawn(async move {
        if let Err(error) = sender.send(message).await {
            warn!(error = %format!("{error:#}"), channel = %target.channel, "failed to send relay reply");
        }
    });
}

fn trace_inbound(message: &'static str, inbound: &InboundMessage) {
    debug!(
        event_id = %inbound.event_id,
        kind = ?inbound.kind,
        sender = ?inbound.sender,
        channel = %inbound.channel,
        thread_ts = ?inbound.thread_ts,
        "{message}"
    );
}
