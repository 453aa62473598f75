//! Core trait definitions for Courier.
//!
//! These define the contracts between components. Implementations live in
//! other crates (courier-agent for the agent runner, courier-channels for
//! transports).

use crate::types::{
    AgentEvent, ChannelHealth, InboundMessage, InvocationMode, OutboundMessage, TurnRequest,
};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// Posts messages through a transport. Clonable handles are shared by every
/// session that delivers output; implementations serialize the actual writes.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, msg: OutboundMessage) -> Result<()>;
}

/// A long-lived chat transport (Slack Socket Mode, fakes in tests).
#[async_trait]
pub trait Channel: Send {
    /// Unique identifier for this channel.
    fn id(&self) -> &str;

    /// The relay's own user id on this transport, resolved once at connect.
    fn self_user_id(&self) -> Option<&str>;

    /// Receive the next inbound message (waits until one is available).
    async fn recv(&mut self) -> Result<InboundMessage>;

    /// Shared handle for outbound messages.
    fn sender(&self) -> Arc<dyn OutboundSender>;

    /// Probe health of this channel.
    async fn probe(&self) -> ChannelHealth;
}

// ---------------------------------------------------------------------------
// Agent runner
// ---------------------------------------------------------------------------

/// Lazy, finite sequence of agent events for one turn. Consumed once.
pub type AgentEventStream = Pin<Box<dyn futures::Stream<Item = AgentEvent> + Send>>;

/// A running agent turn.
pub struct AgentTurn {
    pub mode: InvocationMode,
    pub events: AgentEventStream,
}

impl fmt::Debug for AgentTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentTurn")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Starts or resumes an agent session for one turn.
///
/// An `Err` from `run` means nothing was spawned. Once a turn is returned,
/// its event stream always ends with `AgentEvent::Exited`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: TurnRequest) -> Result<AgentTurn>;
}
