//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::traits::{AgentRunner, AgentTurn, Channel, OutboundSender};
use crate::types::{
    AgentEvent, ChannelHealth, ExitReport, InboundMessage, InvocationMode, OutboundMessage,
    StopSignal, TurnRequest, TurnSummary,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// RecordingSender
// ---------------------------------------------------------------------------

/// Outbound sender that records everything it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboundSender for RecordingSender {
    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeChannel
// ---------------------------------------------------------------------------

/// Fake channel for testing. Inbound messages are injected through the
/// sender returned by `new`; `recv` fails once that sender is dropped.
#[derive(Debug)]
pub struct FakeChannel {
    id: String,
    self_user_id: Option<String>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    outbound: Arc<RecordingSender>,
}

impl FakeChannel {
    pub fn new(self_user_id: Option<&str>) -> (Self, mpsc::Sender<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let channel = Self {
            id: "fake".into(),
            self_user_id: self_user_id.map(str::to_owned),
            inbound_rx,
            outbound: Arc::new(RecordingSender::new()),
        };
        (channel, inbound_tx)
    }

    pub fn recorder(&self) -> Arc<RecordingSender> {
        Arc::clone(&self.outbound)
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn self_user_id(&self) -> Option<&str> {
        self.self_user_id.as_deref()
    }

    async fn recv(&mut self) -> Result<InboundMessage> {
        self.inbound_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("fake channel closed"))
    }

    fn sender(&self) -> Arc<dyn OutboundSender> {
        Arc::clone(&self.outbound) as Arc<dyn OutboundSender>
    }

    async fn probe(&self) -> ChannelHealth {
        ChannelHealth::Healthy
    }
}

// ---------------------------------------------------------------------------
// FakeAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum FakeBehavior {
    Reply,
    HoldUntilCancelled,
    FailSpawn,
}

/// Fake agent runner with scripted turns.
///
/// Records every invocation mode and prompt so tests can assert start vs.
/// resume behavior and how many turns actually ran.
#[derive(Debug)]
pub struct FakeAgent {
    reply: String,
    cost_usd: f64,
    behavior: FakeBehavior,
    invocations: Mutex<Vec<InvocationMode>>,
    prompts: Mutex<Vec<String>>,
    next_session: AtomicUsize,
}

impl FakeAgent {
    /// Every turn replies with `reply` and exits cleanly.
    pub fn new(reply: impl Into<String>) -> Self {
        Self::with_behavior(reply.into(), FakeBehavior::Reply)
    }

    /// Every turn stays running until its cancel token fires.
    pub fn holding() -> Self {
        Self::with_behavior(String::new(), FakeBehavior::HoldUntilCancelled)
    }

    /// Every turn fails to spawn.
    pub fn failing() -> Self {
        Self::with_behavior(String::new(), FakeBehavior::FailSpawn)
    }

    #[must_use]
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    fn with_behavior(reply: String, behavior: FakeBehavior) -> Self {
        Self {
            reply,
            cost_usd: 0.01,
            behavior,
            invocations: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            next_session: AtomicUsize::new(1),
        }
    }

    pub fn invocations(&self) -> Vec<InvocationMode> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentRunner for FakeAgent {
    async fn run(&self, request: TurnRequest) -> Result<AgentTurn> {
        if matches!(self.behavior, FakeBehavior::FailSpawn) {
            anyhow::bail!("failed to spawn agent: fake spawn failure");
        }

        let mode = match request.session_id {
            Some(session_id) => InvocationMode::Resume { session_id },
            None => {
                let n = self.next_session.fetch_add(1, Ordering::SeqCst);
                InvocationMode::Start {
                    session_id: format!("fake-session-{n}"),
                }
            }
        };
        self.invocations.lock().unwrap().push(mode.clone());
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let session_id = mode.session_id().to_owned();
        let started = AgentEvent::SessionStarted {
            session_id: session_id.clone(),
        };

        let events = match self.behavior {
            FakeBehavior::HoldUntilCancelled => {
                let cancel = request.cancel.clone();
                futures::stream::iter(vec![started])
                    .chain(futures::stream::once(async move {
                        cancel.cancelled().await;
                        AgentEvent::Exited(ExitReport {
                            code: None,
                            stopped_by: Some(StopSignal::Graceful),
                        })
                    }))
                    .boxed()
            }
            _ => futures::stream::iter(vec![
                started,
                AgentEvent::Text(self.reply.clone()),
                AgentEvent::Completed(TurnSummary {
                    result: Some(self.reply.clone()),
                    cost_usd: self.cost_usd,
                    session_id: Some(session_id),
                    num_turns: Some(1),
                    ..Default::default()
                }),
                AgentEvent::Exited(ExitReport {
                    code: Some(0),
                    stopped_by: None,
                }),
            ])
            .boxed(),
        };

        Ok(AgentTurn { mode, events })
    }
}
