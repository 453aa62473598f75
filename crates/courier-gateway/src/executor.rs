use anyhow::Result;
use async_trait::async_trait;
use courier_agent::AgentError;
use courier_core::{AgentEvent, AgentRunner, ExitReport, TurnRequest};
use futures::StreamExt;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::delivery::ChunkedDelivery;
use crate::registry::TurnGuard;

/// Where a turn's output goes: a chat thread or a task's sinks.
#[async_trait]
pub(crate) trait TurnOutput: Send {
    /// One user-facing text block, in stream order.
    async fn text(&mut self, text: &str) -> Result<()>;

    /// The turn could not produce a reply.
    async fn failure(&mut self, message: &str) -> Result<()>;

    /// Called once after the event stream ended.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TurnOutcome {
    /// Nothing was spawned; the session is untouched.
    SpawnFailed,
    Finished {
        session_id: String,
        exit: ExitReport,
        cost_usd: f64,
        delivered: bool,
    },
}

/// Run one agent turn for the claimed session and stream its output.
///
/// The guard is consumed, so the session goes idle when this returns no
/// matter how the turn ended.
pub(crate) async fn run_turn(
    runner: &dyn AgentRunner,
    guard: TurnGuard,
    prompt: String,
    allowed_tools: Vec<String>,
    output: &mut dyn TurnOutput,
) -> TurnOutcome {
    let span = info_span!(
        "turn",
        session = %guard.key(),
        resume = guard.session_id().is_some(),
    );
    run_turn_inner(runner, guard, prompt, allowed_tools, output)
        .instrument(span)
        .await
}

async fn run_turn_inner(
    runner: &dyn AgentRunner,
    guard: TurnGuard,
    prompt: String,
    allowed_tools: Vec<String>,
    output: &mut dyn TurnOutput,
) -> TurnOutcome {
    let request = TurnRequest {
        session_id: guard.session_id(),
        prompt,
        allowed_tools,
        cancel: guard.cancel_token(),
    };

    let turn = match runner.run(request).await {
        Ok(turn) => turn,
        Err(error) => {
            let message = match error.downcast_ref::<AgentError>() {
                Some(AgentError::Spawn { binary, .. }) => {
                    format!("Failed to start the agent (`{binary}` could not be launched).")
                }
                _ => format!("Failed to start the agent: {error}"),
            };
            warn!(error = %format!("{error:#}"), "agent turn failed to start");
            report(output.failure(&message).await);
            return TurnOutcome::SpawnFailed;
        }
    };

    guard.record_start(&turn.mode);
    info!(
        session_id = turn.mode.session_id(),
        start = turn.mode.is_start(),
        "agent turn started"
    );

    let mut events = turn.events;
    let mut delivered = false;
    let mut result_text = None;
    let mut cost_usd = 0.0;
    let mut exit = ExitReport::default();

    while let Some(event) = events.next().await {
        match event {
            AgentEvent::SessionStarted { session_id } => guard.record_session_id(&session_id),
            AgentEvent::TextDelta(delta) => debug!(len = delta.len(), "agent text delta"),
            AgentEvent::Text(text) => {
                delivered = true;
                report(output.text(&text).await);
            }
            AgentEvent::ToolUse { name } => debug!(tool = %name, "agent tool use"),
            AgentEvent::Completed(summary) => {
                cost_usd = summary.cost_usd;
                guard.add_cost(summary.cost_usd);
                if let Some(session_id) = &summary.session_id {
                    guard.record_session_id(session_id);
                }
                info!(
                    cost_usd = summary.cost_usd,
                    num_turns = ?summary.num_turns,
                    duration_ms = ?summary.duration_ms,
                    is_error = summary.is_error,
                    "agent turn completed"
                );
                result_text = summary.result;
            }
            AgentEvent::Exited(report) => {
                exit = report;
                break;
            }
        }
    }

    if !delivered
        && let Some(text) = result_text.filter(|t| !t.trim().is_empty())
    {
        delivered = true;
        report(output.text(&text).await);
    }

    if !delivered && exit.stopped_by.is_none() && !exit.success() {
        let message = match exit.code {
            Some(code) => format!("The agent exited with code {code} without replying."),
            None => "The agent exited without replying.".to_owned(),
        };
        report(output.failure(&message).await);
    }

    report(output.finish().await);

    info!(
        code = ?exit.code,
        stopped_by = ?exit.stopped_by,
        delivered,
        "agent turn finished"
    );

    TurnOutcome::Finished {
        session_id: guard.session_id().unwrap_or_default(),
        exit,
        cost_usd,
        delivered,
    }
}

fn report(result: Result<()>) {
    if let Err(error) = result {
        warn!(error = %format!("{error:#}"), "failed to deliver turn output");
    }
}

/// Output to a chat thread, chunked and paced.
#[derive(Debug)]
pub(crate) struct ThreadOutput {
    delivery: ChunkedDelivery,
}

impl ThreadOutput {
    pub(crate) fn new(delivery: ChunkedDelivery) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl TurnOutput for ThreadOutput {
    async fn text(&mut self, text: &str) -> Result<()> {
        self.delivery.deliver(text).await
    }

    async fn failure(&mut self, message: &str) -> Result<()> {
        self.delivery.deliver(message).await
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryLimits;
    use crate::registry::SessionRegistry;
    use courier_core::fakes::{FakeAgent, RecordingSender};
    use courier_core::{
        AgentTurn, ConversationKey, InvocationMode, OutboundSender, ReplyTarget, StopSignal,
        TurnSummary,
    };
    use std::sync::{Arc, Mutex};

    /// Runner that replays a fixed event list.
    struct ScriptedAgent {
        events: Mutex<Option<Vec<AgentEvent>>>,
    }

    impl ScriptedAgent {
        fn new(events: Vec<AgentEvent>) -> Self {
            Self {
                events: Mutex::new(Some(events)),
            }
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedAgent {
        async fn run(&self, _request: TurnRequest) -> Result<AgentTurn> {
            let events = self.events.lock().unwrap().take().unwrap();
            Ok(AgentTurn {
                mode: InvocationMode::Start {
                    session_id: "scripted".to_owned(),
                },
                events: futures::stream::iter(events).boxed(),
            })
        }
    }

    fn key() -> ConversationKey {
        ConversationKey::thread("D1", None)
    }

    fn thread_output(recorder: &Arc<RecordingSender>) -> ThreadOutput {
        ThreadOutput::new(ChunkedDelivery::new(
            Arc::clone(recorder) as Arc<dyn OutboundSender>,
            ReplyTarget {
                channel: "D1".to_owned(),
                thread_ts: None,
            },
            DeliveryLimits {
                pacing: std::time::Duration::ZERO,
                ..DeliveryLimits::default()
            },
        ))
    }

    fn texts(recorder: &RecordingSender) -> Vec<String> {
        recorder.sent().into_iter().map(|m| m.text).collect()
    }

    #[tokio::test]
    async fn first_turn_starts_and_records_session() {
        let registry = Arc::new(SessionRegistry::in_memory());
        let agent = FakeAgent::new("hi there").with_cost(0.02);
        let recorder = Arc::new(RecordingSender::new());

        let guard = registry.mark_busy(&key()).unwrap();
        let outcome = run_turn(
            &agent,
            guard,
            "hello".to_owned(),
            Vec::new(),
            &mut thread_output(&recorder),
        )
        .await;

        assert!(matches!(outcome, TurnOutcome::Finished { delivered: true, .. }));
        assert_eq!(texts(&recorder), vec!["hi there"]);
        let status = registry.status(&key());
        assert!(!status.busy);
        assert_eq!(status.session.session_id.as_deref(), Some("fake-session-1"));
        assert_eq!(status.session.message_count, 1);
        assert!((status.session.total_cost_usd - 0.02).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn second_turn_resumes() {
        let registry = Arc::new(SessionRegistry::in_memory());
        let agent = FakeAgent::new("ok");
        let recorder = Arc::new(RecordingSender::new());

        for prompt in ["one", "two"] {
            let guard = registry.mark_busy(&key()).unwrap();
            run_turn(
                &agent,
                guard,
                prompt.to_owned(),
                Vec::new(),
                &mut thread_output(&recorder),
            )
            .await;
        }

        let invocations = agent.invocations();
        assert!(invocations[0].is_start());
        assert_eq!(
            invocations[1],
            InvocationMode::Resume {
                session_id: "fake-session-1".to_owned()
            }
        );
        assert_eq!(registry.resolve(&key()).message_count, 2);
    }

    #[tokio::test]
    async fn spawn_failure_reports_and_leaves_session_idle() {
        let registry = Arc::new(SessionRegistry::in_memory());
        let recorder = Arc::new(RecordingSender::new());

        let guard = registry.mark_busy(&key()).unwrap();
        let outcome = run_turn(
            &FakeAgent::failing(),
            guard,
            "hello".to_owned(),
            Vec::new(),
            &mut thread_output(&recorder),
        )
        .await;

        assert_eq!(outcome, TurnOutcome::SpawnFailed);
        let sent = texts(&recorder);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("Failed to start the agent"));

        let status = registry.status(&key());
        assert!(!status.busy);
        assert_eq!(status.session.session_id, None);
        assert_eq!(status.session.message_count, 0);
    }

    #[tokio::test]
    async fn result_text_is_used_when_no_text_blocks() {
        let registry = Arc::new(SessionRegistry::in_memory());
        let recorder = Arc::new(RecordingSender::new());
        let agent = ScriptedAgent::new(vec![
            AgentEvent::TextDelta("par".to_owned()),
            AgentEvent::Completed(TurnSummary {
                result: Some("final answer".to_owned()),
                cost_usd: 0.1,
                ..Default::default()
            }),
            AgentEvent::Exited(ExitReport {
                code: Some(0),
                stopped_by: None,
            }),
        ]);

        let guard = registry.mark_busy(&key()).unwrap();
        run_turn(&agent, guard, "q".to_owned(), Vec::new(), &mut thread_output(&recorder)).await;

        assert_eq!(texts(&recorder), vec!["final answer"]);
    }

    #[tokio::test]
    async fn silent_nonzero_exit_reports_failure() {
        let registry = Arc::new(SessionRegistry::in_memory());
        let recorder = Arc::new(RecordingSender::new());
        let agent = ScriptedAgent::new(vec![AgentEvent::Exited(ExitReport {
            code: Some(2),
            stopped_by: None,
        })]);

        let guard = registry.mark_busy(&key()).unwrap();
        run_turn(&agent, guard, "q".to_owned(), Vec::new(), &mut thread_output(&recorder)).await;

        assert_eq!(
            texts(&recorder),
            vec!["The agent exited with code 2 without replying."]
        );
        assert!(!registry.status(&key()).busy);
    }

    #[tokio::test]
    async fn stopped_turn_is_not_a_failure() {
        let registry = Arc::new(SessionRegistry::in_memory());
        let recorder = Arc::new(RecordingSender::new());
        let agent = ScriptedAgent::new(vec![
            AgentEvent::Text("partial".to_owned()),
            AgentEvent::Exited(ExitReport {
                code: None,
                stopped_by: Some(StopSignal::Forceful),
            }),
        ]);

        let guard = registry.mark_busy(&key()).unwrap();
        let outcome =
            run_turn(&agent, guard, "q".to_owned(), Vec::new(), &mut thread_output(&recorder))
                .await;

        assert_eq!(texts(&recorder), vec!["partial"]);
        assert!(matches!(
            outcome,
            TurnOutcome::Finished { exit: ExitReport { stopped_by: Some(StopSignal::Forceful), .. }, .. }
        ));
    }

    #[tokio::test]
    async fn stop_ends_held_turn() {
        let registry = Arc::new(SessionRegistry::in_memory());
        let recorder = Arc::new(RecordingSender::new());
        let agent = Arc::new(FakeAgent::holding());

        let guard = registry.mark_busy(&key()).unwrap();
        let turn = {
            let agent = Arc::clone(&agent);
            let recorder = Arc::clone(&recorder);
            tokio::spawn(async move {
                run_turn(
                    agent.as_ref(),
                    guard,
                    "q".to_owned(),
                    Vec::new(),
                    &mut thread_output(&recorder),
                )
                .await
            })
        };

        while agent.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(registry.stop(&key()));
        turn.await.unwrap();

        assert!(recorder.is_empty());
        let status = registry.status(&key());
        assert!(!status.busy);
        assert_eq!(status.session.session_id.as_deref(), Some("fake-session-1"));
    }
}
