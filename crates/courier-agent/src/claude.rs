use crate::error::AgentError;
use crate::process::ProcessSupervisor;
use crate::stream::parse_line;
use anyhow::Result;
use async_trait::async_trait;
use courier_core::{AgentEvent, AgentRunner, AgentTurn, InvocationMode, TurnRequest};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

/// How long to keep reading stdout after the process exits. Bounds the wait
/// when an orphaned grandchild still holds the pipe open.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub binary: String,
    pub model: Option<String>,
    /// Inserted before the generated arguments.
    pub extra_args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Time between the graceful and the forceful stop signal.
    pub stop_grace: Duration,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_owned(),
            model: None,
            extra_args: Vec::new(),
            workdir: None,
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Runs one turn of the `claude` CLI per call, in print mode with
/// line-delimited JSON output.
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    config: ClaudeConfig,
}

impl ClaudeRunner {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, mode: &InvocationMode, allowed_tools: &[String]) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        args.extend(
            ["-p", "--output-format", "stream-json", "--verbose"]
                .into_iter()
                .map(str::to_owned),
        );
        if let Some(model) = &self.config.model {
            args.push("--model".to_owned());
            args.push(model.clone());
        }
        if !allowed_tools.is_empty() {
            args.push("--allowedTools".to_owned());
            args.push(allowed_tools.join(","));
        }
        match mode {
            InvocationMode::Start { session_id } => {
                args.push("--session-id".to_owned());
                args.push(session_id.clone());
            }
            InvocationMode::Resume { session_id } => {
                args.push("--resume".to_owned());
                args.push(session_id.clone());
            }
        }
        args
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(&self, request: TurnRequest) -> Result<AgentTurn> {
        let mode = match request.session_id {
            Some(session_id) => InvocationMode::Resume { session_id },
            None => InvocationMode::Start {
                session_id: uuid::Uuid::new_v4().to_string(),
            },
        };

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.build_args(&mode, &request.allowed_tools))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.workdir {
            cmd.current_dir(dir);
        }
        // Own process group so a stop reaches every tool subprocess too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
            binary: self.config.binary.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(AgentError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(AgentError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(AgentError::MissingPipe("stderr"))?;

        let span = info_span!(
            "agent_turn",
            session_id = %mode.session_id(),
            resume = !mode.is_start(),
            pid = ?child.id(),
        );
        info!(parent: &span, "agent process spawned");

        let prompt = request.prompt;
        tokio::spawn(
            async move {
                let mut stdin = stdin;
                if let Err(error) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %error, "failed to write prompt to agent stdin");
                }
            }
            .instrument(span.clone()),
        );
        tokio::spawn(log_stderr(stderr).instrument(span.clone()));

        let (tx, rx) = mpsc::channel(64);
        let mut reader = tokio::spawn(read_events(stdout, tx.clone()).instrument(span.clone()));

        let supervisor = ProcessSupervisor::new(child, self.config.stop_grace);
        let cancel = request.cancel;
        // Dropping the event stream early stops the whole process group.
        let stop_on_drop = cancel.clone().drop_guard();
        tokio::spawn(
            async move {
                let report = supervisor.supervise(cancel).await;
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
                    .await
                    .is_err()
                {
                    warn!("agent output still open after exit, abandoning reader");
                    reader.abort();
                }
                info!(code = ?report.code, stopped_by = ?report.stopped_by, "agent turn finished");
                let _ = tx.send(AgentEvent::Exited(report)).await;
            }
            .instrument(span),
        );

        let events = futures::stream::unfold(
            (rx, stop_on_drop),
            |(mut rx, stop_on_drop)| async move {
                rx.recv().await.map(|event| (event, (rx, stop_on_drop)))
            },
        )
        .boxed();

        Ok(AgentTurn { mode, events })
    }
}

async fn read_events(stdout: ChildStdout, tx: mpsc::Sender<AgentEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                for event in parse_line(&line) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(error) => {
                warn!(error = %error, "failed to read agent output");
                return;
            }
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(line = %line, "agent stderr");
    }
}
