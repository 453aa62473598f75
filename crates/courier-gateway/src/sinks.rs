use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use courier_channels::SlackWebClient;
use courier_core::{OutboundSender, ReplyTarget};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{Config, SinkConfig, resolve_config_path, secret_from_env};
use crate::delivery::{ChunkedDelivery, DeliveryLimits};
use crate::executor::TurnOutput;

/// Final destination for a task's output.
#[async_trait]
pub(crate) trait Sink: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn deliver(&self, task: &str, text: &str) -> Result<()>;
}

/// Shared handles sinks are built from.
#[derive(Clone)]
pub(crate) struct SinkContext {
    pub config_dir: PathBuf,
    pub slack: Option<Arc<dyn OutboundSender>>,
    pub limits: DeliveryLimits,
    pub http: reqwest::Client,
}

impl std::fmt::Debug for SinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkContext")
            .field("config_dir", &self.config_dir)
            .field("slack", &self.slack.is_some())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SinkContext {
    /// Slack posting uses the relay's bot token variable when a relay is
    /// configured, `SLACK_BOT_TOKEN` otherwise. Without a token, slack sinks
    /// are unavailable.
    pub(crate) fn from_config(config: &Config, config_dir: &Path) -> Self {
        let (token_env, api_base, limits) = match &config.relay {
            Some(relay) => (
                relay.bot_token_env.as_str(),
                relay.api_base.as_str(),
                DeliveryLimits::from(&relay.delivery),
            ),
            None => (
                "SLACK_BOT_TOKEN",
                courier_channels::slack::DEFAULT_API_BASE,
                DeliveryLimits::default(),
            ),
        };

        let slack = match secret_from_env(token_env) {
            Ok(token) => Some(Arc::new(SlackWebClient::new(token).with_base_url(api_base))
                as Arc<dyn OutboundSender>),
            Err(error) => {
                debug!(error = %error, "slack sinks unavailable");
                None
            }
        };

        Self {
            config_dir: config_dir.to_path_buf(),
            slack,
            limits,
            http: reqwest::Client::new(),
        }
    }
}

/// Posts to a Slack channel, chunked and paced like a relay reply.
pub(crate) struct SlackSink {
    sender: Arc<dyn OutboundSender>,
    target: ReplyTarget,
    limits: DeliveryLimits,
}

impl std::fmt::Debug for SlackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSink")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Sink for SlackSink {
    fn kind(&self) -> &'static str {
        "slack"
    }

    async fn deliver(&self, _task: &str, text: &str) -> Result<()> {
        let mut delivery =
            ChunkedDelivery::new(Arc::clone(&self.sender), self.target.clone(), self.limits);
        delivery.deliver(text).await
    }
}

/// Appends a timestamped section to a file.
#[derive(Debug)]
pub(crate) struct FileSink {
    path_template: PathBuf,
}

impl FileSink {
    fn path_for(&self, task: &str) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let rendered = self
            .path_template
            .to_string_lossy()
            .replace("{task}", task)
            .replace("{date}", &date);
        PathBuf::from(rendered)
    }
}

#[async_trait]
impl Sink for FileSink {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn deliver(&self, task: &str, text: &str) -> Result<()> {
        let path = self.path_for(task);
        let section = format!(
            "## {task} ({})\n\n{}\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            text.trim_end()
        );

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            file.write_all(section.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(())
        })
        .await
        .context("file sink task panicked")?
    }
}

/// POSTs `{"task": ..., "text": ...}` as JSON.
#[derive(Debug)]
pub(crate) struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

#[async_trait]
impl Sink for WebhookSink {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, task: &str, text: &str) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&json!({ "task": task, "text": text }))
            .send()
            .await
            .with_context(|| format!("webhook request to {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("webhook {} rejected the delivery", self.url))?;
        Ok(())
    }
}

pub(crate) fn build_sinks(configs: &[SinkConfig], ctx: &SinkContext) -> Result<Vec<Box<dyn Sink>>> {
    configs
        .iter()
        .map(|config| -> Result<Box<dyn Sink>> {
            Ok(match config {
                SinkConfig::Slack { channel, thread_ts } => {
                    let sender = ctx.slack.as_ref().with_context(|| {
                        format!("slack sink for {channel} needs a bot token in the environment")
                    })?;
                    Box::new(SlackSink {
                        sender: Arc::clone(sender),
                        target: ReplyTarget {
                            channel: channel.clone(),
                            thread_ts: thread_ts.clone(),
                        },
                        limits: ctx.limits,
                    })
                }
                SinkConfig::File { path } => Box::new(FileSink {
                    path_template: resolve_config_path(&ctx.config_dir, path),
                }),
                SinkConfig::Webhook { url } => Box::new(WebhookSink {
                    http: ctx.http.clone(),
                    url: url.clone(),
                }),
            })
        })
        .collect()
}

/// Buffers a task turn's text and hands it to every sink once the turn ends.
pub(crate) struct SinkOutput {
    task: String,
    sinks: Vec<Box<dyn Sink>>,
    buffer: String,
    failed: bool,
}

impl SinkOutput {
    pub(crate) fn new(task: impl Into<String>, sinks: Vec<Box<dyn Sink>>) -> Self {
        Self {
            task: task.into(),
            sinks,
            buffer: String::new(),
            failed: false,
        }
    }
}

impl std::fmt::Debug for SinkOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkOutput")
            .field("task", &self.task)
            .field("sinks", &self.sinks.len())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TurnOutput for SinkOutput {
    async fn text(&mut self, text: &str) -> Result<()> {
        if !self.buffer.is_empty() {
            self.buffer.push_str("\n\n");
        }
        self.buffer.push_str(text);
        Ok(())
    }

    async fn failure(&mut self, message: &str) -> Result<()> {
        self.failed = true;
        warn!(task.name = %self.task, message, "task turn failed");
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if self.failed || self.buffer.trim().is_empty() {
            debug!(task.name = %self.task, "no task output to deliver");
            return Ok(());
        }

        let span = info_span!("task_deliver", task.name = %self.task, sinks = self.sinks.len());
        async {
            let mut failures = 0;
            for sink in &self.sinks {
                match sink.deliver(&self.task, &self.buffer).await {
                    Ok(()) => info!(sink = sink.kind(), "task output delivered"),
                    Err(error) => {
                        failures += 1;
                        warn!(sink = sink.kind(), error = %format!("{error:#}"), "sink delivery failed");
                    }
                }
            }
            anyhow::ensure!(failures == 0, "{failures} of {} sinks failed", self.sinks.len());
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::fakes::RecordingSender;
    use mockito::Matcher;

    fn ctx(dir: &Path, slack: Option<Arc<RecordingSender>>) -> SinkContext {
        SinkContext {
            config_dir: dir.to_path_buf(),
            slack: slack.map(|s| s as Arc<dyn OutboundSender>),
            limits: DeliveryLimits {
                pacing: std::time::Duration::ZERO,
                ..DeliveryLimits::default()
            },
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn file_sink_appends_sections() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = build_sinks(
            &[SinkConfig::File {
                path: "out/{task}.md".to_owned(),
            }],
            &ctx(dir.path(), None),
        )
        .unwrap();

        sinks[0].deliver("brief", "first run").await.unwrap();
        sinks[0].deliver("brief", "second run").await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("out/brief.md")).unwrap();
        assert_eq!(content.matches("## brief (").count(), 2);
        let first = content.find("first run").unwrap();
        let second = content.find("second run").unwrap();
        assert!(first < second);
    }

    #[test]
    fn file_sink_substitutes_date() {
        let sink = FileSink {
            path_template: PathBuf::from("/data/{task}-{date}.md"),
        };
        let date = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(
            sink.path_for("news"),
            PathBuf::from(format!("/data/news-{date}.md"))
        );
    }

    #[tokio::test]
    async fn webhook_sink_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({"task": "pr-review", "text": "LGTM"})))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sinks = build_sinks(
            &[SinkConfig::Webhook {
                url: format!("{}/hook", server.url()),
            }],
            &ctx(dir.path(), None),
        )
        .unwrap();
        sinks[0].deliver("pr-review", "LGTM").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn webhook_error_status_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hook")
            .with_status(500)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sinks = build_sinks(
            &[SinkConfig::Webhook {
                url: format!("{}/hook", server.url()),
            }],
            &ctx(dir.path(), None),
        )
        .unwrap();
        assert!(sinks[0].deliver("t", "x").await.is_err());
    }

    #[tokio::test]
    async fn slack_sink_posts_to_channel() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(RecordingSender::new());
        let sinks = build_sinks(
            &[SinkConfig::Slack {
                channel: "C9".to_owned(),
                thread_ts: None,
            }],
            &ctx(dir.path(), Some(Arc::clone(&recorder))),
        )
        .unwrap();
        sinks[0].deliver("t", "summary").await.unwrap();

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "C9");
        assert_eq!(sent[0].text, "summary");
    }

    #[test]
    fn slack_sink_without_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = build_sinks(
            &[SinkConfig::Slack {
                channel: "C9".to_owned(),
                thread_ts: None,
            }],
            &ctx(dir.path(), None),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sink_output_joins_text_and_skips_failed_turns() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(RecordingSender::new());
        let sinks = || {
            build_sinks(
                &[SinkConfig::Slack {
                    channel: "C9".to_owned(),
                    thread_ts: None,
                }],
                &ctx(dir.path(), Some(Arc::clone(&recorder))),
            )
            .unwrap()
        };

        let mut output = SinkOutput::new("t", sinks());
        output.text("part one").await.unwrap();
        output.text("part two").await.unwrap();
        output.finish().await.unwrap();
        assert_eq!(recorder.take()[0].text, "part one\n\npart two");

        let mut output = SinkOutput::new("t", sinks());
        output.failure("agent crashed").await.unwrap();
        output.finish().await.unwrap();
        assert!(recorder.is_empty());
    }
}
