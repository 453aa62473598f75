use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::{FilterConfig, SourceConfig};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Produces the items an event-poll task reacts to.
#[async_trait]
pub(crate) trait Source: Send + Sync {
    fn describe(&self) -> String;

    async fn poll(&self) -> Result<Vec<String>>;
}

/// Runs a shell command; every non-empty stdout line is one item.
#[derive(Debug)]
pub(crate) struct CommandSource {
    command: String,
    workdir: PathBuf,
}

impl CommandSource {
    pub(crate) fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Source for CommandSource {
    fn describe(&self) -> String {
        format!("command `{}`", self.command)
    }

    async fn poll(&self) -> Result<Vec<String>> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to run source command `{}`", self.command))?;

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "source command `{}` timed out after {}s",
                    self.command,
                    COMMAND_TIMEOUT.as_secs()
                )
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "source command `{}` failed ({}): {}",
                self.command,
                output.status,
                stderr.trim()
            );
        }

        let items: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        debug!(command = %self.command, items = items.len(), "source polled");
        Ok(items)
    }
}

pub(crate) fn build_sources(configs: &[SourceConfig], config_dir: &Path) -> Vec<Box<dyn Source>> {
    configs
        .iter()
        .map(|config| match config {
            SourceConfig::Command { command } => {
                Box::new(CommandSource::new(command, config_dir)) as Box<dyn Source>
            }
        })
        .collect()
}

/// Case-insensitive keyword match on item text. No keywords admits all.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeywordFilter {
    keywords: Vec<String>,
}

impl KeywordFilter {
    pub(crate) fn new(config: Option<&FilterConfig>) -> Self {
        let keywords = config
            .map(|c| {
                c.keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self { keywords }
    }

    pub(crate) fn matches(&self, item: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let item = item.to_lowercase();
        self.keywords.iter().any(|k| item.contains(k.as_str()))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_lines_become_items() {
        let dir = tempfile::tempdir().unwrap();
        let source = CommandSource::new("printf 'a\\n\\n  b  \\nc\\n'", dir.path());
        assert_eq!(source.poll().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn command_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("items.txt"), "one\ntwo\n").unwrap();
        let source = CommandSource::new("cat items.txt", dir.path());
        assert_eq!(source.poll().await.unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = CommandSource::new("echo boom >&2; exit 4", dir.path());
        let err = source.poll().await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("boom"), "{message}");
    }

    #[test]
    fn keyword_filter_is_case_insensitive() {
        let filter = KeywordFilter::new(Some(&FilterConfig {
            keywords: vec!["Rust".to_owned(), " tokio ".to_owned()],
        }));
        assert!(filter.matches("New RUST release"));
        assert!(filter.matches("tokio 2.0"));
        assert!(!filter.matches("Go 1.30 is out"));
    }

    #[test]
    fn empty_filter_admits_everything() {
        assert!(KeywordFilter::new(None).matches("anything"));
        let blank = KeywordFilter::new(Some(&FilterConfig {
            keywords: vec![String::new()],
        }));
        assert!(blank.matches("anything"));
    }

    #[test]
    fn builds_one_source_per_config() {
        let sources = build_sources(
            &[SourceConfig::Command {
                command: "echo hi".to_owned(),
            }],
            Path::new("/tmp"),
        );
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].describe(), "command `echo hi`");
    }
}
