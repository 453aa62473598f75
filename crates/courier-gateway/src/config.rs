use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub(crate) type SharedConfig = Arc<ArcSwap<Config>>;

pub(crate) fn shared_config(config: Config) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// Absent means the chat relay is disabled; tasks still run.
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AgentConfig {
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            model: None,
            workdir: None,
            extra_args: Vec::new(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl AgentConfig {
    pub(crate) fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionsConfig {
    #[serde(default = "default_sessions_dir")]
    pub dir: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: default_sessions_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RelayConfig {
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default = "default_app_token_env")]
    pub app_token_env: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DeliveryConfig {
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_chunk_len: default_max_chunk_len(),
            max_chunks: default_max_chunks(),
            pacing_ms: default_pacing_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TaskConfig {
    pub name: String,
    /// IANA zone for cron evaluation; UTC when unset.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Reset the task's session before every run.
    #[serde(default)]
    pub fresh_session: bool,
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TriggerConfig {
    Cron(String),
    Poll { interval_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FilterConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExecutorConfig {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_file: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum SourceConfig {
    /// Each non-empty stdout line of `sh -c <command>` is one item.
    Command { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum SinkConfig {
    Slack {
        channel: String,
        #[serde(default)]
        thread_ts: Option<String>,
    },
    /// Appends to `path`; `{task}` and `{date}` are substituted.
    File { path: String },
    Webhook { url: String },
}

impl SinkConfig {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Slack { .. } => "slack",
            Self::File { .. } => "file",
            Self::Webhook { .. } => "webhook",
        }
    }
}

/// Relay credentials, read from the environment at startup.
#[derive(Debug, Clone)]
pub(crate) struct SlackCredentials {
    pub bot_token: SecretString,
    pub app_token: SecretString,
}

impl RelayConfig {
    pub(crate) fn credentials(&self) -> Result<SlackCredentials> {
        Ok(SlackCredentials {
            bot_token: secret_from_env(&self.bot_token_env)?,
            app_token: secret_from_env(&self.app_token_env)?,
        })
    }
}

pub(crate) fn secret_from_env(var: &str) -> Result<SecretString> {
    let value = std::env::var(var)
        .with_context(|| format!("environment variable {var} is not set"))?;
    anyhow::ensure!(!value.trim().is_empty(), "environment variable {var} is empty");
    Ok(SecretString::new(value))
}

fn default_agent_binary() -> String {
    "claude".to_owned()
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_sessions_dir() -> String {
    "./data/sessions".to_owned()
}

fn default_bot_token_env() -> String {
    "SLACK_BOT_TOKEN".to_owned()
}

fn default_app_token_env() -> String {
    "SLACK_APP_TOKEN".to_owned()
}

fn default_api_base() -> String {
    courier_channels::slack::DEFAULT_API_BASE.to_owned()
}

fn default_max_chunk_len() -> usize {
    4000
}

fn default_max_chunks() -> usize {
    20
}

fn default_pacing_ms() -> u64 {
    300
}

impl Config {
    /// Load config from a TOML file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub(crate) fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Resolve config path: check arg, then default locations.
    pub(crate) fn find_config_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }

        let local = PathBuf::from("courier.toml");
        if local.exists() {
            return local;
        }

        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            let xdg = PathBuf::from(config_dir).join("courier/courier.toml");
            if xdg.exists() {
                return xdg;
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home).join(".config/courier/courier.toml");
            if home_config.exists() {
                return home_config;
            }
        }

        local
    }
}

/// Resolve a config-relative path against the config file's directory.
pub(crate) fn resolve_config_path(config_dir: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        config_dir.join(path)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.agent.binary, "claude");
        assert_eq!(config.agent.stop_grace_secs, 5);
        assert_eq!(config.sessions.dir, "./data/sessions");
        assert!(config.relay.is_none());
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn parse_relay_section() {
        let config: Config = toml::from_str(
            r#"
[relay]
allowed_tools = ["Read", "Grep"]

[relay.delivery]
max_chunk_len = 3000
"#,
        )
        .unwrap();
        let relay = config.relay.unwrap();
        assert_eq!(relay.bot_token_env, "SLACK_BOT_TOKEN");
        assert_eq!(relay.app_token_env, "SLACK_APP_TOKEN");
        assert_eq!(relay.allowed_tools, vec!["Read", "Grep"]);
        assert_eq!(relay.api_base, "https://slack.com/api");
        assert_eq!(relay.delivery.max_chunk_len, 3000);
        assert_eq!(relay.delivery.max_chunks, 20);
        assert_eq!(relay.delivery.pacing_ms, 300);
    }

    #[test]
    fn parse_cron_task_with_sources_and_sinks() {
        let config: Config = toml::from_str(
            r#"
[[tasks]]
name = "pr-review"
timezone = "Europe/Berlin"
trigger = { cron = "0 8 * * 1-5" }
filter = { keywords = ["rust"] }
executor = { prompt = "Review these PRs.", allowed_tools = ["Bash"] }

[[tasks.sources]]
type = "command"
command = "gh pr list"

[[tasks.sinks]]
type = "slack"
channel = "C0123"

[[tasks.sinks]]
type = "file"
path = "out/{task}-{date}.md"

[[tasks.sinks]]
type = "webhook"
url = "https://example.com/hook"
"#,
        )
        .unwrap();

        let task = config.task("pr-review").unwrap();
        assert_eq!(task.trigger, TriggerConfig::Cron("0 8 * * 1-5".to_owned()));
        assert_eq!(task.timezone.as_deref(), Some("Europe/Berlin"));
        assert!(!task.fresh_session);
        assert_eq!(task.filter.as_ref().unwrap().keywords, vec!["rust"]);
        assert_eq!(task.executor.prompt.as_deref(), Some("Review these PRs."));
        assert_eq!(
            task.sources,
            vec![SourceConfig::Command {
                command: "gh pr list".to_owned()
            }]
        );
        let kinds: Vec<_> = task.sinks.iter().map(SinkConfig::kind).collect();
        assert_eq!(kinds, vec!["slack", "file", "webhook"]);
    }

    #[test]
    fn parse_poll_task() {
        let config: Config = toml::from_str(
            r#"
[[tasks]]
name = "news"
fresh_session = true
trigger = { poll = { interval_secs = 300 } }
executor = { prompt_file = "prompts/news.md" }
"#,
        )
        .unwrap();
        let task = &config.tasks[0];
        assert_eq!(task.trigger, TriggerConfig::Poll { interval_secs: 300 });
        assert!(task.fresh_session);
        assert_eq!(task.executor.prompt_file.as_deref(), Some("prompts/news.md"));
        assert!(task.sinks.is_empty());
    }

    #[test]
    fn unknown_sink_type_is_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[[tasks]]
name = "x"
trigger = { cron = "* * * * *" }
executor = { prompt = "p" }
[[tasks.sinks]]
type = "carrier-pigeon"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn resolve_relative_and_absolute_paths() {
        let base = Path::new("/etc/courier");
        assert_eq!(
            resolve_config_path(base, "data/sessions"),
            PathBuf::from("/etc/courier/data/sessions")
        );
        assert_eq!(
            resolve_config_path(base, "/var/lib/courier"),
            PathBuf::from("/var/lib/courier")
        );
    }

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(
            Config::find_config_path(Some("/tmp/custom.toml")),
            PathBuf::from("/tmp/custom.toml")
        );
    }
}
