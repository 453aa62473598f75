use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::{
    Config, RelayConfig, SinkConfig, SourceConfig, TaskConfig, TriggerConfig, resolve_config_path,
};
use crate::scheduler::{Trigger, parse_timezone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CheckResult {
    pub name: &'static str,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    fn pass(name: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            name,
            severity,
            passed: true,
            message: message.into(),
        }
    }

    fn fail(name: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            name,
            severity,
            passed: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CheckReport {
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    pub(crate) fn push(&mut self, result: CheckResult) {
        self.results.push(result);
    }

    pub(crate) fn has_errors(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.severity == Severity::Error && !r.passed)
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn has_warnings(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.severity == Severity::Warning && !r.passed)
    }

    fn error_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.severity == Severity::Error && !r.passed)
            .count()
    }

    fn warning_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.severity == Severity::Warning && !r.passed)
            .count()
    }

    /// Failed error-level checks as `name: message` lines.
    pub(crate) fn error_messages(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.severity == Severity::Error && !r.passed)
            .map(|r| format!("{}: {}", r.name, r.message))
            .collect()
    }

    fn format_result(r: &CheckResult) -> String {
        let icon = if r.severity == Severity::Info {
            "·"
        } else if r.passed {
            "✓"
        } else {
            match r.severity {
                Severity::Warning => "⚠",
                _ => "✗",
            }
        };
        format!("{icon} {}", r.message)
    }

    pub(crate) fn to_summary_string(&self) -> String {
        let mut lines: Vec<String> = self.results.iter().map(Self::format_result).collect();
        let errors = self.error_count();
        let warnings = self.warning_count();
        if errors == 0 && warnings == 0 {
            lines.push("\nall checks passed".to_owned());
        } else {
            lines.push(format!("\n{errors} error(s), {warnings} warning(s)"));
        }
        lines.join("\n")
    }

    pub(crate) fn print_human(&self) {
        println!("{}", self.to_summary_string());
    }

    pub(crate) fn print_json(&self) {
        let value = self.to_json_value();
        println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_default()
        );
    }

    pub(crate) fn to_json_value(&self) -> serde_json::Value {
        let checks: Vec<serde_json::Value> = self
            .results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "severity": r.severity.as_str(),
                    "passed": r.passed,
                    "message": r.message,
                })
            })
            .collect();

        serde_json::json!({
            "passed": !self.has_errors(),
            "errors": self.error_count(),
            "warnings": self.warning_count(),
            "checks": checks,
        })
    }
}

pub(crate) fn validate_config(config_path: &Path, config_dir: &Path) -> CheckReport {
    let mut report = CheckReport::default();

    // 1. toml_parse
    let config = match Config::load(config_path) {
        Ok(c) => {
            report.push(CheckResult::pass(
                "toml_parse",
                Severity::Error,
                "config syntax valid",
            ));
            c
        }
        Err(e) => {
            report.push(CheckResult::fail(
                "toml_parse",
                Severity::Error,
                format!("{e:#}"),
            ));
            return report;
        }
    };

    // 2-4. agent and session storage
    check_agent(&mut report, &config, config_dir);
    check_sessions_dir(&mut report, &config, config_dir);

    // 5. relay
    match config.relay {
        Some(ref relay) => check_relay(&mut report, relay),
        None => report.push(CheckResult::pass(
            "relay",
            Severity::Info,
            "no [relay] section: chat relay disabled, tasks only",
        )),
    }

    // 6. tasks
    check_task_names(&mut report, &config);
    for task in &config.tasks {
        check_trigger(&mut report, task);
        check_prompt(&mut report, task, config_dir);
        check_sources(&mut report, task);
        check_sinks(&mut report, task, &config);
    }

    report
}

fn check_agent(report: &mut CheckReport, config: &Config, config_dir: &Path) {
    let binary = &config.agent.binary;
    if binary.trim().is_empty() {
        report.push(CheckResult::fail(
            "agent_binary",
            Severity::Error,
            "agent.binary must be non-empty",
        ));
    } else {
        report.push(match find_binary(binary, config_dir) {
            Some(path) => CheckResult::pass(
                "agent_binary",
                Severity::Warning,
                format!("agent binary: {}", path.display()),
            ),
            None => CheckResult::fail(
                "agent_binary",
                Severity::Warning,
                format!("agent binary '{binary}' not found (turns will fail to start)"),
            ),
        });
    }

    if let Some(ref workdir) = config.agent.workdir {
        let path = resolve_config_path(config_dir, workdir);
        report.push(if path.is_dir() {
            CheckResult::pass(
                "agent_workdir",
                Severity::Error,
                format!("agent workdir: {}", path.display()),
            )
        } else {
            CheckResult::fail(
                "agent_workdir",
                Severity::Error,
                format!("agent workdir does not exist: {}", path.display()),
            )
        });
    }

    if config.agent.stop_grace_secs == 0 {
        report.push(CheckResult::fail(
            "agent_stop_grace",
            Severity::Warning,
            "agent.stop_grace_secs is 0: stopped turns are killed without a grace period",
        ));
    }
}

/// Locate the agent binary: paths with a separator are taken as-is
/// (relative to the config dir), bare names are searched on `PATH`.
fn find_binary(binary: &str, config_dir: &Path) -> Option<PathBuf> {
    if binary.contains('/') {
        let path = resolve_config_path(config_dir, binary);
        return path.is_file().then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn check_sessions_dir(report: &mut CheckReport, config: &Config, config_dir: &Path) {
    let dir = resolve_config_path(config_dir, &config.sessions.dir);
    if dir.exists() && !dir.is_dir() {
        report.push(CheckResult::fail(
            "sessions_dir",
            Severity::Error,
            format!("sessions.dir is not a directory: {}", dir.display()),
        ));
    } else {
        report.push(CheckResult::pass(
            "sessions_dir",
            Severity::Info,
            format!("sessions: {}", dir.display()),
        ));
    }
}

fn check_relay(report: &mut CheckReport, relay: &RelayConfig) {
    for var in [&relay.bot_token_env, &relay.app_token_env] {
        let present = std::env::var(var).is_ok_and(|v| !v.trim().is_empty());
        report.push(if present {
            CheckResult::pass("relay_credentials", Severity::Error, format!("{var}: present"))
        } else {
            CheckResult::fail(
                "relay_credentials",
                Severity::Error,
                format!("{var} environment variable not set"),
            )
        });
    }

    if !relay.api_base.starts_with("http://") && !relay.api_base.starts_with("https://") {
        report.push(CheckResult::fail(
            "relay_api_base",
            Severity::Error,
            format!("relay.api_base must be an http(s) URL, got '{}'", relay.api_base),
        ));
    }

    let delivery = &relay.delivery;
    if delivery.max_chunk_len == 0 || delivery.max_chunks == 0 {
        report.push(CheckResult::fail(
            "relay_delivery",
            Severity::Error,
            "relay.delivery.max_chunk_len and max_chunks must be positive",
        ));
    } else {
        report.push(CheckResult::pass(
            "relay_delivery",
            Severity::Error,
            format!(
                "delivery: {} chars x {} chunks, {}ms pacing",
                delivery.max_chunk_len, delivery.max_chunks, delivery.pacing_ms
            ),
        ));
    }
}

fn check_task_names(report: &mut CheckReport, config: &Config) {
    let mut seen = HashSet::new();
    for task in &config.tasks {
        if task.name.trim().is_empty() {
            report.push(CheckResult::fail(
                "task_names",
                Severity::Error,
                "task name must be non-empty",
            ));
        } else if !seen.insert(task.name.as_str()) {
            report.push(CheckResult::fail(
                "task_names",
                Severity::Error,
                format!("duplicate task name '{}'", task.name),
            ));
        }
    }
    if !config.tasks.is_empty() {
        report.push(CheckResult::pass(
            "task_names",
            Severity::Info,
            format!("tasks: {}", config.tasks.len()),
        ));
    }
}

fn check_trigger(report: &mut CheckReport, task: &TaskConfig) {
    match Trigger::from_task(task) {
        Ok(_) => {
            let description = match &task.trigger {
                TriggerConfig::Cron(expr) => format!(
                    "task '{}': cron '{expr}' ({})",
                    task.name,
                    task.timezone.as_deref().unwrap_or("UTC")
                ),
                TriggerConfig::Poll { interval_secs } => {
                    format!("task '{}': poll every {interval_secs}s", task.name)
                }
            };
            report.push(CheckResult::pass("task_trigger", Severity::Error, description));
        }
        Err(e) => report.push(CheckResult::fail(
            "task_trigger",
            Severity::Error,
            format!("task '{}': {e:#}", task.name),
        )),
    }

    // Cron triggers already validate the zone above.
    if matches!(task.trigger, TriggerConfig::Poll { .. })
        && let Err(e) = parse_timezone(task.timezone.as_deref())
    {
        report.push(CheckResult::fail(
            "task_timezone",
            Severity::Error,
            format!("task '{}': {e:#}", task.name),
        ));
    }
}

fn check_prompt(report: &mut CheckReport, task: &TaskConfig, config_dir: &Path) {
    let result = match (&task.executor.prompt, &task.executor.prompt_file) {
        (Some(prompt), None) if prompt.trim().is_empty() => CheckResult::fail(
            "task_prompt",
            Severity::Error,
            format!("task '{}': prompt is empty", task.name),
        ),
        (Some(_), None) => return,
        (None, Some(file)) => {
            let path = resolve_config_path(config_dir, file);
            if path.is_file() {
                return;
            }
            CheckResult::fail(
                "task_prompt",
                Severity::Error,
                format!("task '{}': prompt file not found: {}", task.name, path.display()),
            )
        }
        (Some(_), Some(_)) => CheckResult::fail(
            "task_prompt",
            Severity::Error,
            format!("task '{}': set either prompt or prompt_file, not both", task.name),
        ),
        (None, None) => CheckResult::fail(
            "task_prompt",
            Severity::Error,
            format!("task '{}': no prompt or prompt_file", task.name),
        ),
    };
    report.push(result);
}

fn check_sources(report: &mut CheckReport, task: &TaskConfig) {
    for source in &task.sources {
        match source {
            SourceConfig::Command { command } if command.trim().is_empty() => {
                report.push(CheckResult::fail(
                    "task_sources",
                    Severity::Error,
                    format!("task '{}': command source is empty", task.name),
                ));
            }
            SourceConfig::Command { .. } => {}
        }
    }
    if task.filter.is_some() && task.sources.is_empty() {
        report.push(CheckResult::fail(
            "task_sources",
            Severity::Warning,
            format!("task '{}': filter has no effect without sources", task.name),
        ));
    }
}

fn check_sinks(report: &mut CheckReport, task: &TaskConfig, config: &Config) {
    if task.sinks.is_empty() {
        report.push(CheckResult::fail(
            "task_sinks",
            Severity::Warning,
            format!("task '{}': no sinks, output is discarded", task.name),
        ));
        return;
    }

    for sink in &task.sinks {
        let problem = match sink {
            SinkConfig::Slack { channel, .. } if channel.trim().is_empty() => {
                Some("slack sink channel is empty".to_owned())
            }
            SinkConfig::Slack { .. } => {
                let var = config
                    .relay
                    .as_ref()
                    .map_or("SLACK_BOT_TOKEN", |relay| relay.bot_token_env.as_str());
                std::env::var(var)
                    .is_err()
                    .then(|| format!("slack sink needs {var} to be set"))
            }
            SinkConfig::File { path } if path.trim().is_empty() => {
                Some("file sink path is empty".to_owned())
            }
            SinkConfig::File { .. } => None,
            SinkConfig::Webhook { url }
                if !url.starts_with("http://") && !url.starts_with("https://") =>
            {
                Some(format!("webhook url must be an http(s) URL, got '{url}'"))
            }
            SinkConfig::Webhook { .. } => None,
        };
        if let Some(problem) = problem {
            report.push(CheckResult::fail(
                "task_sinks",
                Severity::Error,
                format!("task '{}': {problem}", task.name),
            ));
        }
    }
}
