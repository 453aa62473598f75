use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{Config, SharedConfig};
use crate::config_check;

/// Spawn a background task that polls `config_path` for changes and
/// hot-swaps the `SharedConfig` when the file is modified.
///
/// The agent invocation, session storage and relay sections are wired up
/// once at startup, so a reload that changes any of them is rejected.
pub(crate) fn spawn_config_watcher(
    config_path: PathBuf,
    config: SharedConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let span = info_span!("config_watcher", path = %config_path.display());
    tokio::spawn(
        async move {
            config_poll_loop(&config_path, &config, shutdown).await;
        }
        .instrument(span),
    )
}

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEBOUNCE: Duration = Duration::from_millis(200);

async fn config_poll_loop(config_path: &Path, config: &SharedConfig, shutdown: CancellationToken) {
    let mut last_modified = file_modified(config_path);
    info!("config watcher started");

    loop {
        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            () = shutdown.cancelled() => {
                debug!("config watcher stopped");
                return;
            }
        }

        let current_modified = file_modified(config_path);
        if current_modified == last_modified {
            continue;
        }
        last_modified = current_modified;

        // Editors often write-rename-delete in quick succession.
        tokio::time::sleep(DEBOUNCE).await;
        try_reload(config_path, config);
    }
}

fn file_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn try_reload(config_path: &Path, config: &SharedConfig) {
    let new_config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "config reload failed: parse error");
            return;
        }
    };

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let report = config_check::validate_config(config_path, config_dir);
    if report.has_errors() {
        warn!(
            errors = ?report.error_messages(),
            "config reload rejected: validation errors"
        );
        return;
    }

    let current = config.load();
    if let Some(reasons) = check_restart_only_fields(&current, &new_config) {
        warn!(
            fields = ?reasons,
            "config reload rejected: these fields require a restart"
        );
        return;
    }

    if *current.as_ref() == new_config {
        debug!("config file changed but content is identical, skipping reload");
        return;
    }

    let changed = diff_sections(&current, &new_config);
    config.store(Arc::new(new_config));
    info!(changed = ?changed, "config reloaded");
}

/// Returns `Some(reasons)` if any restart-only sections differ.
fn check_restart_only_fields(current: &Config, new: &Config) -> Option<Vec<&'static str>> {
    let mut reasons = Vec::new();

    if new.agent != current.agent {
        reasons.push("agent");
    }
    if new.sessions != current.sessions {
        reasons.push("sessions");
    }
    if new.relay != current.relay {
        reasons.push("relay");
    }

    if reasons.is_empty() {
        None
    } else {
        Some(reasons)
    }
}

/// Names of the tasks that were added, removed or edited.
fn diff_sections(current: &Config, new: &Config) -> Vec<String> {
    let mut changed = Vec::new();
    for task in &new.tasks {
        match current.task(&task.name) {
            Some(old) if old == task => {}
            Some(_) => changed.push(format!("tasks.{} (changed)", task.name)),
            None => changed.push(format!("tasks.{} (added)", task.name)),
        }
    }
    for task in &current.tasks {
        if new.task(&task.name).is_none() {
            changed.push(format!("tasks.{} (removed)", task.name));
        }
    }
    changed
}
