use anyhow::{Context, Result};
use courier_core::ConversationKey;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::registry::Session;

/// File-backed session store.
///
/// Each session is stored as `{dir}/{slug}.json` where the slug is derived
/// from the conversation key. Used as a write-through backing store for the
/// in-memory session registry.
#[derive(Debug)]
pub(crate) struct DiskSessionStore {
    dir: PathBuf,
}

impl DiskSessionStore {
    pub(crate) fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create session dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Every readable session in the directory. Corrupt files are skipped.
    pub(crate) fn load_all(&self) -> Result<Vec<Session>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?;

        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                    continue;
                }
            };
            match serde_json::from_str::<Session>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt session file");
                }
            }
        }

        debug!(count = sessions.len(), dir = %self.dir.display(), "loaded sessions from disk");
        Ok(sessions)
    }

    pub(crate) fn save(&self, session: &Session) -> Result<()> {
        let path = self.path(&session.key);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(session)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    fn path(&self, key: &ConversationKey) -> PathBuf {
        self.dir.join(format!("{}.json", slug(key)))
    }
}

/// File-safe name for a key. Distinct keys always get distinct names.
fn slug(key: &ConversationKey) -> String {
    let mut slug = String::new();
    for c in key.to_string().chars() {
        match c {
            '_' => slug.push_str("__"),
            ':' => slug.push_str("_c"),
            '/' => slug.push_str("_s"),
            c => slug.push(c),
        }
    }
    slug
}
