use thiserror::Error;

/// Failures that prevent an agent turn from starting.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent binary `{binary}`")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent process has no {0} pipe")]
    MissingPipe(&'static str),
}
