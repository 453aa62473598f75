//! Agent subprocess engine: spawns the agent binary for one turn, parses its
//! streamed output, and terminates its process group on request.

mod claude;
mod error;
mod process;
pub mod stream;

pub use claude::{ClaudeConfig, ClaudeRunner};
pub use error::AgentError;
pub use process::TerminationState;
