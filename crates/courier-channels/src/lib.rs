pub mod backoff;
#[cfg(feature = "slack")]
pub mod slack;

pub use backoff::Backoff;
#[cfg(feature = "slack")]
pub use slack::{SlackChannel, SlackConfig, SlackWebClient};
