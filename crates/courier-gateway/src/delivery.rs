use anyhow::Result;
use courier_core::{OutboundMessage, OutboundSender, ReplyTarget, split_chunks};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;

pub(crate) const TRUNCATION_MARKER: &str = "_(output truncated)_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeliveryLimits {
    pub max_chunk_len: usize,
    pub max_chunks: usize,
    pub pacing: Duration,
}

impl Default for DeliveryLimits {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for DeliveryLimits {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_chunk_len: config.max_chunk_len,
            max_chunks: config.max_chunks,
            pacing: Duration::from_millis(config.pacing_ms),
        }
    }
}

/// One bounded segment of a turn's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutboundChunk {
    pub seq: usize,
    pub target: ReplyTarget,
    pub text: String,
}

/// Ordered, paced delivery of one turn's output to one conversation.
///
/// A turn may call [`deliver`](Self::deliver) many times; sequence numbers
/// and the chunk cap span all of those calls.
pub(crate) struct ChunkedDelivery {
    sender: Arc<dyn OutboundSender>,
    target: ReplyTarget,
    limits: DeliveryLimits,
    next_seq: usize,
    truncated: bool,
}

impl std::fmt::Debug for ChunkedDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedDelivery")
            .field("target", &self.target)
            .field("limits", &self.limits)
            .field("next_seq", &self.next_seq)
            .field("truncated", &self.truncated)
            .finish_non_exhaustive()
    }
}

impl ChunkedDelivery {
    pub(crate) fn new(
        sender: Arc<dyn OutboundSender>,
        target: ReplyTarget,
        limits: DeliveryLimits,
    ) -> Self {
        Self {
            sender,
            target,
            limits,
            next_seq: 0,
            truncated: false,
        }
    }

    /// Number of chunks sent so far, not counting the truncation marker.
    pub(crate) fn sent(&self) -> usize {
        self.next_seq
    }

    pub(crate) fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) async fn deliver(&mut self, text: &str) -> Result<()> {
        if self.truncated {
            return Ok(());
        }

        for text in split_chunks(text, self.limits.max_chunk_len) {
            if text.trim().is_empty() {
                continue;
            }
            if self.next_seq >= self.limits.max_chunks {
                self.truncate().await?;
                return Ok(());
            }
            let chunk = OutboundChunk {
                seq: self.next_seq,
                target: self.target.clone(),
                text,
            };
            self.send(chunk).await?;
            self.next_seq += 1;
        }
        Ok(())
    }

    async fn truncate(&mut self) -> Result<()> {
        self.truncated = true;
        warn!(
            channel = %self.target.channel,
            max_chunks = self.limits.max_chunks,
            "turn output exceeded chunk cap, truncating"
        );
        self.pace().await;
        self.sender
            .send(OutboundMessage::reply(&self.target, TRUNCATION_MARKER))
            .await
    }

    async fn send(&self, chunk: OutboundChunk) -> Result<()> {
        if chunk.seq > 0 {
            self.pace().await;
        }
        debug!(
            channel = %chunk.target.channel,
            seq = chunk.seq,
            len = chunk.text.chars().count(),
            "delivering chunk"
        );
        self.sender
            .send(OutboundMessage::reply(&chunk.target, chunk.text))
            .await
    }

    async fn pace(&self) {
        if !self.limits.pacing.is_zero() {
            tokio::time::sleep(self.limits.pacing).await;
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::fakes::RecordingSender;
    use tokio::time::Instant;

    fn target() -> ReplyTarget {
        ReplyTarget {
            channel: "C1".to_owned(),
            thread_ts: Some("1.1".to_owned()),
        }
    }

    fn limits(max_chunk_len: usize, max_chunks: usize, pacing_ms: u64) -> DeliveryLimits {
        DeliveryLimits {
            max_chunk_len,
            max_chunks,
            pacing: Duration::from_millis(pacing_ms),
        }
    }

    fn delivery(recorder: &Arc<RecordingSender>, limits: DeliveryLimits) -> ChunkedDelivery {
        ChunkedDelivery::new(
            Arc::clone(recorder) as Arc<dyn OutboundSender>,
            target(),
            limits,
        )
    }

    #[tokio::test]
    async fn chunks_are_bounded_ordered_and_threaded() {
        let recorder = Arc::new(RecordingSender::new());
        let mut out = delivery(&recorder, limits(10, 20, 0));
        let text = "alpha beta gamma delta epsilon zeta";
        out.deliver(text).await.unwrap();

        let sent = recorder.sent();
        assert!(sent.len() > 1);
        assert!(sent.iter().all(|m| m.text.chars().count() <= 10));
        assert!(sent.iter().all(|m| m.thread_ts.as_deref() == Some("1.1")));
        let joined: String = sent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(joined, text);
        assert_eq!(out.sent(), sent.len());
    }

    #[tokio::test]
    async fn overflow_sends_cap_then_single_marker() {
        let recorder = Arc::new(RecordingSender::new());
        let mut out = delivery(&recorder, limits(5, 3, 0));
        out.deliver(&"x".repeat(40)).await.unwrap();
        out.deliver("more text after the cap").await.unwrap();

        let sent = recorder.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent[..3].iter().all(|m| m.text == "xxxxx"));
        assert_eq!(sent[3].text, TRUNCATION_MARKER);
        assert!(out.is_truncated());
    }

    #[tokio::test]
    async fn exactly_cap_chunks_is_not_truncated() {
        let recorder = Arc::new(RecordingSender::new());
        let mut out = delivery(&recorder, limits(5, 2, 0));
        out.deliver("aaaaabbbbb").await.unwrap();

        assert_eq!(recorder.len(), 2);
        assert!(!out.is_truncated());
    }

    #[tokio::test]
    async fn sequence_and_cap_span_deliver_calls() {
        let recorder = Arc::new(RecordingSender::new());
        let mut out = delivery(&recorder, limits(100, 2, 0));
        out.deliver("first").await.unwrap();
        out.deliver("second").await.unwrap();
        out.deliver("third").await.unwrap();

        let texts: Vec<_> = recorder.sent().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["first", "second", TRUNCATION_MARKER]);
    }

    #[tokio::test]
    async fn whitespace_only_chunks_are_skipped() {
        let recorder = Arc::new(RecordingSender::new());
        let mut out = delivery(&recorder, limits(100, 20, 0));
        out.deliver("  \n ").await.unwrap();
        out.deliver("").await.unwrap();
        assert!(recorder.is_empty());
        assert_eq!(out.sent(), 0);
    }

    #[tokio::test]
    async fn pacing_delays_between_chunks_only() {
        tokio::time::pause();
        let recorder = Arc::new(RecordingSender::new());
        let mut out = delivery(&recorder, limits(4, 20, 300));

        let started = Instant::now();
        out.deliver("aaaabbbbcccc").await.unwrap();

        assert_eq!(recorder.len(), 3);
        // Two gaps for three chunks; the first chunk goes out immediately.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
    }

    #[test]
    fn limits_follow_config() {
        let config = DeliveryConfig {
            max_chunk_len: 1000,
            max_chunks: 5,
            pacing_ms: 50,
        };
        assert_eq!(DeliveryLimits::from(&config), limits(1000, 5, 50));
        assert_eq!(DeliveryLimits::default(), limits(4000, 20, 300));
    }
}
