use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tracing::trace;

/// Capacity of the inbound event ring.
pub(crate) const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
struct DedupEntry {
    event_id: String,
    inserted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Ring {
    order: VecDeque<DedupEntry>,
    members: HashSet<String>,
}

/// Sliding window of the most recently admitted identifiers.
///
/// Eviction is purely by count: once the ring is full, each admission
/// pushes out the oldest entry, however recent it is.
#[derive(Debug)]
pub(crate) struct DedupFilter {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DedupFilter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(Ring::default()),
        }
    }

    /// `true` the first time `event_id` is seen within the window.
    pub(crate) fn admit(&self, event_id: &str) -> bool {
        let mut ring = self.ring.lock().expect("dedup ring lock poisoned");
        if ring.members.contains(event_id) {
            return false;
        }

        if ring.order.len() == self.capacity
            && let Some(evicted) = ring.order.pop_front()
        {
            ring.members.remove(&evicted.event_id);
            trace!(
                event_id = %evicted.event_id,
                held_secs = (Utc::now() - evicted.inserted_at).num_seconds(),
                "dedup entry evicted"
            );
        }
        ring.members.insert(event_id.to_owned());
        ring.order.push_back(DedupEntry {
            event_id: event_id.to_owned(),
            inserted_at: Utc::now(),
        });
        true
    }
}
