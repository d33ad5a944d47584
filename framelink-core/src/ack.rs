//! Producer-side tracking of unacknowledged image sends.
//!
//! Every IMAGE that completes a send is tracked by name until the
//! receiver's ACK comes back. The number of tracked entries is the
//! number of frames in flight, and [`BackpressureConfig`] bounds it.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::FramelinkError;

// ── Configuration ────────────────────────────────────────────────

/// What to do when the number of in-flight frames reaches the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Stop sending new frames until ACKs drain the tracker.
    #[default]
    Skip,
    /// Forget the oldest half of the unacked frames and keep sending.
    EvictOldest,
}

/// Backpressure limit and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Maximum frames in flight per connection (`K`, at least 1).
    pub limit: usize,
    pub policy: BackpressurePolicy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            limit: 4,
            policy: BackpressurePolicy::Skip,
        }
    }
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<(), FramelinkError> {
        if self.limit == 0 {
            return Err(FramelinkError::Config(
                "backpressure limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Decision returned by [`AckTracker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Send,
    Skip,
}

// ── AckTracker ───────────────────────────────────────────────────

/// Insertion-ordered map from in-flight image name to sequence number.
#[derive(Debug, Clone)]
pub struct AckTracker {
    config: BackpressureConfig,
    /// name → (insertion order, sequence).
    entries: HashMap<String, (u64, u64)>,
    /// insertion order → name, oldest first.
    order: BTreeMap<u64, String>,
    next_order: u64,
    skip_count: u64,
    eviction_count: u64,
    unexpected_acks: u64,
}

impl AckTracker {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_order: 0,
            skip_count: 0,
            eviction_count: 0,
            unexpected_acks: 0,
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Decide whether a new frame may be sent.
    ///
    /// Under [`BackpressurePolicy::EvictOldest`] this makes room by
    /// evicting before answering, so a following [`track`](Self::track)
    /// never takes the tracker past the limit.
    pub fn admit(&mut self) -> Admission {
        let limit = self.config.limit.max(1);
        if self.entries.len() < limit {
            return Admission::Send;
        }
        match self.config.policy {
            BackpressurePolicy::Skip => {
                self.skip_count += 1;
                debug!(in_flight = self.entries.len(), "skipping frame under backpressure");
                Admission::Skip
            }
            BackpressurePolicy::EvictOldest => {
                let target = (limit / 2).max(1);
                let evicted = self.evict_oldest(target);
                debug!(evicted, "evicted unacked frames under backpressure");
                Admission::Send
            }
        }
    }

    /// Track a completed send at the tail.
    ///
    /// Names are expected to be unique per session; a repeated name is
    /// moved to the tail with its new sequence number.
    pub fn track(&mut self, name: impl Into<String>, sequence: u64) {
        let name = name.into();
        let order = self.next_order;
        self.next_order += 1;
        if let Some((old_order, _)) = self.entries.insert(name.clone(), (order, sequence)) {
            warn!(%name, "frame name tracked twice; keeping the newest send");
            self.order.remove(&old_order);
        }
        self.order.insert(order, name);
    }

    /// Resolve a tracked entry, returning its sequence number.
    ///
    /// An ACK for an unknown name is counted and reported as
    /// [`FramelinkError::UnexpectedAck`]; the entry may simply have been
    /// evicted already.
    pub fn acknowledge(&mut self, name: &str) -> Result<u64, FramelinkError> {
        match self.entries.remove(name) {
            Some((order, sequence)) => {
                self.order.remove(&order);
                Ok(sequence)
            }
            None => {
                self.unexpected_acks += 1;
                Err(FramelinkError::UnexpectedAck(name.to_string()))
            }
        }
    }

    /// Drop up to `count` of the oldest entries. Returns how many went.
    pub fn evict_oldest(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let Some((_, name)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&name);
            evicted += 1;
        }
        self.eviction_count += evicted as u64;
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The oldest unacknowledged entry.
    pub fn oldest(&self) -> Option<(&str, u64)> {
        let (_, name) = self.order.first_key_value()?;
        let (_, sequence) = self.entries.get(name)?;
        Some((name.as_str(), *sequence))
    }

    /// All unacknowledged entries, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.order
            .values()
            .filter_map(|name| self.entries.get(name).map(|(_, seq)| (name.as_str(), *seq)))
    }

    /// Frames not sent because the tracker was full.
    pub fn skip_count(&self) -> u64 {
        self.skip_count
    }

    /// Entries dropped without an ACK.
    pub fn eviction_count(&self) -> u64 {
        self.eviction_count
    }

    pub fn unexpected_acks(&self) -> u64 {
        self.unexpected_acks
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new(BackpressureConfig::default())
    }
}

// ── Tests ─────────────────────────────────────────────────────────
