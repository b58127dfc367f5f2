//! Tracks which received offsets have been settled, per partition.
//!
//! Deliveries settle out of order, so the committed offset for a partition
//! may only move up to the lowest offset that is still being handled. Every
//! offset below it has been acked, discarded or republished.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum OffsetTrackerError {
    /// Commits are skipped until the group settles.
    #[error("rebalance in progress, offset commits are skipped")]
    RebalanceInProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub topic: String,
    pub partition: i32,
}

impl Partition {
    pub fn new(topic: &str, partition: i32) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
        }
    }
}

/// An offset to commit, meaning "the next offset to consume".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittableOffset {
    pub partition: Partition,
    pub offset: i64,
}

#[derive(Default)]
struct PartitionOffsets {
    pending: BTreeSet<i64>,
    next_unseen: i64,
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn committable(&self) -> i64 {
        self.pending.first().copied().unwrap_or(self.next_unseen)
    }

    /// The offset to commit, if it moved past the last commit.
    fn advanced(&self) -> Option<i64> {
        let offset = self.committable();
        let advanced = match self.committed {
            Some(committed) => offset > committed,
            None => true,
        };
        (advanced && offset > 0).then_some(offset)
    }
}

/// Only partitions this consumer owns are tracked. A revoked partition is
/// dropped, so settlements that arrive after the revocation are ignored.
#[derive(Default)]
pub struct OffsetTracker {
    partitions: DashMap<Partition, PartitionOffsets>,
    rebalancing: AtomicBool,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self, partition: &Partition, offset: i64) {
        let mut state = self.partitions.entry(partition.clone()).or_default();
        state.pending.insert(offset);
        state.next_unseen = state.next_unseen.max(offset + 1);
    }

    pub fn settled(&self, partition: &Partition, offset: i64) {
        match self.partitions.get_mut(partition) {
            Some(mut state) => {
                state.pending.remove(&offset);
            }
            None => debug!(
                topic = partition.topic,
                partition = partition.partition,
                offset,
                "ignoring settlement for a partition this consumer no longer owns"
            ),
        }
    }

    /// Offsets that moved past what was last committed for their partition.
    pub fn committable(&self) -> Result<Vec<CommittableOffset>, OffsetTrackerError> {
        if self.is_rebalancing() {
            return Err(OffsetTrackerError::RebalanceInProgress);
        }

        Ok(self
            .partitions
            .iter()
            .filter_map(|entry| {
                entry.value().advanced().map(|offset| CommittableOffset {
                    partition: entry.key().clone(),
                    offset,
                })
            })
            .collect())
    }

    pub fn mark_committed(&self, offsets: &[CommittableOffset]) {
        for committed in offsets {
            if let Some(mut state) = self.partitions.get_mut(&committed.partition) {
                state.committed = Some(
                    state
                        .committed
                        .map_or(committed.offset, |prev| prev.max(committed.offset)),
                );
            }
        }
    }

    /// Received but not yet settled, across all partitions.
    pub fn pending(&self) -> usize {
        self.partitions
            .iter()
            .map(|entry| entry.value().pending.len())
            .sum()
    }

    pub fn set_rebalancing(&self, rebalancing: bool) {
        let was_rebalancing = self.rebalancing.swap(rebalancing, Ordering::SeqCst);
        if was_rebalancing != rebalancing {
            info!(rebalancing, "offset tracker rebalancing state changed");
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::SeqCst)
    }

    /// Stop tracking revoked partitions. Returns the last offsets worth
    /// committing for them, which the caller commits while it still owns them.
    pub fn revoke(&self, partitions: &[Partition]) -> Vec<CommittableOffset> {
        partitions
            .iter()
            .filter_map(|partition| {
                let (partition, state) = self.partitions.remove(partition)?;
                if !state.pending.is_empty() {
                    info!(
                        topic = partition.topic,
                        partition = partition.partition,
                        pending = state.pending.len(),
                        "revoked partition has unsettled messages, they will be redelivered"
                    );
                }
                state
                    .advanced()
                    .map(|offset| CommittableOffset { partition, offset })
            })
            .collect()
    }

    /// Start newly assigned partitions from a clean slate. The broker decides
    /// where consumption resumes, anything remembered from an earlier
    /// assignment is stale.
    pub fn assign(&self, partitions: &[Partition]) {
        for partition in partitions {
            if self.partitions.remove(partition).is_some() {
                debug!(
                    topic = partition.topic,
                    partition = partition.partition,
                    "dropped stale offset state for reassigned partition"
                );
            }
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
