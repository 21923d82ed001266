//! Version histories: per-branch `(event_id, version)` lineage facts.
//!
//! An item is an atomic fact: "event N on this branch was authored under
//! failover version V". Items are monotone in event id; versions only move
//! upward within a branch.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::VersionHistoryError;
use super::event::{EventId, Version};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: EventId,
    pub version: Version,
}

impl VersionHistoryItem {
    pub fn new(event_id: EventId, version: Version) -> Self {
        Self { event_id, version }
    }
}

/// One branch of a run's history lineage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionHistory {
    branch_token: Bytes,
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    pub fn new(branch_token: Bytes, items: Vec<VersionHistoryItem>) -> Self {
        Self {
            branch_token,
            items,
        }
    }

    pub fn branch_token(&self) -> &Bytes {
        &self.branch_token
    }

    pub fn set_branch_token(&mut self, token: Bytes) {
        self.branch_token = token;
    }

    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn last_item(&self) -> Result<VersionHistoryItem, VersionHistoryError> {
        self.items
            .last()
            .copied()
            .ok_or(VersionHistoryError::Empty)
    }

    /// Record that events up to `event_id` carry `version`. Extends the last
    /// item when the version matches, appends a new item on a version bump,
    /// and rejects regressions on either axis.
    pub fn add_or_update_item(
        &mut self,
        item: VersionHistoryItem,
    ) -> Result<(), VersionHistoryError> {
        let Some(last) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };

        if item.version < last.version {
            return Err(VersionHistoryError::VersionDecreasing {
                last: last.version,
                got: item.version,
            });
        }
        if item.event_id <= last.event_id {
            // Same-position rewrite with an equal version is an idempotent
            // retry, not a violation.
            if item.event_id == last.event_id && item.version == last.version {
                return Ok(());
            }
            return Err(VersionHistoryError::EventIdNotIncreasing {
                last: last.event_id,
                got: item.event_id,
            });
        }

        if item.version == last.version {
            last.event_id = item.event_id;
        } else {
            self.items.push(item);
        }
        Ok(())
    }

    pub fn contains_item(&self, item: VersionHistoryItem) -> bool {
        let mut prev_event_id = 0i64;
        for known in &self.items {
            if item.version == known.version {
                return prev_event_id < item.event_id.get() && item.event_id <= known.event_id;
            }
            prev_event_id = known.event_id.get();
        }
        false
    }

    /// The highest item present in both branches.
    pub fn lowest_common_ancestor(
        &self,
        other: &VersionHistory,
    ) -> Result<VersionHistoryItem, VersionHistoryError> {
        for local in self.items.iter().rev() {
            for remote in other.items.iter().rev() {
                if local.version == remote.version {
                    let event_id = local.event_id.min(remote.event_id);
                    return Ok(VersionHistoryItem::new(event_id, local.version));
                }
            }
        }
        Err(VersionHistoryError::NoCommonAncestor)
    }
}

/// All branches of a run plus the current-branch index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_index: usize,
    histories: Vec<VersionHistory>,
}

impl VersionHistories {
    pub fn new(initial: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![initial],
        }
    }

    pub fn current(&self) -> &VersionHistory {
        &self.histories[self.current_index]
    }

    pub fn current_mut(&mut self) -> &mut VersionHistory {
        &mut self.histories[self.current_index]
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn branch_count(&self) -> usize {
        self.histories.len()
    }

    pub fn branch(&self, index: usize) -> Result<&VersionHistory, VersionHistoryError> {
        self.histories
            .get(index)
            .ok_or(VersionHistoryError::BranchOutOfRange {
                index,
                count: self.histories.len(),
            })
    }

    pub fn add_branch(&mut self, history: VersionHistory) -> usize {
        self.histories.push(history);
        self.histories.len() - 1
    }

    pub fn set_current(&mut self, index: usize) -> Result<(), VersionHistoryError> {
        if index >= self.histories.len() {
            return Err(VersionHistoryError::BranchOutOfRange {
                index,
                count: self.histories.len(),
            });
        }
        self.current_index = index;
        Ok(())
    }
}
