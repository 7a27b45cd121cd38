//! Table of contents: a size snapshot of every partition.
//!
//! Serializes as `{"<group>": {"<day>": {"size": <bytes>}}}`, the same shape
//! used on the wire by `getToc`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Size information for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Written size in bytes.
    pub size: u64,
}

/// Partitions of one group keyed by day timestamp.
pub type GroupContents = BTreeMap<u64, PartitionInfo>;

/// Snapshot mapping group name to day timestamp to written size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableOfContents {
    groups: BTreeMap<String, GroupContents>,
}

impl TableOfContents {
    /// Creates an empty table of contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a partition size, creating the group if needed.
    pub fn insert(&mut self, group: &str, day: u64, size: u64) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(day, PartitionInfo { size });
    }

    /// Records a group, possibly without partitions.
    pub fn insert_group(&mut self, group: &str) {
        self.groups.entry(group.to_string()).or_default();
    }

    /// Returns the recorded size of a partition.
    pub fn size(&self, group: &str, day: u64) -> Option<u64> {
        self.groups.get(group)?.get(&day).map(|info| info.size)
    }

    /// Returns a group's partitions.
    pub fn group(&self, group: &str) -> Option<&GroupContents> {
        self.groups.get(group)
    }

    /// Whether the group is present.
    pub fn contains_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Iterates groups in name order.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &GroupContents)> {
        self.groups
            .iter()
            .map(|(name, contents)| (name.as_str(), contents))
    }

    /// Iterates every `(group, day, size)` in order.
    pub fn partitions(&self) -> impl Iterator<Item = (&str, u64, u64)> {
        self.groups.iter().flat_map(|(name, contents)| {
            contents
                .iter()
                .map(move |(day, info)| (name.as_str(), *day, info.size))
        })
    }

    /// Removes a whole group.
    pub fn remove_group(&mut self, group: &str) -> Option<GroupContents> {
        self.groups.remove(group)
    }

    /// Removes one partition, keeping its group.
    pub fn remove_partition(&mut self, group: &str, day: u64) -> Option<PartitionInfo> {
        self.groups.get_mut(group)?.remove(&day)
    }

    /// Whether no group is recorded.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
