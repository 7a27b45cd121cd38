//! Compares a local and a remote table of contents.

use crate::database::TableOfContents;

/// One step needed to make the remote side match the local side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedWork {
    /// Delete a remote group (`day == None`) or one remote partition.
    Prune {
        /// Group name.
        group: String,
        /// Day timestamp.
        day: Option<u64>,
    },
    /// Send the records the remote partition is missing.
    Fill {
        /// Group name.
        group: String,
        /// Day timestamp.
        day: u64,
    },
}

impl PlannedWork {
    /// Whether this is a fill.
    pub fn is_fill(&self) -> bool {
        matches!(self, PlannedWork::Fill { .. })
    }
}

/// Plans the work that brings `remote` in line with `local`.
///
/// - A remote group or partition unknown locally is pruned.
/// - A remote partition larger than the local one is pruned, then refilled
///   from scratch.
/// - A local partition larger than the remote one, or non-empty and missing
///   remotely, is filled.
///
/// Prunes for a group come before its fills.
pub fn plan_synchronization(local: &TableOfContents, remote: &TableOfContents) -> Vec<PlannedWork> {
    let mut work = Vec::new();

    for (group, remote_days) in remote.groups() {
        let Some(local_days) = local.group(group) else {
            work.push(PlannedWork::Prune {
                group: group.to_string(),
                day: None,
            });
            continue;
        };
        for (&day, remote_info) in remote_days {
            match local_days.get(&day) {
                None => work.push(PlannedWork::Prune {
                    group: group.to_string(),
                    day: Some(day),
                }),
                Some(local_info) if local_info.size < remote_info.size => {
                    work.push(PlannedWork::Prune {
                        group: group.to_string(),
                        day: Some(day),
                    });
                    work.push(PlannedWork::Fill {
                        group: group.to_string(),
                        day,
                    });
                }
                Some(_) => {}
            }
        }
    }

    for (group, day, local_size) in local.partitions() {
        let behind = match remote.size(group, day) {
            Some(remote_size) => local_size > remote_size,
            None => local_size > 0,
        };
        if behind {
            work.push(PlannedWork::Fill {
                group: group.to_string(),
                day,
            });
        }
    }

    work
}
