//! Partition storage.
//!
//! - [`TimeEntry`]: one (group, day) data file with leased reads and writes
//! - [`Group`]: a named set of day partitions
//! - [`layout`]: directory naming and positional file I/O

pub mod group;
pub mod layout;
pub mod time_entry;

pub use group::{validate_group_name, Group};
pub use time_entry::{
    AppendOutcome, CloseWaiter, ReadLease, Record, RecordIter, TimeEntry, WriteLease,
};
