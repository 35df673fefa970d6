//! Data models for pagebind.

mod group;
mod work_item;

pub use group::{GroupCounts, PageGroup};
pub use work_item::{IntakeFile, WorkItem, WorkItemCounts, WorkItemState};
