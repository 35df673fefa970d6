//! Page group models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical document: the content pages between two bookmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageGroup {
    pub id: i32,
    pub is_complete: bool,
    pub page_count: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Group counters for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupCounts {
    pub complete: i64,
    pub open: i64,
}
