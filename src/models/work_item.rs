//! Work item models.
//!
//! A work item is one scanned page. Its sequence number is assigned at intake
//! and is the only basis for putting pages back in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    /// Waiting for the upstream review stage.
    Unreviewed,
    /// Eligible for OCR.
    Pending,
    /// Claimed by a worker.
    InFlight,
    /// Text extracted, not yet consumed by grouping.
    Processed,
    /// Placed in a group (or skipped as a bookmark).
    Consumed,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreviewed => "unreviewed",
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Processed => "processed",
            Self::Consumed => "consumed",
        }
    }
}

/// A scanned page moving through OCR and grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i32,
    pub sequence_number: i64,
    pub original_name: String,
    /// Path of the uploaded image, relative to the page store.
    pub storage_path: String,
    /// Path of an edited image produced during review, if any.
    pub edited_path: Option<String>,
    pub mime_type: String,
    pub size_bytes: i64,
    pub is_reviewed: bool,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub failure_count: i32,
    pub last_error: Option<String>,
    pub extracted_text: Option<String>,
    pub is_bookmark: bool,
    pub group_id: Option<i32>,
    pub position_in_group: Option<i32>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Image the OCR call should read.
    ///
    /// Reviewed items with an edited image use the edit.
    pub fn image_path(&self) -> &str {
        match (&self.edited_path, self.is_reviewed) {
            (Some(edited), true) => edited,
            _ => &self.storage_path,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn state(&self) -> WorkItemState {
        if self.is_consumed() {
            WorkItemState::Consumed
        } else if self.processed {
            WorkItemState::Processed
        } else if self.in_flight {
            WorkItemState::InFlight
        } else if self.is_reviewed {
            WorkItemState::Pending
        } else {
            WorkItemState::Unreviewed
        }
    }
}

/// A page handed to intake before it has a sequence number.
#[derive(Debug, Clone)]
pub struct IntakeFile {
    pub original_name: String,
    pub data: Vec<u8>,
}

impl IntakeFile {
    pub fn new(original_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            original_name: original_name.into(),
            data,
        }
    }
}

/// Item counters for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkItemCounts {
    pub total: i64,
    pub unreviewed: i64,
    pub pending: i64,
    pub in_flight: i64,
    pub processed: i64,
    pub consumed: i64,
    pub bookmarks: i64,
    /// Unprocessed items with at least one recorded failure.
    pub failing: i64,
}
