//! Diesel ORM models for database tables.
//!
//! Records mirror the table layout in `schema.rs`; conversions into the
//! domain models in `crate::models` live here as well.

use diesel::prelude::*;

use super::{parse_datetime, parse_datetime_opt};
use crate::models::{PageGroup, WorkItem};
use crate::schema;

/// Work item record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::work_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WorkItemRecord {
    pub id: i32,
    pub sequence_number: i64,
    pub original_name: String,
    pub storage_path: String,
    pub edited_path: Option<String>,
    pub mime_type: String,
    pub size_bytes: i64,
    pub is_reviewed: bool,
    pub processed: bool,
    pub processed_at: Option<String>,
    pub in_flight: bool,
    pub claimed_at: Option<String>,
    pub claimed_by: Option<String>,
    pub failure_count: i32,
    pub last_error: Option<String>,
    pub extracted_text: Option<String>,
    pub is_bookmark: bool,
    pub group_id: Option<i32>,
    pub position_in_group: Option<i32>,
    pub consumed_at: Option<String>,
    pub created_at: String,
}

/// New work item for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::work_items)]
pub struct NewWorkItem<'a> {
    pub sequence_number: i64,
    pub original_name: &'a str,
    pub storage_path: &'a str,
    pub mime_type: &'a str,
    pub size_bytes: i64,
    pub created_at: &'a str,
}

/// Page group record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::page_groups)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PageGroupRecord {
    pub id: i32,
    pub is_complete: bool,
    pub page_count: i32,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// New page group for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::page_groups)]
pub struct NewPageGroup<'a> {
    pub is_complete: bool,
    pub page_count: i32,
    pub created_at: &'a str,
}

impl From<WorkItemRecord> for WorkItem {
    fn from(record: WorkItemRecord) -> Self {
        WorkItem {
            id: record.id,
            sequence_number: record.sequence_number,
            original_name: record.original_name,
            storage_path: record.storage_path,
            edited_path: record.edited_path,
            mime_type: record.mime_type,
            size_bytes: record.size_bytes,
            is_reviewed: record.is_reviewed,
            processed: record.processed,
            processed_at: parse_datetime_opt(record.processed_at),
            in_flight: record.in_flight,
            claimed_at: parse_datetime_opt(record.claimed_at),
            claimed_by: record.claimed_by,
            failure_count: record.failure_count,
            last_error: record.last_error,
            extracted_text: record.extracted_text,
            is_bookmark: record.is_bookmark,
            group_id: record.group_id,
            position_in_group: record.position_in_group,
            consumed_at: parse_datetime_opt(record.consumed_at),
            created_at: parse_datetime(&record.created_at),
        }
    }
}

impl From<PageGroupRecord> for PageGroup {
    fn from(record: PageGroupRecord) -> Self {
        PageGroup {
            id: record.id,
            is_complete: record.is_complete,
            page_count: record.page_count,
            created_at: parse_datetime(&record.created_at),
            completed_at: parse_datetime_opt(record.completed_at),
        }
    }
}
