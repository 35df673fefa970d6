//! OCR results waiting to be grouped, keyed by sequence number.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Extracted text of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult {
    pub item_id: i32,
    pub sequence_number: i64,
    pub text: String,
    pub is_bookmark: bool,
}

#[derive(Debug, Default)]
pub struct ResultMap {
    results: Mutex<HashMap<i64, PageResult>>,
}

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, result: PageResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(result.sequence_number, result);
    }

    pub fn get(&self, sequence_number: i64) -> Option<PageResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sequence_number)
            .cloned()
    }

    /// Drop a result once grouping has persisted it.
    pub fn remove(&self, sequence_number: i64) -> Option<PageResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sequence_number)
    }

    pub fn len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
