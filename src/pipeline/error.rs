use thiserror::Error;

use crate::ocr::OcrError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("OCR client error: {0}")]
    Ocr(#[from] OcrError),
    #[error("No OCR API keys configured")]
    NoCredentials,
    #[error("Task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}
