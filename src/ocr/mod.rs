//! OCR client layer.
//!
//! - `OcrClient`: one remote text-extraction call per page image
//! - `HttpOcrClient`: the JSON-over-HTTP implementation
//! - `RetryPolicy`: bounded attempts with linear backoff and cancellation
//! - `is_bookmark_text`: sentinel page detection

mod bookmark;
mod client;
mod http;
mod retry;

pub use bookmark::{is_bookmark_text, DEFAULT_BOOKMARK_MARKER};
pub use client::{group_credentials, Credential, OcrClient, OcrError};
pub use http::{HttpOcrClient, OcrRequestOptions};
pub use retry::{RetryError, RetryPolicy};
