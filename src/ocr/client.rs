//! OCR client abstraction and credentials.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from a single OCR call. The client never retries on its own.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR request failed: {0}")]
    Http(String),
    #[error("OCR service error: {status} - {body}")]
    Service { status: u16, body: String },
    #[error("OCR service rejected the page: {0}")]
    Rejected(String),
    #[error("OCR request timed out")]
    Timeout,
    #[error("Invalid OCR response: {0}")]
    Decode(String),
}

/// API keys used by one worker. One worker runs per credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub index: usize,
    keys: Vec<String>,
}

impl Credential {
    pub fn new(index: usize, keys: Vec<String>) -> Self {
        Self { index, keys }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("keys", &format_args!("[{} redacted]", self.keys.len()))
            .finish()
    }
}

/// Split API keys into credentials of `keys_per_worker` keys each.
///
/// A trailing partial chunk still becomes a credential. Blank keys are dropped.
pub fn group_credentials(keys: &[String], keys_per_worker: usize) -> Vec<Credential> {
    let keys: Vec<String> = keys
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    keys.chunks(keys_per_worker.max(1))
        .enumerate()
        .map(|(index, chunk)| Credential::new(index, chunk.to_vec()))
        .collect()
}

/// Remote text extraction for one page image.
#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Extract the text of `image` using `credential`.
    async fn extract(
        &self,
        image: &[u8],
        mime_type: &str,
        credential: &Credential,
    ) -> Result<String, OcrError>;
}
