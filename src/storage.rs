//! Storage helpers for page images on disk.
//!
//! Paths stored in the database are relative to the store root so a data
//! directory can be moved without rewriting rows.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Subdirectory for images as uploaded.
pub const RAW_SUBDIR: &str = "raw";
/// Subdirectory for images replaced during review.
pub const EDITED_SUBDIR: &str = "edited";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid page path: {0}")]
    InvalidPath(String),
}

/// Filesystem store for page images.
#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative path for an uploaded page: `raw/{sequence}.{ext}`.
    pub fn raw_path(sequence: i64, original_name: &str, mime_type: &str) -> String {
        format!(
            "{RAW_SUBDIR}/{sequence}.{}",
            extension_for(original_name, mime_type)
        )
    }

    /// Relative path for an edited page: `edited/{sequence}.{ext}`.
    pub fn edited_path(sequence: i64, original_name: &str, mime_type: &str) -> String {
        format!(
            "{EDITED_SUBDIR}/{sequence}.{}",
            extension_for(original_name, mime_type)
        )
    }

    /// Write `data` at `relative`, creating parent directories.
    pub async fn write(&self, relative: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Read the image stored at `relative`.
    pub async fn read(&self, relative: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(relative)?;
        tokio::fs::read(&path)
            .await
            .map_err(|source| StorageError::Io { path, source })
    }

    /// Join `relative` onto the root, refusing paths that would escape it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.is_empty() || escapes {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

/// Detect the MIME type of page content, falling back to octet-stream.
pub fn detect_mime(data: &[u8]) -> &'static str {
    infer::get(data)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream")
}

/// Map MIME type to file extension.
pub fn mime_to_extension(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/tiff" => "tif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

/// Prefer the uploaded file's own extension, otherwise derive one from MIME.
fn extension_for(original_name: &str, mime_type: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| mime_to_extension(mime_type).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_raw_path_uses_original_extension() {
        assert_eq!(PageStore::raw_path(7, "Scan 7.JPG", "image/png"), "raw/7.jpg");
    }

    #[test]
    fn test_raw_path_falls_back_to_mime() {
        assert_eq!(PageStore::raw_path(3, "upload", "image/png"), "raw/3.png");
        assert_eq!(
            PageStore::edited_path(3, "upload", "text/plain"),
            "edited/3.bin"
        );
    }

    #[test]
    fn test_resolve_rejects_escaping_paths() {
        let store = PageStore::new("/data/pages");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
        assert_eq!(
            store.resolve("raw/1.png").unwrap(),
            PathBuf::from("/data/pages/raw/1.png")
        );
    }

    #[test]
    fn test_detect_mime() {
        let png_header = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(detect_mime(&png_header), "image/png");
        assert_eq!(detect_mime(b"plain bytes"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path());

        let path = store.write("raw/1.png", b"page one").await.unwrap();
        assert!(path.exists());
        assert_eq!(store.read("raw/1.png").await.unwrap(), b"page one");
        assert!(store.read("raw/2.png").await.is_err());
    }
}
