//! Bookmark sentinel detection.

/// Marker that identifies a bookmark page when no other is configured.
pub const DEFAULT_BOOKMARK_MARKER: &str = "BOOKMARK";

/// Whether extracted text belongs to a bookmark page.
///
/// Matching is case-insensitive and looks for the marker anywhere in the
/// text, since OCR output around the marker is often noisy.
pub fn is_bookmark_text(text: &str, marker: &str) -> bool {
    let marker = marker.trim();
    if marker.is_empty() {
        return false;
    }
    text.to_uppercase().contains(&marker.to_uppercase())
}
