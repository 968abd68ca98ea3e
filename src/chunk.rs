//! Overlapping-window text splitter.
//!
//! Splits extracted document text into fixed-size character windows with a
//! fixed overlap between consecutive windows, preserving each window's
//! character offset within the source text. Window boundaries always fall
//! on `char` boundaries, so multi-byte text never splits mid-codepoint.

/// Split `text` into overlapping windows of `size` characters advancing by
/// `size - overlap` each step. The final window is shorter when the text
/// does not divide evenly; a window whose predecessor already reached the
/// end of the text is never emitted.
///
/// Returns `(char_offset, window_text)` pairs. Empty input yields no
/// windows — the caller decides whether that is an error.
///
/// `overlap` must be smaller than `size` (enforced at config load).
pub fn split_text(text: &str, size: usize, overlap: usize) -> Vec<(usize, String)> {
    if text.is_empty() || size == 0 {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let stride = size.saturating_sub(overlap).max(1);

    let mut windows = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + size).min(total);
        windows.push((start, chars[start..end].iter().collect()));
        if start + size >= total {
            break;
        }
        start += stride;
    }
    windows
}
