//! Overlapping text chunker.
//!
//! Splits a document into [`Fragment`]s of at most `max_chunk_size` bytes
//! where consecutive fragments share roughly `overlap` bytes. Cut points
//! prefer, in order: paragraph breaks, sentence ends, line breaks, spaces.
//! Only the second half of each window is searched so fragments do not
//! shrink to slivers; when nothing is found the window is cut hard.
//!
//! Nothing is trimmed, so dropping each fragment's overlap prefix and
//! concatenating restores the document byte for byte (see [`reassemble`]).

use crate::config::validate_chunking;
use crate::error::Result;
use crate::rag::document::{Document, Fragment};

/// Split `document` into overlapping fragments.
///
/// # Errors
///
/// Returns [`crate::ChatError::InvalidConfiguration`] unless
/// `0 < overlap < max_chunk_size`.
pub fn chunk(document: &Document, max_chunk_size: usize, overlap: usize) -> Result<Vec<Fragment>> {
    validate_chunking(max_chunk_size, overlap)?;

    let text = document.text.as_str();
    let len = text.len();
    let mut fragments = Vec::new();
    let mut prev_end = 0;

    while prev_end < len {
        let start = if fragments.is_empty() {
            0
        } else {
            floor_char_boundary(text, prev_end.saturating_sub(overlap))
        };

        let mut limit = floor_char_boundary(text, (start + max_chunk_size).min(len));
        if limit <= prev_end {
            // A multi-byte char straddles the window edge; take it whole.
            limit = ceil_char_boundary(text, prev_end + 1);
        }

        let end = if limit >= len {
            len
        } else {
            let lo = ceil_char_boundary(text, (start + max_chunk_size / 2).max(prev_end + 1));
            find_split(text, lo, limit).unwrap_or(limit)
        };

        fragments.push(Fragment::new(
            document,
            fragments.len(),
            start,
            end,
            prev_end - start,
        ));
        prev_end = end;
    }

    Ok(fragments)
}

/// Rebuild the original text from fragments produced by [`chunk`].
pub fn reassemble(fragments: &[Fragment]) -> String {
    fragments.iter().map(Fragment::fresh_text).collect()
}

/// Best cut point in `text[lo..hi]`, as an absolute byte offset just past
/// the boundary.
fn find_split(text: &str, lo: usize, hi: usize) -> Option<usize> {
    if lo >= hi {
        return None;
    }
    let window = &text[lo..hi];

    if let Some(idx) = window.rfind("\n\n") {
        return Some(lo + idx + 2);
    }

    let mut sentence_end = None;
    let mut line_end = None;
    let mut space_end = None;
    let mut prev: Option<char> = None;
    for (i, c) in window.char_indices() {
        let after = lo + i + c.len_utf8();
        if c.is_whitespace() && matches!(prev, Some('.' | '!' | '?')) {
            sentence_end = Some(after);
        }
        if c == '\n' {
            line_end = Some(after);
        } else if c.is_whitespace() {
            space_end = Some(after);
        }
        prev = Some(c);
    }

    sentence_end.or(line_end).or(space_end)
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Snap a byte index forward to the nearest valid UTF-8 char boundary.
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
