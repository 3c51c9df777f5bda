//! Fixed-size character chunking with overlap.
//!
//! Sizes and overlaps are counted in Unicode scalar values (`char`s), so a
//! window never splits a multi-byte character.

use crate::error::ChunkError;

/// Default window size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 800;

/// Default number of characters shared by consecutive windows.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Split `text` into overlapping windows of `size` characters.
///
/// Each window after the first starts `size - overlap` characters after the
/// previous one; the walk stops at the first window that reaches the end of
/// the text. Trailing whitespace is trimmed from every window and windows
/// that are empty after trimming are dropped, so empty input yields no chunks.
///
/// Returns an error when `size == 0` or `overlap >= size`.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<String>, ChunkError> {
    if size == 0 {
        return Err(ChunkError::ZeroSize);
    }
    if overlap >= size {
        return Err(ChunkError::OverlapTooLarge { size, overlap });
    }

    // Byte offset of every char boundary, including the end of the text.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n = bounds.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < n {
        let end = (start + size).min(n);
        let window = text[bounds[start]..bounds[end]].trim_end();
        if !window.is_empty() {
            chunks.push(window.to_string());
        }
        if end == n {
            break;
        }
        start = end - overlap;
    }
    Ok(chunks)
}

/// Number of windows [`chunk`] walks for a text of `len` characters.
pub fn expected_chunk_count(len: usize, size: usize, overlap: usize) -> usize {
    if len == 0 {
        0
    } else if len <= size {
        1
    } else {
        (len - overlap).div_ceil(size - overlap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_short_text_is_one_trimmed_chunk() {
        let chunks = chunk("hello world   \n", 800, 200).unwrap();
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(chunk("", 10, 2).unwrap().is_empty());
        assert!(chunk("   \n\t", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_windows_overlap() {
        let chunks = chunk("abcdefghij", 4, 2).unwrap();
        assert_eq!(chunks, vec!["abcd", "cdef", "efgh", "ghij"]);
    }

    #[test]
    fn test_last_window_stops_at_end() {
        let chunks = chunk("abcdefg", 4, 1).unwrap();
        assert_eq!(chunks, vec!["abcd", "defg"]);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let text = "héllo wörld ünïcode";
        let chunks = chunk(text, 5, 1).unwrap();
        assert_eq!(chunks[0], "héllo");
        assert_eq!(chunks[1], "o wör");
        for c in &chunks {
            assert!(c.chars().count() <= 5);
        }
    }

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(chunk("abc", 0, 0), Err(ChunkError::ZeroSize));
        assert_eq!(
            chunk("abc", 4, 4),
            Err(ChunkError::OverlapTooLarge {
                size: 4,
                overlap: 4
            })
        );
    }

    #[test]
    fn test_expected_chunk_count() {
        assert_eq!(expected_chunk_count(0, 800, 200), 0);
        assert_eq!(expected_chunk_count(500, 800, 200), 1);
        assert_eq!(expected_chunk_count(800, 800, 200), 1);
        assert_eq!(expected_chunk_count(801, 800, 200), 2);
        assert_eq!(expected_chunk_count(2000, 800, 200), 3);
    }

    proptest! {
        #[test]
        fn chunks_reconstruct_text(
            text in "[a-zA-Z0-9é]{1,300}",
            size in 2usize..60,
            overlap_seed in 0usize..60,
        ) {
            let overlap = overlap_seed % size;
            let chunks = chunk(&text, size, overlap).unwrap();

            let len = text.chars().count();
            prop_assert_eq!(chunks.len(), expected_chunk_count(len, size, overlap));

            let mut rebuilt = chunks[0].clone();
            for c in &chunks[1..] {
                rebuilt.extend(c.chars().skip(overlap));
            }
            prop_assert_eq!(rebuilt, text);
        }

        #[test]
        fn consecutive_windows_share_overlap(
            text in "[a-z]{50,200}",
            size in 5usize..30,
            overlap_seed in 0usize..30,
        ) {
            let overlap = overlap_seed % size;
            let chunks = chunk(&text, size, overlap).unwrap();
            for pair in chunks.windows(2) {
                let prev: Vec<char> = pair[0].chars().collect();
                let next: Vec<char> = pair[1].chars().collect();
                prop_assert_eq!(&prev[prev.len() - overlap..], &next[..overlap]);
            }
        }
    }
}
