//! Boundary-seeking text chunker with a fixed character overlap.
//!
//! Splits extracted document text into chunks of at most `chunk_size`
//! characters. Each cut is placed on the strongest boundary available
//! inside the window, falling back in order:
//!
//! 1. paragraph break (`\n\n`)
//! 2. sentence end (`. `, `! `, `? ` and their newline forms)
//! 3. any whitespace
//! 4. a raw character cut at the window end
//!
//! Every chunk after the first starts exactly `chunk_overlap` characters
//! before the previous cut, so chunk `i` begins with the last
//! `chunk_overlap` characters of chunk `i - 1`. Chunks are exact
//! substrings of the input; dropping the overlap prefix of every chunk but
//! the first and concatenating reconstructs the text.
//!
//! Lengths are measured in Unicode scalar values, not bytes.
//!
//! # Example
//!
//! ```rust
//! use drive_ingest::chunk::{chunk_text, ChunkerConfig};
//!
//! let config = ChunkerConfig::new(1500, 200).unwrap();
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", &config);
//! assert_eq!(chunks, vec!["Hello world.\n\nSecond paragraph.".to_string()]);
//! ```

use crate::error::{PipelineError, Result};

/// Sentence terminators, cut after the trailing whitespace.
const SENTENCE_ENDS: &[&str] = &[". ", "! ", "? ", ".\n", "!\n", "?\n"];

const PARAGRAPH_BREAK: &str = "\n\n";

/// Chunk length and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ChunkerConfig {
    /// Fails unless `chunk_size > chunk_overlap`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(PipelineError::Config(format!(
                "chunk size ({}) must be greater than overlap ({})",
                chunk_size, chunk_overlap
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }
}

#[derive(Debug, Clone, Copy)]
enum Boundary {
    Paragraph,
    Sentence,
    Whitespace,
}

/// Split `text` into overlapping chunks.
///
/// Returns an empty vector only for empty input. Input of at most
/// `chunk_size` characters comes back as a single chunk, unchanged.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    // Byte offset of every char, plus the end of the string.
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = offsets.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        if total_chars - start <= config.chunk_size {
            chunks.push(text[offsets[start]..].to_string());
            break;
        }

        let window_end = start + config.chunk_size;
        // The cut must leave more than the overlap behind, or the next
        // chunk would start where this one did.
        let min_end = start + config.chunk_overlap + 1;
        let end = find_cut(text, &offsets, start, min_end, window_end);

        chunks.push(text[offsets[start]..offsets[end]].to_string());
        start = end - config.chunk_overlap;
    }

    chunks
}

/// Pick the cut (as a char index) for the window `[start, window_end)`.
fn find_cut(
    text: &str,
    offsets: &[usize],
    start: usize,
    min_end: usize,
    window_end: usize,
) -> usize {
    let base = offsets[start];
    let window = &text[base..offsets[window_end]];

    for boundary in [Boundary::Paragraph, Boundary::Sentence, Boundary::Whitespace] {
        if let Some(cut_byte) = last_boundary(window, boundary) {
            let cut = char_index(offsets, base + cut_byte);
            if cut >= min_end {
                return cut;
            }
        }
    }

    window_end
}

/// Byte position just past the last boundary of the given kind in `window`.
fn last_boundary(window: &str, boundary: Boundary) -> Option<usize> {
    match boundary {
        Boundary::Paragraph => window
            .rfind(PARAGRAPH_BREAK)
            .map(|pos| pos + PARAGRAPH_BREAK.len()),
        Boundary::Sentence => SENTENCE_ENDS
            .iter()
            .filter_map(|sep| window.rfind(sep).map(|pos| pos + sep.len()))
            .max(),
        Boundary::Whitespace => window
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, c)| i + c.len_utf8()),
    }
}

fn char_index(offsets: &[usize], byte: usize) -> usize {
    offsets.binary_search(&byte).unwrap_or_else(|i| i)
}
