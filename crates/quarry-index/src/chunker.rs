//! Boundary-aware chunking with a sliding-window fallback.
//!
//! Sizes and overlap are counted in characters. A cut is placed at the strongest
//! boundary inside the window (entity start, paragraph break, line break, sentence end),
//! latest position winning ties; with no boundary the window is cut at `max_size`.
//! Consecutive spans share exactly `overlap` characters.

use serde::{Deserialize, Serialize};

use crate::languages::{Lang, entity_boundaries};

/// A contiguous slice of a document's normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    pub text: String,
}

impl Span {
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_size: usize,
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            overlap: 50,
        }
    }
}

/// Split `text` into spans of at most `max_size` characters.
#[must_use]
pub fn chunk(text: &str, max_size: usize, overlap: usize) -> Vec<Span> {
    chunk_with_boundaries(text, max_size, overlap, &[])
}

/// Chunk source code, preferring cuts at entity starts found by tree-sitter.
#[must_use]
pub fn chunk_code(text: &str, lang: Lang, config: &ChunkerConfig) -> Vec<Span> {
    let boundaries = entity_boundaries(text, lang);
    chunk_with_boundaries(text, config.max_size, config.overlap, &boundaries)
}

const STRENGTH_NONE: u8 = 0;
const STRENGTH_SENTENCE: u8 = 1;
const STRENGTH_LINE: u8 = 2;
const STRENGTH_PARAGRAPH: u8 = 3;
const STRENGTH_ENTITY: u8 = 4;

/// Like [`chunk`], with extra preferred cut points given as byte offsets.
#[must_use]
pub fn chunk_with_boundaries(
    text: &str,
    max_size: usize,
    overlap: usize,
    entity_offsets: &[usize],
) -> Vec<Span> {
    if text.is_empty() {
        return Vec::new();
    }
    let max_size = max_size.max(1);
    let overlap = overlap.min(max_size - 1);

    // byte_at[i] is the byte offset of char i; byte_at[n] == text.len()
    let mut byte_at: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    byte_at.push(text.len());
    let n = byte_at.len() - 1;

    let strength = cut_strengths(text, &byte_at, entity_offsets);

    let mut spans = Vec::new();
    let mut start = 0usize;
    loop {
        if n - start <= max_size {
            push_span(text, &byte_at, start, n, &mut spans);
            break;
        }
        let hi = start + max_size;
        let lo = start + (overlap + 1).max(max_size / 2);
        let end = best_cut(&strength, lo, hi);
        push_span(text, &byte_at, start, end, &mut spans);
        start = end - overlap;
    }
    spans
}

/// Strength of cutting immediately before char `i`, for `i` in `0..=n`.
fn cut_strengths(text: &str, byte_at: &[usize], entity_offsets: &[usize]) -> Vec<u8> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut strength = vec![STRENGTH_NONE; n + 1];

    for i in 1..n {
        let prev = chars[i - 1];
        let s = if prev == '\n' && i >= 2 && chars[i - 2] == '\n' {
            STRENGTH_PARAGRAPH
        } else if prev == '\n' {
            STRENGTH_LINE
        } else if chars[i].is_whitespace() && matches!(prev, '.' | '?' | '!') {
            STRENGTH_SENTENCE
        } else {
            STRENGTH_NONE
        };
        strength[i] = s;
    }

    for &offset in entity_offsets {
        if let Ok(i) = byte_at.binary_search(&offset)
            && i > 0
            && i < n
        {
            strength[i] = STRENGTH_ENTITY;
        }
    }
    strength
}

fn best_cut(strength: &[u8], lo: usize, hi: usize) -> usize {
    let mut best = hi;
    let mut best_strength = STRENGTH_NONE;
    for (i, &s) in strength.iter().enumerate().take(hi + 1).skip(lo) {
        if s != STRENGTH_NONE && s >= best_strength {
            best = i;
            best_strength = s;
        }
    }
    best
}

fn push_span(text: &str, byte_at: &[usize], from: usize, to: usize, out: &mut Vec<Span>) {
    let (start, end) = (byte_at[from], byte_at[to]);
    out.push(Span {
        start,
        end,
        text: text[start..end].to_owned(),
    });
}

/// 1-based inclusive line range covered by `start..end` in `text`.
#[must_use]
pub fn line_range(text: &str, start: usize, end: usize) -> (usize, usize) {
    let first = text[..start].matches('\n').count() + 1;
    let body = &text[start..end];
    let extra = body.trim_end_matches('\n').matches('\n').count();
    (first, first + extra)
}

/// Content hash used for idempotence checks.
#[must_use]
pub fn blake3_hex(input: &[u8]) -> String {
    blake3::hash(input).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_offset(text: &str, byte: usize) -> usize {
        text[..byte].chars().count()
    }

    #[test]
    fn empty_text_no_spans() {
        assert!(chunk("", 500, 50).is_empty());
    }

    #[test]
    fn short_text_single_span() {
        let spans = chunk("hello world", 500, 50);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans[0].end, 11);
        assert_eq!(spans[0].text, "hello world");
    }

    #[test]
    fn deterministic_for_identical_input() {
        let text = "Lorem ipsum dolor sit amet. ".repeat(200);
        assert_eq!(chunk(&text, 500, 50), chunk(&text, 500, 50));
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let para = "word ".repeat(50);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let spans = chunk(&text, 300, 10);
        assert!(spans.len() > 1);
        assert!(spans[0].text.ends_with("\n\n"), "got {:?}", spans[0].text);
    }

    #[test]
    fn hard_cut_without_boundaries() {
        let text = "a".repeat(25);
        let spans = chunk(&text, 10, 3);
        assert_eq!(spans[0].text.len(), 10);
        assert_eq!(spans[1].start, 7);
        for s in &spans {
            assert!(s.char_len() <= 10);
        }
        assert_eq!(spans.last().unwrap().end, 25);
    }

    #[test]
    fn consecutive_spans_overlap_exactly() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let spans = chunk(&text, 120, 20);
        for pair in spans.windows(2) {
            let prev_end = char_offset(&text, pair[0].end);
            let next_start = char_offset(&text, pair[1].start);
            assert_eq!(prev_end - next_start, 20);
        }
    }

    #[test]
    fn multibyte_text_respects_char_boundaries() {
        let text = "héllo wörld ünïcode ".repeat(30);
        let spans = chunk(&text, 37, 5);
        for s in &spans {
            assert!(s.char_len() <= 37);
            assert_eq!(&text[s.start..s.end], s.text);
        }
    }

    #[test]
    fn overlap_larger_than_max_still_progresses() {
        let spans = chunk(&"x".repeat(50), 5, 50);
        assert!(spans.len() < 50);
        assert_eq!(spans.last().unwrap().end, 50);
    }

    #[test]
    fn entity_offsets_win_over_lines() {
        let text = "line one\nline two\nline three\nfn target() {}\nline four\nline five\n";
        let entity = text.find("fn target").unwrap();
        let spans = chunk_with_boundaries(text, 40, 0, &[entity]);
        assert_eq!(spans[0].end, entity);
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn chunk_code_cuts_between_functions() {
        let body = "    let x = 1;\n".repeat(8);
        let text = format!("fn a() {{\n{body}}}\n\nfn b() {{\n{body}}}\n");
        let spans = chunk_code(
            &text,
            Lang::Rust,
            &ChunkerConfig {
                max_size: 200,
                overlap: 0,
            },
        );
        assert!(spans.len() >= 2);
        assert!(spans[1].text.starts_with("fn b"));
    }

    #[test]
    fn line_range_counts_lines() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(line_range(text, 0, 2), (1, 1));
        assert_eq!(line_range(text, 2, 6), (2, 3));
    }

    #[test]
    fn content_hash_deterministic() {
        assert_eq!(blake3_hex(b"fn a() {}"), blake3_hex(b"fn a() {}"));
        assert_ne!(blake3_hex(b"fn a() {}"), blake3_hex(b"fn b() {}"));
    }

    mod proptest_chunker {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(300))]

            #[test]
            fn chunk_never_panics(
                text in "\\PC{0,2000}",
                max_size in 1usize..400,
                overlap in 0usize..200,
            ) {
                let _ = chunk(&text, max_size, overlap);
            }

            #[test]
            fn spans_bounded_and_cover_text(
                text in "[a-z]{1,8}([ .\n][a-z]{1,8}){0,300}",
                max_size in 10usize..300,
                overlap in 0usize..9,
            ) {
                let spans = chunk(&text, max_size, overlap);
                prop_assert!(!spans.is_empty());
                prop_assert_eq!(spans[0].start, 0);
                prop_assert_eq!(spans.last().unwrap().end, text.len());
                for s in &spans {
                    prop_assert!(s.char_len() <= max_size);
                }
                for pair in spans.windows(2) {
                    prop_assert!(pair[1].start < pair[0].end || overlap == 0);
                    prop_assert!(pair[1].start > pair[0].start);
                    prop_assert!(pair[1].start <= pair[0].end);
                }
            }

            #[test]
            fn deterministic(text in "[a-z \n.]{0,1000}", max_size in 5usize..200) {
                prop_assert_eq!(chunk(&text, max_size, 3), chunk(&text, max_size, 3));
            }
        }
    }
}
