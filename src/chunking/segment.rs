//! Sentence-level segmentation with word spans.

use unicode_segmentation::UnicodeSegmentation;

use super::tokenizer::TokenCounter;

/// Whitespace-free run of text located by byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Word {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) tokens: usize,
}

/// Minimal semantic unit: one sentence worth of words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unit {
    pub(crate) words: Vec<Word>,
    pub(crate) tokens: usize,
}

impl Unit {
    pub(crate) fn text<'a>(&self, source: &'a str) -> &'a str {
        match (self.words.first(), self.words.last()) {
            (Some(first), Some(last)) => &source[first.start..last.end],
            _ => "",
        }
    }
}

/// Split `text` into sentences, each holding the words that start inside it.
///
/// Words are located first and then assigned to sentences by their start offset, so a sentence
/// boundary can never cut a word in two.
pub(crate) fn segment(text: &str, counter: &TokenCounter) -> Vec<Unit> {
    let words = word_spans(text);
    if words.is_empty() {
        return Vec::new();
    }

    let mut boundaries: Vec<usize> = text
        .split_sentence_bound_indices()
        .map(|(offset, _)| offset)
        .skip(1)
        .collect();
    boundaries.push(usize::MAX);

    let mut units = Vec::new();
    let mut current = Vec::new();
    let mut boundary_iter = boundaries.into_iter();
    let mut next_boundary = boundary_iter.next().unwrap_or(usize::MAX);

    for (start, end) in words {
        while start >= next_boundary {
            if !current.is_empty() {
                units.push(build_unit(std::mem::take(&mut current)));
            }
            next_boundary = boundary_iter.next().unwrap_or(usize::MAX);
        }
        current.push(Word {
            start,
            end,
            tokens: counter.as_ref()(&text[start..end]),
        });
    }
    if !current.is_empty() {
        units.push(build_unit(current));
    }

    units
}

/// Cut a word whose token count exceeds `max_tokens` into consecutive pieces that each fit.
///
/// Each piece is the longest prefix of the remainder, at a char boundary, whose count stays
/// within budget (found by binary search). A piece always holds at least one char, so a single
/// char above budget still advances.
pub(crate) fn split_word(
    text: &str,
    word: Word,
    max_tokens: usize,
    counter: &TokenCounter,
) -> Vec<Word> {
    let count = |start: usize, end: usize| counter.as_ref()(&text[start..end]);
    let mut pieces = Vec::new();
    let mut start = word.start;
    while start < word.end {
        let ends: Vec<usize> = text[start..word.end]
            .char_indices()
            .skip(1)
            .map(|(offset, _)| start + offset)
            .chain(std::iter::once(word.end))
            .collect();
        let (mut low, mut high) = (0, ends.len());
        while low < high {
            let mid = low + (high - low) / 2;
            if count(start, ends[mid]) <= max_tokens {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        let end = ends[low.saturating_sub(1)];
        pieces.push(Word {
            start,
            end,
            tokens: count(start, end),
        });
        start = end;
    }
    pieces
}

fn build_unit(words: Vec<Word>) -> Unit {
    let tokens = words.iter().map(|word| word.tokens).sum();
    Unit { words, tokens }
}

fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(begin) = start.take() {
                spans.push((begin, index));
            }
        } else if start.is_none() {
            start = Some(index);
        }
    }
    if let Some(begin) = start {
        spans.push((begin, text.len()));
    }
    spans
}
