//! Extractive summary helpers used when merging lower-level results.

/// A piece of text competing for space in a merged summary.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WeightedText<'a> {
    pub(crate) text: &'a str,
    pub(crate) weight: f32,
}

/// First sentence of `text`, cut to `max_words` words.
pub(crate) fn extractive_summary(text: &str, max_words: usize) -> String {
    truncate_words(first_sentence(text.trim()), max_words)
}

/// Merge summaries under a word budget.
///
/// Parts are admitted by descending weight (ties keep input order) until the budget is spent,
/// then emitted in input order. The first admitted part is always kept, truncated if needed.
pub(crate) fn merge_summaries(parts: &[WeightedText<'_>], max_words: usize) -> String {
    let mut ranked: Vec<usize> = (0..parts.len())
        .filter(|&index| !parts[index].text.trim().is_empty())
        .collect();
    ranked.sort_by(|&left, &right| parts[right].weight.total_cmp(&parts[left].weight));

    let mut chosen: Vec<(usize, String)> = Vec::new();
    let mut used_words = 0usize;
    for index in ranked {
        let text = parts[index].text.trim();
        let words = count_words(text);
        if chosen.is_empty() && words > max_words {
            chosen.push((index, truncate_words(text, max_words)));
            break;
        }
        if used_words + words > max_words {
            continue;
        }
        used_words += words;
        chosen.push((index, text.to_string()));
    }

    chosen.sort_by_key(|(index, _)| *index);
    chosen
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Weighted mean; zero when the weights sum to zero.
pub(crate) fn weighted_mean(values: impl IntoIterator<Item = (f32, f32)>) -> f32 {
    let (sum, weights) = values
        .into_iter()
        .fold((0.0_f32, 0.0_f32), |(sum, weights), (value, weight)| {
            (sum + value * weight, weights + weight)
        });
    if weights > 0.0 { sum / weights } else { 0.0 }
}

fn first_sentence(text: &str) -> &str {
    text.char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?'))
        .map(|(index, c)| text[..index + c.len_utf8()].trim())
        .filter(|sentence| sentence.len() > 1)
        .unwrap_or(text)
}

fn truncate_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return words.join(" ");
    }
    let mut truncated = words[..max_words].join(" ");
    truncated.push('…');
    truncated
}

fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}
