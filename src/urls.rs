use regex::Regex;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::LazyLock;

/// `http(s)://` up to whitespace, brackets, quotes, backtick, pipe, backslash or caret.
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).unwrap());

/// Sentence punctuation that usually trails a pasted link rather than belonging to it.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', '!', '?', ')'];

/// Every URL occurrence in `text` with its byte range, trailing punctuation already trimmed.
/// Occurrences are yielded in order and may repeat.
pub fn url_spans(text: &str) -> impl Iterator<Item = (Range<usize>, &str)> {
    URL_RE.find_iter(text).filter_map(|m| {
        let trimmed = m.as_str().trim_end_matches(TRAILING_PUNCTUATION);
        // "https://" alone, or something that was all punctuation after the scheme
        if !trimmed.contains("://") || trimmed.ends_with("://") {
            return None;
        }
        Some((m.start()..m.start() + trimmed.len(), trimmed))
    })
}

/// Distinct URLs in first-seen order. Empty text yields an empty list.
pub fn find_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    url_spans(text)
        .filter(|(_, url)| seen.insert(*url))
        .map(|(_, url)| url.to_string())
        .collect()
}
