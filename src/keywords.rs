use std::collections::HashMap;

/// Common English stopwords excluded from keyword candidates
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "before", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had",
    "has", "have", "how", "i", "if", "in", "into", "is", "it", "its", "just", "may", "more",
    "most", "much", "my", "no", "not", "of", "on", "one", "only", "or", "other", "our", "out",
    "over", "should", "so", "some", "such", "than", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "those", "through", "to", "under", "up", "use", "used",
    "using", "was", "we", "were", "what", "when", "where", "which", "while", "who", "why",
    "will", "with", "would", "you", "your",
];

/// Extract up to `top_n` representative keywords from `text`.
///
/// Deterministic: tokens are ranked by frequency, ties broken by first
/// occurrence. Empty or all-stopword text yields an empty list.
pub fn extract_keywords(text: &str, top_n: usize) -> Vec<String> {
    if text.trim().is_empty() || top_n == 0 {
        return Vec::new();
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();

    for (position, token) in tokenize(text).enumerate() {
        if token.len() < 3 || STOPWORDS.binary_search(&token.as_str()).is_ok() {
            continue;
        }
        *counts.entry(token.clone()).or_insert(0) += 1;
        first_seen.entry(token).or_insert(position);
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then_with(|| first_seen[&a.0].cmp(&first_seen[&b.0]))
    });

    ranked.into_iter().take(top_n).map(|(word, _)| word).collect()
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}
