use std::sync::OnceLock;

use rust_stemmers::{Algorithm, Stemmer};

/// Punctuation stripped from tokens before stemming. Includes `~` so the
/// searchable transcript's meta markers can never collide with stemmed text.
const PUNCTUATION: &[char] = &[',', '.', '!', '?', '"', '\\', '[', ']', '(', ')', '~'];

fn stemmer() -> &'static Stemmer {
    static STEMMER: OnceLock<Stemmer> = OnceLock::new();
    STEMMER.get_or_init(|| Stemmer::create(Algorithm::English))
}

/// Normalize a line of text into its stemmed form: lowercase, strip common
/// punctuation, stem each word, join with single spaces.
///
/// The output never contains the character `~`.
pub fn stem_line(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(value.len());
    for word in stem_words(value) {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&word);
    }

    out
}

/// Like [`stem_line`] but returns the stemmed tokens in order.
pub fn stem_words(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .filter_map(|token| {
            let cleaned: String = token
                .chars()
                .filter(|c| !PUNCTUATION.contains(c))
                .collect::<String>()
                .to_lowercase();
            if cleaned.is_empty() {
                None
            } else {
                Some(stemmer().stem(&cleaned).into_owned())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stems_and_joins() {
        assert_eq!(stem_line("Thanks for watching!"), "thank for watch");
        assert_eq!(stem_line("running, jumping."), "run jump");
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert_eq!(stem_line(""), "");
        assert_eq!(stem_line("   "), "");
        assert_eq!(stem_line("  hello   there  "), "hello there");
    }

    #[test]
    fn test_punctuation_removed() {
        let stemmed = stem_line(r#"wow!? ("quoted") [bracketed] back\slash"#);
        for c in [',', '.', '!', '?', '"', '\\', '[', ']', '(', ')', '~'] {
            assert!(!stemmed.contains(c), "{:?} leaked into {:?}", c, stemmed);
        }
    }

    #[test]
    fn test_never_emits_tilde() {
        assert_eq!(stem_line("~~~"), "");
        assert_eq!(stem_line("a~b c~~d"), "ab cd");
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "the quick brown fox jumps over the lazy dog",
            "Running quickly, turning sharply!",
            "hello there friend",
        ];
        for input in inputs {
            let once = stem_line(input);
            assert_eq!(stem_line(&once), once, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn test_stem_words_order() {
        assert_eq!(stem_words("watching videos daily"), vec!["watch", "video", "daili"]);
    }
}
