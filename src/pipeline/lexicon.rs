//! Deterministic lexicon fallback for the sentiment ensemble.
//!
//! Scores text by counting weighted hits against finance/crypto word lists
//! with a short negation window. Output is bit-identical for identical
//! input; no allocation beyond tokenization.

const POSITIVE_WORDS: &[&str] = &[
    "adoption",
    "ath",
    "breakout",
    "bull",
    "bullish",
    "buy",
    "buying",
    "confident",
    "gain",
    "gains",
    "good",
    "great",
    "green",
    "growth",
    "high",
    "long",
    "milestone",
    "moon",
    "optimistic",
    "partnership",
    "profit",
    "promising",
    "rally",
    "record",
    "rise",
    "rising",
    "soar",
    "soaring",
    "solid",
    "strong",
    "success",
    "successful",
    "support",
    "surge",
    "undervalued",
    "up",
    "upgrade",
    "win",
    "winning",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad",
    "ban",
    "bankrupt",
    "bankruptcy",
    "banned",
    "bear",
    "bearish",
    "bubble",
    "collapse",
    "crash",
    "decline",
    "delisted",
    "down",
    "drop",
    "dropping",
    "dump",
    "exploit",
    "fall",
    "falling",
    "fear",
    "fraud",
    "fud",
    "hack",
    "hacked",
    "insolvent",
    "lawsuit",
    "loss",
    "losses",
    "overvalued",
    "panic",
    "plunge",
    "ponzi",
    "red",
    "risk",
    "risky",
    "rug",
    "rugpull",
    "scam",
    "sell",
    "selloff",
    "short",
    "terrible",
    "weak",
    "worthless",
];

const NEGATORS: &[&str] = &[
    "not", "no", "never", "without", "isnt", "dont", "doesnt", "wont", "cant", "didnt", "wasnt",
];

/// How many tokens after a negator still get flipped.
const NEGATION_WINDOW: usize = 3;

/// Confidence cap for the lexicon alone; word counting is never more than
/// moderately sure.
const MAX_CONFIDENCE: f64 = 0.8;

/// Deterministic word-list scorer.
#[derive(Debug, Clone, Default)]
pub struct LexiconScorer;

impl LexiconScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score a text. Returns `(polarity, confidence)` with polarity in
    /// [-1, 1] and confidence in [0, 1].
    pub fn score(&self, text: &str) -> (f64, f64) {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return (0.0, 0.0);
        }

        let mut positive = 0u32;
        let mut negative = 0u32;
        let mut negated_until: Option<usize> = None;

        for (index, token) in tokens.iter().enumerate() {
            if NEGATORS.contains(&token.as_str()) {
                negated_until = Some(index + NEGATION_WINDOW);
                continue;
            }
            let flip = matches!(negated_until, Some(limit) if index <= limit);

            if POSITIVE_WORDS.binary_search(&token.as_str()).is_ok() {
                if flip {
                    negative += 1;
                } else {
                    positive += 1;
                }
            } else if NEGATIVE_WORDS.binary_search(&token.as_str()).is_ok() {
                if flip {
                    positive += 1;
                } else {
                    negative += 1;
                }
            }
        }

        let hits = positive + negative;
        if hits == 0 {
            return (0.0, 0.0);
        }

        let polarity = (positive as f64 - negative as f64) / hits as f64;
        let density = hits as f64 / tokens.len() as f64;
        let confidence = (density * 4.0).min(MAX_CONFIDENCE);
        (polarity, confidence)
    }
}

/// Lowercase alphanumeric tokens; apostrophes are stripped so "don't"
/// matches the negator list.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_lists_are_sorted() {
        // binary_search requires it.
        let mut sorted = POSITIVE_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, POSITIVE_WORDS);

        let mut sorted = NEGATIVE_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, NEGATIVE_WORDS);
    }

    #[test]
    fn test_positive_text() {
        let scorer = LexiconScorer::new();
        let (polarity, confidence) = scorer.score("Strong rally and solid gains today");
        assert!(polarity > 0.9);
        assert!(confidence > 0.0);
    }

    #[test]
    fn test_negative_text() {
        let scorer = LexiconScorer::new();
        let (polarity, confidence) = scorer.score("total scam, expect a crash and heavy losses");
        assert!(polarity < -0.9);
        assert!(confidence > 0.0);
    }

    #[test]
    fn test_neutral_text_zero_confidence() {
        let scorer = LexiconScorer::new();
        let (polarity, confidence) = scorer.score("the meeting is scheduled for tuesday");
        assert_eq!(polarity, 0.0);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_empty_text() {
        let scorer = LexiconScorer::new();
        assert_eq!(scorer.score(""), (0.0, 0.0));
        assert_eq!(scorer.score("   \n\t"), (0.0, 0.0));
    }

    #[test]
    fn test_negation_flips_polarity() {
        let scorer = LexiconScorer::new();
        let (plain, _) = scorer.score("this is a strong project");
        let (negated, _) = scorer.score("this is not a strong project");
        assert!(plain > 0.0);
        assert!(negated < 0.0);
    }

    #[test]
    fn test_negation_window_expires() {
        let scorer = LexiconScorer::new();
        // "strong" is more than NEGATION_WINDOW tokens past "not".
        let (polarity, _) = scorer.score("not now anyway but later the outlook is strong");
        assert!(polarity > 0.0);
    }

    #[test]
    fn test_mixed_text_balances() {
        let scorer = LexiconScorer::new();
        let (polarity, _) = scorer.score("big gains but also big losses");
        assert_eq!(polarity, 0.0);
    }

    #[test]
    fn test_determinism() {
        let scorer = LexiconScorer::new();
        let text = "bullish breakout, expect a strong rally despite the fud";
        let first = scorer.score(text);
        for _ in 0..10 {
            assert_eq!(scorer.score(text), first);
        }
    }

    #[test]
    fn test_confidence_capped() {
        let scorer = LexiconScorer::new();
        let (_, confidence) = scorer.score("moon moon moon moon moon");
        assert!(confidence <= MAX_CONFIDENCE);
    }
}
