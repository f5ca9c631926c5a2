//! Spoken menu reference resolution.
//!
//! Resolution is a pure function over the utterance, the catalog items, an alias
//! table and a confidence threshold. Stages run in order and the first hit wins:
//!
//! 1. Exact: item id or normalized name (including per-item aliases)
//! 2. Alias table: word-level rewrites of common mishearings, then exact again
//! 3. Phonetic key: consonant skeleton of the words, accepted only when the
//!    spelling is also close (`phonetic_threshold`)
//! 4. Jaro-Winkler similarity at or above the threshold
//!
//! Anything below the thresholds is reported as not found with the best
//! candidate as a suggestion, so the caller can ask the guest to clarify.
//! A sound-alike rejected at stage 3 is preferred as that suggestion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::menu::MenuItem;
use crate::errors::MutationError;

/// Minimum Jaro-Winkler similarity for a candidate to be offered as a suggestion.
const SUGGESTION_FLOOR: f64 = 0.6;

/// Leading filler words dropped before matching.
const FILLER_WORDS: &[&str] = &["a", "an", "the", "some", "one", "order", "of"];

/// Matcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum Jaro-Winkler similarity to accept a fuzzy match
    pub threshold: f64,
    /// Minimum Jaro-Winkler similarity for a phonetic-key match to count.
    /// Short words share skeletons easily ("beer" and "bar").
    pub phonetic_threshold: f64,
    /// Word-level rewrites applied before the alias stage (misheard → canonical)
    pub aliases: BTreeMap<String, String>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let aliases = [
            ("fahita", "fajita"),
            ("fahitas", "fajitas"),
            ("fajeeta", "fajita"),
            ("kesadilla", "quesadilla"),
            ("quesadia", "quesadilla"),
            ("expresso", "espresso"),
            ("cappucino", "cappuccino"),
            ("gyros", "gyro"),
            ("zatziki", "tzatziki"),
        ]
        .into_iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect();

        Self {
            threshold: 0.85,
            phonetic_threshold: 0.82,
            aliases,
        }
    }
}

/// How a match was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Alias,
    Phonetic,
    Fuzzy,
}

/// A resolved menu item.
#[derive(Debug, Clone, PartialEq)]
pub struct MenuMatch<'a> {
    pub item: &'a MenuItem,
    pub kind: MatchKind,
    /// 1.0 for exact and alias matches, Jaro-Winkler similarity otherwise
    pub score: f64,
}

/// Resolve `utterance` against `items`.
pub fn resolve<'a>(
    utterance: &str,
    items: &'a [MenuItem],
    config: &MatcherConfig,
) -> Result<MenuMatch<'a>, MutationError> {
    let candidates: Vec<&MenuItem> = items.iter().filter(|item| item.available).collect();

    // Exact id, before normalization strips punctuation out of it.
    let trimmed = utterance.trim();
    if let Some(item) = candidates
        .iter()
        .copied()
        .find(|item| item.id.eq_ignore_ascii_case(trimmed))
    {
        return Ok(exact(item, MatchKind::Exact));
    }

    let query = normalize(utterance);
    if query.is_empty() {
        return Err(MutationError::MenuItemNotFound {
            query: utterance.to_string(),
            suggestion: None,
        });
    }

    if let Some(item) = find_by_name(&candidates, &query) {
        return Ok(exact(item, MatchKind::Exact));
    }

    let rewritten = apply_aliases(&query, &config.aliases);
    if rewritten != query
        && let Some(item) = find_by_name(&candidates, &rewritten)
    {
        return Ok(exact(item, MatchKind::Alias));
    }

    // Several items can share a skeleton; prefer the closest spelling.
    let key = phonetic_key(&rewritten);
    let sound_alike = candidates
        .iter()
        .copied()
        .filter(|item| spoken_names(item).any(|name| phonetic_key(&name) == key))
        .map(|item| (item, similarity(&rewritten, item)))
        .max_by(|a, b| a.1.total_cmp(&b.1));
    if let Some((item, score)) = sound_alike
        && score >= config.phonetic_threshold
    {
        return Ok(MenuMatch {
            item,
            kind: MatchKind::Phonetic,
            score,
        });
    }

    let best = candidates
        .iter()
        .map(|item| (*item, similarity(&rewritten, item)))
        .max_by(|a, b| a.1.total_cmp(&b.1));

    if let Some((item, score)) = best
        && score >= config.threshold
    {
        return Ok(MenuMatch {
            item,
            kind: MatchKind::Fuzzy,
            score,
        });
    }

    let suggestion = sound_alike
        .map(|(item, _)| item)
        .or_else(|| best.filter(|(_, score)| *score >= SUGGESTION_FLOOR).map(|(item, _)| item))
        .map(|item| item.name.clone());
    Err(MutationError::MenuItemNotFound {
        query: utterance.to_string(),
        suggestion,
    })
}

fn exact(item: &MenuItem, kind: MatchKind) -> MenuMatch<'_> {
    MenuMatch {
        item,
        kind,
        score: 1.0,
    }
}

/// Item name and aliases, normalized.
fn spoken_names(item: &MenuItem) -> impl Iterator<Item = String> + '_ {
    std::iter::once(normalize(&item.name)).chain(item.aliases.iter().map(|a| normalize(a)))
}

fn find_by_name<'a>(candidates: &[&'a MenuItem], query: &str) -> Option<&'a MenuItem> {
    let singular = singularize(query);
    candidates.iter().copied().find(|item| {
        spoken_names(item).any(|name| name == query || name == singular || singularize(&name) == singular)
    })
}

fn similarity(query: &str, item: &MenuItem) -> f64 {
    let singular = singularize(query);
    spoken_names(item)
        .map(|name| {
            strsim::jaro_winkler(query, &name).max(strsim::jaro_winkler(&singular, &singularize(&name)))
        })
        .fold(0.0, f64::max)
}

/// Lowercase, strip punctuation, collapse whitespace and drop leading filler words.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();

    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    while words.len() > 1 && FILLER_WORDS.contains(&words[0]) {
        words.remove(0);
    }
    words.join(" ")
}

fn singularize(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
                &word[..word.len() - 1]
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn apply_aliases(text: &str, aliases: &BTreeMap<String, String>) -> String {
    if let Some(whole) = aliases.get(text) {
        return whole.clone();
    }
    text.split(' ')
        .map(|word| aliases.get(word).map(String::as_str).unwrap_or(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Consonant skeleton of each word.
///
/// Spelling variants that sound alike collapse to the same key: `ph`/`f`,
/// `c`/`k`/`q`, `j`/`h`, `ll`/`y`, `z`/`s`; vowels after the first letter and
/// doubled letters are dropped.
pub fn phonetic_key(text: &str) -> String {
    text.split(' ')
        .filter(|word| !word.is_empty())
        .map(word_key)
        .collect::<Vec<_>>()
        .join(" ")
}

fn word_key(word: &str) -> String {
    let word = singularize(word)
        .replace("ph", "f")
        .replace("ck", "k")
        .replace("qu", "k")
        .replace("ll", "y")
        .replace("gh", "g")
        .replace("tz", "s");

    let mut key = String::with_capacity(word.len());
    for (i, c) in word.chars().enumerate() {
        let mapped = match c {
            'c' | 'q' => 'k',
            'z' => 's',
            'j' => 'h',
            'v' => 'b',
            'a' | 'e' | 'i' | 'o' | 'u' if i > 0 => continue,
            other => other,
        };
        if key.ends_with(mapped) {
            continue;
        }
        if mapped == 'x' {
            key.push_str("ks");
        } else {
            key.push(mapped);
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, name: &str) -> MenuItem {
        MenuItem {
            id: id.to_string(),
            name: name.to_string(),
            price_cents: 1000,
            aliases: vec![],
            modifiers: vec![],
            available: true,
        }
    }

    fn menu() -> Vec<MenuItem> {
        let mut fries = item("fries", "French Fries");
        fries.aliases.push("fries".to_string());
        vec![
            item("greek-bowl", "Greek Bowl"),
            item("chicken-fajita", "Chicken Fajita"),
            item("quesadilla", "Cheese Quesadilla"),
            item("espresso", "Espresso"),
            item("burger", "Classic Burger"),
            fries,
        ]
    }

    #[test]
    fn test_exact_id_and_name() {
        let items = menu();
        let config = MatcherConfig::default();

        let m = resolve("greek-bowl", &items, &config).unwrap();
        assert_eq!(m.item.id, "greek-bowl");
        assert_eq!(m.kind, MatchKind::Exact);

        let m = resolve("  the Greek Bowls!", &items, &config).unwrap();
        assert_eq!(m.item.id, "greek-bowl");
        assert_eq!(m.kind, MatchKind::Exact);

        let m = resolve("fries", &items, &config).unwrap();
        assert_eq!(m.item.id, "fries");
    }

    #[test]
    fn test_alias_table() {
        let items = menu();
        let config = MatcherConfig::default();

        let m = resolve("expresso", &items, &config).unwrap();
        assert_eq!(m.item.id, "espresso");
        assert_eq!(m.kind, MatchKind::Alias);

        let m = resolve("chicken fahita", &items, &config).unwrap();
        assert_eq!(m.item.id, "chicken-fajita");
        assert_eq!(m.kind, MatchKind::Alias);
    }

    #[test]
    fn test_phonetic_match() {
        let items = menu();
        let config = MatcherConfig {
            aliases: BTreeMap::new(),
            ..Default::default()
        };

        let m = resolve("chicken fahita", &items, &config).unwrap();
        assert_eq!(m.item.id, "chicken-fajita");
        assert_eq!(m.kind, MatchKind::Phonetic);

        let m = resolve("cheese kesadiya", &items, &config).unwrap();
        assert_eq!(m.item.id, "quesadilla");
        assert_eq!(m.kind, MatchKind::Phonetic);
    }

    #[test]
    fn test_fuzzy_match_above_threshold() {
        let items = menu();
        let config = MatcherConfig::default();

        let m = resolve("clasik burjer", &items, &config).unwrap();
        assert_eq!(m.item.id, "burger");
        assert!(m.score >= 0.85);
    }

    #[test]
    fn test_low_confidence_reports_suggestion() {
        let items = menu();
        let config = MatcherConfig {
            threshold: 0.99,
            ..Default::default()
        };

        let err = resolve("clasik burjer", &items, &config).unwrap_err();
        match err {
            MutationError::MenuItemNotFound { query, suggestion } => {
                assert_eq!(query, "clasik burjer");
                assert_eq!(suggestion.as_deref(), Some("Classic Burger"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = resolve("zzzz", &items, &MatcherConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            MutationError::MenuItemNotFound {
                suggestion: None,
                ..
            }
        ));
    }

    #[test]
    fn test_unavailable_items_are_skipped() {
        let mut items = menu();
        items[3].available = false;
        assert!(resolve("espresso", &items, &MatcherConfig::default()).is_err());
    }

    #[test]
    fn test_phonetic_key() {
        assert_eq!(phonetic_key("fajita"), phonetic_key("fahita"));
        assert_eq!(phonetic_key("quesadilla"), phonetic_key("kesadiya"));
        assert_eq!(phonetic_key("philly"), phonetic_key("filly"));
        assert_ne!(phonetic_key("burger"), phonetic_key("espresso"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  An order of   Fries, please "), "fries please");
        assert_eq!(normalize("the"), "the");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_weak_sound_alike_becomes_suggestion() {
        let items = vec![
            item("bar", "Bar"),
            item("malek", "Malek"),
            item("bugle", "Bugle"),
        ];
        let config = MatcherConfig::default();

        for (said, expected) in [("beer", "Bar"), ("milk", "Malek"), ("bagel", "Bugle")] {
            assert_eq!(phonetic_key(said), phonetic_key(&expected.to_lowercase()));
            match resolve(said, &items, &config) {
                Err(MutationError::MenuItemNotFound { suggestion, .. }) => {
                    assert_eq!(suggestion.as_deref(), Some(expected), "for {said:?}");
                }
                other => panic!("{said:?} should need clarification, got {other:?}"),
            }
        }
    }
}
