//! Web-search intent detection and query extraction.
//!
//! Detection is a fixed set of case-insensitive trigger phrases
//! ("search the web", "look online", ...). Extraction is a heuristic cascade;
//! whenever intent is detected it always yields a non-empty query.

use once_cell::sync::Lazy;
use regex::Regex;

static TRIGGER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(?:check|search|look)\s+(?:the\s+)?web\b",
        r"(?i)\b(?:search|look)\s+online\b",
        r"(?i)\bfind\s+(?:on\s+)?(?:the\s+)?(?:web|internet)\b",
        r"(?i)\bweb\s+search\b",
        r"(?i)\bcheck\s+online\b",
        r"(?i)\blook\s+up\s+online\b",
        r"(?i)\bsearch\s+for\s+(?:me\s+)?online\b",
        r"(?i)\bgo\s+(?:check|search|look)\s+(?:the\s+)?web\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid trigger regex"))
    .collect()
});

static TRIGGER_SPLIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:check|search|look|find|go).*?\b(?:web|online|internet)\b")
        .expect("Invalid trigger split regex")
});

static TRAILING_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?.!,]+$").expect("Invalid trailing punctuation regex"));

static TOPIC_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)(?:check|search|look|find).*?(?:for|about|on)\s+(.+?)(?:\.|$)")
        .expect("Invalid topic clause regex")
});

static POLITENESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:please|thanks?|thank you)\s*$").expect("Invalid politeness regex")
});

static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

static EDGE_PUNCT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[,.?!\s]+|[,.?!\s]+$").expect("Invalid edge punctuation regex")
});

static TRIGGER_VERBS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:check|search|look|find|go)\b").expect("Invalid trigger verb regex")
});

static CONNECTORS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:web|online|internet|the)\b").expect("Invalid connector regex")
});

/// True if `text` asks for a web search.
pub fn detect_web_search_intent(text: &str) -> bool {
    TRIGGER_PATTERNS.iter().any(|p| p.is_match(text))
}

/// Best-effort search query for `text`, or `None` when there is no intent.
///
/// Strategies, first hit wins:
/// 1. the question stated before the trigger phrase (longer than 10 chars)
/// 2. an explicit "for/about/on X" clause after a trigger verb
/// 3. the text with every trigger phrase removed
/// 4. the text with trigger verbs and connector words removed, else the text itself
pub fn extract_search_query(text: &str) -> Option<String> {
    if !detect_web_search_intent(text) {
        return None;
    }

    if let Some(before) = TRIGGER_SPLIT.splitn(text, 2).next() {
        let before = before.trim();
        if !before.is_empty() {
            let query = TRAILING_PUNCT.replace(before, "").trim().to_string();
            if query.chars().count() > 10 {
                return Some(query);
            }
        }
    }

    if let Some(topic) = TOPIC_CLAUSE.captures(text).and_then(|c| c.get(1)) {
        let query = POLITENESS.replace(topic.as_str().trim(), "").to_string();
        if query.chars().count() > 3 {
            return Some(query);
        }
    }

    let mut cleaned = text.to_string();
    for pattern in TRIGGER_PATTERNS.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    let cleaned = collapse_whitespace(&cleaned);
    let cleaned = EDGE_PUNCT.replace_all(&cleaned, "").to_string();
    if cleaned.chars().count() > 3 {
        return Some(cleaned);
    }

    let fallback = TRIGGER_VERBS.replace_all(text, "");
    let fallback = CONNECTORS.replace_all(&fallback, "");
    let fallback = collapse_whitespace(&fallback);
    if fallback.is_empty() {
        Some(text.to_string())
    } else {
        Some(fallback)
    }
}

/// Detection and extraction in one call: `Some(query)` iff intent was found.
pub fn parse_web_intent(text: &str) -> Option<String> {
    let query = extract_search_query(text);
    if let Some(q) = &query {
        tracing::debug!(query = %q, "web search intent detected");
    }
    query
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_trigger_phrases_case_insensitively() {
        for text in [
            "Search web for climate change policies",
            "please CHECK THE WEB about this",
            "look online for reviews",
            "Find on the internet the latest news about fusion energy",
            "do a web search on rust",
            "can you look up online the schedule",
            "search for me online: cheap flights",
            "Go check the web for SpaceX news",
        ] {
            assert!(detect_web_search_intent(text), "missed: {text}");
        }
    }

    #[test]
    fn no_intent_in_plain_questions() {
        for text in [
            "Explain quantum entanglement in simple terms.",
            "What is the capital of France?",
            "The spider web was beautiful",
            "",
        ] {
            assert!(!detect_web_search_intent(text), "false positive: {text}");
            assert_eq!(extract_search_query(text), None);
        }
    }

    #[test]
    fn question_before_trigger_wins() {
        let q = extract_search_query(
            "What are the latest quantum computing breakthroughs? Check the web for recent developments.",
        );
        assert_eq!(q.as_deref(), Some("What are the latest quantum computing breakthroughs"));

        let q = extract_search_query("How does nuclear fusion work? Look online for explanations.");
        assert_eq!(q.as_deref(), Some("How does nuclear fusion work"));
    }

    #[test]
    fn topic_clause_after_trigger() {
        let q = extract_search_query("Search web for climate change policies").unwrap();
        assert_eq!(q, "climate change policies");
        assert!(!q.to_lowercase().contains("search web for"));

        let q = extract_search_query("Go check web for AI safety research");
        assert_eq!(q.as_deref(), Some("AI safety research"));
    }

    #[test]
    fn topic_clause_drops_politeness() {
        let q = extract_search_query("Search the web for rust async runtimes please");
        assert_eq!(q.as_deref(), Some("rust async runtimes"));
    }

    #[test]
    fn short_prefix_falls_through_to_phrase_removal() {
        let q = extract_search_query("rust news, check online");
        assert_eq!(q.as_deref(), Some("rust news"));
    }

    #[test]
    fn bare_trigger_falls_back_to_original_text() {
        assert_eq!(extract_search_query("check online").as_deref(), Some("check online"));
    }

    #[test]
    fn parse_matches_extract() {
        assert_eq!(parse_web_intent("hello there"), None);
        assert!(parse_web_intent("web search: tokio").is_some());
    }
}
