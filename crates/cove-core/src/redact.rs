//! Secret scrubbing for text that is persisted as data (error transcripts, artifacts).

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret",
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token",
            Regex::new(r"(sk-[A-Za-z0-9\-_]{16,})").expect("invalid sk_token regex"),
        ),
    ]
});

/// Result of scrubbing one piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redacted {
    pub text: String,
    pub patterns: Vec<&'static str>,
}

pub fn redact(input: &str) -> Redacted {
    let mut text = input.to_string();
    let mut patterns = Vec::new();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        text = regex
            .replace_all(&text, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .into_owned();
        if matched {
            patterns.push(*name);
        }
    }
    Redacted { text, patterns }
}

/// Scrub `input`, warning once when anything was removed.
pub fn scrub(input: &str) -> String {
    let redacted = redact(input);
    if !redacted.patterns.is_empty() {
        tracing::warn!(fields = ?redacted.patterns, "redacted potential secrets from recorded text");
    }
    redacted.text
}
