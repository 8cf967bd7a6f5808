//! Hierarchical topic names and subscription patterns.
//!
//! Topics are `.`-separated, non-empty tokens. Patterns may additionally use
//! `*` to match exactly one token and a trailing `>` to match one or more
//! tokens.

use crate::error::ChannelError;

const SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const TAIL_WILDCARD: &str = ">";

/// Validate a concrete topic (no wildcards).
pub fn validate_topic(topic: &str) -> Result<(), ChannelError> {
    check_tokens(topic)?;
    if topic
        .split(SEPARATOR)
        .any(|t| t == SINGLE_WILDCARD || t == TAIL_WILDCARD)
    {
        return Err(invalid(topic, "wildcards are not allowed in a published topic"));
    }
    Ok(())
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), ChannelError> {
    check_tokens(pattern)?;
    let tokens: Vec<&str> = pattern.split(SEPARATOR).collect();
    if let Some(pos) = tokens.iter().position(|t| *t == TAIL_WILDCARD) {
        if pos != tokens.len() - 1 {
            return Err(invalid(pattern, "'>' must be the last token"));
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `pattern`.
///
/// Both are assumed valid; see [`validate_topic`] and [`validate_pattern`].
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_tokens = pattern.split(SEPARATOR);
    let mut topic_tokens = topic.split(SEPARATOR);

    loop {
        match (pattern_tokens.next(), topic_tokens.next()) {
            (Some(TAIL_WILDCARD), Some(_)) => return true,
            (Some(SINGLE_WILDCARD), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn check_tokens(value: &str) -> Result<(), ChannelError> {
    if value.is_empty() {
        return Err(invalid(value, "must not be empty"));
    }
    if value.split(SEPARATOR).any(str::is_empty) {
        return Err(invalid(value, "tokens must not be empty"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(invalid(value, "must not contain whitespace"));
    }
    Ok(())
}

fn invalid(value: &str, reason: &'static str) -> ChannelError {
    ChannelError::InvalidTopic {
        topic: value.to_string(),
        reason,
    }
}
