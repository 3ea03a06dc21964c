//! Subject syntax: dot-separated tokens with `*` and trailing `>` wildcards

use crate::models::{HubError, HubResult};

/// Single-token wildcard
pub const WILDCARD_ONE: &str = "*";
/// Trailing multi-token wildcard
pub const WILDCARD_TAIL: &str = ">";

/// Whether `subject` matches `pattern`.
///
/// `*` matches exactly one token, `>` as the final token matches one or more
/// trailing tokens, anything else matches literally. Without a trailing `>`
/// both sides must have the same number of tokens.
pub fn matches(pattern: &str, subject: &str) -> bool {
    if pattern.is_empty() || subject.is_empty() {
        return false;
    }

    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let last = pattern_tokens.len() - 1;

    for (i, token) in pattern_tokens.iter().enumerate() {
        if *token == WILDCARD_TAIL && i == last {
            return subject_tokens.len() > i;
        }
        match subject_tokens.get(i) {
            None => return false,
            Some(s) if s.is_empty() => return false,
            Some(_) if *token == WILDCARD_ONE => {}
            Some(s) if s == token => {}
            Some(_) => return false,
        }
    }

    pattern_tokens.len() == subject_tokens.len()
}

/// Whether `subject` carries `namespace` as its leading token(s)
pub fn has_namespace(namespace: &str, subject: &str) -> bool {
    subject == namespace
        || subject
            .strip_prefix(namespace)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Prefix `subject` with `namespace` unless it already carries it
pub fn qualify(namespace: &str, subject: &str) -> String {
    if has_namespace(namespace, subject) {
        subject.to_string()
    } else {
        format!("{}.{}", namespace, subject)
    }
}

/// Check a concrete (publishable) subject
pub fn validate_subject(subject: &str) -> HubResult<()> {
    validate_tokens(subject, false)
}

/// Check a subscription pattern
pub fn validate_pattern(pattern: &str) -> HubResult<()> {
    validate_tokens(pattern, true)
}

fn validate_tokens(value: &str, allow_wildcards: bool) -> HubResult<()> {
    if value.is_empty() {
        return Err(HubError::Validation("subject must not be empty".to_string()));
    }
    for token in value.split('.') {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return Err(HubError::Validation(format!("invalid subject '{}'", value)));
        }
        if !allow_wildcards && (token == WILDCARD_ONE || token == WILDCARD_TAIL) {
            return Err(HubError::Validation(format!(
                "subject '{}' must not contain wildcards",
                value
            )));
        }
    }
    Ok(())
}

/// Builders for the subjects the hub publishes on
pub mod subjects {
    /// Peer discovery announcements
    pub fn global_presence(namespace: &str) -> String {
        format!("{}.global.presence", namespace)
    }

    /// Aggregate metrics of one hub
    pub fn global_metrics(namespace: &str, hub_id: &str) -> String {
        format!("{}.global.metrics.{}", namespace, hub_id)
    }

    /// Catalog-facing per-project heartbeat
    pub fn project_presence(namespace: &str, project_slug: &str) -> String {
        format!("{}.presence.{}", namespace, project_slug)
    }

    /// Pattern matching every project heartbeat
    pub fn project_presence_pattern(namespace: &str) -> String {
        format!("{}.presence.*", namespace)
    }

    /// Result of a health check
    pub fn health_result(namespace: &str, service_id: &str) -> String {
        format!("{}.health.{}", namespace, service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(matches("hub.global.presence", "hub.global.presence"));
        assert!(!matches("hub.global.presence", "hub.global.metrics"));
        assert!(!matches("hub.global", "hub.global.presence"));
    }

    #[test]
    fn test_single_token_wildcard() {
        assert!(matches("hub.presence.*", "hub.presence.alpha"));
        assert!(!matches("hub.presence.*", "hub.presence"));
        assert!(!matches("hub.presence.*", "hub.presence.alpha.extra"));
        assert!(!matches("hub.*.project.*", "hub.local.test.project.created"));
        assert!(matches("hub.*.project.*", "hub.local.project.created"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(matches("hub.global.>", "hub.global.presence.announced"));
        assert!(matches("hub.global.>", "hub.global.presence"));
        assert!(!matches("hub.global.>", "hub.global"));
        assert!(!matches("hub.global.>", "hub.local.presence"));
        assert!(matches(">", "anything.at.all"));
    }

    #[test]
    fn test_tail_wildcard_only_at_end() {
        // A non-final `>` is an ordinary token
        assert!(!matches("hub.>.presence", "hub.global.presence"));
        assert!(matches("hub.>.presence", "hub.>.presence"));
    }

    #[test]
    fn test_empty_tokens_never_match() {
        assert!(!matches("hub.*", "hub."));
        assert!(!matches("", "hub"));
        assert!(!matches("hub", ""));
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("hub", "global.presence"), "hub.global.presence");
        assert_eq!(qualify("hub", "hub.global.presence"), "hub.global.presence");
        assert_eq!(qualify("hub", "hubble.events"), "hub.hubble.events");
        assert_eq!(qualify("hub", "hub"), "hub");
        assert_eq!(qualify("hub", ">"), "hub.>");
    }

    #[test]
    fn test_validation() {
        assert!(validate_subject("hub.global.presence").is_ok());
        assert!(validate_subject("hub.*").is_err());
        assert!(validate_subject("hub..x").is_err());
        assert!(validate_subject("hub. x").is_err());
        assert!(validate_pattern("hub.presence.*").is_ok());
        assert!(validate_pattern("hub.>").is_ok());
    }

    #[test]
    fn test_subject_builders() {
        assert_eq!(subjects::global_presence("hub"), "hub.global.presence");
        assert_eq!(subjects::global_metrics("hub", "h1"), "hub.global.metrics.h1");
        assert_eq!(subjects::project_presence("hub", "alpha"), "hub.presence.alpha");
        assert!(matches(
            &subjects::project_presence_pattern("hub"),
            &subjects::project_presence("hub", "alpha")
        ));
    }
}
