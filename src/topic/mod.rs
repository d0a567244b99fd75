//! Topic names, topic filters, and matching
//!
//! A topic is a `/`-separated, case-sensitive path. Filters may use `+`
//! (exactly one level) and a trailing `#` (all remaining levels, including
//! none). Topics whose first level starts with `$` are reserved: a filter
//! can only reach them by spelling the `$`-level out literally.

use std::fmt;

/// Why a topic name or filter was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    Empty,
    TooLong,
    EmbeddedNul,
    /// `+` or `#` inside a topic name (they are filter-only)
    WildcardInName,
    /// `#` sharing a level with other characters
    HashNotAlone,
    /// `#` followed by further levels
    HashNotLast,
    /// `+` sharing a level with other characters
    PlusNotAlone,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::Empty => write!(f, "empty topic"),
            TopicError::TooLong => write!(f, "topic longer than 65535 bytes"),
            TopicError::EmbeddedNul => write!(f, "topic contains U+0000"),
            TopicError::WildcardInName => write!(f, "wildcard in a topic name"),
            TopicError::HashNotAlone => write!(f, "'#' must occupy a whole level"),
            TopicError::HashNotLast => write!(f, "'#' only allowed as the final level"),
            TopicError::PlusNotAlone => write!(f, "'+' must occupy a whole level"),
        }
    }
}

impl std::error::Error for TopicError {}

/// How a topic filter is stored and matched by the subscription index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// No wildcards: exact-match tier
    Simple,
    /// Contains `+` or a non-lone `#`: level-matched tier
    Wildcard,
    /// The filter is exactly `#`: matches every non-`$` topic
    Omni,
}

impl FilterKind {
    /// Classify a (validated) topic filter
    pub fn classify(filter: &str) -> FilterKind {
        if filter == "#" {
            FilterKind::Omni
        } else if filter.contains('+') || filter.contains('#') {
            FilterKind::Wildcard
        } else {
            FilterKind::Simple
        }
    }
}

/// Split a topic or filter into its levels
pub fn split_levels(topic: &str) -> Vec<String> {
    topic.split('/').map(str::to_string).collect()
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > u16::MAX as usize {
        return Err(TopicError::TooLong);
    }
    if topic.as_bytes().contains(&0) {
        return Err(TopicError::EmbeddedNul);
    }
    Ok(())
}

/// Validate a topic name (PUBLISH topics and will topics)
pub fn check_topic_name(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.as_bytes().iter().any(|&b| b == b'+' || b == b'#') {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// Validate a topic filter (SUBSCRIBE/UNSUBSCRIBE)
pub fn check_topic_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => return Err(TopicError::HashNotLast),
            "#" | "+" => {}
            mixed if mixed.contains('#') => return Err(TopicError::HashNotAlone),
            mixed if mixed.contains('+') => return Err(TopicError::PlusNotAlone),
            _ => {}
        }
    }
    Ok(())
}

/// Match a pre-split wildcard filter against a topic name.
///
/// Walks the topic's levels alongside the pattern: a literal must equal the
/// next level, `+` consumes the next level whatever it is, and `#` accepts
/// everything still unconsumed (including nothing, so `a/#` covers `a`).
pub fn filter_matches(pattern: &[String], topic: &str) -> bool {
    // [MQTT-4.7.2-1] a leading wildcard never reaches a $-topic
    if topic.starts_with('$') {
        if let Some("+" | "#") = pattern.first().map(String::as_str) {
            return false;
        }
    }

    let mut levels = topic.split('/');
    for part in pattern {
        match part.as_str() {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    // the topic must be fully consumed as well
    levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(filter: &str, topic: &str) -> bool {
        filter_matches(&split_levels(filter), topic)
    }

    #[test]
    fn test_classify() {
        assert_eq!(FilterKind::classify("a/b/c"), FilterKind::Simple);
        assert_eq!(FilterKind::classify("a"), FilterKind::Simple);
        assert_eq!(FilterKind::classify("a/+/c"), FilterKind::Wildcard);
        assert_eq!(FilterKind::classify("a/#"), FilterKind::Wildcard);
        assert_eq!(FilterKind::classify("+"), FilterKind::Wildcard);
        assert_eq!(FilterKind::classify("$SYS/#"), FilterKind::Wildcard);
        assert_eq!(FilterKind::classify("#"), FilterKind::Omni);
    }

    #[test]
    fn test_topic_name_rules() {
        assert_eq!(check_topic_name("sensors"), Ok(()));
        assert_eq!(check_topic_name("sensors/hall/temp"), Ok(()));
        assert_eq!(check_topic_name("/leading/slash"), Ok(()));
        assert_eq!(check_topic_name("trailing/slash/"), Ok(()));

        assert_eq!(check_topic_name(""), Err(TopicError::Empty));
        assert_eq!(check_topic_name("a\0b"), Err(TopicError::EmbeddedNul));
        assert_eq!(check_topic_name("a/+/b"), Err(TopicError::WildcardInName));
        assert_eq!(check_topic_name("a/#"), Err(TopicError::WildcardInName));
        assert_eq!(check_topic_name("a+b"), Err(TopicError::WildcardInName));
    }

    #[test]
    fn test_topic_filter_rules() {
        assert_eq!(check_topic_filter("sensors"), Ok(()));
        assert_eq!(check_topic_filter("sensors/+/temp"), Ok(()));
        assert_eq!(check_topic_filter("+"), Ok(()));
        assert_eq!(check_topic_filter("#"), Ok(()));
        assert_eq!(check_topic_filter("sensors/#"), Ok(()));
        assert_eq!(check_topic_filter("+/+/+"), Ok(()));

        assert_eq!(check_topic_filter(""), Err(TopicError::Empty));
        assert_eq!(check_topic_filter("a#"), Err(TopicError::HashNotAlone));
        assert_eq!(check_topic_filter("a/#/b"), Err(TopicError::HashNotLast));
        assert_eq!(check_topic_filter("a+"), Err(TopicError::PlusNotAlone));
        assert_eq!(check_topic_filter("+a/b"), Err(TopicError::PlusNotAlone));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("test/+", "test/topic"));
        assert!(matches("+/topic", "test/topic"));
        assert!(matches("+/+", "test/topic"));
        assert!(matches("+/b/+", "a/b/c"));
        assert!(!matches("+/+", "test"));
        assert!(!matches("test/+", "test/topic/extra"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("test/#", "test/topic"));
        assert!(matches("test/#", "test/topic/more"));
        // '#' also covers the parent level itself
        assert!(matches("test/#", "test"));
        assert!(!matches("test/#", "other/topic"));

        assert!(matches("a/+/#", "a/b/c/d"));
        assert!(!matches("a/+/#", "a"));
    }

    #[test]
    fn test_dollar_topics_need_literal_prefix() {
        assert!(!matches("#", "$SYS/load"));
        assert!(!matches("+/load", "$SYS/load"));
        assert!(matches("$SYS/+", "$SYS/load"));
        assert!(matches("$SYS/#", "$SYS/load"));
        assert!(!matches("$SYS/#", "a/b"));
    }
}
