//! Topic matching and subscription tracking
//!
//! `matches` decides whether a concrete topic falls under a subscription
//! filter; the registry maps filters to the handlers that receive them.

pub mod registry;
pub mod validation;

pub use registry::{Subscription, SubscriptionRegistry};
pub use validation::{validate_topic_filter, validate_topic_name};

/// Check if a topic filter matches a concrete topic
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one non-empty level
/// - # matches the remaining levels, zero or more (must be last)
/// - any other level must match literally
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(filter_level) = filter_levels.next() {
        if filter_level == "#" {
            // only meaningful as the final level
            return filter_levels.peek().is_none();
        }

        let Some(topic_level) = topic_levels.next() else {
            return false;
        };

        match filter_level {
            "+" if !topic_level.is_empty() => {}
            "+" => return false,
            literal if literal == topic_level => {}
            _ => return false,
        }
    }

    // Leftover concrete levels mean the filter was too short
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reference_matches() {
        assert!(matches("aaa/bbb/ccc", "aaa/bbb/#"));
        assert!(matches("aaa/bbb/ccc", "aaa/+/+"));
        assert!(matches("aaa/bbb", "aaa/bbb/#"));
        assert!(!matches("aaa/bbb", "aaa/bbb/ddd/#"));
        assert!(!matches("aaa/bbb/ccc", "aaa/bbb"));
        assert!(matches("aaa", "aaa"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("test/topic", "test/+"));
        assert!(matches("test/topic", "+/topic"));
        assert!(matches("a/b/c", "+/b/+"));
        assert!(!matches("test", "+/+"));
        assert!(!matches("test/topic/extra", "test/+"));
        // + never matches an empty level
        assert!(!matches("test/", "test/+"));
        assert!(!matches("/finance", "+/finance"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("test", "#"));
        assert!(matches("test/topic/more", "#"));
        assert!(matches("test/topic/more", "test/#"));
        assert!(matches("/leading/slash", "/#"));
        assert!(!matches("other/topic", "test/#"));
        // # in the middle never matches
        assert!(!matches("a/b/c", "a/#/c"));
    }

    #[test]
    fn test_literal_levels() {
        assert!(matches("/a", "/a"));
        assert!(!matches("/a", "a"));
        assert!(!matches("a", "a/"));
        assert!(matches("a/", "a/"));
    }

    fn level() -> impl Strategy<Value = String> {
        "[a-c]{1,3}"
    }

    fn topic() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(level(), 1..6)
    }

    proptest! {
        #[test]
        fn topic_matches_itself(levels in topic()) {
            let topic = levels.join("/");
            prop_assert!(matches(&topic, &topic));
        }

        #[test]
        fn hash_matches_every_suffix(levels in topic(), split in 0usize..6) {
            let split = split.min(levels.len());
            let topic = levels.join("/");
            let mut filter_levels: Vec<String> = levels[..split].to_vec();
            filter_levels.push("#".to_string());
            prop_assert!(matches(&topic, &filter_levels.join("/")));
        }

        #[test]
        fn plus_replaces_any_level(levels in topic(), idx in 0usize..6) {
            let idx = idx % levels.len();
            let topic = levels.join("/");
            let mut filter_levels = levels.clone();
            filter_levels[idx] = "+".to_string();
            prop_assert!(matches(&topic, &filter_levels.join("/")));
        }

        #[test]
        fn longer_filter_without_wildcard_never_matches(levels in topic(), extra in level()) {
            let topic = levels.join("/");
            let filter = format!("{}/{}", topic, extra);
            prop_assert!(!matches(&topic, &filter));
        }
    }
}
