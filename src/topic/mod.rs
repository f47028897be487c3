//! Topic filter matching for the local subscription index
//!
//! - `/` separates levels
//! - `+` matches exactly one level
//! - `#` matches the remaining levels, including none
//! - `$`-topics never match filters that start with a wildcard
//! - `$share/{group}/{filter}` marks a shared subscription

/// Split a shared subscription filter into (group, filter).
///
/// Returns `None` for ordinary filters.
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let (group, actual) = rest.split_once('/')?;
    if group.is_empty() || actual.is_empty() {
        return None;
    }
    Some((group, actual))
}

/// Validate a subscription filter, including the `$share/` form
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let actual = if filter.starts_with("$share/") {
        let (group, actual) =
            parse_shared_subscription(filter).ok_or("invalid shared subscription format")?;
        if group.contains(['+', '#']) {
            return Err("shared subscription group name cannot contain wildcards");
        }
        actual
    } else {
        filter
    };

    let mut levels = actual.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err("multi-level wildcard must be the whole last level");
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }
    Ok(())
}

/// Check if a topic filter matches a topic name
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b", "a"));

        assert!(topic_matches_filter("a/b", "a/+"));
        assert!(topic_matches_filter("a/b/c", "+/b/+"));
        assert!(!topic_matches_filter("a", "+/+"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));

        assert!(topic_matches_filter("a", "#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(!topic_matches_filter("b/c", "a/#"));

        assert!(!topic_matches_filter("$SYS/x", "#"));
        assert!(!topic_matches_filter("$SYS/x", "+/x"));
        assert!(topic_matches_filter("$SYS/x", "$SYS/+"));
    }

    #[test]
    fn test_parse_shared_subscription() {
        assert_eq!(
            parse_shared_subscription("$share/g1/sensor/#"),
            Some(("g1", "sensor/#"))
        );
        assert_eq!(parse_shared_subscription("sensor/#"), None);
        assert_eq!(parse_shared_subscription("$share//a"), None);
        assert_eq!(parse_shared_subscription("$share/g1"), None);
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("$share/g/a/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a+").is_err());
        assert!(validate_topic_filter("$share/g").is_err());
        assert!(validate_topic_filter("$share/g+/a").is_err());
    }
}
