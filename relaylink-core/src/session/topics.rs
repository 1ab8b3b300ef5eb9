//! MQTT topic names and filters.

/// Topic names used for publishing: non-empty, no wildcard, no NUL.
pub fn validate_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic is empty".into());
    }
    if topic.contains(['+', '#']) {
        return Err(format!("wildcards are not allowed when publishing: '{topic}'"));
    }
    if topic.contains('\0') {
        return Err("topic contains NUL".into());
    }
    if topic.len() > u16::MAX as usize {
        return Err("topic longer than 65535 bytes".into());
    }
    Ok(())
}

/// Subscription filters: `+` must fill a whole level, `#` must be the whole last level.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("filter is empty".into());
    }
    if filter.contains('\0') {
        return Err("filter contains NUL".into());
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(format!("'#' must be the last level on its own: '{filter}'"));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must occupy a whole level: '{filter}'"));
        }
    }
    Ok(())
}

/// Does `topic` match subscription `filter`?
///
/// `+` matches exactly one level, `#` matches the parent level and everything
/// below it. Wildcards in the first level never match `$`-prefixed topics.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("esp/relay/control", "esp/relay/control"));
        assert!(!topic_matches("esp/relay/control", "esp/relay/status"));
        assert!(!topic_matches("esp/relay", "esp/relay/control"));
        assert!(!topic_matches("esp/relay/control", "esp/relay"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("esp/+/control", "esp/relay/control"));
        assert!(topic_matches("+/relay/+", "esp/relay/state"));
        assert!(!topic_matches("esp/+", "esp/relay/control"));
        assert!(topic_matches("esp/+", "esp/"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("esp/#", "esp/relay/control"));
        assert!(topic_matches("esp/#", "esp"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("other/#", "esp/relay"));
    }

    #[test]
    fn test_dollar_topics_hidden_from_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("esp/relay/control").is_ok());
        assert!(validate_topic("control").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("esp/+/control").is_err());
        assert!(validate_topic("esp/#").is_err());
    }

    #[test]
    fn test_validate_filter() {
        for ok in ["a/b", "a/+/c", "a/#", "#", "+", "+/+"] {
            assert!(validate_filter(ok).is_ok(), "{ok}");
        }
        for bad in ["", "a/#/c", "a#", "a/b+", "#/a"] {
            assert!(validate_filter(bad).is_err(), "{bad}");
        }
    }
}
