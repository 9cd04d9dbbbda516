//! Hierarchical topic names and subscription filters.
//!
//! Levels are separated by `/`. Filters may use `+` for exactly one level
//! and a trailing `#` for any number of remaining levels, including none.

/// Validate a topic to publish on: non-empty and wildcard-free.
///
/// # Errors
///
/// Returns a description of the first problem found.
pub fn validate_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.contains(['+', '#']) {
        return Err(format!("topic '{topic}' must not contain wildcards"));
    }
    if topic.contains('\0') {
        return Err("topic must not contain NUL".to_string());
    }
    Ok(())
}

/// Validate a subscription filter.
///
/// # Errors
///
/// Returns a description of the first problem found.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("filter must not be empty".to_string());
    }
    if filter.contains('\0') {
        return Err("filter must not contain NUL".to_string());
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        match *level {
            "+" => {}
            "#" if index == last => {}
            "#" => return Err(format!("'#' must be the last level in '{filter}'")),
            other if other.contains(['+', '#']) => {
                return Err(format!("wildcard must occupy a whole level in '{filter}'"))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether `topic` matches `filter`.
///
/// `filter` is assumed valid (see [`validate_filter`]).
#[must_use]
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
