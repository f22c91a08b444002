//! Topic checks applied after templating, before anything reaches the broker.

use thiserror::Error;

const MAX_TOPIC_LEN: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid topic {topic:?}: {reason}")]
pub struct TopicError {
    pub topic: String,
    pub reason: &'static str,
}

/// Publish topics must be non-empty and free of wildcards and NUL.
pub fn check_publish_topic(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(err(topic, "publish topic cannot contain '+' or '#'"));
    }
    Ok(())
}

/// Subscribe filters may use `+` for a whole level and `#` as the last level.
pub fn check_subscribe_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(err(filter, "'#' must be the whole last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(err(filter, "'+' must occupy a whole level"));
        }
    }
    Ok(())
}

/// Whether a concrete topic name is matched by a subscribe filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
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

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(err(topic, "topic is empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(err(topic, "topic exceeds 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(err(topic, "topic contains NUL"));
    }
    Ok(())
}

fn err(topic: &str, reason: &'static str) -> TopicError {
    TopicError {
        topic: topic.to_string(),
        reason,
    }
}
