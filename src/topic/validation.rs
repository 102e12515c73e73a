//! Checks applied before a topic string reaches the wire
//!
//! A publish topic is a concrete name and may not carry wildcards. A
//! subscription filter may, as long as every `+` and `#` stands alone in its
//! level and `#` comes last.

/// Both kinds of topic string are length-prefixed with a u16
const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Rules shared by names and filters; `what` picks the message wording
fn check_encodable(topic: &str, what: Kind) -> Result<(), &'static str> {
    let problem = if topic.is_empty() {
        Problem::Empty
    } else if topic.len() > MAX_TOPIC_LEN {
        Problem::TooLong
    } else if topic.contains('\0') {
        Problem::Nul
    } else {
        return Ok(());
    };

    Err(match (what, problem) {
        (Kind::Name, Problem::Empty) => "topic name cannot be empty",
        (Kind::Name, Problem::TooLong) => "topic name exceeds maximum length",
        (Kind::Name, Problem::Nul) => "topic name cannot contain null character",
        (Kind::Filter, Problem::Empty) => "topic filter cannot be empty",
        (Kind::Filter, Problem::TooLong) => "topic filter exceeds maximum length",
        (Kind::Filter, Problem::Nul) => "topic filter cannot contain null character",
    })
}

#[derive(Clone, Copy)]
enum Kind {
    Name,
    Filter,
}

enum Problem {
    Empty,
    TooLong,
    Nul,
}

/// Validate the topic of an outgoing PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_encodable(topic, Kind::Name)?;
    if topic.bytes().any(|b| b == b'+' || b == b'#') {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a SUBSCRIBE or UNSUBSCRIBE filter
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_encodable(filter, Kind::Filter)?;

    let level_count = filter.split('/').count();
    for (index, level) in filter.split('/').enumerate() {
        match level {
            "+" => {}
            "#" if index + 1 == level_count => {}
            "#" => return Err("multi-level wildcard must be last level"),
            _ if level.contains('#') => {
                return Err("multi-level wildcard must occupy entire level")
            }
            _ if level.contains('+') => {
                return Err("single-level wildcard must occupy entire level")
            }
            _ => {}
        }
    }

    Ok(())
}
