//! AMQP topic-exchange pattern matching.
//!
//! Routing keys are dot-separated words. In binding patterns `*` matches
//! exactly one word and `#` matches zero or more words.

/// Whether `routing_key` matches the topic binding `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = split(pattern);
    let key: Vec<&str> = split(routing_key);
    match_words(&pattern, &key)
}

fn split(value: &str) -> Vec<&str> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            // `#` swallows zero words, or one word and stays active.
            match_words(rest, key) || key.split_first().is_some_and(|(_, tail)| match_words(pattern, tail))
        }
        (Some((&"*", rest)), Some((_, tail))) => match_words(rest, tail),
        (Some((word, rest)), Some((head, tail))) => word == head && match_words(rest, tail),
        _ => false,
    }
}
