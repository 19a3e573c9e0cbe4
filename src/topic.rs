//! MQTT topic matching and the MQTT ⇄ NATS name mapping.
//!
//! Matching walks the topic and filter segment by segment: `+` matches
//! exactly one level, `#` as the final segment matches any remaining suffix
//! (including none). Name mapping swaps `/` and `.` in both directions; on
//! subscriptions it additionally swaps `+`/`*` and `#`/`>` so MQTT filters
//! become NATS subjects and vice versa.

/// Matches a topic name against a topic filter with wildcard support.
///
/// # Examples
/// ```
/// # use mqtt_nats::topic::matches;
/// assert!(matches("sport/tennis", "sport/+"));
/// assert!(matches("sport/tennis/player1", "sport/#"));
/// assert!(!matches("sport/tennis", "sport/+/player1"));
/// ```
#[must_use]
pub fn matches(topic: &str, filter: &str) -> bool {
    match_segments(
        &topic.split('/').collect::<Vec<_>>(),
        &filter.split('/').collect::<Vec<_>>(),
    )
}

fn match_segments(topic: &[&str], filter: &[&str]) -> bool {
    match (topic.first(), filter.first()) {
        (None, None) => true,
        // '#' must be the final segment and swallows the rest, empty included
        (_, Some(&"#")) => filter.len() == 1,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(&t), Some(&f)) => {
            (f == "+" || f == t) && match_segments(&topic[1..], &filter[1..])
        }
    }
}

/// A topic filter compiled once for repeated matching.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    segments: Vec<String>,
}

impl CompiledFilter {
    #[must_use]
    pub fn new(filter: &str) -> Self {
        Self {
            segments: filter.split('/').map(str::to_string).collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let topic: Vec<&str> = topic.split('/').collect();
        let filter: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        match_segments(&topic, &filter)
    }
}

/// Converts an MQTT topic to a NATS subject: dots become slashes, slashes
/// become dots.
#[must_use]
pub fn to_nats(mqtt_topic: &str) -> String {
    mqtt_topic
        .chars()
        .map(|c| match c {
            '.' => '/',
            '/' => '.',
            other => other,
        })
        .collect()
}

/// Converts a NATS subject to an MQTT topic. Same swap, opposite direction.
#[must_use]
pub fn from_nats(nats_subject: &str) -> String {
    to_nats(nats_subject)
}

/// Converts an MQTT subscription filter into a NATS subscription subject:
/// the `to_nats` swap plus `+` ⇄ `*` and `#` ⇄ `>`.
#[must_use]
pub fn to_nats_subscription(mqtt_filter: &str) -> String {
    mqtt_filter
        .chars()
        .map(|c| match c {
            '.' => '/',
            '/' => '.',
            '*' => '+',
            '+' => '*',
            '#' => '>',
            '>' => '#',
            other => other,
        })
        .collect()
}

/// Converts a NATS subscription subject into an MQTT filter. Same swap,
/// opposite direction.
#[must_use]
pub fn from_nats_subscription(nats_subject: &str) -> String {
    to_nats_subscription(nats_subject)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("sport/tennis", "sport/tennis"));
        assert!(matches("/", "/"));
        assert!(!matches("sport", "sports"));
        assert!(!matches("sport/tennis", "sport/tennis/player1"));
        // no substring matching
        assert!(!matches("xsport/tennisx", "sport/tennis"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("sport/tennis", "sport/+"));
        assert!(matches("sport/", "sport/+"));
        assert!(!matches("sport/tennis/player1", "sport/+"));
        assert!(matches("sport/tennis/player1", "sport/+/+"));
        assert!(matches("/tennis", "+/tennis"));
        assert!(!matches("sport", "sport/+"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("sport", "sport/#"));
        assert!(matches("sport/tennis/player1/ranking", "sport/#"));
        assert!(matches("sport", "#"));
        assert!(!matches("sports", "sport/#"));
        // '#' not in final position never matches
        assert!(!matches("sport/tennis", "sport/#/tennis"));
    }

    #[test]
    fn test_mixed_wildcards() {
        assert!(matches("sport/tennis/player1", "sport/+/#"));
        assert!(matches("sport/tennis", "sport/+/#"));
        assert!(!matches("sport", "sport/+/#"));
    }

    #[test]
    fn test_compiled_filter() {
        let f = CompiledFilter::new("testing/s.o.m.e/retained/#");
        assert!(f.matches("testing/s.o.m.e/retained/first"));
        assert!(f.matches("testing/s.o.m.e/retained"));
        assert!(!f.matches("testing/other/retained/first"));
    }

    #[test]
    fn test_topic_subject_mapping() {
        assert_eq!(to_nats("testing/s.o.m.e/topic"), "testing.s/o/m/e.topic");
        assert_eq!(from_nats("testing.s/o/m/e.topic"), "testing/s.o.m.e/topic");
        // mapping is its own inverse
        assert_eq!(from_nats(&to_nats("a.b/c.d")), "a.b/c.d");
    }

    #[test]
    fn test_subscription_mapping() {
        assert_eq!(to_nats_subscription("a/+/b/#"), "a.*.b.>");
        assert_eq!(from_nats_subscription("a.*.b.>"), "a/+/b/#");
        assert_eq!(
            from_nats_subscription("testing.s/o/m/e.retained.>"),
            "testing/s.o.m.e/retained/#"
        );
    }
}
