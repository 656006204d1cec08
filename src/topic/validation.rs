//! Topic name and filter validation
//!
//! - names never contain wildcards
//! - `+` occupies a whole level, `#` a whole level and only the last one
//! - `$share/<group>/<filter>` is the shared form; the group is a single
//!   level without wildcards

/// Prefix of the shared-subscription filter form
pub const SHARE_PREFIX: &str = "$share/";

/// A filter split into its share group and residual filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFilter<'a> {
    pub share_group: Option<&'a str>,
    pub filter: &'a str,
}

/// Validate a topic name from PUBLISH or a will. `max_levels == 0` disables
/// the level limit.
pub fn validate_topic_name(topic: &str, max_levels: usize) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > u16::MAX as usize {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains(&['+', '#', '\0'][..]) {
        return Err("topic name cannot contain wildcards or null characters");
    }
    check_levels(topic, max_levels)
}

/// Validate a SUBSCRIBE/UNSUBSCRIBE filter, splitting off any share group
pub fn parse_filter(raw: &str, max_levels: usize) -> Result<ParsedFilter<'_>, &'static str> {
    let parsed = match raw.strip_prefix(SHARE_PREFIX) {
        Some(rest) => {
            let (group, filter) = rest
                .split_once('/')
                .ok_or("shared subscription without a filter")?;
            if group.is_empty() {
                return Err("shared subscription group cannot be empty");
            }
            if group.contains(&['+', '#'][..]) {
                return Err("shared subscription group cannot contain wildcards");
            }
            ParsedFilter {
                share_group: Some(group),
                filter,
            }
        }
        None => ParsedFilter {
            share_group: None,
            filter: raw,
        },
    };
    validate_topic_filter(parsed.filter, max_levels)?;
    Ok(parsed)
}

/// Validate a plain (non-shared) topic filter
pub fn validate_topic_filter(filter: &str, max_levels: usize) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > u16::MAX as usize {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null characters");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err("multi-level wildcard must be the last level")
            }
            "#" | "+" => {}
            l if l.contains('#') => {
                return Err("multi-level wildcard must occupy an entire level")
            }
            l if l.contains('+') => {
                return Err("single-level wildcard must occupy an entire level")
            }
            _ => {}
        }
    }
    check_levels(filter, max_levels)
}

fn check_levels(s: &str, max_levels: usize) -> Result<(), &'static str> {
    if max_levels > 0 && s.split('/').count() > max_levels {
        return Err("too many topic levels");
    }
    Ok(())
}

#[inline]
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains(&['+', '#'][..])
}

/// Whether `topic` matches the plain filter `filter`
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(&['+', '#'][..]) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for f in filter.split('/') {
        if f == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(t) if f == "+" || f == t => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a"; "single level")]
    #[test_case("a/b/c"; "nested")]
    #[test_case("/leading"; "leading slash")]
    #[test_case("trailing/"; "trailing slash")]
    #[test_case("$SYS/x"; "dollar")]
    fn valid_names(topic: &str) {
        assert!(validate_topic_name(topic, 0).is_ok());
    }

    #[test_case(""; "empty")]
    #[test_case("a/+"; "plus")]
    #[test_case("a/#"; "hash")]
    #[test_case("a\0b"; "null")]
    fn invalid_names(topic: &str) {
        assert!(validate_topic_name(topic, 0).is_err());
    }

    #[test_case("#")]
    #[test_case("+")]
    #[test_case("a/+/c")]
    #[test_case("a/#")]
    #[test_case("+/+/+")]
    #[test_case("/")]
    fn valid_filters(filter: &str) {
        assert!(validate_topic_filter(filter, 0).is_ok());
    }

    #[test_case("")]
    #[test_case("a#")]
    #[test_case("a/#/b")]
    #[test_case("a+")]
    #[test_case("+a/b")]
    fn invalid_filters(filter: &str) {
        assert!(validate_topic_filter(filter, 0).is_err());
    }

    #[test]
    fn shared_filters() {
        assert_eq!(
            parse_filter("$share/g1/a/+", 0).unwrap(),
            ParsedFilter {
                share_group: Some("g1"),
                filter: "a/+"
            }
        );
        assert_eq!(parse_filter("a/b", 0).unwrap().share_group, None);
        assert!(parse_filter("$share/g1", 0).is_err());
        assert!(parse_filter("$share//a", 0).is_err());
        assert!(parse_filter("$share/g+/a", 0).is_err());
        assert!(parse_filter("$share/g/a/#/b", 0).is_err());
    }

    #[test]
    fn level_limits() {
        assert!(validate_topic_name("a/b/c", 3).is_ok());
        assert!(validate_topic_name("/a/b/c", 3).is_err());
        assert!(parse_filter("$share/g/a/b/c", 3).is_ok());
        assert!(parse_filter("$share/g/a/b/c/d", 3).is_err());
    }

    #[test]
    fn filter_matching() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(topic_matches_filter("a/b", "+/b"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b/c", "#"));
        assert!(!topic_matches_filter("$SYS/a", "#"));
        assert!(!topic_matches_filter("$SYS/a", "+/a"));
        assert!(topic_matches_filter("$SYS/a", "$SYS/#"));
    }
}
