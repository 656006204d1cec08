//! Topic names, filters and the subscription index
//!
//! Filters are validated once at subscription time; the shared form
//! `$share/<group>/<filter>` is split there and only the residual filter is
//! indexed, with the group folded into the entry key.

mod trie;
pub mod validation;

pub use trie::{EntryKey, TopicMatcher};
pub use validation::{
    has_wildcards, parse_filter, topic_matches_filter, validate_topic_filter,
    validate_topic_name, ParsedFilter, SHARE_PREFIX,
};
