//! Character trie for subscription lookup
//!
//! Every filter is stored one character per node, so filters sharing a
//! prefix share nodes. `+` and `#` are ordinary child keys; since topic
//! names never contain them, a literal walk cannot follow them by accident.
//! Entries terminating at a node are kept in insertion order, which gives
//! callers a stable first-seen order.

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

/// Identity of one subscription at a node: the owning client plus its
/// share group, if any. Equivalent to `(client_id, filter)` for the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub client_id: Arc<str>,
    pub share_group: Option<Arc<str>>,
}

impl EntryKey {
    pub fn new(client_id: Arc<str>, share_group: Option<Arc<str>>) -> Self {
        Self {
            client_id,
            share_group,
        }
    }
}

#[derive(Debug)]
struct Node<V> {
    children: AHashMap<char, Node<V>>,
    entries: SmallVec<[(EntryKey, V); 2]>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            children: AHashMap::new(),
            entries: SmallVec::new(),
        }
    }
}

impl<V> Node<V> {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.entries.is_empty()
    }

    fn extend_into<'a>(&'a self, out: &mut Vec<(&'a EntryKey, &'a V)>) {
        out.extend(self.entries.iter().map(|(k, v)| (k, v)));
    }
}

#[derive(Debug)]
pub struct TopicMatcher<V> {
    root: Node<V>,
    len: usize,
}

impl<V> Default for TopicMatcher<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TopicMatcher<V> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    /// Number of stored entries across all filters
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` for `(filter, key)`. Returns true if an existing entry
    /// was replaced; its position in first-seen order is kept.
    pub fn insert(&mut self, filter: &str, key: EntryKey, value: V) -> bool {
        let mut node = &mut self.root;
        for ch in filter.chars() {
            node = node.children.entry(ch).or_default();
        }
        match node.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => {
                slot.1 = value;
                true
            }
            None => {
                node.entries.push((key, value));
                self.len += 1;
                false
            }
        }
    }

    pub fn get(&self, filter: &str, key: &EntryKey) -> Option<&V> {
        let mut node = &self.root;
        for ch in filter.chars() {
            node = node.children.get(&ch)?;
        }
        node.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove the entry for `(filter, key)` and prune nodes left empty
    pub fn remove(&mut self, filter: &str, key: &EntryKey) -> Option<V> {
        let path: SmallVec<[char; 64]> = filter.chars().collect();

        let mut node = &mut self.root;
        for ch in &path {
            node = node.children.get_mut(ch)?;
        }
        let idx = node.entries.iter().position(|(k, _)| k == key)?;
        let (_, value) = node.entries.remove(idx);
        self.len -= 1;

        self.prune(&path);
        Some(value)
    }

    /// Drop the deepest empty nodes along `path`, stopping at the first
    /// node that still carries entries or other children.
    fn prune(&mut self, path: &[char]) {
        for depth in (1..=path.len()).rev() {
            let mut parent = &mut self.root;
            for ch in &path[..depth - 1] {
                match parent.children.get_mut(ch) {
                    Some(next) => parent = next,
                    None => return,
                }
            }
            let last = path[depth - 1];
            if !parent.children.get(&last).is_some_and(Node::is_empty) {
                return;
            }
            parent.children.remove(&last);
        }
    }

    /// Remove every entry owned by `client_id`, returning how many were dropped
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let owned: Vec<(String, EntryKey)> = {
            let mut found = Vec::new();
            let mut stack: Vec<(String, &Node<V>)> = vec![(String::new(), &self.root)];
            while let Some((path, node)) = stack.pop() {
                for (key, _) in &node.entries {
                    if &*key.client_id == client_id {
                        found.push((path.clone(), key.clone()));
                    }
                }
                for (ch, child) in &node.children {
                    let mut next = path.clone();
                    next.push(*ch);
                    stack.push((next, child));
                }
            }
            found
        };

        owned
            .iter()
            .filter(|(filter, key)| self.remove(filter, key).is_some())
            .count()
    }

    /// Every entry whose filter matches `topic`.
    ///
    /// Root-level wildcards never match topics starting with `$`.
    pub fn matches<'a>(&'a self, topic: &str) -> Vec<(&'a EntryKey, &'a V)> {
        let mut out = Vec::new();
        let skip_root_wildcards = topic.starts_with('$');
        Self::match_level(&self.root, topic, 0, skip_root_wildcards, &mut out);
        out
    }

    /// `node` sits at the start of the level beginning at byte `pos`
    fn match_level<'a>(
        node: &'a Node<V>,
        topic: &str,
        pos: usize,
        skip_wildcards: bool,
        out: &mut Vec<(&'a EntryKey, &'a V)>,
    ) {
        if !skip_wildcards {
            if let Some(hash) = node.children.get(&'#') {
                hash.extend_into(out);
            }
            if let Some(plus) = node.children.get(&'+') {
                let end = topic[pos..]
                    .find('/')
                    .map_or(topic.len(), |i| pos + i);
                Self::level_done(plus, topic, end, out);
            }
        }

        let mut node = node;
        let mut end = pos;
        for ch in topic[pos..].chars() {
            if ch == '/' {
                break;
            }
            match node.children.get(&ch) {
                Some(child) => node = child,
                None => return,
            }
            end += ch.len_utf8();
        }
        Self::level_done(node, topic, end, out);
    }

    /// `node` has consumed one whole level ending at byte `end`
    fn level_done<'a>(
        node: &'a Node<V>,
        topic: &str,
        end: usize,
        out: &mut Vec<(&'a EntryKey, &'a V)>,
    ) {
        let slash = node.children.get(&'/');
        if end == topic.len() {
            node.extend_into(out);
            // `sport/#` also matches `sport`
            if let Some(hash) = slash.and_then(|s| s.children.get(&'#')) {
                hash.extend_into(out);
            }
        } else if let Some(slash) = slash {
            Self::match_level(slash, topic, end + 1, false, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn key(client: &str) -> EntryKey {
        EntryKey::new(Arc::from(client), None)
    }

    fn matched(m: &TopicMatcher<&'static str>, topic: &str) -> Vec<&'static str> {
        let mut v: Vec<_> = m.matches(topic).into_iter().map(|(_, f)| *f).collect();
        v.sort_unstable();
        v
    }

    fn literal_table() -> TopicMatcher<&'static str> {
        let mut m = TopicMatcher::new();
        for f in [
            "sport/#",
            "sport/+",
            "sport/+/1/2",
            "+",
            "+/+",
            "TopicA/#",
            "TopicA",
        ] {
            m.insert(f, key(f), f);
        }
        m
    }

    #[test_case("sport", &["+", "sport/#"])]
    #[test_case("sport/", &["+/+", "sport/#", "sport/+"])]
    #[test_case("sport/tennis", &["+/+", "sport/#", "sport/+"])]
    #[test_case("sport/tennis/1/2", &["sport/#", "sport/+/1/2"])]
    #[test_case("sport/tennis/1/3", &["sport/#"])]
    #[test_case("TopicA", &["+", "TopicA", "TopicA/#"])]
    #[test_case("TopicA/B", &["+/+", "TopicA/#"])]
    #[test_case("/finance", &["+/+"])]
    #[test_case("$SYS/x", &[])]
    fn literal_trie_table(topic: &str, expected: &[&str]) {
        assert_eq!(matched(&literal_table(), topic), expected.to_vec());
    }

    #[test]
    fn dollar_topics_match_explicit_filters() {
        let mut m = TopicMatcher::new();
        m.insert("#", key("a"), "#");
        m.insert("$SYS/#", key("b"), "$SYS/#");
        m.insert("$SYS/+", key("c"), "$SYS/+");
        assert_eq!(matched(&m, "$SYS/load"), vec!["$SYS/#", "$SYS/+"]);
    }

    #[test]
    fn prefix_sharing_filters_stay_distinct() {
        let mut m = TopicMatcher::new();
        m.insert("a/b", key("x"), "a/b");
        m.insert("a/bc", key("x"), "a/bc");
        m.insert("a", key("x"), "a");
        assert_eq!(matched(&m, "a/b"), vec!["a/b"]);
        assert_eq!(matched(&m, "a/bc"), vec!["a/bc"]);
        assert_eq!(matched(&m, "a/bcd"), Vec::<&str>::new());
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut m = TopicMatcher::new();
        assert!(!m.insert("t", key("a"), "first"));
        assert!(!m.insert("t", key("b"), "other"));
        assert!(m.insert("t", key("a"), "second"));
        assert_eq!(m.len(), 2);
        let order: Vec<_> = m.matches("t").into_iter().map(|(_, v)| *v).collect();
        assert_eq!(order, vec!["second", "other"]);
    }

    #[test]
    fn share_group_is_part_of_the_key() {
        let mut m = TopicMatcher::new();
        let shared = EntryKey::new(Arc::from("a"), Some(Arc::from("g")));
        m.insert("t", key("a"), "plain");
        m.insert("t", shared.clone(), "shared");
        assert_eq!(m.len(), 2);
        assert_eq!(m.remove("t", &shared), Some("shared"));
        assert_eq!(m.get("t", &key("a")), Some(&"plain"));
    }

    #[test]
    fn remove_prunes_to_root() {
        let mut m = literal_table();
        for f in [
            "sport/#",
            "sport/+",
            "sport/+/1/2",
            "+",
            "+/+",
            "TopicA/#",
            "TopicA",
        ] {
            assert_eq!(m.remove(f, &key(f)), Some(f));
        }
        assert!(m.is_empty());
        assert!(m.root.is_empty());
        assert_eq!(m.remove("sport/#", &key("sport/#")), None);
    }

    #[test]
    fn remove_keeps_shared_prefixes() {
        let mut m = TopicMatcher::new();
        m.insert("a/b", key("x"), 1);
        m.insert("a/b/c", key("x"), 2);
        assert_eq!(m.remove("a/b", &key("x")), Some(1));
        assert_eq!(m.matches("a/b/c").len(), 1);
        assert_eq!(m.matches("a/b").len(), 0);
    }

    #[test]
    fn remove_client_prunes_everything_it_owned() {
        let mut m = TopicMatcher::new();
        m.insert("a/#", key("x"), 1);
        m.insert("a/+", key("x"), 2);
        m.insert("a/+", key("y"), 3);
        m.insert("b", EntryKey::new(Arc::from("x"), Some(Arc::from("g"))), 4);
        assert_eq!(m.remove_client("x"), 3);
        assert_eq!(m.len(), 1);
        assert_eq!(m.matches("a/z").len(), 1);
        assert!(m.matches("b").is_empty());
        assert!(!m.root.children.contains_key(&'b'));
    }

    #[test]
    fn empty_levels() {
        let mut m = TopicMatcher::new();
        m.insert("a/+/b", key("x"), "a/+/b");
        m.insert("a//b", key("y"), "a//b");
        assert_eq!(matched(&m, "a//b"), vec!["a/+/b", "a//b"]);
    }
}
