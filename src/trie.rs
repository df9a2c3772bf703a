//! Subscription trie and retained-message store.
//!
//! The trie maps topic filters to subscriber values with three kinds of
//! child edges per level:
//! - literal level names
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)
//!
//! Matching collects values from *every* matching branch; a topic routed
//! through the trie reaches all subscriptions whose filters match.
//!
//! Per MQTT spec section 4.7.2, wildcards at the first filter level never
//! match topics whose first level starts with `$` (the `$SYS` tree).

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::Message;

/// Trie node for MQTT topic filter matching.
pub struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    match_any: Option<Box<TrieNode<T>>>, // + wildcard
    match_all: Option<Box<TrieNode<T>>>, // # wildcard
    values: Vec<T>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TrieNode<T> {
    /// Create a new empty trie node.
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            match_any: None,
            match_all: None,
            values: Vec::new(),
        }
    }

    /// Apply a closure to the node addressed by the given filter,
    /// creating intermediate nodes as needed.
    pub fn set<F>(&mut self, filter: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut TrieNode<T>),
    {
        if filter.is_empty() {
            f(self);
            return Ok(());
        }

        let (first, subseq) = match filter.find('/') {
            None => (filter, ""),
            Some(idx) => (&filter[..idx], &filter[idx + 1..]),
        };

        match first {
            "+" => {
                if self.match_any.is_none() {
                    self.match_any = Some(Box::new(TrieNode::new()));
                }
                self.match_any.as_mut().expect("set above").set(subseq, f)
            }
            "#" => {
                if !subseq.is_empty() {
                    return Err(Error::ProtocolViolation(
                        "'#' must be the last segment".to_string(),
                    ));
                }
                if self.match_all.is_none() {
                    self.match_all = Some(Box::new(TrieNode::new()));
                }
                f(self.match_all.as_mut().expect("set above"));
                Ok(())
            }
            _ => {
                let child = self.children.entry(first.to_string()).or_default();
                child.set(subseq, f)
            }
        }
    }

    /// Collect values from every filter branch matching the topic.
    pub fn collect<'a>(&'a self, topic: &str, out: &mut Vec<&'a T>) {
        let first_is_reserved = topic.split('/').next().is_some_and(|l| l.starts_with('$'));
        self.collect_level(topic, !first_is_reserved, out);
    }

    /// Walk one topic level. `wildcards` is false at the root of a
    /// `$`-prefixed topic so `+`/`#` cannot cross the leading segment.
    fn collect_level<'a>(&'a self, topic: &str, wildcards: bool, out: &mut Vec<&'a T>) {
        // `#` matches the remaining levels including none at all.
        if wildcards {
            if let Some(ref match_all) = self.match_all {
                out.extend(match_all.values.iter());
            }
        }

        if topic.is_empty() {
            out.extend(self.values.iter());
            return;
        }

        let (first, subseq) = match topic.find('/') {
            None => (topic, ""),
            Some(idx) => (&topic[..idx], &topic[idx + 1..]),
        };

        if let Some(child) = self.children.get(first) {
            child.collect_level(subseq, true, out);
        }

        if wildcards && !first.is_empty() {
            if let Some(ref match_any) = self.match_any {
                match_any.collect_level(subseq, true, out);
            }
        }
    }

    /// Remove values matching the predicate at the given filter; prunes
    /// branches left empty. Returns true if anything was removed.
    pub fn remove<F>(&mut self, filter: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        if filter.is_empty() {
            let before = self.values.len();
            self.values.retain(|v| !predicate(v));
            return self.values.len() < before;
        }

        let (first, subseq) = match filter.find('/') {
            None => (filter, ""),
            Some(idx) => (&filter[..idx], &filter[idx + 1..]),
        };

        let removed = match first {
            "+" => {
                if let Some(ref mut match_any) = self.match_any {
                    let removed = match_any.remove(subseq, predicate);
                    if match_any.is_empty() {
                        self.match_any = None;
                    }
                    removed
                } else {
                    false
                }
            }
            "#" => {
                if let Some(ref mut match_all) = self.match_all {
                    let before = match_all.values.len();
                    match_all.values.retain(|v| !predicate(v));
                    let removed = match_all.values.len() < before;
                    if match_all.is_empty() {
                        self.match_all = None;
                    }
                    removed
                } else {
                    false
                }
            }
            _ => {
                if let Some(child) = self.children.get_mut(first) {
                    let removed = child.remove(subseq, predicate);
                    if child.is_empty() {
                        self.children.remove(first);
                    }
                    removed
                } else {
                    false
                }
            }
        };

        removed
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.children.is_empty()
            && self.match_any.is_none()
            && self.match_all.is_none()
    }

    /// Values stored at this node.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Mutable access to the values stored at this node.
    pub fn values_mut(&mut self) -> &mut Vec<T> {
        &mut self.values
    }

    /// Count values across the whole subtree.
    pub fn len(&self) -> usize {
        let mut n = self.values.len();
        for child in self.children.values() {
            n += child.len();
        }
        if let Some(ref any) = self.match_any {
            n += any.len();
        }
        if let Some(ref all) = self.match_all {
            n += all.len();
        }
        n
    }
}

impl<T: fmt::Debug> fmt::Debug for TrieNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieNode")
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("match_any", &self.match_any.is_some())
            .field("match_all", &self.match_all.is_some())
            .field("values", &self.values.len())
            .finish()
    }
}

/// Thread-safe trie.
pub struct Trie<T> {
    root: RwLock<TrieNode<T>>,
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Trie<T> {
    /// Create a new empty trie.
    pub fn new() -> Self {
        Self {
            root: RwLock::new(TrieNode::new()),
        }
    }

    /// Collect all values matching the given topic.
    pub fn collect(&self, topic: &str) -> Vec<T>
    where
        T: Clone,
    {
        let root = self.root.read();
        let mut out = Vec::new();
        root.collect(topic, &mut out);
        out.into_iter().cloned().collect()
    }

    /// Remove values matching the predicate from the given filter.
    pub fn remove<F>(&self, filter: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.root.write().remove(filter, predicate)
    }

    /// Execute a function with mutable access to the root node.
    pub fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TrieNode<T>) -> R,
    {
        f(&mut self.root.write())
    }

    /// Total number of stored values.
    pub fn len(&self) -> usize {
        self.root.read().len()
    }

    /// Whether the trie holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: fmt::Debug> fmt::Debug for Trie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.root.read())
    }
}

/// Check if a topic filter matches a concrete topic name.
///
/// MQTT spec compliance (section 4.7.2): `#` and `+` at the start of a
/// filter do not match topics whose first level starts with `$`. To
/// receive `$SYS` messages, clients must subscribe with an explicit
/// `$SYS/...` prefix.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    if topic_parts
        .first()
        .is_some_and(|first| first.starts_with('$'))
    {
        let head = filter_parts.first().copied().unwrap_or("");
        if head == "#" || head == "+" {
            return false;
        }
    }

    let mut f_idx = 0;
    let mut t_idx = 0;

    while f_idx < filter_parts.len() {
        let f = filter_parts[f_idx];

        if f == "#" {
            return true;
        }

        if t_idx >= topic_parts.len() {
            return false;
        }

        if f == "+" {
            // `+` matches exactly one non-empty level.
            if topic_parts[t_idx].is_empty() {
                return false;
            }
            f_idx += 1;
            t_idx += 1;
        } else if f == topic_parts[t_idx] {
            f_idx += 1;
            t_idx += 1;
        } else {
            return false;
        }
    }

    t_idx == topic_parts.len()
}

/// Retained-message store: at most one payload per concrete topic,
/// last-writer-wins. A retained PUBLISH with an empty payload clears
/// the entry.
#[derive(Default)]
pub struct RetainedStore {
    inner: RwLock<HashMap<String, Message>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a retained publish: store, replace or clear.
    pub fn update(&self, msg: &Message) {
        let mut inner = self.inner.write();
        if msg.payload.is_empty() {
            inner.remove(&msg.topic);
        } else {
            inner.insert(msg.topic.clone(), msg.clone());
        }
    }

    /// All retained messages whose topics match the filter.
    pub fn matching(&self, filter: &str) -> Vec<Message> {
        let inner = self.inner.read();
        let mut out: Vec<Message> = inner
            .values()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        out
    }

    /// Retained message for an exact topic, if any.
    pub fn get(&self, topic: &str) -> Option<Message> {
        self.inner.read().get(topic).cloned()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;

    #[test]
    fn test_exact_match() {
        let trie: Trie<String> = Trie::new();
        trie.with_mut(|root| root.set("device/gear-001/state", |n| n.values.push("h1".into())))
            .unwrap();

        assert_eq!(trie.collect("device/gear-001/state"), vec!["h1"]);
        assert!(trie.collect("device/gear-002/state").is_empty());
        assert!(trie.collect("device/gear-001").is_empty());
    }

    #[test]
    fn test_single_level_wildcard() {
        let trie: Trie<String> = Trie::new();
        trie.with_mut(|root| root.set("device/+/state", |n| n.values.push("w".into())))
            .unwrap();

        assert!(!trie.collect("device/gear-001/state").is_empty());
        assert!(!trie.collect("device/abc/state").is_empty());
        assert!(trie.collect("device/state").is_empty()); // missing middle level
        assert!(trie.collect("device/a/b/state").is_empty()); // too many levels
    }

    #[test]
    fn test_multi_level_wildcard() {
        let trie: Trie<String> = Trie::new();
        trie.with_mut(|root| root.set("device/#", |n| n.values.push("m".into())))
            .unwrap();

        assert!(!trie.collect("device/gear-001").is_empty());
        assert!(!trie.collect("device/gear-001/state/value").is_empty());
        // "device/#" matches "device" itself.
        assert!(!trie.collect("device").is_empty());
        assert!(trie.collect("other/gear-001").is_empty());
    }

    #[test]
    fn test_multi_level_wildcard_must_be_last() {
        let trie: Trie<String> = Trie::new();
        let result = trie.with_mut(|root| root.set("device/#/state", |n| n.values.push("x".into())));
        assert!(result.is_err());
    }

    #[test]
    fn test_overlapping_filters_collect_all() {
        let trie: Trie<String> = Trie::new();
        trie.with_mut(|root| root.set("a/b", |n| n.values.push("exact".into())))
            .unwrap();
        trie.with_mut(|root| root.set("a/+", |n| n.values.push("plus".into())))
            .unwrap();
        trie.with_mut(|root| root.set("a/#", |n| n.values.push("hash".into())))
            .unwrap();
        trie.with_mut(|root| root.set("#", |n| n.values.push("all".into())))
            .unwrap();

        let mut hits = trie.collect("a/b");
        hits.sort();
        assert_eq!(hits, vec!["all", "exact", "hash", "plus"]);
    }

    #[test]
    fn test_dollar_topics_not_matched_by_wildcards() {
        let trie: Trie<String> = Trie::new();
        trie.with_mut(|root| root.set("#", |n| n.values.push("all".into())))
            .unwrap();
        trie.with_mut(|root| root.set("+/a", |n| n.values.push("plus".into())))
            .unwrap();
        trie.with_mut(|root| root.set("$SYS/#", |n| n.values.push("sys".into())))
            .unwrap();

        assert_eq!(trie.collect("$SYS/a"), vec!["sys"]);
        assert_eq!(trie.collect("b/a"), vec!["all", "plus"]);
    }

    #[test]
    fn test_remove_and_prune() {
        let trie: Trie<String> = Trie::new();
        trie.with_mut(|root| root.set("device/+/state", |n| n.values.push("h1".into())))
            .unwrap();
        trie.with_mut(|root| root.set("device/+/state", |n| n.values.push("h2".into())))
            .unwrap();

        assert_eq!(trie.collect("device/gear-001/state").len(), 2);

        assert!(trie.remove("device/+/state", |v| v == "h1"));
        assert_eq!(trie.collect("device/gear-001/state"), vec!["h2"]);

        assert!(trie.remove("device/+/state", |v| v == "h2"));
        assert!(trie.is_empty());
        assert!(!trie.remove("device/+/state", |v| v == "h2"));
    }

    #[test]
    fn test_topic_matches_truth_table() {
        let cases = [
            ("a/b/c", "a/b/c", true),
            ("a/b/c", "a/b/d", false),
            ("a/+/c", "a/b/c", true),
            ("a/+/c", "a/b/d", false),
            ("a/+", "a/b/c", false),
            ("+", "a", true),
            ("+", "a/b", false),
            ("#", "a/b/c", true),
            ("a/#", "a", true),
            ("a/#", "a/b/c", true),
            ("a/#", "b", false),
            ("#", "$SYS/a", false),
            ("+/a", "$SYS/a", false),
            ("$SYS/#", "$SYS/a", true),
            ("$SYS/a", "$SYS/a", true),
        ];
        for (filter, topic, expected) in cases {
            assert_eq!(
                topic_matches(filter, topic),
                expected,
                "filter={filter} topic={topic}"
            );
        }
    }

    #[test]
    fn test_retained_store() {
        let store = RetainedStore::new();
        store.update(&Message::new("t/1", &b"a"[..]).with_retain(true));
        store.update(&Message::new("t/2", &b"b"[..]).with_retain(true).with_qos(QoS::AtLeastOnce));

        assert_eq!(store.matching("t/#").len(), 2);
        assert_eq!(store.matching("t/1").len(), 1);

        // Last writer wins.
        store.update(&Message::new("t/1", &b"c"[..]).with_retain(true));
        assert_eq!(store.get("t/1").unwrap().payload.as_ref(), b"c");

        // Empty payload clears.
        store.update(&Message::new("t/1", &b""[..]).with_retain(true));
        assert!(store.get("t/1").is_none());
        assert_eq!(store.len(), 1);
    }
}
