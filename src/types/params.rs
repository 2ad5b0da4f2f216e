use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::value::Value;

/// A bag of named parameters whose keys compare case-insensitively.
///
/// The spelling used by the most recent `set` is kept for display and
/// persistence.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(from = "BTreeMap<String, Value>", into = "BTreeMap<String, Value>")]
pub struct ParamBag {
    /// Keyed by the lowercased name; holds the original spelling and value.
    entries: BTreeMap<String, (String, Value)>,
}

impl ParamBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, returning the value it replaced.
    pub fn set(&mut self, key: &str, value: Value) -> Option<Value> {
        self.entries
            .insert(key.to_lowercase(), (key.to_owned(), value))
            .map(|(_, old)| old)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&key.to_lowercase()).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(&key.to_lowercase()).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(name, value)` pairs. No ordering is promised.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }
}

impl From<BTreeMap<String, Value>> for ParamBag {
    fn from(map: BTreeMap<String, Value>) -> Self {
        let mut bag = Self::new();
        for (k, v) in map {
            bag.set(&k, v);
        }
        bag
    }
}

impl From<ParamBag> for BTreeMap<String, Value> {
    fn from(bag: ParamBag) -> Self {
        bag.entries.into_values().collect()
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for ParamBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = Self::new();
        for (k, v) in iter {
            bag.set(k.as_ref(), v.into());
        }
        bag
    }
}
