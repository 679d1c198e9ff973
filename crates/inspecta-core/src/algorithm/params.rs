//! Case-insensitive string maps used for engine parameters and image paths.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// String map whose keys compare case-insensitively.
///
/// The spelling of the most recent insert is kept for display and
/// serialization. Iteration order is the folded key order, so it is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamMap {
    entries: BTreeMap<String, (String, String)>,
}

fn fold(key: &str) -> String {
    key.to_lowercase()
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any entry whose key matches ignoring case.
    ///
    /// Returns the replaced value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        self.entries
            .insert(fold(&key), (key, value.into()))
            .map(|(_, old)| old)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&fold(key)).map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&fold(key))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&fold(key)).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(key, value)` pairs using the stored key spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ParamMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for ParamMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParamMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ParamMapVisitor;

        impl<'de> Visitor<'de> for ParamMapVisitor {
            type Value = ParamMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ParamMap, A::Error> {
                let mut map = ParamMap::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(ParamMapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        let mut map = ParamMap::new();
        map.insert("Threshold", "12");

        assert_eq!(map.get("threshold"), Some("12"));
        assert_eq!(map.get("THRESHOLD"), Some("12"));
        assert!(map.get("missing").is_none());
    }

    #[test]
    fn test_insert_replaces_case_variant() {
        let mut map = ParamMap::new();
        map.insert("Gray", "a.png");
        let old = map.insert("GRAY", "b.png");

        assert_eq!(old.as_deref(), Some("a.png"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.iter().next(), Some(("GRAY", "b.png")));
    }

    #[test]
    fn test_json_keeps_original_spelling() {
        let map: ParamMap = [("Height", "h.png")].into_iter().collect();
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"Height":"h.png"}"#);

        let parsed: ParamMap = serde_json::from_str(r#"{"height":"x","HEIGHT":"y"}"#).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("Height"), Some("y"));
    }
}
