//! Nostr subscription filters.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

#[cfg(test)]
use crate::event::Event;

/// A NIP-01 filter. Every populated field must match (logical AND); values
/// inside one field are alternatives (logical OR).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Tag constraints keyed by tag name without the `#` prefix.
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Add `value` to the `#key` constraint.
    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.entry(key.to_string()).or_default().push(value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Encode as the JSON object sent inside a `REQ` message.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), Value::from(ids.clone()));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), Value::from(authors.clone()));
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), Value::from(kinds.clone()));
        }
        for (key, values) in &self.tags {
            obj.insert(format!("#{key}"), Value::from(values.clone()));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), Value::from(since));
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), Value::from(until));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), Value::from(limit));
        }
        Value::Object(obj)
    }

    /// Parse a filter object, ignoring fields with unexpected shapes.
    #[cfg(test)]
    pub fn from_json(val: &Value) -> Self {
        let strings = |v: &Value| -> Option<Vec<String>> {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
        };
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                if let Some(name) = key.strip_prefix('#') {
                    if let Some(values) = strings(v) {
                        tags.insert(name.to_string(), values);
                    }
                }
            }
        }
        Filter {
            ids: val.get("ids").and_then(strings),
            authors: val.get("authors").and_then(strings),
            kinds: val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_u64().map(|u| u as u32))
                    .collect()
            }),
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize),
        }
    }

    /// Check whether `ev` satisfies every populated constraint.
    #[cfg(test)]
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        let tags_ok = self
            .tags
            .iter()
            .all(|(key, values)| values.iter().any(|v| ev.has_tag(key, v)));
        tags_ok
            && self.since.map_or(true, |s| ev.created_at >= s)
            && self.until.map_or(true, |u| ev.created_at <= u)
    }
}
