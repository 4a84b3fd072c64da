//! NIP-01 filters: query and subscription predicates.

use serde_json::Value;

use crate::event::Event;

/// Declarative predicate over events, used both for store queries and live
/// subscription matching.
///
/// Every specified field must be satisfied (AND across fields); a field with
/// multiple values matches when the event's value is a member of the set (OR
/// within a field). Tag constraints require at least one tag entry whose name
/// matches and whose second element is in the allowed set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Acceptable event ids (hex).
    pub ids: Option<Vec<String>>,
    /// Acceptable author public keys (hex).
    pub authors: Option<Vec<String>>,
    /// Acceptable kind numbers.
    pub kinds: Option<Vec<u32>>,
    /// Tag constraints, keyed by tag name (the part after `#`).
    pub tags: Vec<(String, Vec<String>)>,
    /// Minimum `created_at`, inclusive.
    pub since: Option<i64>,
    /// Maximum `created_at`, inclusive.
    pub until: Option<i64>,
    /// Maximum number of events returned from a query, applied after sorting
    /// by recency.
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a `Filter` from a Nostr filter JSON object.
    ///
    /// Unknown keys are ignored; `"#x"` keys collect tag constraints.
    pub fn from_value(val: &Value) -> Self {
        let ids = string_array(val.get("ids"));
        let authors = string_array(val.get("authors"));
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let mut tags = Vec::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                if let Some(name) = key.strip_prefix('#') {
                    if !name.is_empty() {
                        if let Some(values) = string_array(Some(v)) {
                            tags.push((name.to_string(), values));
                        }
                    }
                }
            }
        }
        let since = val.get("since").and_then(|v| v.as_i64());
        let until = val.get("until").and_then(|v| v.as_i64());
        let limit = val
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        Filter {
            ids,
            authors,
            kinds,
            tags,
            since,
            until,
            limit,
        }
    }

    /// Evaluate the filter against a single event. Pure function of the
    /// event and filter fields.
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
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (name, allowed) in &self.tags {
            let hit = ev.tags.iter().any(|tag| {
                tag.name() == Some(name.as_str())
                    && tag.value().is_some_and(|v| allowed.iter().any(|a| a == v))
            });
            if !hit {
                return false;
            }
        }
        true
    }

    /// Whether the filter names any indexed predicate (ids, authors, kinds,
    /// or tags). Filters without one require a full scan.
    pub fn has_indexed_predicate(&self) -> bool {
        self.ids.is_some() || self.authors.is_some() || self.kinds.is_some() || !self.tags.is_empty()
    }
}

/// Parse an optional JSON array of strings.
fn string_array(val: Option<&Value>) -> Option<Vec<String>> {
    val.and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}
