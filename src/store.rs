//! File-backed, deduplicated event store with index-pruned queries.
//!
//! Layout under the store root:
//!
//! - `events/<id[0..2]>/<id[2..4]>/<id>.json` — one file per event
//! - `log/events.ndjson` — append-only log, the scan source for filters
//!   without an indexed predicate
//! - `index/by-author/<pubkey>.txt`, `index/by-kind/<kind>.txt`,
//!   `index/by-tag/<name>/<key>.txt` — newline-separated id lists

use std::{
    cmp::Reverse,
    collections::HashSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde_json::to_writer;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::event::Event;
use crate::filter::Filter;

/// Result of an insert attempt. Duplicates are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Persistent store for events and indexes rooted at `root`.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Create a new store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        for d in ["events", "log", "index/by-author", "index/by-kind", "index/by-tag"] {
            fs::create_dir_all(self.root.join(d))?;
        }
        Ok(())
    }

    /// Persist an event unless one with the same id already exists.
    ///
    /// At-most-once is guaranteed by writing to a temp file and renaming
    /// without clobbering; concurrent inserts of the same id leave exactly
    /// one logical copy and all but one caller sees `AlreadyPresent`.
    pub fn insert_if_absent(&self, ev: &Event) -> Result<InsertOutcome> {
        let path = self.event_path(&ev.id);
        if path.exists() {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        let parent_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        to_writer(&tmp, ev)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(InsertOutcome::AlreadyPresent);
            }
            Err(e) => return Err(e.error.into()),
        }

        // Append to the newline-delimited log; its order is insertion order.
        let log_path = self.root.join("log/events.ndjson");
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        serde_json::to_writer(&mut log_file, ev)?;
        log_file.write_all(b"\n")?;

        self.index_event(ev)?;
        Ok(InsertOutcome::Inserted)
    }

    /// Look up a single event by id.
    pub fn get(&self, id: &str) -> Option<Event> {
        let data = fs::read_to_string(self.event_path(id)).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// Rebuild indexes and the log from the `events/` tree.
    pub fn reindex(&self) -> Result<()> {
        let index_dir = self.root.join("index");
        if index_dir.exists() {
            fs::remove_dir_all(&index_dir)?;
        }
        fs::create_dir_all(self.root.join("index/by-author"))?;
        fs::create_dir_all(self.root.join("index/by-kind"))?;
        fs::create_dir_all(self.root.join("index/by-tag"))?;

        let mut events = vec![];
        for entry in walkdir::WalkDir::new(self.root.join("events")) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let data = fs::read_to_string(entry.path())?;
                let ev: Event = serde_json::from_str(&data)?;
                events.push(ev);
            }
        }
        events.sort_by_key(|e| e.created_at);
        fs::create_dir_all(self.root.join("log"))?;
        let mut log_file = fs::File::create(self.root.join("log/events.ndjson"))?;
        for ev in &events {
            self.index_event(ev)?;
            serde_json::to_writer(&mut log_file, ev)?;
            log_file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Execute a filter list: merge per-filter results, de-duplicate by id,
    /// and return events newest-first. Each filter's `limit` is applied to
    /// its own result set after sorting.
    pub fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let mut merged: Vec<Event> = vec![];
        let mut seen: HashSet<String> = HashSet::new();
        for filter in filters {
            let candidates = self.candidates(filter)?;
            let mut events: Vec<Event> = match candidates {
                Some(ids) => ids
                    .into_iter()
                    .filter_map(|id| self.get(&id))
                    .filter(|ev| filter.matches(ev))
                    .collect(),
                // No indexed predicate: scan the log.
                None => self
                    .scan_log()?
                    .into_iter()
                    .filter(|ev| filter.matches(ev))
                    .collect(),
            };
            sort_newest_first(&mut events);
            collapse_versions(&mut events);
            if let Some(limit) = filter.limit {
                events.truncate(limit);
            }
            for ev in events {
                if seen.insert(ev.id.clone()) {
                    merged.push(ev);
                }
            }
        }
        sort_newest_first(&mut merged);
        Ok(merged)
    }

    /// Candidate id set for a filter, a superset of its matches, or `None`
    /// when no index applies and a scan is required.
    fn candidates(&self, filter: &Filter) -> Result<Option<HashSet<String>>> {
        let mut sets: Vec<HashSet<String>> = vec![];
        if let Some(ids) = &filter.ids {
            sets.push(ids.iter().cloned().collect());
        }
        if let Some(authors) = &filter.authors {
            sets.push(self.load_ids("index/by-author", authors)?);
        }
        if let Some(kinds) = &filter.kinds {
            let keys: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
            sets.push(self.load_ids("index/by-kind", &keys)?);
        }
        for (name, values) in &filter.tags {
            // Only single-character tag names are indexed; anything else is
            // handled by the post-filter over a wider candidate set.
            if name.len() == 1 {
                let prefix = format!("index/by-tag/{}", name);
                let keys: Vec<String> = values.iter().map(|v| index_key(v)).collect();
                sets.push(self.load_ids(&prefix, &keys)?);
            }
        }
        if sets.is_empty() {
            return Ok(None);
        }
        let mut iter = sets.into_iter();
        let mut ids = iter.next().unwrap_or_default();
        for s in iter {
            ids = ids.intersection(&s).cloned().collect();
        }
        Ok(Some(ids))
    }

    /// Update indexes for an event.
    fn index_event(&self, ev: &Event) -> Result<()> {
        self.append_index("index/by-author", &ev.pubkey, &ev.id)?;
        self.append_index("index/by-kind", &ev.kind.to_string(), &ev.id)?;
        for tag in &ev.tags {
            if let (Some(name), Some(value)) = (tag.name(), tag.value()) {
                if name.len() == 1 && name.chars().all(|c| c.is_ascii_alphanumeric()) {
                    let prefix = format!("index/by-tag/{}", name);
                    self.append_index(&prefix, &index_key(value), &ev.id)?;
                }
            }
        }
        Ok(())
    }

    /// Append an event id to the index file under `prefix/name.txt`.
    fn append_index(&self, prefix: &str, name: &str, id: &str) -> Result<()> {
        let path = self.root.join(prefix).join(format!("{}.txt", name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(f, "{}", id)?;
        Ok(())
    }

    /// Compute the canonical path for an event id.
    fn event_path(&self, id: &str) -> PathBuf {
        // Ids shorter than the shard prefix only appear in tests; shard on
        // whatever is available.
        let sub1 = id.get(0..2).unwrap_or("_");
        let sub2 = id.get(2..4).unwrap_or("_");
        self.root
            .join("events")
            .join(sub1)
            .join(sub2)
            .join(format!("{}.json", id))
    }

    /// Union of id sets for a list of keys under `prefix`.
    fn load_ids(&self, prefix: &str, keys: &[String]) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for key in keys {
            let path = self.root.join(prefix).join(format!("{}.txt", key));
            ids.extend(read_ids(&path)?);
        }
        Ok(ids)
    }

    /// Read every stored event from the append-only log.
    fn scan_log(&self) -> Result<Vec<Event>> {
        let path = self.root.join("log/events.ndjson");
        if !path.exists() {
            return Ok(vec![]);
        }
        let data = fs::read_to_string(path)?;
        let mut events = vec![];
        for line in data.lines() {
            match serde_json::from_str::<Event>(line) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!(error = %e, "skipping unparseable log line"),
            }
        }
        Ok(events)
    }
}

/// Sort newest-first, breaking timestamp ties by id.
fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| {
        Reverse(a.created_at)
            .cmp(&Reverse(b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Drop superseded versions of replaceable and addressable events. Assumes
/// the slice is sorted newest-first so the first version seen wins.
fn collapse_versions(events: &mut Vec<Event>) {
    let mut seen = HashSet::new();
    events.retain(|ev| {
        let key = if ev.is_addressable() {
            Some(format!(
                "{}:{}:{}",
                ev.pubkey,
                ev.kind,
                ev.tag_value("d").unwrap_or_default()
            ))
        } else if ev.is_replaceable() {
            Some(format!("{}:{}", ev.pubkey, ev.kind))
        } else {
            None
        };
        match key {
            Some(k) => seen.insert(k),
            None => true,
        }
    });
}

/// Filesystem-safe index filename for a tag value. Plain short values map to
/// themselves; anything else maps to a digest of the value.
fn index_key(value: &str) -> String {
    let plain = !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        value.to_string()
    } else {
        hex::encode(Sha256::digest(value.as_bytes()))
    }
}

/// Read newline-separated ids from a text file.
fn read_ids(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(Default::default());
    }
    let data = fs::read_to_string(path)?;
    Ok(data.lines().map(|s| s.to_string()).collect())
}
