//! Nostr event model and canonical id computation.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and
/// the following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – unique identifier for addressable events
/// - `t` – free-form topic or hashtag
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. the first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// First data element, i.e. the second array entry.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Core Nostr event persisted on disk and relayed to subscribers.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "deadbeef...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"], ["d", "slug"]],
///   "content": "hello",
///   "sig": "deadbeef..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash of the canonical form).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Arbitrary tags such as `d` (identifier) or `t` (topic).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Recompute the canonical SHA-256 digest over
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn digest(&self) -> Result<[u8; 32]> {
        let arr =
            serde_json::json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]);
        let data = serde_json::to_vec(&arr)?;
        Ok(Sha256::digest(&data).into())
    }

    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(|t| t.value())
    }

    /// Whether any tag with the given name exists.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name() == Some(name))
    }

    /// Replaceable events keep only the latest version per author and kind.
    pub fn is_replaceable(&self) -> bool {
        matches!(self.kind, 0 | 3 | 10000..=19999)
    }

    /// Addressable events keep only the latest version per author, kind and
    /// `d` tag.
    pub fn is_addressable(&self) -> bool {
        matches!(self.kind, 30000..=39999)
    }

    /// Ephemeral events are relayed to subscribers but never stored.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self.kind, 20000..=29999)
    }
}
