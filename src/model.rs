// src/model.rs
//! Plain data shapes shared by sources, stores and readers.
//!
//! Both records serialize as flat maps: a [`SourceRecord`] carries its `kind`,
//! cursor and any adapter parameters side by side, and an [`EventRecord`] keeps
//! adapter-specific extras (titles, metadata) next to the core fields. Times are
//! always epoch seconds (UTC) in persisted form.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

/// Default collapse window: two hours.
pub const DEFAULT_COLLAPSE_INTERVAL_SECS: i64 = 2 * 60 * 60;

/// Default upper bound for `events()` when the caller gives none.
pub const DEFAULT_EVENT_COUNT: usize = 100;

/// Opaque incremental-fetch cursor. Only adapters and the store touch it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Since {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Last-Modified validator, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
}

impl Since {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.modified.is_none()
    }
}

/// Source-level collapse setting: `true`/`false`, or a window such as
/// `{"interval": 600}` (`interval_seconds` is accepted too).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollapsePolicy {
    Flag(bool),
    Window {
        #[serde(default, alias = "interval_seconds", skip_serializing_if = "Option::is_none")]
        interval: Option<i64>,
    },
}

impl CollapsePolicy {
    /// The grouping window in seconds, or `None` when collapsing is off.
    pub fn interval(&self) -> Option<i64> {
        match self {
            CollapsePolicy::Flag(false) => None,
            CollapsePolicy::Flag(true) => Some(DEFAULT_COLLAPSE_INTERVAL_SECS),
            CollapsePolicy::Window { interval } => {
                Some(interval.unwrap_or(DEFAULT_COLLAPSE_INTERVAL_SECS))
            }
        }
    }
}

/// A configured source as persisted by the store.
///
/// `source_id` is derived once by the adapter factory and never changes.
/// Everything adapter-specific (url, path, queue, user flags such as
/// `syndicate`) lives in `config`, flattened next to the typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(rename = "_id")]
    pub source_id: String,
    pub kind: String,
    #[serde(default)]
    pub since: Since,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse: Option<CollapsePolicy>,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(kind: &str, source_id: String) -> Self {
        Self {
            source_id,
            kind: kind.to_string(),
            since: Since::default(),
            collapse: None,
            config: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    /// String-valued config parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Read a single key from the flat persisted view (`kind`, `since`,
    /// `collapse` or any config entry).
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "source_id" | "_id" => Some(Value::String(self.source_id.clone())),
            "kind" => Some(Value::String(self.kind.clone())),
            "since" => serde_json::to_value(&self.since).ok(),
            "collapse" => self.collapse.and_then(|c| serde_json::to_value(c).ok()),
            other => self.config.get(other).cloned(),
        }
    }
}

/// One normalized activity item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub kind: String,
    /// Epoch seconds, UTC.
    pub timestamp: i64,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse: Option<bool>,
    /// Raw upstream payload kept for reprocessing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventRecord {
    pub fn new(summary: impl Into<String>, timestamp: i64) -> Self {
        Self {
            summary: summary.into(),
            timestamp,
            ..Self::default()
        }
    }

    /// Assigns the content id when none is set and returns the id.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_none() {
            self.id = Some(content_id(&self.summary, self.timestamp));
        }
        self.id.as_deref().unwrap_or_default()
    }

    /// Field lookup inside the raw `data` payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }
}

/// SHA-1 over `summary` followed by the decimal timestamp, hex encoded.
pub fn content_id(summary: &str, timestamp: i64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(summary.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex_digest(&hasher.finalize())
}

/// SHA-1 of an arbitrary stable key (e.g. a file path), hex encoded.
pub fn identity_id(key: &str) -> String {
    hex_digest(&Sha1::digest(key.as_bytes()))
}

fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Parameters for [`EventStore::events`](crate::store::EventStore::events).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// `None` means unbounded.
    pub count: Option<usize>,
    /// Start key: newest timestamp to include when descending, oldest when ascending.
    pub before: Option<i64>,
    pub source: Option<String>,
    pub descending: bool,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            count: Some(DEFAULT_EVENT_COUNT),
            before: None,
            source: None,
            descending: true,
        }
    }
}

impl EventQuery {
    pub fn all() -> Self {
        Self {
            count: None,
            ..Self::default()
        }
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn before(mut self, ts: i64) -> Self {
        self.before = Some(ts);
        self
    }

    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source = Some(source_id.into());
        self
    }

    pub fn ascending(mut self) -> Self {
        self.descending = false;
        self
    }
}
