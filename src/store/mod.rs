// src/store/mod.rs
//! Event persistence: the [`EventStore`] contract, the conflict-retry write path
//! shared by every backend, and backend selection.
//!
//! Two backend families implement the contract:
//! - document stores ([`DocumentStore`]) over a CouchDB-shaped [`DocumentDb`]
//!   (`CouchDb` over HTTP, `MemoryDocumentDb` in process);
//! - key-value stores ([`KeyValueStore`]) over a Redis-shaped [`KvClient`]
//!   (`RedisKv`, `MemoryKv`).

pub mod couch;
pub mod document;
pub mod kv;
pub mod memory_doc;
pub mod memory_kv;
pub mod redis_kv;

use async_trait::async_trait;
use metrics::counter;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collapse::{collapse_events, DisplayItem};
use crate::config::AppConfig;
use crate::error::StoreError;
use crate::model::{EventQuery, EventRecord, SourceRecord};

pub use couch::CouchDb;
pub use document::{DocumentDb, DocumentStore};
pub use kv::{KeyValueStore, KvClient};
pub use memory_doc::MemoryDocumentDb;
pub use memory_kv::MemoryKv;
pub use redis_kv::RedisKv;

/// Total write attempts before unresolved conflicts become fatal.
pub const WRITE_ATTEMPTS: usize = 3;

/// Persisted record: id and revision token kept apart from the flat body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: Option<String>,
    pub body: Map<String, Value>,
}

impl Document {
    pub fn from_event(event: &EventRecord) -> Result<Self, StoreError> {
        let mut body = into_object(serde_json::to_value(event)?);
        let id = take_string(&mut body, "_id").ok_or_else(|| StoreError::Malformed {
            id: event.summary.clone(),
            reason: "event has no id".into(),
        })?;
        body.insert("type".into(), Value::String("event".into()));
        Ok(Self { id, rev: None, body })
    }

    pub fn from_source(source: &SourceRecord) -> Result<Self, StoreError> {
        let mut body = into_object(serde_json::to_value(source)?);
        body.remove("_id");
        body.insert("type".into(), Value::String("source".into()));
        Ok(Self {
            id: source.source_id.clone(),
            rev: None,
            body,
        })
    }

    /// Parse the wire form (`_id`, `_rev` and body fields side by side).
    pub fn from_json(value: Value) -> Result<Self, StoreError> {
        let Value::Object(mut body) = value else {
            return Err(StoreError::Malformed {
                id: "?".into(),
                reason: "record is not an object".into(),
            });
        };
        let id = take_string(&mut body, "_id").ok_or_else(|| StoreError::Malformed {
            id: "?".into(),
            reason: "record has no _id".into(),
        })?;
        let rev = take_string(&mut body, "_rev");
        body.retain(|k, _| !k.starts_with('_'));
        Ok(Self { id, rev, body })
    }

    pub fn to_json(&self) -> Value {
        let mut out = self.body.clone();
        out.insert("_id".into(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            out.insert("_rev".into(), Value::String(rev.clone()));
        }
        Value::Object(out)
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    pub fn into_event(self) -> Result<EventRecord, StoreError> {
        let id = self.id.clone();
        serde_json::from_value(self.into_record_json()).map_err(|e| StoreError::Malformed {
            id,
            reason: e.to_string(),
        })
    }

    pub fn into_source(self) -> Result<SourceRecord, StoreError> {
        let id = self.id.clone();
        serde_json::from_value(self.into_record_json()).map_err(|e| StoreError::Malformed {
            id,
            reason: e.to_string(),
        })
    }

    fn into_record_json(self) -> Value {
        let mut body = self.body;
        body.remove("type");
        body.insert("_id".into(), Value::String(self.id));
        Value::Object(body)
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Per-record result of one batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    Written { id: String },
    /// The stored revision differs from the one the write expected.
    Conflict { id: String },
    /// Any other refusal; not retried.
    Failed { id: String, reason: String },
}

/// Revision-checked batch writes, the primitive under [`write_with_retry`].
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    async fn write_batch(&self, docs: &[Document]) -> Result<Vec<WriteStatus>, StoreError>;

    /// Freshly read stored version of `doc`, if any.
    async fn read_current(&self, doc: &Document) -> Result<Option<Document>, StoreError>;
}

/// Write `docs` with bounded optimistic-concurrency retries.
///
/// Each attempt writes every unresolved record. A conflicted record is re-read:
/// it takes the stored revision and is dropped if the stored body already
/// equals what is being written. Returns the number of records actually
/// written; fails with `ConflictExhausted` if anything is left after
/// [`WRITE_ATTEMPTS`] attempts.
pub async fn write_with_retry<W>(writer: &W, docs: Vec<Document>) -> Result<usize, StoreError>
where
    W: DocumentWriter + ?Sized,
{
    let mut pending: BTreeMap<String, Document> =
        docs.into_iter().map(|d| (d.id.clone(), d)).collect();
    let mut written = 0usize;
    let mut attempts = 0usize;

    while !pending.is_empty() && attempts < WRITE_ATTEMPTS {
        attempts += 1;
        let batch: Vec<Document> = pending.values().cloned().collect();
        let results = writer.write_batch(&batch).await?;

        for status in results {
            match status {
                WriteStatus::Written { id } => {
                    if pending.remove(&id).is_some() {
                        written += 1;
                    }
                }
                WriteStatus::Conflict { id } => {
                    let Some(doc) = pending.get(&id) else {
                        continue;
                    };
                    // A blind create hitting an existing record is routine;
                    // only a stale revision means another writer got there.
                    if doc.rev.is_some() {
                        counter!("been_store_conflicts_total").increment(1);
                    }
                    let current = writer.read_current(doc).await?;
                    let unchanged = match (current, pending.get_mut(&id)) {
                        (Some(cur), Some(doc)) => {
                            doc.rev = cur.rev;
                            cur.body == doc.body
                        }
                        (None, Some(doc)) => {
                            doc.rev = None;
                            false
                        }
                        _ => false,
                    };
                    if unchanged {
                        tracing::trace!(%id, "stored record already up to date");
                        pending.remove(&id);
                    }
                }
                WriteStatus::Failed { id, reason } => {
                    return Err(StoreError::Rejected { id, reason });
                }
            }
        }
    }

    if !pending.is_empty() {
        let ids: Vec<String> = pending.into_keys().collect();
        tracing::warn!(attempts, unresolved = ids.len(), "write conflicts exhausted");
        return Err(StoreError::ConflictExhausted { attempts, ids });
    }

    Ok(written)
}

/// Durable, idempotent, queryable storage for sources and events.
#[async_trait]
pub trait EventStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_sources(&self) -> Result<BTreeMap<String, SourceRecord>, StoreError>;

    /// Upsert; an identical stored record is left untouched.
    async fn store_source(&self, source: &SourceRecord) -> Result<(), StoreError>;

    /// Assign missing ids, then write through the conflict-retry path.
    /// Returns the number of records written.
    async fn store_events(&self, events: Vec<EventRecord>) -> Result<usize, StoreError>;

    /// Tag `events` with the source, store them, then store the source.
    /// Not atomic across the two steps.
    async fn store_update(
        &self,
        source: &SourceRecord,
        mut events: Vec<EventRecord>,
    ) -> Result<usize, StoreError> {
        for event in &mut events {
            event.kind = source.kind.clone();
            event.source = source.source_id.clone();
        }
        let stored = self.store_events(events).await?;
        self.store_source(source).await?;
        Ok(stored)
    }

    async fn events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError>;

    async fn events_by_slug(&self, slug: &str) -> Result<Vec<EventRecord>, StoreError>;

    async fn events_by_source_count(&self) -> Result<BTreeMap<String, usize>, StoreError>;

    /// Delete every event and reset every source cursor.
    async fn empty(&self) -> Result<(), StoreError>;

    async fn collapsed_events(&self, query: &EventQuery) -> Result<Vec<DisplayItem>, StoreError> {
        let sources = self.get_sources().await?;
        let events = self.events(query).await?;
        Ok(collapse_events(events, &sources))
    }
}

pub(crate) fn assign_ids(events: Vec<EventRecord>) -> Result<Vec<Document>, StoreError> {
    events
        .into_iter()
        .map(|mut event| {
            event.ensure_id();
            Document::from_event(&event)
        })
        .collect()
}

/// Build the backend named by `config.store`.
pub async fn create_store(config: &AppConfig) -> Result<Arc<dyn EventStore>, StoreError> {
    create_named_store(&config.store, config).await
}

pub async fn create_named_store(
    name: &str,
    config: &AppConfig,
) -> Result<Arc<dyn EventStore>, StoreError> {
    let store: Arc<dyn EventStore> = match name.trim().to_ascii_lowercase().as_str() {
        "couch" | "couchdb" => {
            let db = CouchDb::connect(&config.couch).await?;
            Arc::new(DocumentStore::new(db))
        }
        "redis" => {
            let kv = RedisKv::connect(&config.redis.url).await?;
            Arc::new(KeyValueStore::new(kv, &config.redis.prefix))
        }
        "memory" => Arc::new(DocumentStore::new(MemoryDocumentDb::new())),
        other => return Err(StoreError::UnknownBackend(other.to_string())),
    };
    tracing::info!(backend = store.name(), "event store ready");
    Ok(store)
}

/// Copy every source and every event from one backend to another.
/// Returns `(sources, events written)`.
pub async fn migrate(from: &dyn EventStore, to: &dyn EventStore) -> Result<(usize, usize), StoreError> {
    let sources = from.get_sources().await?;
    for source in sources.values() {
        to.store_source(source).await?;
    }
    let events = from.events(&EventQuery::all()).await?;
    let written = to.store_events(events).await?;
    tracing::info!(
        from = from.name(),
        to = to.name(),
        sources = sources.len(),
        events = written,
        "migration finished"
    );
    Ok((sources.len(), written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Writer that reports a conflict for the first `reject` attempts while a
    /// competing writer holds a different body at revision `9-other`.
    struct ScriptedWriter {
        reject: usize,
        calls: Mutex<usize>,
        stored_body: Map<String, Value>,
        seen_revs: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedWriter {
        fn new(reject: usize, stored_body: Map<String, Value>) -> Self {
            Self {
                reject,
                calls: Mutex::new(0),
                stored_body,
                seen_revs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DocumentWriter for ScriptedWriter {
        async fn write_batch(&self, docs: &[Document]) -> Result<Vec<WriteStatus>, StoreError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            let reject = *calls <= self.reject;
            let mut seen = self.seen_revs.lock().unwrap();
            Ok(docs
                .iter()
                .map(|d| {
                    seen.push(d.rev.clone());
                    if reject {
                        WriteStatus::Conflict { id: d.id.clone() }
                    } else {
                        WriteStatus::Written { id: d.id.clone() }
                    }
                })
                .collect())
        }

        async fn read_current(&self, doc: &Document) -> Result<Option<Document>, StoreError> {
            Ok(Some(Document {
                id: doc.id.clone(),
                rev: Some("9-other".into()),
                body: self.stored_body.clone(),
            }))
        }
    }

    fn event_doc(summary: &str, ts: i64) -> Document {
        let mut ev = EventRecord::new(summary, ts);
        ev.ensure_id();
        Document::from_event(&ev).unwrap()
    }

    fn other_body() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("summary".into(), Value::String("someone else's edit".into()));
        m
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let writer = ScriptedWriter::new(2, other_body());
        let n = write_with_retry(&writer, vec![event_doc("a", 1)]).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(*writer.calls.lock().unwrap(), 3);
        // First attempt is a blind create; retries carry the merged revision.
        let revs = writer.seen_revs.lock().unwrap();
        assert_eq!(revs[0], None);
        assert_eq!(revs[2].as_deref(), Some("9-other"));
    }

    #[tokio::test]
    async fn three_conflicts_exhaust_the_budget() {
        let writer = ScriptedWriter::new(3, other_body());
        let err = write_with_retry(&writer, vec![event_doc("a", 1)])
            .await
            .unwrap_err();
        match err {
            StoreError::ConflictExhausted { attempts, ids } => {
                assert_eq!(attempts, WRITE_ATTEMPTS);
                assert_eq!(ids.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*writer.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn identical_stored_body_is_treated_as_applied() {
        let doc = event_doc("same", 7);
        let writer = ScriptedWriter::new(usize::MAX, doc.body.clone());
        let n = write_with_retry(&writer, vec![doc]).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(*writer.calls.lock().unwrap(), 1);
    }

    /// Run `write_with_retry` under a private recorder and return the
    /// rendered conflict counter line, if any.
    fn conflicts_counted(writer: &ScriptedWriter, docs: Vec<Document>) -> Option<String> {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        metrics::with_local_recorder(&recorder, || {
            let _ = rt.block_on(write_with_retry(writer, docs));
        });
        handle
            .render()
            .lines()
            .find(|l| l.starts_with("been_store_conflicts_total "))
            .map(str::to_string)
    }

    #[test]
    fn only_stale_revisions_count_as_conflicts() {
        // Blind create conflicts, then the merged revision conflicts once more.
        let writer = ScriptedWriter::new(2, other_body());
        assert_eq!(
            conflicts_counted(&writer, vec![event_doc("a", 1)]).as_deref(),
            Some("been_store_conflicts_total 1")
        );

        // Re-storing an unchanged record is not contention.
        let doc = event_doc("same", 7);
        let writer = ScriptedWriter::new(usize::MAX, doc.body.clone());
        assert_eq!(conflicts_counted(&writer, vec![doc]), None);
    }

    #[test]
    fn document_roundtrips_event_and_strips_underscored_fields() {
        let mut ev = EventRecord::new("posted", 3);
        ev.ensure_id();
        let doc = Document::from_event(&ev).unwrap();
        assert_eq!(doc.doc_type(), Some("event"));

        let mut wire = doc.to_json();
        wire["_rev"] = Value::String("1-abc".into());
        wire["_conflicts"] = Value::Array(vec![]);
        let parsed = Document::from_json(wire).unwrap();
        assert_eq!(parsed.rev.as_deref(), Some("1-abc"));
        assert!(!parsed.body.contains_key("_conflicts"));
        assert_eq!(parsed.into_event().unwrap(), ev);
    }
}
