// src/store/kv.rs
//! Key-value backend: records are JSON strings in hashes, orderings are
//! sorted sets scored by timestamp, and revisions live in a side hash so a
//! write can be checked and applied atomically.
//!
//! Keys (all under the configured prefix):
//! - `sources`, `source-revs`
//! - `events`, `event-revs`
//! - `events-by-timestamp` (zset, member = event id)
//! - `events-by-source:<source id>` (zset)
//! - `events-by-slug` (hash slug -> event id)

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::memory_doc::next_rev;
use super::{assign_ids, write_with_retry, Document, DocumentWriter, EventStore, WriteStatus};
use crate::error::StoreError;
use crate::model::{EventQuery, EventRecord, SourceRecord, Since};

/// Score window for a sorted-set read. `bound` is inclusive: the upper bound
/// when descending, the lower bound when ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreRange {
    pub bound: Option<i64>,
    pub descending: bool,
    pub limit: Option<usize>,
}

/// Index maintenance applied together with a record write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    ZAdd { key: String, score: i64, member: String },
    ZRem { key: String, member: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
}

/// One revision-checked record write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvWrite {
    pub hash: String,
    pub revs: String,
    pub field: String,
    /// Revision the caller last saw; `None` means the field must not exist.
    pub expected_rev: Option<String>,
    pub rev: String,
    pub value: String,
    pub index: Vec<IndexOp>,
}

/// The Redis subset the key-value store needs.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Members ordered by (score, member), reversed when descending.
    async fn zrange_by_score(&self, key: &str, range: ScoreRange) -> Result<Vec<String>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    async fn del(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Apply `write` only if the stored revision equals `expected_rev`.
    /// Returns false (and changes nothing) otherwise.
    async fn check_and_set(&self, write: &KvWrite) -> Result<bool, StoreError>;

    fn backend_name(&self) -> &'static str;
}

/// [`EventStore`] over any [`KvClient`].
pub struct KeyValueStore<K> {
    kv: K,
    prefix: String,
}

impl<K: KvClient> KeyValueStore<K> {
    pub fn new(kv: K, prefix: &str) -> Self {
        Self {
            kv,
            prefix: prefix.to_string(),
        }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn source_index(&self, source: &str) -> String {
        format!("{}events-by-source:{}", self.prefix, source)
    }

    /// (record hash, revision hash) for a document type.
    fn hashes_for(&self, doc: &Document) -> (String, String) {
        match doc.doc_type() {
            Some("source") => (self.key("sources"), self.key("source-revs")),
            _ => (self.key("events"), self.key("event-revs")),
        }
    }

    fn index_ops(&self, doc: &Document) -> Vec<IndexOp> {
        if doc.doc_type() != Some("event") {
            return Vec::new();
        }
        let score = doc.body.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
        let mut ops = vec![IndexOp::ZAdd {
            key: self.key("events-by-timestamp"),
            score,
            member: doc.id.clone(),
        }];
        if let Some(source) = doc.body.get("source").and_then(Value::as_str) {
            ops.push(IndexOp::ZAdd {
                key: self.source_index(source),
                score,
                member: doc.id.clone(),
            });
        }
        if let Some(slug) = event_slug(doc) {
            ops.push(IndexOp::HSet {
                key: self.key("events-by-slug"),
                field: slug.to_string(),
                value: doc.id.clone(),
            });
        }
        ops
    }

    /// Entries owned by the previous version of an event that the new
    /// version no longer produces.
    fn stale_index_ops(&self, previous: &Document, next: &Document) -> Vec<IndexOp> {
        let mut ops = Vec::new();
        let source_of = |d: &Document| d.body.get("source").and_then(Value::as_str).map(str::to_string);
        if let Some(old) = source_of(previous) {
            if source_of(next).as_deref() != Some(old.as_str()) {
                ops.push(IndexOp::ZRem {
                    key: self.source_index(&old),
                    member: previous.id.clone(),
                });
            }
        }
        if let Some(old) = event_slug(previous) {
            if event_slug(next) != Some(old) {
                ops.push(IndexOp::HDel {
                    key: self.key("events-by-slug"),
                    field: old.to_string(),
                });
            }
        }
        ops
    }

    async fn load(&self, hash: &str, revs: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let Some(raw) = self.kv.hget(hash, id).await? else {
            return Ok(None);
        };
        let mut doc = Document::from_json(serde_json::from_str(&raw)?)?;
        doc.rev = self.kv.hget(revs, id).await?;
        Ok(Some(doc))
    }

    async fn load_events(&self, ids: Vec<String>) -> Result<Vec<EventRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let values = self.kv.hmget(&self.key("events"), &ids).await?;
        let mut out = Vec::with_capacity(values.len());
        for (id, raw) in ids.iter().zip(values) {
            // Index entries can briefly outlive a deleted record.
            let Some(raw) = raw else {
                tracing::debug!(%id, "index points at a missing event");
                continue;
            };
            out.push(Document::from_json(serde_json::from_str(&raw)?)?.into_event()?);
        }
        Ok(out)
    }
}

fn event_slug(doc: &Document) -> Option<&str> {
    doc.body
        .get("slug")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl<K: KvClient> DocumentWriter for KeyValueStore<K> {
    async fn write_batch(&self, docs: &[Document]) -> Result<Vec<WriteStatus>, StoreError> {
        let mut statuses = Vec::with_capacity(docs.len());
        for doc in docs {
            let (hash, revs) = self.hashes_for(doc);
            let stored = Document { rev: None, ..doc.clone() };
            let value = serde_json::to_string(&stored.to_json())?;

            let mut index = self.index_ops(doc);
            if doc.rev.is_some() && doc.doc_type() == Some("event") {
                if let Some(previous) = self.load(&hash, &revs, &doc.id).await? {
                    index.extend(self.stale_index_ops(&previous, doc));
                }
            }

            let write = KvWrite {
                rev: next_rev(doc.rev.as_deref(), &value),
                hash,
                revs,
                field: doc.id.clone(),
                expected_rev: doc.rev.clone(),
                value,
                index,
            };
            let status = if self.kv.check_and_set(&write).await? {
                WriteStatus::Written { id: doc.id.clone() }
            } else {
                WriteStatus::Conflict { id: doc.id.clone() }
            };
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn read_current(&self, doc: &Document) -> Result<Option<Document>, StoreError> {
        let (hash, revs) = self.hashes_for(doc);
        self.load(&hash, &revs, &doc.id).await
    }
}

#[async_trait]
impl<K: KvClient> EventStore for KeyValueStore<K> {
    fn name(&self) -> &'static str {
        self.kv.backend_name()
    }

    async fn get_sources(&self) -> Result<BTreeMap<String, SourceRecord>, StoreError> {
        let mut out = BTreeMap::new();
        for (id, raw) in self.kv.hgetall(&self.key("sources")).await? {
            let source = Document::from_json(serde_json::from_str(&raw)?)?.into_source()?;
            out.insert(id, source);
        }
        Ok(out)
    }

    async fn store_source(&self, source: &SourceRecord) -> Result<(), StoreError> {
        write_with_retry(self, vec![Document::from_source(source)?]).await?;
        Ok(())
    }

    async fn store_events(&self, events: Vec<EventRecord>) -> Result<usize, StoreError> {
        write_with_retry(self, assign_ids(events)?).await
    }

    async fn events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError> {
        let index = match &query.source {
            Some(source) => self.source_index(source),
            None => self.key("events-by-timestamp"),
        };
        let range = ScoreRange {
            bound: query.before,
            descending: query.descending,
            limit: query.count,
        };
        let ids = self.kv.zrange_by_score(&index, range).await?;
        self.load_events(ids).await
    }

    async fn events_by_slug(&self, slug: &str) -> Result<Vec<EventRecord>, StoreError> {
        match self.kv.hget(&self.key("events-by-slug"), slug).await? {
            Some(id) => self.load_events(vec![id]).await,
            None => Ok(Vec::new()),
        }
    }

    async fn events_by_source_count(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let mut out = BTreeMap::new();
        for source in self.kv.hkeys(&self.key("sources")).await? {
            let n = self.kv.zcard(&self.source_index(&source)).await?;
            if n > 0 {
                out.insert(source, n);
            }
        }
        Ok(out)
    }

    async fn empty(&self) -> Result<(), StoreError> {
        // Per-source indexes are named after every source an event mentions,
        // registered or not.
        let mut sources: BTreeSet<String> = self.kv.hkeys(&self.key("sources")).await?.into_iter().collect();
        for raw in self.kv.hgetall(&self.key("events")).await?.into_values() {
            if let Ok(Value::Object(body)) = serde_json::from_str::<Value>(&raw) {
                if let Some(Value::String(s)) = body.get("source") {
                    sources.insert(s.clone());
                }
            }
        }

        let mut keys: Vec<String> = ["events", "event-revs", "events-by-timestamp", "events-by-slug"]
            .iter()
            .map(|k| self.key(k))
            .collect();
        keys.extend(sources.iter().map(|s| self.source_index(s)));
        self.kv.del(&keys).await?;
        tracing::info!(indexes = keys.len(), "events cleared");

        for (_, mut source) in self.get_sources().await? {
            source.since = Since::default();
            self.store_source(&source).await?;
        }
        Ok(())
    }
}
