// src/store/document.rs
//! Document-oriented backend: records live as JSON documents with server-side
//! revisions, and every query goes through one of the design-document views
//! below, which the database keeps current on each write.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{assign_ids, write_with_retry, Document, DocumentWriter, EventStore, WriteStatus, WRITE_ATTEMPTS};
use crate::error::StoreError;
use crate::model::{EventQuery, EventRecord, SourceRecord, Since};

pub const DESIGN_DOC_ID: &str = "_design/activity";

/// Secondary orderings maintained by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    /// key: source id
    Sources,
    /// key: timestamp
    Events,
    /// key: [source, timestamp]
    EventsBySource,
    /// key: source, reduced with `_count`
    EventsBySourceCount,
    /// key: slug
    EventsBySlug,
}

impl View {
    pub const ALL: [View; 5] = [
        View::Sources,
        View::Events,
        View::EventsBySource,
        View::EventsBySourceCount,
        View::EventsBySlug,
    ];

    pub fn name(self) -> &'static str {
        match self {
            View::Sources => "sources",
            View::Events => "events",
            View::EventsBySource => "events-by-source",
            View::EventsBySourceCount => "events-by-source-count",
            View::EventsBySlug => "events-by-slug",
        }
    }

    fn map_fn(self) -> &'static str {
        match self {
            View::Sources => "function(doc) { if (doc.type == 'source') { emit(doc._id, doc) } }",
            View::Events => "function(doc) { if (doc.type == 'event') { emit(doc.timestamp, doc) } }",
            View::EventsBySource => {
                "function(doc) { if (doc.type == 'event') { emit([doc.source, doc.timestamp], doc) } }"
            }
            View::EventsBySourceCount => {
                "function(doc) { if (doc.type == 'event') { emit(doc.source, null) } }"
            }
            View::EventsBySlug => {
                "function(doc) { if (doc.type == 'event' && doc.slug) { emit(doc.slug, doc) } }"
            }
        }
    }

    pub fn is_reduce(self) -> bool {
        matches!(self, View::EventsBySourceCount)
    }

    /// Index key for `doc` in this view, mirroring [`View::map_fn`].
    pub fn emit(self, doc: &Document) -> Option<Value> {
        let body = &doc.body;
        match (self, doc.doc_type()?) {
            (View::Sources, "source") => Some(Value::String(doc.id.clone())),
            (View::Events, "event") => Some(body.get("timestamp").cloned().unwrap_or(Value::Null)),
            (View::EventsBySource, "event") => Some(json!([
                body.get("source").cloned().unwrap_or(Value::Null),
                body.get("timestamp").cloned().unwrap_or(Value::Null)
            ])),
            (View::EventsBySourceCount, "event") => {
                Some(body.get("source").cloned().unwrap_or(Value::Null))
            }
            (View::EventsBySlug, "event") => match body.get("slug") {
                Some(Value::String(s)) if !s.is_empty() => Some(Value::String(s.clone())),
                _ => None,
            },
            _ => None,
        }
    }
}

/// The design document declaring every view.
pub fn design_document() -> Value {
    let mut views = serde_json::Map::new();
    for view in View::ALL {
        let mut def = serde_json::Map::new();
        def.insert("map".into(), Value::String(view.map_fn().into()));
        if view.is_reduce() {
            def.insert("reduce".into(), Value::String("_count".into()));
        }
        views.insert(view.name().into(), Value::Object(def));
    }
    json!({
        "_id": DESIGN_DOC_ID,
        "language": "javascript",
        "views": views,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewQuery {
    pub descending: bool,
    pub limit: Option<usize>,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    /// Group reduce output by key (reduce views only).
    pub group: bool,
}

impl ViewQuery {
    pub fn key(key: Value) -> Self {
        Self {
            start_key: Some(key.clone()),
            end_key: Some(key),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ViewRow {
    #[serde(default)]
    pub id: Option<String>,
    pub key: Value,
    #[serde(default)]
    pub value: Value,
}

/// One entry of a `_bulk_docs` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BulkResult {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkResult {
    pub fn ok(id: &str, rev: &str) -> Self {
        Self {
            id: id.to_string(),
            rev: Some(rev.to_string()),
            error: None,
            reason: None,
        }
    }

    pub fn conflict(id: &str) -> Self {
        Self {
            id: id.to_string(),
            rev: None,
            error: Some("conflict".into()),
            reason: Some("Document update conflict.".into()),
        }
    }
}

/// CouchDB-shaped database primitives.
#[async_trait]
pub trait DocumentDb: Send + Sync {
    /// Write documents in one request; each write is checked against `_rev`.
    /// Documents with `"_deleted": true` are removed.
    async fn bulk_docs(&self, docs: &[Value]) -> Result<Vec<BulkResult>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError>;

    async fn view(&self, view: View, query: &ViewQuery) -> Result<Vec<ViewRow>, StoreError>;

    fn backend_name(&self) -> &'static str;
}

/// [`EventStore`] over any [`DocumentDb`].
pub struct DocumentStore<D> {
    db: D,
}

impl<D: DocumentDb> DocumentStore<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    async fn view_documents(&self, view: View, query: &ViewQuery) -> Result<Vec<Document>, StoreError> {
        self.db
            .view(view, query)
            .await?
            .into_iter()
            .map(|row| Document::from_json(row.value))
            .collect()
    }

    async fn view_events(&self, view: View, query: &ViewQuery) -> Result<Vec<EventRecord>, StoreError> {
        self.view_documents(view, query)
            .await?
            .into_iter()
            .map(Document::into_event)
            .collect()
    }
}

/// Translate an [`EventQuery`] into a view and key range.
fn events_view_query(query: &EventQuery) -> (View, ViewQuery) {
    let mut vq = ViewQuery {
        descending: query.descending,
        limit: query.count,
        ..ViewQuery::default()
    };
    match &query.source {
        Some(source) => {
            // `{}` collates after every number, `[source]` before every `[source, ts]`.
            let bound = query.before.map(Value::from).unwrap_or_else(|| json!({}));
            if query.descending {
                vq.start_key = Some(json!([source, bound]));
                vq.end_key = Some(json!([source]));
            } else {
                vq.start_key = Some(match query.before {
                    Some(ts) => json!([source, ts]),
                    None => json!([source]),
                });
                vq.end_key = Some(json!([source, {}]));
            }
            (View::EventsBySource, vq)
        }
        None => {
            vq.start_key = query.before.map(Value::from);
            (View::Events, vq)
        }
    }
}

#[async_trait]
impl<D: DocumentDb> DocumentWriter for DocumentStore<D> {
    async fn write_batch(&self, docs: &[Document]) -> Result<Vec<WriteStatus>, StoreError> {
        let payload: Vec<Value> = docs.iter().map(Document::to_json).collect();
        let results = self.db.bulk_docs(&payload).await?;
        Ok(results
            .into_iter()
            .map(|r| match r.error.as_deref() {
                None => WriteStatus::Written { id: r.id },
                Some("conflict") => WriteStatus::Conflict { id: r.id },
                Some(other) => WriteStatus::Failed {
                    reason: r.reason.unwrap_or_else(|| other.to_string()),
                    id: r.id,
                },
            })
            .collect())
    }

    async fn read_current(&self, doc: &Document) -> Result<Option<Document>, StoreError> {
        self.db.get(&doc.id).await?.map(Document::from_json).transpose()
    }
}

#[async_trait]
impl<D: DocumentDb> EventStore for DocumentStore<D> {
    fn name(&self) -> &'static str {
        self.db.backend_name()
    }

    async fn get_sources(&self) -> Result<BTreeMap<String, SourceRecord>, StoreError> {
        self.view_documents(View::Sources, &ViewQuery::default())
            .await?
            .into_iter()
            .map(|doc| doc.into_source().map(|s| (s.source_id.clone(), s)))
            .collect()
    }

    async fn store_source(&self, source: &SourceRecord) -> Result<(), StoreError> {
        write_with_retry(self, vec![Document::from_source(source)?]).await?;
        Ok(())
    }

    async fn store_events(&self, events: Vec<EventRecord>) -> Result<usize, StoreError> {
        write_with_retry(self, assign_ids(events)?).await
    }

    async fn events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError> {
        let (view, vq) = events_view_query(query);
        self.view_events(view, &vq).await
    }

    async fn events_by_slug(&self, slug: &str) -> Result<Vec<EventRecord>, StoreError> {
        let mut vq = ViewQuery::key(Value::String(slug.to_string()));
        vq.limit = Some(1);
        self.view_events(View::EventsBySlug, &vq).await
    }

    async fn events_by_source_count(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let vq = ViewQuery {
            group: true,
            ..ViewQuery::default()
        };
        Ok(self
            .db
            .view(View::EventsBySourceCount, &vq)
            .await?
            .into_iter()
            .filter_map(|row| {
                let source = row.key.as_str()?.to_string();
                let count = row.value.as_u64()? as usize;
                Some((source, count))
            })
            .collect())
    }

    async fn empty(&self) -> Result<(), StoreError> {
        let events = self.view_documents(View::Events, &ViewQuery::default()).await?;
        let listed = events.len();
        let mut pending: Vec<(String, Option<String>)> =
            events.into_iter().map(|doc| (doc.id, doc.rev)).collect();

        let mut attempts = 0usize;
        while !pending.is_empty() && attempts < WRITE_ATTEMPTS {
            attempts += 1;
            let tombstones: Vec<Value> = pending
                .iter()
                .map(|(id, rev)| json!({ "_id": id, "_rev": rev, "_deleted": true }))
                .collect();
            let mut retry = Vec::new();
            for r in self.db.bulk_docs(&tombstones).await? {
                match r.error.as_deref() {
                    None => {}
                    Some("conflict") => {
                        // Edited since it was listed: delete the current revision.
                        if let Some(current) = self.db.get(&r.id).await? {
                            let rev = current.get("_rev").and_then(Value::as_str).map(str::to_string);
                            retry.push((r.id, rev));
                        }
                    }
                    Some(other) => {
                        return Err(StoreError::Rejected {
                            reason: r.reason.clone().unwrap_or_else(|| other.to_string()),
                            id: r.id,
                        });
                    }
                }
            }
            pending = retry;
        }
        if !pending.is_empty() {
            let ids: Vec<String> = pending.into_iter().map(|(id, _)| id).collect();
            return Err(StoreError::ConflictExhausted { attempts, ids });
        }
        if listed > 0 {
            tracing::info!(deleted = listed, "events cleared");
        }

        for (_, mut source) in self.get_sources().await? {
            source.since = Since::default();
            self.store_source(&source).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn design_document_declares_every_view() {
        let doc = design_document();
        for view in View::ALL {
            assert!(doc["views"][view.name()]["map"].is_string(), "{}", view.name());
        }
        assert_eq!(doc["views"]["events-by-source-count"]["reduce"], "_count");
        assert!(doc["views"]["events"].get("reduce").is_none());
    }

    #[test]
    fn source_query_brackets_the_source_key_range() {
        let q = EventQuery::default().source("feed:x");
        let (view, vq) = events_view_query(&q);
        assert_eq!(view, View::EventsBySource);
        assert!(vq.descending);
        assert_eq!(vq.start_key, Some(json!(["feed:x", {}])));
        assert_eq!(vq.end_key, Some(json!(["feed:x"])));
        assert_eq!(vq.limit, Some(100));

        let q = EventQuery::default().source("feed:x").before(50).ascending();
        let (_, vq) = events_view_query(&q);
        assert_eq!(vq.start_key, Some(json!(["feed:x", 50])));
        assert_eq!(vq.end_key, Some(json!(["feed:x", {}])));
    }

    #[test]
    fn emit_skips_events_without_slug() {
        let mut ev = EventRecord::new("x", 1);
        ev.ensure_id();
        let doc = Document::from_event(&ev).unwrap();
        assert_eq!(View::EventsBySlug.emit(&doc), None);
        assert_eq!(View::Events.emit(&doc), Some(json!(1)));
        assert_eq!(View::Sources.emit(&doc), None);
    }
}
