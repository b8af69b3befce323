// src/sources/publish.rs
//! `publish` kind: events entered by hand. [`enqueue`] appends an entry to the
//! source's persisted queue; the next fetch drains it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use super::{normalize_text, single_param, FetchStrategy, Normalize, Source, SourceAdapter, SourceContext, SourceKind};
use crate::error::SourceError;
use crate::model::{EventRecord, SourceRecord};

pub const KIND: SourceKind = SourceKind {
    kind: "publish",
    usage: "publish <name>",
    configure,
    build,
};

const QUEUE: &str = "queue";

fn configure(params: &[String]) -> Result<SourceRecord, SourceError> {
    let name = single_param("publish", "name", params)?;
    Ok(SourceRecord::new("publish", format!("publish:{name}"))
        .with("name", name)
        .with(QUEUE, Value::Array(Vec::new())))
}

fn build(record: SourceRecord, _ctx: &SourceContext) -> Result<Box<dyn SourceAdapter>, SourceError> {
    Ok(Box::new(Source::new(record, QueueDrain, PublishedEntry)))
}

/// Append `fields` as a pending entry. `timestamp` defaults to now.
pub fn enqueue(record: &mut SourceRecord, mut fields: Map<String, Value>) -> Result<(), SourceError> {
    if record.kind != KIND.kind {
        return Err(SourceError::WrongKind {
            source_id: record.source_id.clone(),
            expected: KIND.kind.into(),
            actual: record.kind.clone(),
        });
    }
    fields
        .entry("timestamp")
        .or_insert_with(|| Value::from(Utc::now().timestamp()));
    match record.config.entry(QUEUE).or_insert_with(|| Value::Array(Vec::new())) {
        Value::Array(queue) => queue.push(Value::Object(fields)),
        other => *other = Value::Array(vec![Value::Object(fields)]),
    }
    Ok(())
}

pub fn pending(record: &SourceRecord) -> usize {
    record
        .config
        .get(QUEUE)
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

/// Emits every queued entry and empties the queue.
pub struct QueueDrain;

#[async_trait]
impl FetchStrategy for QueueDrain {
    async fn fetch(&self, record: &mut SourceRecord) -> Result<Vec<EventRecord>> {
        let queue = match record.config.insert(QUEUE.into(), Value::Array(Vec::new())) {
            Some(Value::Array(q)) => q,
            _ => Vec::new(),
        };
        Ok(queue
            .into_iter()
            .map(|entry| EventRecord {
                data: Some(entry),
                ..EventRecord::default()
            })
            .collect())
    }
}

/// Copies the entry's fields onto the event. Entries without a summary or
/// title are dropped.
pub struct PublishedEntry;

impl Normalize for PublishedEntry {
    fn process_event(&self, _record: &SourceRecord, mut raw: EventRecord) -> Option<EventRecord> {
        let summary = raw
            .data_str("summary")
            .or_else(|| raw.data_str("title"))
            .map(normalize_text)
            .filter(|s| !s.is_empty())?;
        let timestamp = match raw.data.as_ref()?.get("timestamp")? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        let text = |key: &str| raw.data_str(key).map(str::to_string);
        let (content, author, slug) = (text("content"), text("author"), text("slug"));
        let event_link = text("event_link").or_else(|| text("link"));
        raw.content = content;
        raw.author = author;
        raw.event_link = event_link;
        raw.slug = slug;
        raw.summary = summary;
        raw.timestamp = timestamp;
        Some(raw)
    }
}
