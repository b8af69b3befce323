// src/store/memory_doc.rs
//! In-process [`DocumentDb`] with CouchDB semantics: revision-checked writes
//! and view indexes updated as part of every write.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::document::{BulkResult, DocumentDb, View, ViewQuery, ViewRow};
use super::Document;
use crate::error::StoreError;
use crate::model::identity_id;

/// Couch-style key collation: null < false < true < numbers < strings < arrays < objects.
pub fn collate(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                match collate(x, y) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    key: Value,
    id: String,
}

fn entry_cmp(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<String, Document>,
    /// One sorted index per view.
    indexes: HashMap<View, Vec<IndexEntry>>,
}

impl Inner {
    fn unindex(&mut self, id: &str) {
        for entries in self.indexes.values_mut() {
            entries.retain(|e| e.id != id);
        }
    }

    fn index(&mut self, doc: &Document) {
        for view in View::ALL {
            if let Some(key) = view.emit(doc) {
                let entry = IndexEntry {
                    key,
                    id: doc.id.clone(),
                };
                let entries = self.indexes.entry(view).or_default();
                let pos = entries
                    .binary_search_by(|probe| entry_cmp(probe, &entry))
                    .unwrap_or_else(|p| p);
                entries.insert(pos, entry);
            }
        }
    }

    fn write(&mut self, raw: &Value) -> Result<BulkResult, StoreError> {
        let deleted = raw.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        let doc = Document::from_json(raw.clone())?;
        let current_rev = self.docs.get(&doc.id).and_then(|d| d.rev.clone());
        if doc.rev != current_rev {
            return Ok(BulkResult::conflict(&doc.id));
        }

        self.unindex(&doc.id);
        if deleted {
            self.docs.remove(&doc.id);
            let rev = next_rev(current_rev.as_deref(), "deleted");
            return Ok(BulkResult::ok(&doc.id, &rev));
        }

        let rev = next_rev(current_rev.as_deref(), &Value::Object(doc.body.clone()).to_string());
        let stored = Document {
            rev: Some(rev.clone()),
            ..doc
        };
        self.index(&stored);
        let id = stored.id.clone();
        self.docs.insert(id.clone(), stored);
        Ok(BulkResult::ok(&id, &rev))
    }
}

/// `N-hash` revision following `current`.
pub(crate) fn next_rev(current: Option<&str>, content: &str) -> String {
    let generation = current
        .and_then(|r| r.split('-').next())
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, &identity_id(content)[..16])
}

#[derive(Debug, Default)]
pub struct MemoryDocumentDb {
    inner: Mutex<Inner>,
}

impl MemoryDocumentDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("document db mutex poisoned").docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn in_range(key: &Value, query: &ViewQuery) -> bool {
    let (low, high) = if query.descending {
        (query.end_key.as_ref(), query.start_key.as_ref())
    } else {
        (query.start_key.as_ref(), query.end_key.as_ref())
    };
    low.map_or(true, |l| collate(key, l) != Ordering::Less)
        && high.map_or(true, |h| collate(key, h) != Ordering::Greater)
}

#[async_trait]
impl DocumentDb for MemoryDocumentDb {
    async fn bulk_docs(&self, docs: &[Value]) -> Result<Vec<BulkResult>, StoreError> {
        let mut inner = self.inner.lock().expect("document db mutex poisoned");
        docs.iter().map(|raw| inner.write(raw)).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock().expect("document db mutex poisoned");
        Ok(inner.docs.get(id).map(Document::to_json))
    }

    async fn view(&self, view: View, query: &ViewQuery) -> Result<Vec<ViewRow>, StoreError> {
        let inner = self.inner.lock().expect("document db mutex poisoned");
        let Some(entries) = inner.indexes.get(&view) else {
            return Ok(Vec::new());
        };

        let matching: Box<dyn Iterator<Item = &IndexEntry>> = if query.descending {
            Box::new(entries.iter().rev())
        } else {
            Box::new(entries.iter())
        };
        let matching = matching.filter(|e| in_range(&e.key, query));

        if view.is_reduce() {
            let mut rows: Vec<ViewRow> = Vec::new();
            for entry in matching {
                // Ungrouped reduce collapses everything into one null-keyed row.
                let key = if query.group {
                    entry.key.clone()
                } else {
                    Value::Null
                };
                match rows.last_mut() {
                    Some(last) if collate(&last.key, &key) == Ordering::Equal => {
                        let n = last.value.as_u64().unwrap_or(0);
                        last.value = json!(n + 1);
                    }
                    _ => rows.push(ViewRow {
                        id: None,
                        key,
                        value: json!(1),
                    }),
                }
            }
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
            return Ok(rows);
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matching
            .take(limit)
            .filter_map(|e| {
                let doc = inner.docs.get(&e.id)?;
                Some(ViewRow {
                    id: Some(e.id.clone()),
                    key: e.key.clone(),
                    value: doc.to_json(),
                })
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
