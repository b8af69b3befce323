// tests/store_conflicts.rs
//
// Conflict handling of the document store under a competing writer.
// FlakyDb wraps MemoryDocumentDb and, for its first `reject` bulk writes,
// bumps every event to a foreign body before answering "conflict".
//
// Covered:
// - two rejected rounds followed by a clean one succeed
// - three rejected rounds exhaust the retry budget with ConflictExhausted
// - a conflict against an identical stored body counts as applied
// - empty() re-deletes records edited under it and fails on refused deletes

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};

use been::error::StoreError;
use been::model::{EventQuery, EventRecord};
use been::store::document::{BulkResult, View, ViewQuery, ViewRow};
use been::store::{DocumentDb, DocumentStore, EventStore, MemoryDocumentDb, WRITE_ATTEMPTS};

struct FlakyDb {
    inner: MemoryDocumentDb,
    reject: usize,
    rounds: AtomicUsize,
}

impl FlakyDb {
    fn new(reject: usize) -> Self {
        Self {
            inner: MemoryDocumentDb::new(),
            reject,
            rounds: AtomicUsize::new(0),
        }
    }

    fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentDb for FlakyDb {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn bulk_docs(&self, docs: &[Value]) -> Result<Vec<BulkResult>, StoreError> {
        let round = self.rounds.fetch_add(1, Ordering::SeqCst);
        if round >= self.reject {
            return self.inner.bulk_docs(docs).await;
        }
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc["_id"].as_str().unwrap_or_default().to_string();
            // Someone else wins the race with a different body.
            let mut theirs = doc.clone();
            theirs["summary"] = json!(format!("competing write {round}"));
            if let Some(current) = self.inner.get(&id).await? {
                theirs["_rev"] = current["_rev"].clone();
            } else if let Some(obj) = theirs.as_object_mut() {
                obj.remove("_rev");
            }
            self.inner.bulk_docs(&[theirs]).await?;
            out.push(BulkResult::conflict(&id));
        }
        Ok(out)
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(id).await
    }

    async fn view(&self, view: View, query: &ViewQuery) -> Result<Vec<ViewRow>, StoreError> {
        self.inner.view(view, query).await
    }
}

fn batch() -> Vec<EventRecord> {
    ["one", "two"]
        .iter()
        .enumerate()
        .map(|(i, s)| EventRecord {
            source: "feed:x".into(),
            kind: "feed".into(),
            ..EventRecord::new(*s, 100 + i as i64)
        })
        .collect()
}

#[tokio::test]
async fn two_conflicts_then_success() {
    let store = DocumentStore::new(FlakyDb::new(2));
    let written = store.store_events(batch()).await.expect("third attempt wins");
    assert_eq!(written, 2);
    assert_eq!(store.db().rounds(), 3);

    // Our bodies replaced the competing ones.
    let stored = store.events(&EventQuery::all()).await.unwrap();
    let summaries: Vec<&str> = stored.iter().map(|e| e.summary.as_str()).collect();
    assert_eq!(summaries, ["two", "one"]);
}

#[tokio::test]
async fn three_conflicts_exhaust_the_budget() {
    let store = DocumentStore::new(FlakyDb::new(WRITE_ATTEMPTS));
    match store.store_events(batch()).await {
        Err(StoreError::ConflictExhausted { attempts, ids }) => {
            assert_eq!(attempts, WRITE_ATTEMPTS);
            assert_eq!(ids.len(), 2);
        }
        other => panic!("expected ConflictExhausted, got {other:?}"),
    }
    assert_eq!(store.db().rounds(), WRITE_ATTEMPTS);
}

#[tokio::test]
async fn rewriting_identical_content_is_not_a_failure() {
    let store = DocumentStore::new(MemoryDocumentDb::new());
    assert_eq!(store.store_events(batch()).await.unwrap(), 2);
    // Every write now conflicts, but the stored bodies already match.
    for _ in 0..WRITE_ATTEMPTS + 1 {
        assert_eq!(store.store_events(batch()).await.unwrap(), 0);
    }
    assert_eq!(store.db().len(), 2);
}

/// Lets writes through but interferes with deletions: either refuses them,
/// or edits every target once right before the first delete lands.
struct GuardedDb {
    inner: MemoryDocumentDb,
    refuse_deletes: bool,
    race_next_delete: AtomicBool,
}

impl GuardedDb {
    fn new(refuse_deletes: bool, race: bool) -> Self {
        Self {
            inner: MemoryDocumentDb::new(),
            refuse_deletes,
            race_next_delete: AtomicBool::new(race),
        }
    }
}

#[async_trait]
impl DocumentDb for GuardedDb {
    fn backend_name(&self) -> &'static str {
        "guarded"
    }

    async fn bulk_docs(&self, docs: &[Value]) -> Result<Vec<BulkResult>, StoreError> {
        let deleting = docs.iter().any(|d| d["_deleted"] == json!(true));
        if deleting && self.refuse_deletes {
            return Ok(docs
                .iter()
                .map(|d| BulkResult {
                    id: d["_id"].as_str().unwrap_or_default().to_string(),
                    rev: None,
                    error: Some("forbidden".into()),
                    reason: Some("deletes disabled".into()),
                })
                .collect());
        }
        if deleting && self.race_next_delete.swap(false, Ordering::SeqCst) {
            for doc in docs {
                let id = doc["_id"].as_str().unwrap_or_default();
                if let Some(mut current) = self.inner.get(id).await? {
                    current["summary"] = json!("edited meanwhile");
                    self.inner.bulk_docs(&[current]).await?;
                }
            }
        }
        self.inner.bulk_docs(docs).await
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(id).await
    }

    async fn view(&self, view: View, query: &ViewQuery) -> Result<Vec<ViewRow>, StoreError> {
        self.inner.view(view, query).await
    }
}

#[tokio::test]
async fn empty_deletes_records_edited_while_clearing() {
    let store = DocumentStore::new(GuardedDb::new(false, true));
    store.store_events(batch()).await.unwrap();

    store.empty().await.expect("second round deletes the edited revisions");
    assert!(store.events(&EventQuery::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_reports_refused_deletes() {
    let store = DocumentStore::new(GuardedDb::new(true, false));
    store.store_events(batch()).await.unwrap();

    match store.empty().await {
        Err(StoreError::Rejected { reason, .. }) => assert_eq!(reason, "deletes disabled"),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(store.events(&EventQuery::all()).await.unwrap().len(), 2);
}
