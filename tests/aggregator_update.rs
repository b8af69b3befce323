// tests/aggregator_update.rs
//
// Update cycles through the Aggregator with an in-memory store and a
// test-only `scripted` source kind whose fetch results are set per source id.
//
// Covered:
// - cursor advances and is persisted only on a successful fetch
// - one failing source does not stop the others
// - source ids are deterministic; duplicates are refused
// - publish -> update -> stored event, queue drained
// - configure: immutable keys, collapse/since parsing, null removal
// - reprocess keeps ids; empty resets stored and in-memory cursors
// - load fails on a stored kind the registry does not know

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

use been::aggregator::Aggregator;
use been::config::FeedConfig;
use been::error::SourceError;
use been::model::{CollapsePolicy, EventQuery, EventRecord, Since, SourceRecord};
use been::sources::{
    FetchStrategy, Normalize, Source, SourceAdapter, SourceContext, SourceKind, SourceRegistry,
};
use been::store::{DocumentStore, EventStore, MemoryDocumentDb};

/// What the next fetch of a scripted source returns.
#[derive(Clone, Default)]
struct Step {
    fail: bool,
    etag: Option<String>,
    summaries: Vec<(String, i64)>,
}

static SCRIPTS: Lazy<Mutex<HashMap<String, Step>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn script(source_id: &str, step: Step) {
    SCRIPTS.lock().expect("scripts poisoned").insert(source_id.to_string(), step);
}

struct Scripted;

#[async_trait]
impl FetchStrategy for Scripted {
    async fn fetch(&self, record: &mut SourceRecord) -> Result<Vec<EventRecord>> {
        let step = SCRIPTS
            .lock()
            .expect("scripts poisoned")
            .get(&record.source_id)
            .cloned()
            .unwrap_or_default();
        // Move the cursor before failing; the adapter must discard it.
        record.since.etag = step.etag.clone();
        if step.fail {
            bail!("upstream unavailable");
        }
        Ok(step
            .summaries
            .into_iter()
            .map(|(s, ts)| EventRecord {
                data: Some(json!({ "title": s, "ts": ts })),
                ..EventRecord::new(s, ts)
            })
            .collect())
    }
}

/// Upper-cases the raw title so reprocessing has something to change.
struct Shout;

impl Normalize for Shout {
    fn process_event(&self, record: &SourceRecord, raw: EventRecord) -> Option<EventRecord> {
        let title = raw.data_str("title")?.to_string();
        let summary = if record.config.get("shout") == Some(&Value::Bool(true)) {
            title.to_uppercase()
        } else {
            title
        };
        Some(EventRecord { summary, ..raw })
    }
}

fn configure(params: &[String]) -> Result<SourceRecord, SourceError> {
    match params {
        [name] => Ok(SourceRecord::new("scripted", format!("scripted:{name}")).with("name", name.as_str())),
        _ => Err(SourceError::InvalidConfig {
            kind: "scripted".into(),
            reason: "expected a name".into(),
        }),
    }
}

fn build(record: SourceRecord, _ctx: &SourceContext) -> Result<Box<dyn SourceAdapter>, SourceError> {
    Ok(Box::new(Source::new(record, Scripted, Shout)))
}

const SCRIPTED: SourceKind = SourceKind {
    kind: "scripted",
    usage: "scripted <name>",
    configure,
    build,
};

fn registry() -> SourceRegistry {
    let mut reg = SourceRegistry::builtin();
    reg.register(SCRIPTED);
    reg
}

fn ctx() -> SourceContext {
    SourceContext::new(&FeedConfig::default()).expect("http client")
}

async fn aggregator() -> (Arc<dyn EventStore>, Aggregator) {
    let store: Arc<dyn EventStore> = Arc::new(DocumentStore::new(MemoryDocumentDb::new()));
    let agg = Aggregator::load(store.clone(), registry(), ctx()).await.expect("load");
    (store, agg)
}

fn args(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn step(etag: &str, summaries: &[(&str, i64)]) -> Step {
    Step {
        fail: false,
        etag: Some(etag.to_string()),
        summaries: summaries.iter().map(|(s, t)| (s.to_string(), *t)).collect(),
    }
}

#[tokio::test]
async fn failed_fetch_leaves_the_cursor_alone() {
    let (store, mut agg) = aggregator().await;
    let id = agg.add("scripted", &args(&["cursor"])).await.unwrap();

    script(&id, step("\"v1\"", &[("first", 10)]));
    let report = agg.update(None).await;
    assert!(report.is_success());
    assert_eq!(report.stored[&id], 1);
    assert_eq!(store.get_sources().await.unwrap()[&id].since.etag.as_deref(), Some("\"v1\""));

    script(
        &id,
        Step {
            fail: true,
            etag: Some("\"v2\"".into()),
            summaries: Vec::new(),
        },
    );
    let report = agg.update(None).await;
    assert!(!report.is_success());
    assert!(report.failed[&id].contains("upstream unavailable"));
    assert_eq!(agg.source(&id).unwrap().since.etag.as_deref(), Some("\"v1\""));
    assert_eq!(store.get_sources().await.unwrap()[&id].since.etag.as_deref(), Some("\"v1\""));
    assert_eq!(store.events(&EventQuery::all()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn one_failing_source_does_not_block_the_rest() {
    let (store, mut agg) = aggregator().await;
    let bad = agg.add("scripted", &args(&["iso-bad"])).await.unwrap();
    let good = agg.add("scripted", &args(&["iso-good"])).await.unwrap();
    script(
        &bad,
        Step {
            fail: true,
            ..Step::default()
        },
    );
    script(&good, step("g", &[("a", 1), ("b", 2)]));

    let report = agg.update(None).await;
    assert_eq!(report.stored.get(&good), Some(&2));
    assert!(report.failed.contains_key(&bad));
    assert_eq!(report.summary(), format!("{good}(+2)"));

    let counts = store.events_by_source_count().await.unwrap();
    assert_eq!(counts.get(&good), Some(&2));
    assert_eq!(counts.get(&bad), None);

    // Re-running with unchanged upstream content stores nothing new.
    let again = agg.update(Some(&[good.clone()])).await;
    assert_eq!(again.total(), 0);
    assert!(again.is_success());
}

#[tokio::test]
async fn source_ids_are_deterministic() {
    let reg = registry();
    let a = reg.configure("scripted", &args(&["same"])).unwrap();
    let b = reg.configure("scripted", &args(&["same"])).unwrap();
    assert_eq!(a.source_id, b.source_id);
    assert_eq!(
        reg.configure("feed", &args(&["https://example.org/rss"])).unwrap().source_id,
        "feed:https://example.org/rss"
    );
    assert!(matches!(
        reg.configure("nope", &[]),
        Err(SourceError::UnknownKind(k)) if k == "nope"
    ));

    let (_store, mut agg) = aggregator().await;
    agg.add("scripted", &args(&["dup"])).await.unwrap();
    let err = agg.add("scripted", &args(&["dup"])).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SourceError>(),
        Some(SourceError::Duplicate(id)) if id == "scripted:dup"
    ));
}

#[tokio::test]
async fn publish_stores_the_entry_and_drains_the_queue() {
    let (store, mut agg) = aggregator().await;
    let id = agg.add("publish", &args(&["notes"])).await.unwrap();
    assert_eq!(id, "publish:notes");

    let mut fields = Map::new();
    fields.insert("summary".into(), json!("shipped the thing"));
    fields.insert("timestamp".into(), json!(1_600_000_000));
    assert_eq!(agg.publish("notes", fields).await.unwrap(), 1);

    let events = store.events(&EventQuery::default().source(&id)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].summary, "shipped the thing");
    assert_eq!(events[0].timestamp, 1_600_000_000);
    assert_eq!(events[0].kind, "publish");

    let stored = store.get_sources().await.unwrap();
    assert_eq!(been::sources::publish::pending(&stored[&id]), 0);

    assert!(agg.publish("missing", Map::new()).await.is_err());
}

#[tokio::test]
async fn configure_rules() {
    let (store, mut agg) = aggregator().await;
    let id = agg.add("scripted", &args(&["conf"])).await.unwrap();

    for key in ["kind", "source_id", "_id"] {
        let err = agg.configure(&id, key, "\"x\"").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<SourceError>(), Some(SourceError::Immutable(_))));
    }

    agg.configure(&id, "collapse", r#"{"interval": 600}"#).await.unwrap();
    agg.configure(&id, "syndicate", "true").await.unwrap();
    agg.configure(&id, "note", "plain words").await.unwrap();
    let stored = store.get_sources().await.unwrap()[&id].clone();
    assert_eq!(stored.collapse, Some(CollapsePolicy::Window { interval: Some(600) }));
    assert_eq!(stored.config["syndicate"], Value::Bool(true));
    assert_eq!(stored.param("note"), Some("plain words"));

    agg.configure(&id, "since", r#"{"etag": "\"abc\""}"#).await.unwrap();
    assert_eq!(agg.config_value(&id, "since").unwrap(), Some(json!({"etag": "\"abc\""})));

    agg.configure(&id, "note", "null").await.unwrap();
    assert_eq!(agg.config_value(&id, "note").unwrap(), None);
    assert!(agg.configure(&id, "collapse", "\"sometimes\"").await.is_err());
}

#[tokio::test]
async fn reprocess_rewrites_in_place_and_empty_resets_cursors() {
    let (store, mut agg) = aggregator().await;
    let id = agg.add("scripted", &args(&["reproc"])).await.unwrap();
    script(&id, step("r1", &[("quiet", 5)]));
    agg.update(None).await;

    let before = store.events(&EventQuery::all()).await.unwrap();
    agg.configure(&id, "shout", "true").await.unwrap();
    assert_eq!(agg.reprocess().await.unwrap(), 1);

    let after = store.events(&EventQuery::all()).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].summary, "QUIET");
    assert_eq!(after[0].id, before[0].id, "identity survives reprocessing");
    assert_eq!(after[0].source, id);

    agg.empty().await.unwrap();
    assert!(store.events(&EventQuery::all()).await.unwrap().is_empty());
    assert_eq!(agg.source(&id).unwrap().since, Since::default());
    assert!(store.get_sources().await.unwrap()[&id].since.is_empty());
}

#[tokio::test]
async fn load_restores_sources_and_rejects_unknown_kinds() {
    let store: Arc<dyn EventStore> = Arc::new(DocumentStore::new(MemoryDocumentDb::new()));
    store
        .store_source(&SourceRecord::new("scripted", "scripted:kept".into()))
        .await
        .unwrap();

    let agg = Aggregator::load(store.clone(), registry(), ctx()).await.unwrap();
    assert_eq!(agg.sources().count(), 1);
    assert_eq!(agg.resolve("scripted").unwrap(), "scripted:kept");

    let err = Aggregator::load(store, SourceRegistry::builtin(), ctx()).await.err().expect("unknown kind");
    assert!(format!("{err:#}").contains("unknown source kind 'scripted'"));
}
