// src/aggregator.rs
//! # Aggregator
//! Holds the configured sources and drives fetch -> store cycles.
//!
//! Each source is updated independently: a failed fetch or store for one
//! source is logged and reported but never stops the others, and that
//! source's cursor stays where it was so the next cycle retries.

use anyhow::{anyhow, Context, Result};
use metrics::{counter, gauge, histogram};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use strsim::normalized_levenshtein;

use crate::collapse::DisplayItem;
use crate::error::SourceError;
use crate::metrics::ensure_metrics_described;
use crate::model::{CollapsePolicy, EventQuery, EventRecord, Since, SourceRecord};
use crate::sources::{publish, SourceAdapter, SourceContext, SourceRegistry};
use crate::store::EventStore;

/// Minimum similarity for a "did you mean" hint.
const SUGGESTION_THRESHOLD: f64 = 0.5;

/// Outcome of one update cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Records written per source that updated successfully.
    pub stored: BTreeMap<String, usize>,
    /// Error text per source that failed.
    pub failed: BTreeMap<String, String>,
}

impl UpdateReport {
    pub fn total(&self) -> usize {
        self.stored.values().sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// `feed:x(+2), publish:y(+0)`
    pub fn summary(&self) -> String {
        self.stored
            .iter()
            .map(|(id, n)| format!("{id}(+{n})"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct Aggregator {
    store: Arc<dyn EventStore>,
    registry: SourceRegistry,
    ctx: SourceContext,
    sources: BTreeMap<String, Box<dyn SourceAdapter>>,
}

impl Aggregator {
    /// Build adapters for every stored source. A stored kind missing from
    /// `registry` is an error.
    pub async fn load(
        store: Arc<dyn EventStore>,
        registry: SourceRegistry,
        ctx: SourceContext,
    ) -> Result<Self> {
        ensure_metrics_described();
        let mut sources = BTreeMap::new();
        for (id, record) in store.get_sources().await.context("loading sources")? {
            let adapter = registry
                .build(record, &ctx)
                .with_context(|| format!("restoring source '{id}'"))?;
            sources.insert(id, adapter);
        }
        tracing::debug!(sources = sources.len(), backend = store.name(), "aggregator loaded");
        Ok(Self {
            store,
            registry,
            ctx,
            sources,
        })
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceRecord> {
        self.sources.values().map(|a| a.record())
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceRecord> {
        self.sources.get(source_id).map(|a| a.record())
    }

    /// Configure a new source of `kind` from positional parameters, persist
    /// it and return its id.
    pub async fn add(&mut self, kind: &str, params: &[String]) -> Result<String> {
        let record = self.registry.configure(kind, params)?;
        let id = record.source_id.clone();
        if self.sources.contains_key(&id) {
            return Err(SourceError::Duplicate(id).into());
        }
        let adapter = self.registry.build(record, &self.ctx)?;
        self.store
            .store_source(adapter.record())
            .await
            .with_context(|| format!("storing source '{id}'"))?;
        tracing::info!(source = %id, kind, "source added");
        self.sources.insert(id.clone(), adapter);
        Ok(id)
    }

    /// Update `only` the given sources, or all of them.
    pub async fn update(&mut self, only: Option<&[String]>) -> UpdateReport {
        let ids: Vec<String> = match only {
            Some(ids) => ids.to_vec(),
            None => self.sources.keys().cloned().collect(),
        };

        let mut report = UpdateReport::default();
        for id in ids {
            match self.update_source(&id).await {
                Ok(n) => {
                    report.stored.insert(id, n);
                }
                Err(e) => {
                    tracing::warn!(target: "been", source = %id, error = %format!("{e:#}"), "source update failed");
                    report.failed.insert(id, format!("{e:#}"));
                }
            }
        }

        counter!("been_update_runs_total").increment(1);
        gauge!("been_last_update_ts").set(chrono::Utc::now().timestamp() as f64);
        tracing::info!(
            target: "been",
            stored = report.total(),
            ok = report.stored.len(),
            failed = report.failed.len(),
            "update cycle finished"
        );
        report
    }

    /// One fetch -> store step. The in-memory record (cursor included) is
    /// rolled back if storing fails.
    pub async fn update_source(&mut self, source_id: &str) -> Result<usize> {
        let adapter = self
            .sources
            .get_mut(source_id)
            .ok_or_else(|| anyhow!("unknown source '{source_id}'"))?;
        let previous = adapter.record().clone();

        let t0 = Instant::now();
        let fetched = adapter.fetch().await;
        histogram!("been_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        let events = match fetched {
            Ok(events) => events,
            Err(e) => {
                counter!("been_fetch_errors_total").increment(1);
                return Err(e.context(format!("fetching '{source_id}'")));
            }
        };

        let fetched = events.len();
        match self.store.store_update(adapter.record(), events).await {
            Ok(stored) => {
                counter!("been_events_stored_total").increment(stored as u64);
                tracing::debug!(target: "been", source = %source_id, fetched, stored, "source updated");
                Ok(stored)
            }
            Err(e) => {
                *adapter.record_mut() = previous;
                Err(anyhow::Error::new(e).context(format!("storing update for '{source_id}'")))
            }
        }
    }

    /// Re-run normalization over every stored event using its raw `data`.
    /// Events whose source is gone, or that normalization now rejects, are
    /// left as stored. Returns the number of records rewritten.
    pub async fn reprocess(&self) -> Result<usize> {
        let events = self.store.events(&EventQuery::all()).await?;
        let total = events.len();
        let processed: Vec<EventRecord> = events
            .into_iter()
            .filter_map(|event| {
                let adapter = self.sources.get(&event.source)?;
                let (id, source, kind) = (event.id.clone(), event.source.clone(), event.kind.clone());
                let mut out = adapter.process_event(event)?;
                // Identity and ownership survive reprocessing.
                out.id = id;
                out.source = source;
                out.kind = kind;
                Some(out)
            })
            .collect();
        let skipped = total - processed.len();
        let written = self.store.store_events(processed).await?;
        tracing::info!(total, skipped, written, "reprocess finished");
        Ok(written)
    }

    /// Delete all events and reset every cursor, stored and in memory.
    pub async fn empty(&mut self) -> Result<()> {
        self.store.empty().await?;
        for adapter in self.sources.values_mut() {
            adapter.record_mut().since = Since::default();
        }
        Ok(())
    }

    /// Current value of `key` on a source.
    pub fn config_value(&self, source_id: &str, key: &str) -> Result<Option<Value>> {
        let record = self
            .source(source_id)
            .ok_or_else(|| anyhow!("unknown source '{source_id}'"))?;
        Ok(record.get(key))
    }

    /// Set `key` on a source. `raw` is parsed as JSON, falling back to a
    /// plain string; `null` removes a config key. The adapter is rebuilt so
    /// changed parameters take effect.
    pub async fn configure(&mut self, source_id: &str, key: &str, raw: &str) -> Result<Value> {
        if matches!(key, "kind" | "source_id" | "_id" | "type") {
            return Err(SourceError::Immutable(key.to_string()).into());
        }
        let value = parse_value(raw);
        let mut record = self
            .source(source_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown source '{source_id}'"))?;

        match key {
            "since" => {
                record.since = if value.is_null() {
                    Since::default()
                } else {
                    serde_json::from_value(value.clone()).context("since must be {etag, modified}")?
                };
            }
            "collapse" => {
                record.collapse = if value.is_null() {
                    None
                } else {
                    Some(
                        serde_json::from_value::<CollapsePolicy>(value.clone())
                            .context("collapse must be a boolean or {interval}")?,
                    )
                };
            }
            _ if value.is_null() => {
                record.config.remove(key);
            }
            _ => {
                record.config.insert(key.to_string(), value.clone());
            }
        }

        let adapter = self.registry.build(record, &self.ctx)?;
        self.store
            .store_source(adapter.record())
            .await
            .with_context(|| format!("storing source '{source_id}'"))?;
        tracing::info!(source = %source_id, key, "source reconfigured");
        self.sources.insert(source_id.to_string(), adapter);
        Ok(value)
    }

    /// Queue an entry on `publish:<name>` and update that source right away.
    pub async fn publish(&mut self, name: &str, fields: Map<String, Value>) -> Result<usize> {
        let source_id = self.resolve(&format!("publish:{name}"))?;
        let adapter = self
            .sources
            .get_mut(&source_id)
            .ok_or_else(|| anyhow!("unknown source '{source_id}'"))?;
        publish::enqueue(adapter.record_mut(), fields)?;
        let stored = self.update_source(&source_id).await?;
        tracing::info!(source = %source_id, stored, "published");
        Ok(stored)
    }

    /// Resolve a source id or an unambiguous prefix of one.
    pub fn resolve(&self, key: &str) -> Result<String, SourceError> {
        resolve_key(key, self.sources.keys())
    }

    pub async fn events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        Ok(self.store.events(query).await?)
    }

    pub async fn collapsed_events(&self, query: &EventQuery) -> Result<Vec<DisplayItem>> {
        Ok(self.store.collapsed_events(query).await?)
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Exact match, else the single id starting with `key`.
pub fn resolve_key<'a, I>(key: &str, ids: I) -> Result<String, SourceError>
where
    I: IntoIterator<Item = &'a String>,
{
    let ids: Vec<&String> = ids.into_iter().collect();
    if let Some(exact) = ids.iter().find(|id| id.as_str() == key) {
        return Ok((*exact).clone());
    }
    let mut matches: Vec<String> = ids
        .iter()
        .filter(|id| id.starts_with(key))
        .map(|id| (*id).clone())
        .collect();
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => {
            let suggestion = ids
                .iter()
                .map(|id| (normalized_levenshtein(key, id), *id))
                .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
                .max_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, id)| id.clone());
            Err(SourceError::NoMatch {
                key: key.to_string(),
                suggestion,
            })
        }
        _ => {
            matches.sort();
            Err(SourceError::Ambiguous {
                key: key.to_string(),
                candidates: matches,
            })
        }
    }
}
