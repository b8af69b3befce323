// src/sources/mod.rs
//! # Sources
//! A source is a [`SourceRecord`] plus the behavior of its kind, composed from
//! two independent capabilities:
//! - a [`FetchStrategy`] that retrieves raw candidates and advances the cursor
//!   (feed poll, directory scan, queue drain);
//! - a [`Normalize`] hook that turns one raw candidate into an event or drops it.
//!
//! [`SourceRegistry`] maps kind strings to factories. It is an ordinary value
//! built at startup and handed to the aggregator.

pub mod directory;
pub mod feed;
pub mod publish;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::FeedConfig;
use crate::error::SourceError;
use crate::model::{EventRecord, SourceRecord};

/// Retrieval half of an adapter.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Pull raw candidates. May update `record.since` and `record.config`;
    /// the caller only keeps those changes if this returns `Ok`.
    async fn fetch(&self, record: &mut SourceRecord) -> Result<Vec<EventRecord>>;
}

/// Normalization half of an adapter.
pub trait Normalize: Send + Sync {
    /// `None` discards the candidate (malformed or not yet due).
    fn process_event(&self, record: &SourceRecord, raw: EventRecord) -> Option<EventRecord>;
}

/// A configured source the aggregator can drive.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn record(&self) -> &SourceRecord;

    fn record_mut(&mut self) -> &mut SourceRecord;

    fn source_id(&self) -> &str {
        &self.record().source_id
    }

    fn kind(&self) -> &str {
        &self.record().kind
    }

    /// Fetch and normalize. On error the record, cursor included, is left
    /// exactly as it was.
    async fn fetch(&mut self) -> Result<Vec<EventRecord>>;

    fn process_event(&self, raw: EventRecord) -> Option<EventRecord>;
}

/// An adapter composed from a fetch strategy and a normalization hook.
pub struct Source<F, N> {
    record: SourceRecord,
    fetcher: F,
    normalizer: N,
}

impl<F: FetchStrategy, N: Normalize> Source<F, N> {
    pub fn new(record: SourceRecord, fetcher: F, normalizer: N) -> Self {
        Self {
            record,
            fetcher,
            normalizer,
        }
    }
}

#[async_trait]
impl<F: FetchStrategy, N: Normalize> SourceAdapter for Source<F, N> {
    fn record(&self) -> &SourceRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut SourceRecord {
        &mut self.record
    }

    async fn fetch(&mut self) -> Result<Vec<EventRecord>> {
        let mut working = self.record.clone();
        let raw = self.fetcher.fetch(&mut working).await?;
        let fetched = raw.len();
        let events: Vec<EventRecord> = raw
            .into_iter()
            .filter_map(|candidate| self.normalizer.process_event(&working, candidate))
            .collect();
        if events.len() < fetched {
            tracing::debug!(
                source = %working.source_id,
                discarded = fetched - events.len(),
                "candidates discarded during normalization"
            );
        }
        self.record = working;
        Ok(events)
    }

    fn process_event(&self, raw: EventRecord) -> Option<EventRecord> {
        self.normalizer.process_event(&self.record, raw)
    }
}

/// Shared resources handed to adapter factories.
#[derive(Clone)]
pub struct SourceContext {
    pub http: reqwest::Client,
}

impl SourceContext {
    pub fn new(feed: &FeedConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(feed.user_agent.clone())
            .timeout(Duration::from_secs(feed.timeout_secs))
            .build()?;
        Ok(Self { http })
    }
}

/// Validates user parameters into a fresh record. No I/O.
pub type ConfigureFn = fn(&[String]) -> Result<SourceRecord, SourceError>;

/// Builds the adapter for a stored or freshly configured record.
pub type BuildFn = fn(SourceRecord, &SourceContext) -> Result<Box<dyn SourceAdapter>, SourceError>;

#[derive(Clone, Copy)]
pub struct SourceKind {
    pub kind: &'static str,
    /// One-line usage shown by the CLI.
    pub usage: &'static str,
    pub configure: ConfigureFn,
    pub build: BuildFn,
}

/// Kind string -> factory.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    kinds: BTreeMap<&'static str, SourceKind>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(feed::KIND);
        reg.register(directory::KIND);
        reg.register(publish::KIND);
        reg
    }

    pub fn register(&mut self, kind: SourceKind) {
        self.kinds.insert(kind.kind, kind);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &SourceKind> {
        self.kinds.values()
    }

    fn lookup(&self, kind: &str) -> Result<&SourceKind, SourceError> {
        self.kinds
            .get(kind)
            .ok_or_else(|| SourceError::UnknownKind(kind.to_string()))
    }

    pub fn configure(&self, kind: &str, params: &[String]) -> Result<SourceRecord, SourceError> {
        let record = (self.lookup(kind)?.configure)(params)?;
        debug_assert_eq!(record.kind, kind);
        Ok(record)
    }

    pub fn build(
        &self,
        record: SourceRecord,
        ctx: &SourceContext,
    ) -> Result<Box<dyn SourceAdapter>, SourceError> {
        let entry = self.lookup(&record.kind)?;
        (entry.build)(record, ctx)
    }
}

/// Parse a record's config into a kind's typed parameters.
pub(crate) fn typed_params<T: serde::de::DeserializeOwned>(
    record: &SourceRecord,
) -> Result<T, SourceError> {
    serde_json::from_value(serde_json::Value::Object(record.config.clone())).map_err(|e| {
        SourceError::InvalidConfig {
            kind: record.kind.clone(),
            reason: e.to_string(),
        }
    })
}

/// First positional parameter, required and non-blank.
pub(crate) fn single_param<'a>(
    kind: &str,
    what: &str,
    params: &'a [String],
) -> Result<&'a str, SourceError> {
    match params {
        [one] if !one.trim().is_empty() => Ok(one.trim()),
        [] => Err(SourceError::InvalidConfig {
            kind: kind.to_string(),
            reason: format!("missing {what}"),
        }),
        _ => Err(SourceError::InvalidConfig {
            kind: kind.to_string(),
            reason: format!("expected exactly one {what}, got {}", params.len()),
        }),
    }
}

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static RE_SLUG_STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").expect("slug regex"));
static RE_SLUG_JOIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-\s]+").expect("slug regex"));

/// Plain one-line text: entities decoded, tags stripped, whitespace collapsed.
pub fn normalize_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let stripped = RE_TAGS.replace_all(&decoded, "");
    let out = stripped
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    RE_WS.replace_all(&out, " ").trim().to_string()
}

/// URL-safe slug: ASCII word characters joined by single hyphens.
pub fn slugify(s: &str) -> String {
    let ascii: String = s.chars().filter(char::is_ascii).collect();
    let cleaned = RE_SLUG_STRIP.replace_all(&ascii, "");
    let lowered = cleaned.trim().to_lowercase();
    RE_SLUG_JOIN.replace_all(&lowered, "-").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn normalize_text_decodes_and_collapses() {
        assert_eq!(
            normalize_text("  <b>Hello</b>,&nbsp;&nbsp; \u{201C}world\u{201D}\n "),
            "Hello, \"world\""
        );
    }

    #[test]
    fn slugify_matches_common_titles() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  Rust -- and  Café  "), "rust-and-caf");
        assert_eq!(slugify("already-a-slug"), "already-a-slug");
    }

    struct Flaky {
        fail: AtomicBool,
    }

    #[async_trait]
    impl FetchStrategy for Flaky {
        async fn fetch(&self, record: &mut SourceRecord) -> Result<Vec<EventRecord>> {
            record.since.etag = Some("fresh".into());
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("upstream unavailable");
            }
            Ok(vec![EventRecord::new("keep", 2), EventRecord::new("", 1)])
        }
    }

    struct DropEmpty;

    impl Normalize for DropEmpty {
        fn process_event(&self, _: &SourceRecord, raw: EventRecord) -> Option<EventRecord> {
            (!raw.summary.is_empty()).then_some(raw)
        }
    }

    #[tokio::test]
    async fn cursor_is_committed_only_on_success() {
        let record = SourceRecord::new("test", "test:x".into());
        let mut source = Source::new(
            record,
            Flaky {
                fail: AtomicBool::new(true),
            },
            DropEmpty,
        );

        assert!(source.fetch().await.is_err());
        assert!(source.record().since.is_empty());

        source.fetcher.fail.store(false, Ordering::SeqCst);
        let events = source.fetch().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(source.record().since.etag.as_deref(), Some("fresh"));
    }

    #[test]
    fn registry_rejects_unknown_kinds() {
        let reg = SourceRegistry::builtin();
        assert!(matches!(
            reg.configure("gopher", &[]),
            Err(SourceError::UnknownKind(k)) if k == "gopher"
        ));
        let kinds: Vec<_> = reg.kinds().map(|k| k.kind).collect();
        assert_eq!(kinds, ["feed", "markdown", "publish"]);
    }
}
