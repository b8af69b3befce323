// src/sources/directory.rs
//! `markdown` kind: one event per Markdown file in a directory.
//!
//! A file may start with a metadata header of `Key: value` lines (optionally
//! fenced by `---`), ended by the first blank line:
//!
//! ```text
//! Title: Hello
//! Published: 2024-05-01 09:30:00
//! Slug: hello
//!
//! Body in *Markdown*.
//! ```
//!
//! Events are keyed on the file path, so edits update the stored event in
//! place. Posts published in the future are held back until they are due.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use pulldown_cmark::{html, Options, Parser};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use super::{single_param, slugify, typed_params, FetchStrategy, Normalize, Source, SourceAdapter, SourceContext, SourceKind};
use crate::error::SourceError;
use crate::model::{identity_id, EventRecord, SourceRecord};

pub const KIND: SourceKind = SourceKind {
    kind: "markdown",
    usage: "markdown <directory>",
    configure,
    build,
};

#[derive(Debug, Deserialize)]
struct DirectoryParams {
    path: String,
}

fn configure(params: &[String]) -> Result<SourceRecord, SourceError> {
    let raw = single_param("markdown", "directory", params)?;
    let path = match raw.trim_end_matches('/') {
        "" => "/",
        p => p,
    };
    Ok(SourceRecord::new("markdown", format!("markdown:{path}")).with("path", path))
}

fn build(record: SourceRecord, _ctx: &SourceContext) -> Result<Box<dyn SourceAdapter>, SourceError> {
    let params: DirectoryParams = typed_params(&record)?;
    Ok(Box::new(Source::new(
        record,
        DirectoryScan { path: params.path },
        MarkdownPost,
    )))
}

/// Reads every regular file directly under `path`.
pub struct DirectoryScan {
    path: String,
}

#[async_trait]
impl FetchStrategy for DirectoryScan {
    async fn fetch(&self, _record: &mut SourceRecord) -> Result<Vec<EventRecord>> {
        let mut dir = tokio::fs::read_dir(&self.path)
            .await
            .with_context(|| format!("reading directory {}", self.path))?;
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                files.push((entry.file_name().to_string_lossy().into_owned(), meta));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(files.len());
        for (filename, meta) in files {
            let full_path = format!("{}/{}", self.path, filename);
            let bytes = tokio::fs::read(Path::new(&full_path))
                .await
                .with_context(|| format!("reading {full_path}"))?;
            // Images and other binaries can sit next to the posts.
            let Ok(raw) = String::from_utf8(bytes) else {
                tracing::debug!(path = %full_path, "skipping non-UTF-8 file");
                continue;
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs() as i64);
            out.push(EventRecord {
                timestamp: mtime,
                data: Some(json!({
                    "filename": filename,
                    "full_path": full_path,
                    "raw": raw,
                    "mtime": mtime,
                })),
                ..EventRecord::default()
            });
        }
        Ok(out)
    }
}

static RE_META: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[ ]{0,3}([A-Za-z0-9_-]+):\s*(.*)$").expect("meta regex"));
static RE_META_MORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[ ]{4,}(.*)$").expect("meta regex"));

/// Metadata keys (lowercased) to their values, plus the remaining body.
pub fn split_meta(raw: &str) -> (BTreeMap<String, Vec<String>>, &str) {
    let mut meta: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut last_key: Option<String> = None;
    let mut consumed = 0usize;
    let mut fenced = false;

    for (i, line) in raw.split_inclusive('\n').enumerate() {
        let text = line.trim_end_matches(['\n', '\r']);
        if i == 0 && text.trim() == "---" {
            fenced = true;
            consumed += line.len();
            continue;
        }
        if text.trim().is_empty() || (fenced && matches!(text.trim(), "---" | "...")) {
            consumed += line.len();
            break;
        }
        if let Some(c) = RE_META.captures(text) {
            let key = c[1].to_lowercase();
            meta.entry(key.clone()).or_default().push(c[2].trim().to_string());
            last_key = Some(key);
        } else if let (Some(c), Some(key)) = (RE_META_MORE.captures(text), &last_key) {
            meta.entry(key.clone()).or_default().push(c[1].trim().to_string());
        } else {
            break;
        }
        consumed += line.len();
    }

    if meta.is_empty() && !fenced {
        return (meta, raw);
    }
    (meta, &raw[consumed.min(raw.len())..])
}

pub fn render_markdown(body: &str) -> String {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_TABLES);
    opts.insert(Options::ENABLE_HEADING_ATTRIBUTES);
    let mut out = String::with_capacity(body.len() * 3 / 2);
    html::push_html(&mut out, Parser::new_ext(body, opts));
    out
}

/// `YYYY-MM-DD HH:MM:SS` (or a bare date), read as UTC.
fn parse_published(s: &str) -> Option<i64> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// Renders a file candidate into a post event.
pub struct MarkdownPost;

impl Normalize for MarkdownPost {
    fn process_event(&self, _record: &SourceRecord, mut raw: EventRecord) -> Option<EventRecord> {
        let full_path = raw.data_str("full_path")?.to_string();
        let filename = raw.data_str("filename").unwrap_or(&full_path).to_string();
        let text = raw.data_str("raw")?.to_string();
        let (meta, body) = split_meta(&text);
        let joined = |key: &str, sep: &str| meta.get(key).map(|v| v.join(sep)).filter(|v| !v.is_empty());

        let title = joined("title", " ").unwrap_or(filename);
        if let Some(published) = joined("published", " ") {
            match parse_published(&published) {
                Some(ts) => raw.timestamp = ts,
                None => {
                    tracing::debug!(path = %full_path, %published, "unparseable published date");
                    return None;
                }
            }
        } else if let Some(mtime) = raw.data.as_ref().and_then(|d| d.get("mtime")).and_then(Value::as_i64) {
            raw.timestamp = mtime;
        }
        if raw.timestamp > Utc::now().timestamp() {
            return None;
        }

        raw.id = Some(identity_id(&full_path));
        raw.content = Some(render_markdown(body));
        raw.author = joined("author", " ");
        raw.slug = Some(joined("slug", "-").unwrap_or_else(|| slugify(&title)));
        raw.summary = joined("summary", " ").unwrap_or_else(|| format!("posted {title}"));
        raw.extra.insert("title".into(), Value::String(title));
        let meta_json: Map<String, Value> = meta
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        raw.extra.insert("meta".into(), Value::Object(meta_json));
        Some(raw)
    }
}
