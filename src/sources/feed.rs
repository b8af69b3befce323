// src/sources/feed.rs
//! `feed` kind: an RSS 2.0 or Atom document polled with conditional GET.
//!
//! The cursor holds the response's `ETag` and `Last-Modified` validators. A
//! `304 Not Modified` yields no candidates; validators it carries still
//! refresh the cursor.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use quick_xml::de::from_str;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use super::{normalize_text, single_param, typed_params, FetchStrategy, Normalize, Source, SourceAdapter, SourceContext, SourceKind};
use crate::error::SourceError;
use crate::model::{EventRecord, Since, SourceRecord};

pub const KIND: SourceKind = SourceKind {
    kind: "feed",
    usage: "feed <url>",
    configure,
    build,
};

#[derive(Debug, Deserialize)]
struct FeedParams {
    url: String,
}

fn configure(params: &[String]) -> Result<SourceRecord, SourceError> {
    let url = single_param("feed", "url", params)?;
    reqwest::Url::parse(url).map_err(|e| SourceError::InvalidConfig {
        kind: "feed".into(),
        reason: format!("bad url '{url}': {e}"),
    })?;
    Ok(SourceRecord::new("feed", format!("feed:{url}")).with("url", url))
}

fn build(record: SourceRecord, ctx: &SourceContext) -> Result<Box<dyn SourceAdapter>, SourceError> {
    let params: FeedParams = typed_params(&record)?;
    let poll = FeedPoll {
        client: ctx.http.clone(),
        url: params.url,
    };
    Ok(Box::new(Source::new(record, poll, FeedEntry)))
}

/// Conditional-GET fetch strategy.
pub struct FeedPoll {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl FetchStrategy for FeedPoll {
    async fn fetch(&self, record: &mut SourceRecord) -> Result<Vec<EventRecord>> {
        let mut req = self.client.get(&self.url);
        if let Some(etag) = &record.since.etag {
            req = req.header(IF_NONE_MATCH, etag);
        }
        if let Some(modified) = record.since.modified.and_then(http_date) {
            req = req.header(IF_MODIFIED_SINCE, modified);
        }

        let resp = req.send().await.with_context(|| format!("GET {}", self.url))?;
        let status = resp.status();
        let etag = header_str(&resp, ETAG);
        let modified = header_str(&resp, LAST_MODIFIED).and_then(|v| parse_http_date(&v));

        if status == StatusCode::NOT_MODIFIED {
            tracing::debug!(url = %self.url, "feed not modified");
            if etag.is_some() {
                record.since.etag = etag;
            }
            if modified.is_some() {
                record.since.modified = modified;
            }
            return Ok(Vec::new());
        }

        let body = resp
            .error_for_status()
            .with_context(|| format!("GET {}", self.url))?
            .text()
            .await
            .context("reading feed body")?;
        let entries = parse_feed(&body).with_context(|| format!("parsing feed {}", self.url))?;
        record.since = Since { etag, modified };
        Ok(entries.into_iter().map(FeedItem::into_candidate).collect())
    }
}

fn header_str(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn http_date(epoch: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(epoch, 0).map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

fn parse_http_date(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(s).ok().map(|dt| dt.timestamp())
}

/// RSS dates are RFC 2822, Atom dates RFC 3339.
fn parse_feed_date(s: &str) -> Option<i64> {
    let s = s.trim();
    OffsetDateTime::parse(s, &Rfc2822)
        .map(|dt| dt.unix_timestamp())
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp()))
        .or_else(|| DateTime::parse_from_rfc2822(s).ok().map(|dt| dt.timestamp()))
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    author: Option<String>,
    #[serde(rename = "dc:creator", alias = "creator")]
    creator: Option<String>,
    #[serde(rename = "content:encoded", alias = "encoded")]
    encoded: Option<String>,
    guid: Option<Text>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    id: Option<String>,
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    author: Option<AtomAuthor>,
    content: Option<Text>,
    summary: Option<Text>,
}

/// Element whose text may sit next to attributes (`type="html"` etc).
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    name: Option<String>,
}

/// One feed entry, format-neutral. Serialized into the candidate's `data`
/// so reprocessing can rebuild the event without refetching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub published: Option<String>,
    pub updated: Option<String>,
}

impl FeedItem {
    fn into_candidate(self) -> EventRecord {
        let mut data = Map::new();
        let fields = [
            ("id", self.id),
            ("title", self.title),
            ("link", self.link),
            ("author", self.author),
            ("content", self.content),
            ("summary", self.summary),
            ("published", self.published),
            ("updated", self.updated),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                data.insert(key.into(), Value::String(v));
            }
        }
        EventRecord {
            data: Some(Value::Object(data)),
            ..EventRecord::default()
        }
    }
}

/// Parse an RSS 2.0 or Atom document into entries.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>> {
    let t0 = std::time::Instant::now();
    let clean = scrub_html_entities_for_xml(xml);
    let items = if looks_like_rss(&clean) {
        let rss: Rss = from_str(&clean).context("parsing rss xml")?;
        rss.channel.items.into_iter().map(rss_item).collect()
    } else {
        let feed: AtomFeed = from_str(&clean).context("parsing atom xml")?;
        feed.entries.into_iter().map(atom_entry).collect()
    };
    histogram!("been_feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    Ok(items)
}

fn looks_like_rss(xml: &str) -> bool {
    match (xml.find("<rss"), xml.find("<feed")) {
        (Some(r), Some(f)) => r < f,
        (Some(_), None) => true,
        _ => false,
    }
}

fn rss_item(it: RssItem) -> FeedItem {
    FeedItem {
        id: it.guid.and_then(|g| g.value),
        title: it.title,
        link: it.link,
        author: it.creator.or(it.author),
        content: it.encoded,
        summary: it.description,
        published: it.pub_date,
        updated: None,
    }
}

fn atom_entry(e: AtomEntry) -> FeedItem {
    // rel="alternate" is the default relation.
    let link = e
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
        .or_else(|| e.links.first())
        .and_then(|l| l.href.clone());
    FeedItem {
        id: e.id,
        title: e.title.and_then(|t| t.value),
        link,
        author: e.author.and_then(|a| a.name),
        content: e.content.and_then(|t| t.value),
        summary: e.summary.and_then(|t| t.value),
        published: e.published,
        updated: e.updated,
    }
}

/// Entities valid in HTML but undeclared in XML.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&ldquo;", "&#8220;")
        .replace("&rdquo;", "&#8221;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rsquo;", "&#8217;")
        .replace("&hellip;", "&#8230;")
}

/// Maps the stored entry onto the event fields.
pub struct FeedEntry;

impl Normalize for FeedEntry {
    fn process_event(&self, _record: &SourceRecord, mut raw: EventRecord) -> Option<EventRecord> {
        let timestamp = raw
            .data_str("published")
            .or_else(|| raw.data_str("updated"))
            .and_then(parse_feed_date)?;
        let summary = normalize_text(raw.data_str("title")?);
        if summary.is_empty() {
            return None;
        }
        raw.timestamp = timestamp;
        raw.summary = summary;
        raw.author = raw.data_str("author").map(normalize_text).filter(|a| !a.is_empty());
        raw.event_link = raw.data_str("link").map(|l| l.trim().to_string());
        raw.content = raw
            .data_str("content")
            .or_else(|| raw.data_str("summary"))
            .map(str::to_string);
        Some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(fields: Value) -> EventRecord {
        EventRecord {
            data: Some(fields),
            ..EventRecord::default()
        }
    }

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>t</title>
    <item>
      <title>First &amp; best&nbsp;post</title>
      <link>https://example.org/1</link>
      <pubDate>Tue, 10 Jun 2003 04:00:00 GMT</pubDate>
      <description>&lt;p&gt;hello&lt;/p&gt;</description>
      <dc:creator>ana</dc:creator>
    </item>
    <item>
      <title>No date</title>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>t</title>
  <entry>
    <id>tag:example.org,2003:3.2397</id>
    <title type="text">Atom draft</title>
    <link rel="self" href="https://example.org/self"/>
    <link rel="alternate" href="https://example.org/2003/12/13/atom03"/>
    <updated>2003-12-13T18:30:02Z</updated>
    <author><name>Mark</name></author>
    <content type="html">&lt;b&gt;body&lt;/b&gt;</content>
  </entry>
</feed>"#;

    #[test]
    fn rss_items_become_events() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].author.as_deref(), Some("ana"));

        let rec = SourceRecord::new("feed", "feed:x".into());
        let events: Vec<_> = items
            .into_iter()
            .filter_map(|i| FeedEntry.process_event(&rec, i.into_candidate()))
            .collect();
        // The undated item is discarded, not an error.
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.summary, "First & best post");
        assert_eq!(ev.timestamp, 1_055_217_600);
        assert_eq!(ev.event_link.as_deref(), Some("https://example.org/1"));
        assert_eq!(ev.content.as_deref(), Some("<p>hello</p>"));
    }

    #[test]
    fn atom_entries_use_alternate_link_and_updated() {
        let items = parse_feed(ATOM).unwrap();
        assert_eq!(items.len(), 1);
        let ev = FeedEntry
            .process_event(&SourceRecord::new("feed", "feed:x".into()), items[0].clone().into_candidate())
            .unwrap();
        assert_eq!(ev.summary, "Atom draft");
        assert_eq!(ev.event_link.as_deref(), Some("https://example.org/2003/12/13/atom03"));
        assert_eq!(ev.timestamp, 1_071_340_202);
        assert_eq!(ev.author.as_deref(), Some("Mark"));
        assert_eq!(ev.content.as_deref(), Some("<b>body</b>"));
    }

    #[test]
    fn configure_derives_id_from_url() {
        let a = configure(&["https://example.org/feed".into()]).unwrap();
        let b = configure(&["https://example.org/feed".into()]).unwrap();
        let c = configure(&["https://example.org/other".into()]).unwrap();
        assert_eq!(a.source_id, "feed:https://example.org/feed");
        assert_eq!(a.source_id, b.source_id);
        assert_ne!(a.source_id, c.source_id);
        assert!(configure(&["not a url".into()]).is_err());
        assert!(configure(&[]).is_err());
    }

    #[test]
    fn http_dates_roundtrip_through_the_cursor() {
        let header = http_date(784_111_777).unwrap();
        assert_eq!(header, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&header), Some(784_111_777));
    }

    #[test]
    fn reprocessing_uses_stored_data() {
        let raw = candidate(json!({"title": "again", "published": "2003-12-13T18:30:02Z"}));
        let ev = FeedEntry.process_event(&SourceRecord::new("feed", "feed:x".into()), raw).unwrap();
        assert_eq!(ev.summary, "again");
    }
}
