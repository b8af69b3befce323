// src/store/couch.rs
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use super::document::{design_document, BulkResult, DocumentDb, View, ViewQuery, ViewRow, DESIGN_DOC_ID};
use crate::config::CouchConfig;
use crate::error::StoreError;

#[derive(Debug, Deserialize)]
struct ViewResponse {
    rows: Vec<ViewRow>,
}

/// CouchDB database reached over its HTTP API.
pub struct CouchDb {
    client: reqwest::Client,
    base: Url,
    db_name: String,
}

impl CouchDb {
    /// Open `config.db_name`, creating it and (re)installing the design
    /// document when needed.
    pub async fn connect(config: &CouchConfig) -> Result<Self, StoreError> {
        let base = Url::parse(&config.url)
            .map_err(|e| StoreError::Backend(format!("invalid couchdb url '{}': {e}", config.url)))?;
        let db = Self {
            client: reqwest::Client::new(),
            base,
            db_name: config.db_name.clone(),
        };
        db.ensure_database().await?;
        db.ensure_design_document().await?;
        tracing::info!(url = %config.url, db = %config.db_name, "couchdb connected");
        Ok(db)
    }

    /// `<base>/<db>/<segments...>` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::Backend("couchdb url cannot be a base".into()))?;
            path.pop_if_empty().push(&self.db_name);
            for s in segments {
                path.push(s);
            }
        }
        Ok(url)
    }

    async fn ensure_database(&self) -> Result<(), StoreError> {
        let resp = self.client.put(self.url(&[])?).send().await?;
        match resp.status() {
            s if s.is_success() => {
                tracing::info!(db = %self.db_name, "created couchdb database");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => Ok(()),
            s => Err(StoreError::Backend(format!(
                "creating database '{}' failed with {s}",
                self.db_name
            ))),
        }
    }

    async fn ensure_design_document(&self) -> Result<(), StoreError> {
        let mut wanted = design_document();
        if let Some(current) = self.get(DESIGN_DOC_ID).await? {
            if current.get("views") == wanted.get("views") {
                return Ok(());
            }
            wanted["_rev"] = current.get("_rev").cloned().unwrap_or(Value::Null);
        }
        let (design, name) = DESIGN_DOC_ID.split_once('/').unwrap_or(("_design", "activity"));
        let resp = self
            .client
            .put(self.url(&[design, name])?)
            .json(&wanted)
            .send()
            .await?;
        resp.error_for_status()?;
        tracing::info!(doc = DESIGN_DOC_ID, "installed couchdb views");
        Ok(())
    }
}

fn view_params(query: &ViewQuery, reduce_view: bool) -> Vec<(&'static str, String)> {
    let mut params = vec![("descending", query.descending.to_string())];
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    if let Some(start) = &query.start_key {
        params.push(("startkey", start.to_string()));
    }
    if let Some(end) = &query.end_key {
        params.push(("endkey", end.to_string()));
    }
    if reduce_view {
        params.push(("group", query.group.to_string()));
    }
    params
}

#[async_trait]
impl DocumentDb for CouchDb {
    async fn bulk_docs(&self, docs: &[Value]) -> Result<Vec<BulkResult>, StoreError> {
        let resp = self
            .client
            .post(self.url(&["_bulk_docs"])?)
            .json(&json!({ "docs": docs }))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        let resp = self.client.get(self.url(&[id])?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }

    async fn view(&self, view: View, query: &ViewQuery) -> Result<Vec<ViewRow>, StoreError> {
        let (_, design) = DESIGN_DOC_ID.split_once('/').unwrap_or(("_design", "activity"));
        let url = self.url(&["_design", design, "_view", view.name()])?;
        let t0 = std::time::Instant::now();
        let resp: ViewResponse = self
            .client
            .get(url)
            .query(&view_params(query, view.is_reduce()))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!(
            view = view.name(),
            rows = resp.rows.len(),
            ms = t0.elapsed().as_millis() as u64,
            "couchdb view"
        );
        Ok(resp.rows)
    }

    fn backend_name(&self) -> &'static str {
        "couch"
    }
}
