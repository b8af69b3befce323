// src/store/memory_kv.rs
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use super::kv::{IndexOp, KvClient, KvWrite, ScoreRange};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn add(&mut self, score: i64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) {
        if let Some(old) = self.scores.remove(member) {
            self.ordered.remove(&(old, member.to_string()));
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    hashes: HashMap<String, BTreeMap<String, String>>,
    zsets: HashMap<String, SortedSet>,
}

impl Inner {
    fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.get(key).and_then(|h| h.get(field)).cloned()
    }

    fn apply(&mut self, op: &IndexOp) {
        match op {
            IndexOp::ZAdd { key, score, member } => {
                self.zsets.entry(key.clone()).or_default().add(*score, member);
            }
            IndexOp::ZRem { key, member } => {
                if let Some(z) = self.zsets.get_mut(key) {
                    z.remove(member);
                }
            }
            IndexOp::HSet { key, field, value } => {
                self.hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
            }
            IndexOp::HDel { key, field } => {
                if let Some(h) = self.hashes.get_mut(key) {
                    h.remove(field);
                }
            }
        }
    }
}

/// In-process [`KvClient`] with Redis hash and sorted-set semantics.
#[derive(Debug, Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().expect("kv mutex poisoned").hget(key, field))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let inner = self.inner.lock().expect("kv mutex poisoned");
        Ok(fields.iter().map(|f| inner.hget(key, f)).collect())
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let inner = self.inner.lock().expect("kv mutex poisoned");
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().expect("kv mutex poisoned");
        Ok(inner
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn zrange_by_score(&self, key: &str, range: ScoreRange) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().expect("kv mutex poisoned");
        let Some(z) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let limit = range.limit.unwrap_or(usize::MAX);
        let members = z.ordered.iter();
        let out = if range.descending {
            members
                .rev()
                .filter(|(score, _)| range.bound.map_or(true, |b| *score <= b))
                .take(limit)
                .map(|(_, m)| m.clone())
                .collect()
        } else {
            members
                .filter(|(score, _)| range.bound.map_or(true, |b| *score >= b))
                .take(limit)
                .map(|(_, m)| m.clone())
                .collect()
        };
        Ok(out)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.inner.lock().expect("kv mutex poisoned");
        Ok(inner.zsets.get(key).map_or(0, |z| z.scores.len()))
    }

    async fn del(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("kv mutex poisoned");
        for key in keys {
            inner.hashes.remove(key);
            inner.zsets.remove(key);
        }
        Ok(())
    }

    async fn check_and_set(&self, write: &KvWrite) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("kv mutex poisoned");
        if inner.hget(&write.revs, &write.field) != write.expected_rev {
            return Ok(false);
        }
        inner.apply(&IndexOp::HSet {
            key: write.revs.clone(),
            field: write.field.clone(),
            value: write.rev.clone(),
        });
        inner.apply(&IndexOp::HSet {
            key: write.hash.clone(),
            field: write.field.clone(),
            value: write.value.clone(),
        });
        for op in &write.index {
            inner.apply(op);
        }
        Ok(true)
    }

    fn backend_name(&self) -> &'static str {
        "memory-kv"
    }
}
