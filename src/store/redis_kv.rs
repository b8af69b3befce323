// src/store/redis_kv.rs
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::BTreeMap;

use super::kv::{IndexOp, KvClient, KvWrite, ScoreRange};
use crate::error::StoreError;

/// Compare the stored revision, then write revision, record and index
/// entries in one step.
///
/// KEYS: revs, hash, one key per index op.
/// ARGV: field, expected rev ('' = absent), new rev, value, then
/// (op, a, b) triples matching the index keys.
static CHECK_AND_SET: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local current = redis.call('HGET', KEYS[1], ARGV[1])
        if (current or '') ~= ARGV[2] then
            return 0
        end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
        redis.call('HSET', KEYS[2], ARGV[1], ARGV[4])
        local k = 3
        for i = 5, #ARGV, 3 do
            local op = ARGV[i]
            if op == 'zadd' then
                redis.call('ZADD', KEYS[k], ARGV[i + 1], ARGV[i + 2])
            elseif op == 'zrem' then
                redis.call('ZREM', KEYS[k], ARGV[i + 2])
            elseif op == 'hset' then
                redis.call('HSET', KEYS[k], ARGV[i + 1], ARGV[i + 2])
            elseif op == 'hdel' then
                redis.call('HDEL', KEYS[k], ARGV[i + 1])
            end
            k = k + 1
        end
        return 1
        "#,
    )
});

/// Redis-backed [`KvClient`] sharing one auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(%url, "redis connected");
        Ok(Self { conn })
    }
}

/// (key, op, a, b) script arguments for one index op.
fn script_args(op: &IndexOp) -> (&str, &'static str, String, String) {
    match op {
        IndexOp::ZAdd { key, score, member } => (key.as_str(), "zadd", score.to_string(), member.clone()),
        IndexOp::ZRem { key, member } => (key.as_str(), "zrem", String::new(), member.clone()),
        IndexOp::HSet { key, field, value } => (key.as_str(), "hset", field.clone(), value.clone()),
        IndexOp::HDel { key, field } => (key.as_str(), "hdel", field.clone(), String::new()),
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hkeys(key).await?)
    }

    async fn zrange_by_score(&self, key: &str, range: ScoreRange) -> Result<Vec<String>, StoreError> {
        let bound = range.bound.map(|b| b.to_string());
        let mut cmd = if range.descending {
            let mut c = redis::cmd("ZREVRANGEBYSCORE");
            c.arg(key).arg(bound.as_deref().unwrap_or("+inf")).arg("-inf");
            c
        } else {
            let mut c = redis::cmd("ZRANGEBYSCORE");
            c.arg(key).arg(bound.as_deref().unwrap_or("-inf")).arg("+inf");
            c
        };
        if let Some(limit) = range.limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let mut conn = self.conn.clone();
        let members: Vec<String> = cmd.query_async(&mut conn).await?;
        Ok(members)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn del(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: usize = conn.del(keys).await?;
        Ok(())
    }

    async fn check_and_set(&self, write: &KvWrite) -> Result<bool, StoreError> {
        let mut invocation = CHECK_AND_SET.prepare_invoke();
        invocation
            .key(&write.revs)
            .key(&write.hash)
            .arg(&write.field)
            .arg(write.expected_rev.as_deref().unwrap_or(""))
            .arg(&write.rev)
            .arg(&write.value);
        for op in &write.index {
            let (key, name, a, b) = script_args(op);
            invocation.key(key).arg(name).arg(a).arg(b);
        }
        let mut conn = self.conn.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_ops_map_to_script_triples() {
        let zadd = IndexOp::ZAdd {
            key: "p-events-by-timestamp".into(),
            score: 42,
            member: "abc".into(),
        };
        let (key, op, a, b) = script_args(&zadd);
        assert_eq!((key, op, a.as_str(), b.as_str()), ("p-events-by-timestamp", "zadd", "42", "abc"));

        let hdel = IndexOp::HDel {
            key: "p-events-by-slug".into(),
            field: "old".into(),
        };
        let (_, op, a, b) = script_args(&hdel);
        assert_eq!((op, a.as_str(), b.as_str()), ("hdel", "old", ""));
    }
}
