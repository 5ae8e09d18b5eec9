//! Redis cache store.
//!
//! Uses a `deadpool-redis` pool. Every command runs under the configured
//! timeout so a hung connection surfaces as `StoreError::Timeout` instead of
//! stalling the read path.
//!
//! ## Atomic operations
//!
//! Redis `MULTI`/`EXEC` does not roll back when one queued command fails at
//! runtime (for example `RENAME` of a missing key). [`RedisCacheStore::atomic`]
//! therefore `WATCH`es every key the operation reads, checks that all rename
//! sources exist, and only then queues the transaction. If a watched key
//! changes in between, `EXEC` returns nil and nothing is applied; the check
//! is retried a bounded number of times.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;

use crate::error::{StoreError, StoreResult};
use crate::traits::{AtomicOp, CacheStore};

const SCAN_BATCH: usize = 500;
const ATOMIC_ATTEMPTS: usize = 3;

/// Compare-and-delete: release only if the caller still holds the lease.
const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Compare-and-extend.
const RENEW_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Cache store backed by a Redis server.
#[derive(Clone)]
pub struct RedisCacheStore {
    pool: Pool,
    timeout: Duration,
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore")
            .field("pool", &self.pool.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters for `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

impl RedisCacheStore {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn conn(&self) -> StoreResult<Connection> {
        match tokio::time::timeout(self.timeout, self.pool.get()).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(StoreError::timeout("connect", self.timeout)),
        }
    }

    /// Run a future under the store timeout.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                tracing::debug!(operation, error = %e, "Redis command failed");
                StoreError::from(e)
            }),
            Err(_) => Err(StoreError::timeout(operation, self.timeout)),
        }
    }

    async fn try_atomic(&self, conn: &mut Connection, ops: &[AtomicOp]) -> StoreResult<bool> {
        let watched: BTreeSet<&str> = ops.iter().flat_map(AtomicOp::watched_keys).collect();
        if !watched.is_empty() {
            let mut watch = redis::cmd("WATCH");
            for key in &watched {
                watch.arg(*key);
            }
            let _: () = self.bounded("watch", watch.query_async(&mut *conn)).await?;
        }

        for key in ops.iter().filter_map(AtomicOp::required_key) {
            let exists: bool = self.bounded("exists", conn.exists(key)).await?;
            if !exists {
                let _: () = self
                    .bounded("unwatch", redis::cmd("UNWATCH").query_async(&mut *conn))
                    .await?;
                return Err(StoreError::transaction_aborted(format!("no such key: {key}")));
            }
        }

        for (key, expected) in ops.iter().filter_map(AtomicOp::expected_value) {
            let current: Option<Vec<u8>> = self.bounded("get", conn.get(key)).await?;
            if current.as_deref() != expected {
                let _: () = self
                    .bounded("unwatch", redis::cmd("UNWATCH").query_async(&mut *conn))
                    .await?;
                return Err(StoreError::transaction_aborted(format!(
                    "unexpected value at {key}"
                )));
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                AtomicOp::Rename { from, to } => {
                    pipe.cmd("RENAME").arg(from).arg(to).ignore();
                }
                AtomicOp::UnionInto {
                    destination,
                    source,
                } => {
                    pipe.cmd("SUNIONSTORE")
                        .arg(destination)
                        .arg(destination)
                        .arg(source)
                        .ignore();
                }
                AtomicOp::Expect { .. } => {}
                AtomicOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                AtomicOp::Set { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value.as_slice());
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(millis(*ttl));
                    }
                    cmd.ignore();
                }
                AtomicOp::SetAdd { key, members } if !members.is_empty() => {
                    pipe.cmd("SADD").arg(key).arg(members).ignore();
                }
                AtomicOp::SetRemove { key, members } if !members.is_empty() => {
                    pipe.cmd("SREM").arg(key).arg(members).ignore();
                }
                AtomicOp::SetAdd { .. } | AtomicOp::SetRemove { .. } => {}
            }
        }

        // EXEC replies nil when a watched key changed.
        let committed: Option<()> = self.bounded("exec", pipe.query_async(&mut *conn)).await?;
        Ok(committed.is_some())
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        self.bounded("get", conn.get::<_, Option<Vec<u8>>>(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                self.bounded("set", conn.pset_ex::<_, _, ()>(key, value, millis(ttl)))
                    .await
            }
            None => self.bounded("set", conn.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        self.bounded("del", conn.del::<_, usize>(keys)).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        self.bounded("exists", conn.exists::<_, bool>(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let ms = i64::try_from(millis(ttl)).unwrap_or(i64::MAX);
        self.bounded("pexpire", conn.pexpire::<_, bool>(key, ms)).await
    }

    async fn set_add(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        self.bounded("sadd", conn.sadd::<_, _, usize>(key, members)).await
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        self.bounded("srem", conn.srem::<_, _, usize>(key, members)).await
    }

    async fn set_members(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        let mut conn = self.conn().await?;
        self.bounded("smembers", conn.smembers::<_, BTreeSet<String>>(key))
            .await
    }

    async fn set_union(&self, keys: &[String]) -> StoreResult<BTreeSet<String>> {
        if keys.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut conn = self.conn().await?;
        self.bounded("sunion", conn.sunion::<_, BTreeSet<String>>(keys))
            .await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = glob_escape(prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut scan = redis::cmd("SCAN");
            scan.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) =
                self.bounded("scan", scan.query_async(&mut conn)).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(holder).arg("NX").arg("PX").arg(millis(ttl));
        let reply: Option<String> = self.bounded("lease", cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn renew_lease(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(RENEW_LEASE_SCRIPT);
        let renewed: i64 = self
            .bounded(
                "renew_lease",
                script
                    .key(key)
                    .arg(holder)
                    .arg(millis(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(RELEASE_LEASE_SCRIPT);
        let released: i64 = self
            .bounded(
                "release_lease",
                script.key(key).arg(holder).invoke_async(&mut conn),
            )
            .await?;
        Ok(released == 1)
    }

    async fn lease_holder(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        self.bounded("get", conn.get::<_, Option<String>>(key)).await
    }

    async fn atomic(&self, ops: Vec<AtomicOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        for attempt in 1..=ATOMIC_ATTEMPTS {
            if self.try_atomic(&mut conn, &ops).await? {
                return Ok(());
            }
            tracing::debug!(attempt, "Watched key changed during atomic operation; retrying");
        }
        Err(StoreError::transaction_aborted(format!(
            "watched keys kept changing after {ATOMIC_ATTEMPTS} attempts"
        )))
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = self
            .bounded("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("rowscope:prod:ds"), "rowscope:prod:ds*");
        assert_eq!(glob_escape("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
