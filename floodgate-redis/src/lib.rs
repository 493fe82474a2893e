//! Redis counter store for `floodgate` (companion crate).
//! Bring your own `redis::aio::ConnectionManager`; every instance pointed at the same Redis
//! shares one set of limits.

use async_trait::async_trait;
use floodgate::store::{CounterStore, HashFields};
use floodgate::StoreError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};

/// Replaces a hash only if it still holds exactly the expected fields.
///
/// `ARGV`: ttl, expected pair count, expected pairs, new pairs. Returns 1 on swap, 0 otherwise.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('HGETALL', KEYS[1])
local n = tonumber(ARGV[2])
if #current ~= n * 2 then
  return 0
end
local want = {}
for i = 1, n do
  want[ARGV[1 + 2 * i]] = ARGV[2 + 2 * i]
end
for i = 1, #current, 2 do
  if want[current[i]] ~= current[i + 1] then
    return 0
  end
end
redis.call('DEL', KEYS[1])
local first = 3 + 2 * n
if #ARGV >= first then
  redis.call('HSET', KEYS[1], unpack(ARGV, first))
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
return 1
"#;

/// [`CounterStore`] over Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("conn", &"<redis::aio::ConnectionManager>").finish()
    }
}

impl RedisStore {
    /// Store using an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, cas: Script::new(COMPARE_AND_SET) }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1/`) and build a store.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self::new(conn))
    }
}

fn unavailable(e: RedisError) -> StoreError {
    tracing::warn!(target: "floodgate::redis", error = %e, "redis command failed");
    StoreError::unavailable(e)
}

fn secs(ttl: u64) -> i64 {
    i64::try_from(ttl).unwrap_or(i64::MAX)
}

/// Flatten a hash into `field, value, field, value, ...` in a stable order.
fn pairs(fields: &HashFields) -> Vec<(&str, &str)> {
    let mut out: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    out.sort_unstable();
    out
}

/// Script arguments for [`COMPARE_AND_SET`].
fn cas_args(expected: &HashFields, fields: &HashFields, ttl_secs: u64) -> Vec<String> {
    let mut args = vec![ttl_secs.to_string(), expected.len().to_string()];
    for (k, v) in pairs(expected).into_iter().chain(pairs(fields)) {
        args.push(k.to_string());
        args.push(v.to_string());
    }
    args
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.incr(key, delta).await.map_err(unavailable)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(unavailable)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(secs(ttl_secs))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(secs(ttl_secs))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(unavailable)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let remaining: i64 =
            redis::cmd("TTL").arg(key).query_async(&mut conn).await.map_err(unavailable)?;
        // -2: no such key, -1: no expiry.
        Ok(u64::try_from(remaining).ok())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashFields, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(unavailable)
    }

    async fn hash_set_all(&self, key: &str, fields: &HashFields) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, &pairs(fields)).await.map_err(unavailable)?;
        Ok(())
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        expected: &HashFields,
        fields: &HashFields,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.cas.prepare_invoke();
        invocation.key(key);
        for arg in cas_args(expected, fields, ttl_secs) {
            invocation.arg(arg);
        }
        let swapped: i64 = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(unavailable)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }
}
