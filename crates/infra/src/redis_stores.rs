use std::time::Duration;

use pantau_domain::otp::{OtpChallenge, OtpPurpose};
use pantau_domain::ports::BoxFuture;
use pantau_domain::ports::cache::{CacheError, CacheStore};
use pantau_domain::ports::idempotency::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore, PutOutcome,
};
use pantau_domain::ports::otp::{OtpStore, OtpStoreError};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const PUT_RETRY_LIMIT: usize = 2;
const SCAN_BATCH: usize = 500;

pub async fn connect(redis_url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(redis_url)?;
    ConnectionManager::new(client).await
}

fn ttl_ms(ttl: Duration) -> u64 {
    let ms = ttl.as_millis() as u64;
    if ms == 0 { 1 } else { ms }
}

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(manager: ConnectionManager, prefix: &str) -> Self {
        Self {
            manager,
            prefix: format!("{prefix}:idemp"),
        }
    }

    fn cache_key(&self, key: &IdempotencyKey) -> String {
        key.cache_key(&self.prefix)
    }

    fn serialize_record(record: &IdempotencyRecord) -> Result<String, IdempotencyError> {
        serde_json::to_string(record)
            .map_err(|err| IdempotencyError::Serialization(err.to_string()))
    }

    fn deserialize_record(value: &str) -> Result<IdempotencyRecord, IdempotencyError> {
        serde_json::from_str(value).map_err(|err| IdempotencyError::Serialization(err.to_string()))
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn get(
        &self,
        key: &IdempotencyKey,
    ) -> BoxFuture<'_, Result<Option<IdempotencyRecord>, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = conn
                .get(cache_key)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            value
                .map(|payload| Self::deserialize_record(&payload))
                .transpose()
        })
    }

    fn put_if_absent(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let record = record.clone();
        Box::pin(async move {
            let payload = Self::serialize_record(&record)?;
            let ttl_ms = ttl_ms(ttl);
            for _ in 0..PUT_RETRY_LIMIT {
                let mut conn = self.manager.clone();
                let stored: Option<String> = redis::cmd("SET")
                    .arg(&cache_key)
                    .arg(&payload)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| IdempotencyError::Store(err.to_string()))?;
                if stored.is_some() {
                    return Ok(PutOutcome::Stored);
                }

                // The holder may expire between SET NX and GET; retry once.
                let existing: Option<String> = conn
                    .get(&cache_key)
                    .await
                    .map_err(|err| IdempotencyError::Store(err.to_string()))?;
                if let Some(payload) = existing {
                    return Ok(PutOutcome::Existing(Self::deserialize_record(&payload)?));
                }
            }

            Err(IdempotencyError::Store(
                "failed to claim idempotency key".into(),
            ))
        })
    }

    fn update(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let record = record.clone();
        Box::pin(async move {
            let payload = Self::serialize_record(&record)?;
            let mut conn = self.manager.clone();
            let _: () = redis::cmd("SET")
                .arg(&cache_key)
                .arg(payload)
                .arg("PX")
                .arg(ttl_ms(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            Ok(())
        })
    }

    fn remove(&self, key: &IdempotencyKey) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: () = conn
                .del(cache_key)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            Ok(())
        })
    }
}

/// Challenge JSON under `{prefix}:otp:{purpose}:{identifier}`, failed attempts
/// counted separately under `...:attempts` so INCR stays atomic.
#[derive(Clone)]
pub struct RedisOtpStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisOtpStore {
    pub fn new(manager: ConnectionManager, prefix: &str) -> Self {
        Self {
            manager,
            prefix: format!("{prefix}:otp"),
        }
    }

    fn code_key(&self, identifier: &str, purpose: OtpPurpose) -> String {
        format!("{}:{}:{identifier}", self.prefix, purpose.as_str())
    }

    fn attempts_key(&self, identifier: &str, purpose: OtpPurpose) -> String {
        format!("{}:attempts", self.code_key(identifier, purpose))
    }
}

// KEYS[1] challenge, KEYS[2] attempts; ARGV[1] submitted code.
const TAKE_OTP_IF_MATCHES: &str = r#"
local payload = redis.call('GET', KEYS[1])
if not payload then
  return 0
end
local ok, challenge = pcall(cjson.decode, payload)
if not ok or challenge['code'] ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1], KEYS[2])
return 1
"#;

fn otp_store_error(err: redis::RedisError) -> OtpStoreError {
    OtpStoreError::Store(err.to_string())
}

impl OtpStore for RedisOtpStore {
    fn put(
        &self,
        challenge: &OtpChallenge,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), OtpStoreError>> {
        let code_key = self.code_key(&challenge.identifier, challenge.purpose);
        let attempts_key = self.attempts_key(&challenge.identifier, challenge.purpose);
        let payload = serde_json::to_string(challenge)
            .map_err(|err| OtpStoreError::Serialization(err.to_string()));
        Box::pin(async move {
            let payload = payload?;
            let mut conn = self.manager.clone();
            let _: () = redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(&code_key)
                .arg(payload)
                .arg("PX")
                .arg(ttl_ms(ttl))
                .ignore()
                .cmd("DEL")
                .arg(&attempts_key)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(otp_store_error)?;
            Ok(())
        })
    }

    fn get(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> BoxFuture<'_, Result<Option<OtpChallenge>, OtpStoreError>> {
        let code_key = self.code_key(identifier, purpose);
        let attempts_key = self.attempts_key(identifier, purpose);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let (payload, attempts): (Option<String>, Option<u32>) = redis::pipe()
                .get(&code_key)
                .get(&attempts_key)
                .query_async(&mut conn)
                .await
                .map_err(otp_store_error)?;
            let Some(payload) = payload else {
                return Ok(None);
            };
            let mut challenge: OtpChallenge = serde_json::from_str(&payload)
                .map_err(|err| OtpStoreError::Serialization(err.to_string()))?;
            challenge.attempt_count = attempts.unwrap_or(0);
            Ok(Some(challenge))
        })
    }

    fn remove(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> BoxFuture<'_, Result<(), OtpStoreError>> {
        let keys = [
            self.code_key(identifier, purpose),
            self.attempts_key(identifier, purpose),
        ];
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: () = conn.del(&keys[..]).await.map_err(otp_store_error)?;
            Ok(())
        })
    }

    fn take_if_matches(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        code: &str,
    ) -> BoxFuture<'_, Result<bool, OtpStoreError>> {
        let code_key = self.code_key(identifier, purpose);
        let attempts_key = self.attempts_key(identifier, purpose);
        let code = code.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let taken: i64 = redis::Script::new(TAKE_OTP_IF_MATCHES)
                .key(&code_key)
                .key(&attempts_key)
                .arg(code)
                .invoke_async(&mut conn)
                .await
                .map_err(otp_store_error)?;
            Ok(taken == 1)
        })
    }

    fn record_failed_attempt(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> BoxFuture<'_, Result<u32, OtpStoreError>> {
        let code_key = self.code_key(identifier, purpose);
        let attempts_key = self.attempts_key(identifier, purpose);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let remaining_ms: i64 = conn.pttl(&code_key).await.map_err(otp_store_error)?;
            if remaining_ms <= 0 {
                return Ok(0);
            }
            let (attempts,): (u32,) = redis::pipe()
                .atomic()
                .incr(&attempts_key, 1)
                .pexpire(&attempts_key, remaining_ms)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(otp_store_error)?;
            Ok(attempts)
        })
    }
}

/// Cache entries live under `{prefix}:cache:`; patterns are resolved with
/// SCAN so large keyspaces are never blocked by KEYS. The generation counter
/// sits outside that namespace so no invalidation pattern can match it.
#[derive(Clone)]
pub struct RedisCacheStore {
    manager: ConnectionManager,
    prefix: String,
    generation_key: String,
}

// KEYS[1] generation, KEYS[2] entry; ARGV[1] expected generation, ARGV[2]
// value, ARGV[3] ttl in ms (0 = no expiry).
const SET_IF_GENERATION: &str = r#"
local current = redis.call('GET', KEYS[1]) or '0'
if current ~= ARGV[1] then
  return 0
end
if tonumber(ARGV[3]) > 0 then
  redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
else
  redis.call('SET', KEYS[2], ARGV[2])
end
return 1
"#;

impl RedisCacheStore {
    pub fn new(manager: ConnectionManager, prefix: &str) -> Self {
        Self {
            manager,
            prefix: format!("{prefix}:cache:"),
            generation_key: format!("{prefix}:cache-generation"),
        }
    }

    async fn bump_generation(&self, conn: &mut ConnectionManager) -> Result<(), CacheError> {
        let _: u64 = conn
            .incr(&self.generation_key, 1u64)
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

fn cache_error(err: redis::RedisError) -> CacheError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        CacheError::Unavailable(err.to_string())
    } else {
        CacheError::Operation(err.to_string())
    }
}

impl CacheStore for RedisCacheStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            conn.get(key).await.map_err(cache_error)
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = self.key(key);
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut command = redis::cmd("SET");
            command.arg(&key).arg(value);
            if !ttl.is_zero() {
                command.arg("PX").arg(ttl_ms(ttl));
            }
            let _: () = command.query_async(&mut conn).await.map_err(cache_error)?;
            Ok(())
        })
    }

    fn generation(&self) -> BoxFuture<'_, Result<u64, CacheError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let current: Option<u64> = conn
                .get(&self.generation_key)
                .await
                .map_err(cache_error)?;
            Ok(current.unwrap_or(0))
        })
    }

    fn set_if_generation(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        generation: u64,
    ) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = self.key(key);
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let ttl = if ttl.is_zero() { 0 } else { ttl_ms(ttl) };
            let stored: i64 = redis::Script::new(SET_IF_GENERATION)
                .key(&self.generation_key)
                .key(&key)
                .arg(generation)
                .arg(value)
                .arg(ttl)
                .invoke_async(&mut conn)
                .await
                .map_err(cache_error)?;
            Ok(stored == 1)
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            self.bump_generation(&mut conn).await?;
            let _: () = conn.del(key).await.map_err(cache_error)?;
            Ok(())
        })
    }

    fn remove_pattern(&self, pattern: &str) -> BoxFuture<'_, Result<u64, CacheError>> {
        let pattern = self.key(pattern);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            self.bump_generation(&mut conn).await?;
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(cache_error)?;
                if !keys.is_empty() {
                    let deleted: u64 = conn.del(&keys[..]).await.map_err(cache_error)?;
                    removed += deleted;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(removed)
        })
    }
}
