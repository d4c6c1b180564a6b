//! Idempotency service - at most one "first processing" per (scope, key).
//!
//! Layered double-checked lookup:
//!
//! 1. in-process cache (30-minute TTL, bounded)
//! 2. persistent store keyed by (scope, idempotency_key)
//! 3. insertion in its own SERIALIZABLE transaction, with the unique
//!    constraint as the ultimate arbiter — a constraint violation means a
//!    concurrent winner, whose committed row is re-read and returned
//!
//! The cache and the per-key leases are performance optimizations only;
//! correctness never depends on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::DbPool;
use crate::error::{AppError, is_unique_violation, map_tx_error};
use crate::models::idempotency::IdempotencyRecord;

/// Records expire 24 hours after creation.
const RECORD_TTL_HOURS: i64 = 24;
/// Cached lookups are trusted for 30 minutes.
const CACHE_TTL_MINUTES: i64 = 30;
/// Idle key leases are dropped after this long.
const LEASE_TTL_MINUTES: i64 = 10;

const MAX_CACHE_SIZE: usize = 5_000;
const MAX_LEASES: usize = 1_000;

const KEY_LEASE_TIMEOUT: Duration = Duration::from_secs(5);

struct CacheEntry {
    record: IdempotencyRecord,
    cached_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.cached_at + chrono::Duration::minutes(CACHE_TTL_MINUTES)
    }
}

struct KeyLease {
    mutex: Arc<tokio::sync::Mutex<()>>,
    last_access: Mutex<DateTime<Utc>>,
}

impl KeyLease {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            last_access: Mutex::new(now),
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        *self.last_access.lock().expect("lease mutex poisoned") = now;
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let last = *self.last_access.lock().expect("lease mutex poisoned");
        now >= last + chrono::Duration::minutes(LEASE_TTL_MINUTES)
    }

    fn is_idle(&self) -> bool {
        self.mutex.try_lock().is_ok()
    }
}

/// Snapshot of the in-memory side of the service, for monitoring.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub cache_size: usize,
    pub lease_count: usize,
}

/// Double-checked idempotency store over `idempotency_records`.
pub struct IdempotencyService {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    leases: Mutex<HashMap<String, Arc<KeyLease>>>,
}

impl IdempotencyService {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            cache: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// SHA-256 hex fingerprint of a request body.
    pub fn fingerprint(body: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether `record` answered a request with the same body.
    pub fn validate_matches(record: &IdempotencyRecord, request_body: &str) -> bool {
        let matches = record.request_hash == Self::fingerprint(request_body);
        if !matches {
            tracing::warn!(
                scope = %record.scope,
                "request hash mismatch for idempotency key"
            );
        }
        matches
    }

    /// Return the non-expired record for (scope, key), if one exists.
    pub async fn find(
        &self,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, AppError> {
        let now = self.clock.now();
        let cache_key = cache_key(scope, key);

        {
            let mut cache = self.cache.lock().expect("cache poisoned");
            if let Some(entry) = cache.get(&cache_key) {
                if !entry.is_stale(now) && !entry.record.is_expired(now) {
                    return Ok(Some(entry.record.clone()));
                }
                cache.remove(&cache_key);
            }
            if cache.len() >= MAX_CACHE_SIZE {
                cache.retain(|_, entry| !entry.is_stale(now));
            }
        }

        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT id, scope, idempotency_key, request_hash,
                   response_body, response_status, created_at, expires_at
            FROM idempotency_records
            WHERE scope = $1 AND idempotency_key = $2
            "#,
        )
        .bind(scope)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) if record.is_expired(now) => Ok(None),
            Some(record) => {
                self.cache_put(cache_key, record.clone(), now);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Double-checked store: returns the record that now represents the
    /// winner for (scope, key), whether it was ours or a concurrent one.
    pub async fn save_first(
        &self,
        scope: &str,
        key: &str,
        request_body: &str,
        response_body: Option<&str>,
        response_status: i32,
    ) -> Result<IdempotencyRecord, AppError> {
        let cache_key = cache_key(scope, key);
        let lease = self.acquire_lease(&cache_key).await?;

        let result = self
            .save_first_locked(scope, key, request_body, response_body, response_status)
            .await;

        drop(lease);
        self.release_lease(&cache_key);
        result
    }

    async fn save_first_locked(
        &self,
        scope: &str,
        key: &str,
        request_body: &str,
        response_body: Option<&str>,
        response_status: i32,
    ) -> Result<IdempotencyRecord, AppError> {
        if let Some(existing) = self.find(scope, key).await? {
            tracing::debug!(scope, "idempotency record already exists, returning winner");
            return Ok(existing);
        }

        let now = self.clock.now();
        let request_hash = Self::fingerprint(request_body);

        let inserted = self
            .insert_record(scope, key, &request_hash, response_body, response_status, now)
            .await;

        let record = match inserted {
            Ok(record) => record,
            Err(AppError::DataIntegrityViolation) => {
                // Concurrent winner committed first; return its row.
                tracing::debug!(scope, "lost idempotency insert race, re-reading winner");
                sqlx::query_as::<_, IdempotencyRecord>(
                    r#"
                    SELECT id, scope, idempotency_key, request_hash,
                           response_body, response_status, created_at, expires_at
                    FROM idempotency_records
                    WHERE scope = $1 AND idempotency_key = $2
                    "#,
                )
                .bind(scope)
                .bind(key)
                .fetch_one(&self.pool)
                .await?
            }
            Err(err) => return Err(err),
        };

        self.cache_put(cache_key(scope, key), record.clone(), now);
        Ok(record)
    }

    /// Insert in its own SERIALIZABLE transaction, independent of whatever
    /// transaction the caller may be running.
    async fn insert_record(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        response_body: Option<&str>,
        response_status: i32,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyRecord, AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            INSERT INTO idempotency_records (
                id, scope, idempotency_key, request_hash,
                response_body, response_status, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, scope, idempotency_key, request_hash,
                      response_body, response_status, created_at, expires_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scope)
        .bind(key)
        .bind(request_hash)
        .bind(response_body)
        .bind(response_status)
        .bind(now)
        .bind(now + chrono::Duration::hours(RECORD_TTL_HOURS))
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                AppError::DataIntegrityViolation
            } else {
                map_tx_error(err)
            }
        })?;

        tx.commit().await.map_err(map_tx_error)?;
        Ok(record)
    }

    /// Delete expired records and prune the in-memory structures. Returns
    /// how many persistent records were removed.
    pub async fn cleanup_expired(&self) -> Result<u64, AppError> {
        let now = self.clock.now();
        let deleted = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        {
            let mut cache = self.cache.lock().expect("cache poisoned");
            cache.retain(|_, entry| !entry.is_stale(now) && !entry.record.is_expired(now));
        }
        {
            let mut leases = self.leases.lock().expect("lease map poisoned");
            leases.retain(|_, lease| !lease.is_expired(now) || !lease.is_idle());
        }

        if deleted > 0 {
            tracing::info!(deleted, "expired idempotency records removed");
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> ProcessingStats {
        ProcessingStats {
            cache_size: self.cache.lock().expect("cache poisoned").len(),
            lease_count: self.leases.lock().expect("lease map poisoned").len(),
        }
    }

    fn cache_put(&self, cache_key: String, record: IdempotencyRecord, now: DateTime<Utc>) {
        let mut cache = self.cache.lock().expect("cache poisoned");
        if cache.len() >= MAX_CACHE_SIZE {
            cache.retain(|_, entry| !entry.is_stale(now));
        }
        cache.insert(
            cache_key,
            CacheEntry {
                record,
                cached_at: now,
            },
        );
    }

    async fn acquire_lease(
        &self,
        cache_key: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, AppError> {
        let now = self.clock.now();
        let mutex = {
            let mut leases = self.leases.lock().expect("lease map poisoned");
            if leases.len() >= MAX_LEASES {
                leases.retain(|_, lease| !lease.is_expired(now) || !lease.is_idle());
            }
            let lease = leases
                .entry(cache_key.to_string())
                .or_insert_with(|| Arc::new(KeyLease::new(now)));
            lease.touch(now);
            Arc::clone(&lease.mutex)
        };

        tokio::time::timeout(KEY_LEASE_TIMEOUT, mutex.lock_owned())
            .await
            .map_err(|_| {
                AppError::TransientConflict("timed out waiting for idempotency key lease".into())
            })
    }

    fn release_lease(&self, cache_key: &str) {
        let now = self.clock.now();
        let mut leases = self.leases.lock().expect("lease map poisoned");
        if let Some(lease) = leases.get(cache_key) {
            lease.touch(now);
            if lease.is_expired(now) && lease.is_idle() {
                leases.remove(cache_key);
            }
        }
    }
}

fn cache_key(scope: &str, key: &str) -> String {
    format!("{scope}:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fingerprint_is_stable_sha256_hex() {
        let hash = IdempotencyService::fingerprint("hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(hash, IdempotencyService::fingerprint("hello"));
        assert_ne!(hash, IdempotencyService::fingerprint("hello "));
    }

    #[test]
    fn validate_matches_compares_hashes() {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let record = IdempotencyRecord {
            id: Uuid::new_v4(),
            scope: "transfer".to_string(),
            idempotency_key: "k1".to_string(),
            request_hash: IdempotencyService::fingerprint(r#"{"amount":"10.00"}"#),
            response_body: None,
            response_status: 201,
            created_at: created,
            expires_at: created + chrono::Duration::hours(24),
        };

        assert!(IdempotencyService::validate_matches(
            &record,
            r#"{"amount":"10.00"}"#
        ));
        assert!(!IdempotencyService::validate_matches(
            &record,
            r#"{"amount":"99.00"}"#
        ));
    }

    #[test]
    fn cache_entries_go_stale_after_ttl() {
        let cached_at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let entry = CacheEntry {
            record: IdempotencyRecord {
                id: Uuid::new_v4(),
                scope: "webhook".to_string(),
                idempotency_key: "evt".to_string(),
                request_hash: "0".repeat(64),
                response_body: None,
                response_status: 200,
                created_at: cached_at,
                expires_at: cached_at + chrono::Duration::hours(24),
            },
            cached_at,
        };

        assert!(!entry.is_stale(cached_at + chrono::Duration::minutes(29)));
        assert!(entry.is_stale(cached_at + chrono::Duration::minutes(30)));
    }
}
