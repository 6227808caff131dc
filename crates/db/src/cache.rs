// crates/db/src/cache.rs
//! Redis-backed artefact cache.
//!
//! Dashboard artefacts are JSON documents under
//! `dash:<tenant>:<job>:<section>` with a short TTL. Misses are `Ok(None)`,
//! never errors.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;
use uuid::Uuid;

use crate::{ArtifactCache, DbError, DbResult};

const COMPONENT: &str = "redis";

/// Default artefact TTL (5 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Cache key layout: `dash:<tenant>:<job>:<section>`.
pub fn cache_key(tenant_id: Uuid, job_id: Uuid, section: &str) -> String {
    format!("dash:{tenant_id}:{job_id}:{section}")
}

fn classify(err: redis::RedisError) -> DbError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        DbError::transient(COMPONENT, err)
    } else {
        DbError::permanent(COMPONENT, err)
    }
}

/// Artefact cache over a shared Redis connection manager (which reconnects
/// transparently under the hood).
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> DbResult<Self> {
        let client = redis::Client::open(url).map_err(classify)?;
        let manager = ConnectionManager::new(client).await.map_err(classify)?;
        info!("redis artefact cache ready");
        Ok(Self { manager })
    }
}

#[async_trait]
impl ArtifactCache for RedisCache {
    async fn put_section(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        section: &str,
        payload: &str,
        ttl: Duration,
    ) -> DbResult<()> {
        let key = cache_key(tenant_id, job_id, section);
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs())
            .await
            .map_err(classify)
    }

    async fn get_section(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        section: &str,
    ) -> DbResult<Option<String>> {
        let key = cache_key(tenant_id, job_id, section);
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_layout() {
        let tenant = Uuid::nil();
        let job = Uuid::nil();
        assert_eq!(
            cache_key(tenant, job, "dashboard"),
            format!("dash:{tenant}:{job}:dashboard")
        );
    }

    #[test]
    fn test_keys_are_tenant_prefixed_distinct() {
        let job = Uuid::new_v4();
        let a = cache_key(Uuid::new_v4(), job, "threads");
        let b = cache_key(Uuid::new_v4(), job, "threads");
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_ttl_is_five_minutes() {
        assert_eq!(DEFAULT_CACHE_TTL, Duration::from_secs(300));
    }
}
