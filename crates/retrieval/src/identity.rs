//! Identity resolution with a short-TTL in-process cache
//!
//! The cache is the only state shared across requests. Concurrent misses
//! for the same (tenant, user) collapse into a single resolver call.

use crate::model::{Clearance, SecurityIdentity};
use async_trait::async_trait;
use keystone_common::errors::{AppError, Result};
use keystone_common::metrics;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CACHE_NAME: &str = "identity";
const SERVICE: &str = "identity_resolver";

/// Group membership and clearance for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    #[serde(default)]
    pub groups: Vec<String>,
    pub clearance: Clearance,
    #[serde(default)]
    pub department: Option<String>,
}

impl ResolvedIdentity {
    pub fn into_identity(self, user_id: &str, tenant_id: &str) -> SecurityIdentity {
        let identity = SecurityIdentity::new(user_id, tenant_id, self.groups, self.clearance);
        match self.department {
            Some(department) => identity.with_department(department),
            None => identity,
        }
    }
}

/// External identity / group-membership resolver
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, user_id: &str, tenant_id: &str) -> Result<ResolvedIdentity>;
}

/// Caching wrapper around any resolver
pub struct CachedIdentityResolver {
    inner: Arc<dyn IdentityResolver>,
    cache: Cache<(String, String), ResolvedIdentity>,
}

impl CachedIdentityResolver {
    pub fn new(inner: Arc<dyn IdentityResolver>, ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self { inner, cache }
    }

    /// Resolve and build the request identity
    pub async fn identity(&self, user_id: &str, tenant_id: &str) -> Result<SecurityIdentity> {
        let resolved = self.resolve(user_id, tenant_id).await?;
        Ok(resolved.into_identity(user_id, tenant_id))
    }

    /// Drop a cached entry, e.g. after a membership change
    pub async fn invalidate(&self, user_id: &str, tenant_id: &str) {
        self.cache
            .invalidate(&(tenant_id.to_string(), user_id.to_string()))
            .await;
    }

    /// Approximate number of cached identities
    pub fn cached_entries(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl IdentityResolver for CachedIdentityResolver {
    async fn resolve(&self, user_id: &str, tenant_id: &str) -> Result<ResolvedIdentity> {
        if user_id.trim().is_empty() || tenant_id.trim().is_empty() {
            return Err(AppError::Validation {
                message: "user_id and tenant_id are required".to_string(),
                field: None,
            });
        }

        let key = (tenant_id.to_string(), user_id.to_string());
        if let Some(hit) = self.cache.get(&key).await {
            metrics::record_cache(true, CACHE_NAME);
            return Ok(hit);
        }
        metrics::record_cache(false, CACHE_NAME);

        let inner = self.inner.clone();
        self.cache
            .try_get_with(key, async move { inner.resolve(user_id, tenant_id).await })
            .await
            .map_err(|e| match e.as_ref() {
                AppError::IdentityNotFound { user_id, tenant_id } => AppError::IdentityNotFound {
                    user_id: user_id.clone(),
                    tenant_id: tenant_id.clone(),
                },
                other => AppError::upstream(SERVICE, other.to_string()),
            })
    }
}

/// Fixed identity table
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    identities: HashMap<(String, String), ResolvedIdentity>,
    calls: AtomicUsize,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(
        mut self,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        identity: ResolvedIdentity,
    ) -> Self {
        self.identities.insert((tenant_id.into(), user_id.into()), identity);
        self
    }

    /// Number of resolve calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, user_id: &str, tenant_id: &str) -> Result<ResolvedIdentity> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.identities
            .get(&(tenant_id.to_string(), user_id.to_string()))
            .cloned()
            .ok_or_else(|| AppError::IdentityNotFound {
                user_id: user_id.to_string(),
                tenant_id: tenant_id.to_string(),
            })
    }
}

/// Identity directory reached over HTTP
pub struct HttpIdentityResolver {
    client: reqwest::Client,
    base_url: reqwest::Url,
    timeout: Duration,
}

impl HttpIdentityResolver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| AppError::configuration(format!("Invalid identity resolver URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::configuration("Identity resolver URL cannot be a base"));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn identity_url(&self, user_id: &str, tenant_id: &str) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["tenants", tenant_id, "users", user_id, "identity"]);
        }
        url
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve(&self, user_id: &str, tenant_id: &str) -> Result<ResolvedIdentity> {
        let response = self
            .client
            .get(self.identity_url(user_id, tenant_id))
            .send()
            .await
            .map_err(|e| AppError::upstream_request(SERVICE, self.timeout, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::IdentityNotFound {
                user_id: user_id.to_string(),
                tenant_id: tenant_id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(AppError::upstream(
                SERVICE,
                format!("Resolver returned {}", response.status()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::upstream(SERVICE, format!("Failed to parse response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> Arc<StaticIdentityResolver> {
        Arc::new(StaticIdentityResolver::new().with_identity(
            "acme",
            "alice",
            ResolvedIdentity {
                groups: vec!["eng".into(), "ops".into()],
                clearance: Clearance::Confidential,
                department: Some("legal".into()),
            },
        ))
    }

    #[tokio::test]
    async fn test_cache_hits_skip_resolver() {
        let inner = resolver();
        let cached = CachedIdentityResolver::new(inner.clone(), Duration::from_secs(60), 100);

        let first = cached.identity("alice", "acme").await.unwrap();
        let second = cached.identity("alice", "acme").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.groups(), &["eng", "ops"]);
        assert_eq!(first.department(), Some("legal"));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let inner = resolver();
        let cached = CachedIdentityResolver::new(inner.clone(), Duration::from_secs(60), 100);

        cached.resolve("alice", "acme").await.unwrap();
        cached.invalidate("alice", "acme").await;
        cached.resolve("alice", "acme").await.unwrap();

        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_user_not_cached() {
        let inner = resolver();
        let cached = CachedIdentityResolver::new(inner.clone(), Duration::from_secs(60), 100);

        for _ in 0..2 {
            let err = cached.resolve("mallory", "acme").await.unwrap_err();
            assert!(matches!(err, AppError::IdentityNotFound { .. }));
        }
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_tenant_is_part_of_the_key() {
        let cached = CachedIdentityResolver::new(resolver(), Duration::from_secs(60), 100);
        assert!(cached.resolve("alice", "acme").await.is_ok());
        assert!(cached.resolve("alice", "globex").await.is_err());
    }

    #[tokio::test]
    async fn test_silent_directory_times_out() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let resolver = HttpIdentityResolver::new(&format!("http://{}/", addr), Duration::from_millis(100)).unwrap();
        let err = resolver.resolve("alice", "acme").await.unwrap_err();

        assert!(matches!(
            err,
            AppError::UpstreamTimeout { ref service, timeout_ms: 100 } if service == SERVICE
        ));
    }

    #[test]
    fn test_identity_url_encodes_segments() {
        let resolver = HttpIdentityResolver::new("http://directory.local/api/", Duration::from_secs(1)).unwrap();
        let url = resolver.identity_url("a b", "acme");
        assert_eq!(url.as_str(), "http://directory.local/api/tenants/acme/users/a%20b/identity");
    }
}
