//! Datasource resolution.
//!
//! [`DatasourceResolver`] is what the query and proxy paths call. It
//! short-circuits the expression pseudo-datasource and sends everything else
//! through a [`DatasourceCache`] collaborator. [`CachingDatasourceCache`] is
//! the in-process implementation: a TTL cache in front of a [`DatasourceStore`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use gateway_common::{
    CallerIdentity, DataSourceRef, DatasourceCache, DatasourceError, ResolvedDataSource,
};
use tracing::debug;

/// Result of resolving a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The expression pseudo-datasource; no lookup was made.
    Expression,
    DataSource(ResolvedDataSource),
}

#[derive(Clone)]
pub struct DatasourceResolver {
    cache: Arc<dyn DatasourceCache>,
}

impl DatasourceResolver {
    pub fn new(cache: Arc<dyn DatasourceCache>) -> Self {
        Self { cache }
    }

    pub async fn resolve(
        &self,
        reference: &DataSourceRef,
        caller: &CallerIdentity,
        skip_cache: bool,
    ) -> Result<Resolution, DatasourceError> {
        if reference.is_expression() {
            return Ok(Resolution::Expression);
        }
        if reference.is_empty() {
            return Err(DatasourceError::NotFound);
        }
        self.cache
            .get(reference, caller, skip_cache)
            .await
            .map(Resolution::DataSource)
    }

    /// Resolve a reference that must name a real datasource.
    pub async fn resolve_datasource(
        &self,
        reference: &DataSourceRef,
        caller: &CallerIdentity,
    ) -> Result<ResolvedDataSource, DatasourceError> {
        match self.resolve(reference, caller, false).await? {
            Resolution::DataSource(ds) => Ok(ds),
            Resolution::Expression => Err(DatasourceError::NotFound),
        }
    }
}

/// Source of truth for datasource definitions.
/// Real implementation: `StaticDatasourceStore` (from config). Test double: `CountingStore`.
#[async_trait]
pub trait DatasourceStore: Send + Sync {
    /// Look up a datasource within an org. `Ok(None)` means it does not exist.
    async fn lookup(
        &self,
        reference: &DataSourceRef,
        org_id: i64,
    ) -> anyhow::Result<Option<ResolvedDataSource>>;
}

/// Datasources fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticDatasourceStore {
    datasources: Vec<ResolvedDataSource>,
}

impl StaticDatasourceStore {
    pub fn new(datasources: Vec<ResolvedDataSource>) -> Self {
        Self { datasources }
    }
}

#[async_trait]
impl DatasourceStore for StaticDatasourceStore {
    async fn lookup(
        &self,
        reference: &DataSourceRef,
        org_id: i64,
    ) -> anyhow::Result<Option<ResolvedDataSource>> {
        Ok(self
            .datasources
            .iter()
            .find(|ds| ds.org_id == org_id && ds.matches(reference))
            .cloned())
    }
}

type CacheKey = (i64, String);

struct CacheEntry {
    datasource: ResolvedDataSource,
    stored_at: Instant,
}

/// TTL cache over a [`DatasourceStore`]. Misses are cold lookups; negative results are not cached.
pub struct CachingDatasourceCache {
    store: Arc<dyn DatasourceStore>,
    ttl: Duration,
    entries: DashMap<CacheKey, CacheEntry>,
}

impl CachingDatasourceCache {
    pub fn new(store: Arc<dyn DatasourceStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: DashMap::new(),
        }
    }

    fn key(reference: &DataSourceRef, org_id: i64) -> Option<CacheKey> {
        if let Some(uid) = reference.uid.as_deref().filter(|u| !u.is_empty()) {
            return Some((org_id, format!("uid:{}", uid)));
        }
        if let Some(id) = reference.id {
            return Some((org_id, format!("id:{}", id)));
        }
        reference
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(|name| (org_id, format!("name:{}", name)))
    }

    fn cached(&self, key: &CacheKey) -> Option<ResolvedDataSource> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.datasource.clone())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DatasourceCache for CachingDatasourceCache {
    async fn get(
        &self,
        reference: &DataSourceRef,
        caller: &CallerIdentity,
        skip_cache: bool,
    ) -> Result<ResolvedDataSource, DatasourceError> {
        let key = Self::key(reference, caller.org_id).ok_or(DatasourceError::NotFound)?;

        let hit = if skip_cache { None } else { self.cached(&key) };
        let datasource = match hit {
            Some(ds) => ds,
            None => {
                debug!(
                    reference = %reference,
                    org_id = caller.org_id,
                    skip_cache,
                    "datasource cache miss"
                );
                let ds = self
                    .store
                    .lookup(reference, caller.org_id)
                    .await
                    .map_err(DatasourceError::Internal)?
                    .ok_or(DatasourceError::NotFound)?;
                self.entries.insert(
                    key,
                    CacheEntry {
                        datasource: ds.clone(),
                        stored_at: Instant::now(),
                    },
                );
                ds
            }
        };

        if datasource.org_id != caller.org_id {
            return Err(DatasourceError::NotFound);
        }
        if !caller.has_role(datasource.min_role) {
            return Err(DatasourceError::AccessDenied);
        }
        Ok(datasource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_common::{AccessMode, OrgRole};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prometheus() -> ResolvedDataSource {
        ResolvedDataSource {
            id: 3,
            uid: "prom-main".into(),
            name: "Prometheus".into(),
            ds_type: "prometheus".into(),
            url: "http://127.0.0.1:9090".into(),
            access: AccessMode::Proxy,
            org_id: 1,
            min_role: OrgRole::Viewer,
        }
    }

    /// Counts how many cold lookups reach the store.
    struct CountingStore {
        inner: StaticDatasourceStore,
        lookups: AtomicUsize,
        fail: bool,
    }

    impl CountingStore {
        fn new(datasources: Vec<ResolvedDataSource>) -> Self {
            Self {
                inner: StaticDatasourceStore::new(datasources),
                lookups: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl DatasourceStore for CountingStore {
        async fn lookup(
            &self,
            reference: &DataSourceRef,
            org_id: i64,
        ) -> anyhow::Result<Option<ResolvedDataSource>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("store offline");
            }
            self.inner.lookup(reference, org_id).await
        }
    }

    fn viewer() -> CallerIdentity {
        CallerIdentity {
            user_id: 1,
            org_id: 1,
            login: "viewer".into(),
            org_role: OrgRole::Viewer,
            is_server_admin: false,
            signed_in: true,
        }
    }

    fn resolver(store: Arc<CountingStore>) -> DatasourceResolver {
        DatasourceResolver::new(Arc::new(CachingDatasourceCache::new(
            store,
            Duration::from_secs(60),
        )))
    }

    #[tokio::test]
    async fn expression_reference_skips_lookup() {
        let store = Arc::new(CountingStore::new(vec![]));
        let resolution = resolver(store.clone())
            .resolve(&DataSourceRef::by_uid("__expr__"), &viewer(), false)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Expression);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolves_by_uid_and_id() {
        let store = Arc::new(CountingStore::new(vec![prometheus()]));
        let resolver = resolver(store);
        let by_uid = resolver
            .resolve_datasource(&DataSourceRef::by_uid("prom-main"), &viewer())
            .await
            .unwrap();
        let by_id = resolver
            .resolve_datasource(&DataSourceRef::by_id(3), &viewer())
            .await
            .unwrap();
        assert_eq!(by_uid, by_id);
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let store = Arc::new(CountingStore::new(vec![prometheus()]));
        let resolver = resolver(store.clone());
        let reference = DataSourceRef::by_uid("prom-main");

        resolver.resolve(&reference, &viewer(), false).await.unwrap();
        resolver.resolve(&reference, &viewer(), false).await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

        resolver.resolve(&reference, &viewer(), true).await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_datasource_is_not_found_and_not_cached() {
        let store = Arc::new(CountingStore::new(vec![]));
        let resolver = resolver(store.clone());
        let reference = DataSourceRef::by_uid("missing");

        for _ in 0..2 {
            let err = resolver.resolve(&reference, &viewer(), false).await.unwrap_err();
            assert!(matches!(err, DatasourceError::NotFound));
        }
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_reference_is_not_found() {
        let store = Arc::new(CountingStore::new(vec![prometheus()]));
        let err = resolver(store)
            .resolve(&DataSourceRef::default(), &viewer(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DatasourceError::NotFound));
    }

    #[tokio::test]
    async fn insufficient_role_is_access_denied() {
        let mut ds = prometheus();
        ds.min_role = OrgRole::Editor;
        let store = Arc::new(CountingStore::new(vec![ds]));
        let err = resolver(store)
            .resolve(&DataSourceRef::by_uid("prom-main"), &viewer(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DatasourceError::AccessDenied));
    }

    #[tokio::test]
    async fn other_org_cannot_see_datasource() {
        let store = Arc::new(CountingStore::new(vec![prometheus()]));
        let mut caller = viewer();
        caller.org_id = 2;
        let err = resolver(store)
            .resolve(&DataSourceRef::by_uid("prom-main"), &caller, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DatasourceError::NotFound));
    }

    #[tokio::test]
    async fn store_failure_is_internal() {
        let mut store = CountingStore::new(vec![]);
        store.fail = true;
        let err = resolver(Arc::new(store))
            .resolve(&DataSourceRef::by_id(1), &viewer(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DatasourceError::Internal(_)));
    }
}
