use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{
    config::GeoConfig,
    error::DashboardError,
    types::{GeoRecord, GeoStatus},
};

/// A lookup shared by every caller that asked for the same address.
pub type GeoLookup = Shared<BoxFuture<'static, Arc<GeoRecord>>>;

/// The outbound geolocation query behind [`GeoCache`].
pub trait GeoResolver: Send + Sync + 'static {
    fn resolve(&self, address: &str) -> BoxFuture<'static, Result<GeoRecord, DashboardError>>;
}

/// Resolves addresses against an ip-api.com compatible JSON endpoint.
pub struct IpApiResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl IpApiResolver {
    pub fn new(config: &GeoConfig) -> Result<Self, DashboardError> {
        let client = reqwest::Client::builder()
            .timeout(config.lookup_timeout)
            .build()?;

        info!("Geolocation lookups go to {}", config.endpoint);
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

impl GeoResolver for IpApiResolver {
    fn resolve(&self, address: &str) -> BoxFuture<'static, Result<GeoRecord, DashboardError>> {
        let request = self.client.get(format!("{}{}", self.endpoint, address));
        async move {
            let record = request
                .send()
                .await?
                .error_for_status()?
                .json::<GeoRecord>()
                .await?;
            Ok(record)
        }
        .boxed()
    }
}

struct CacheEntry {
    lookup: GeoLookup,
    registered_at: Instant,
    /// Nanoseconds since the cache's epoch at the most recent lookup.
    last_used: AtomicU64,
}

impl CacheEntry {
    fn new(lookup: GeoLookup, now: u64) -> Self {
        Self {
            lookup,
            registered_at: Instant::now(),
            last_used: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) -> GeoLookup {
        self.last_used.fetch_max(now, Ordering::Relaxed);
        self.lookup.clone()
    }

    fn is_resolved(&self) -> bool {
        self.lookup.peek().is_some()
    }

    fn is_stale(&self, retry_after: Option<Duration>) -> bool {
        let Some(retry_after) = retry_after else {
            return false;
        };
        matches!(self.lookup.peek(), Some(record) if record.status == GeoStatus::Failed)
            && self.registered_at.elapsed() >= retry_after
    }
}

/// Single-flight geolocation cache.
///
/// At most one query is outstanding per address. The first `lookup` for an
/// address registers a shared future and starts the query on the runtime
/// before returning; later callers get a clone of that same future, whether it
/// is still pending or already resolved. Failures and timeouts resolve to a
/// failed record, which is cached like any other.
pub struct GeoCache {
    resolver: Arc<dyn GeoResolver>,
    runtime: Handle,
    entries: DashMap<String, CacheEntry>,
    epoch: Instant,
    lookup_timeout: Duration,
    max_entries: Option<usize>,
    failure_retry_after: Option<Duration>,
    queries: AtomicU64,
    evictions: AtomicU64,
}

impl GeoCache {
    pub fn new(config: &GeoConfig, resolver: Arc<dyn GeoResolver>, runtime: Handle) -> Self {
        Self {
            resolver,
            runtime,
            entries: DashMap::new(),
            epoch: Instant::now(),
            lookup_timeout: config.lookup_timeout,
            max_entries: config.max_entries,
            failure_retry_after: config.failure_retry_after,
            queries: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn lookup(&self, address: &str) -> GeoLookup {
        if let Some(entry) = self.entries.get(address) {
            if !entry.is_stale(self.failure_retry_after) {
                return entry.touch(self.now());
            }
        }

        if !self.entries.contains_key(address) {
            self.make_room();
        }

        // The entry guard holds the shard lock, so check-then-register is atomic
        // for concurrent callers.
        match self.entries.entry(address.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_stale(self.failure_retry_after) {
                    debug!("Retrying geolocation for {}", address);
                    let lookup = self.start_query(address);
                    occupied.insert(CacheEntry::new(lookup.clone(), self.now()));
                    lookup
                } else {
                    occupied.get().touch(self.now())
                }
            }
            Entry::Vacant(vacant) => {
                let lookup = self.start_query(address);
                vacant.insert(CacheEntry::new(lookup.clone(), self.now()));
                lookup
            }
        }
    }

    /// Number of outbound queries issued so far.
    pub fn queries_issued(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn start_query(&self, address: &str) -> GeoLookup {
        self.queries.fetch_add(1, Ordering::Relaxed);

        let query = self.resolver.resolve(address);
        let timeout = self.lookup_timeout;
        let address = address.to_string();
        let task_address = address.clone();

        let handle = self.runtime.spawn(async move {
            match tokio::time::timeout(timeout, query).await {
                Ok(Ok(record)) => {
                    if !record.is_success() {
                        debug!(
                            "Geolocation for {} failed: {}",
                            task_address,
                            record.message.as_deref().unwrap_or("no message")
                        );
                    }
                    record
                }
                Ok(Err(e)) => {
                    warn!("Geolocation query for {} failed: {}", task_address, e);
                    GeoRecord::failed(&task_address, e.to_string())
                }
                Err(_) => {
                    warn!(
                        "Geolocation query for {} timed out after {:?}",
                        task_address, timeout
                    );
                    GeoRecord::failed(&task_address, "lookup timed out")
                }
            }
        });

        async move {
            let record = match handle.await {
                Ok(record) => record,
                Err(e) => GeoRecord::failed(&address, DashboardError::Runtime(e).to_string()),
            };
            Arc::new(record)
        }
        .boxed()
        .shared()
    }

    /// Evicts the least recently used resolved entry once the cache is at its
    /// cap. Pending lookups are never evicted.
    fn make_room(&self) {
        let Some(max_entries) = self.max_entries else {
            return;
        };

        while self.entries.len() >= max_entries {
            let least_recent = self
                .entries
                .iter()
                .filter(|entry| entry.is_resolved())
                .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());

            let Some(address) = least_recent else {
                return;
            };
            if self.entries.remove(&address).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted geolocation for {}", address);
            }
        }
    }
}
