//! De-duplicating image resource cache.
//!
//! Every URL is fetched at most once per cache. The entry starts `Pending`
//! and is replaced exactly once by `Success` or `Failure`; entries are never
//! evicted, so a settled outcome is memoized for the cache's lifetime. The
//! process-wide instance lives in [`ResourceCache::global`].

use crate::error::ImageError;
use crate::fetch::{FetchResponder, ImageFetcher};
use crate::subscription::Subscription;
use crate::{lock, Error, Result};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::oneshot;

/// Cloneable future that resolves once a pending entry settles
pub type Settled = Shared<BoxFuture<'static, ()>>;

/// What a caller observes when asking for a URL
#[derive(Clone)]
pub enum LoadResult {
    /// Not ready yet; await the future or register `when_settled`
    Pending(Settled),
    Success,
    Failure(ImageError),
}

impl LoadResult {
    pub fn is_pending(&self) -> bool {
        matches!(self, LoadResult::Pending(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LoadResult::Success)
    }
}

impl fmt::Debug for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadResult::Pending(_) => f.write_str("Pending"),
            LoadResult::Success => f.write_str("Success"),
            LoadResult::Failure(e) => f.debug_tuple("Failure").field(e).finish(),
        }
    }
}

type SettleListener = Box<dyn FnOnce() + Send>;

enum Resource {
    Pending {
        settled: Settled,
        listeners: BTreeMap<u64, SettleListener>,
    },
    Success,
    Failure(ImageError),
}

impl Resource {
    fn snapshot(&self) -> LoadResult {
        match self {
            Resource::Pending { settled, .. } => LoadResult::Pending(settled.clone()),
            Resource::Success => LoadResult::Success,
            Resource::Failure(e) => LoadResult::Failure(e.clone()),
        }
    }
}

struct CacheInner {
    fetcher: Arc<dyn ImageFetcher>,
    entries: Mutex<HashMap<String, Resource>>,
    next_listener: AtomicU64,
}

/// Shared handle to a URL → load state map. Clones share the same entries.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

static GLOBAL: OnceLock<ResourceCache> = OnceLock::new();

/// Stand-in used when no real fetcher could be built for the global cache
struct UnavailableFetcher(String);

impl ImageFetcher for UnavailableFetcher {
    fn fetch(&self, _url: &str, responder: FetchResponder) {
        responder.fail(format!("no image fetcher available: {}", self.0));
    }
}

fn default_global() -> ResourceCache {
    #[cfg(feature = "http")]
    {
        match crate::fetch::HttpFetcher::new(&crate::ImageConfig::default()) {
            Ok(fetcher) => ResourceCache::new(Arc::new(fetcher)),
            Err(e) => {
                warn!("global resource cache has no HTTP fetcher: {}", e);
                ResourceCache::new(Arc::new(UnavailableFetcher(e.to_string())))
            }
        }
    }
    #[cfg(not(feature = "http"))]
    {
        ResourceCache::new(Arc::new(UnavailableFetcher(
            "built without the `http` feature".to_string(),
        )))
    }
}

impl ResourceCache {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        ResourceCache {
            inner: Arc::new(CacheInner {
                fetcher,
                entries: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide cache.
    ///
    /// Unless [`ResourceCache::install_global`] ran first, it is created on
    /// first use with an `HttpFetcher` built from `ImageConfig::default()`;
    /// that first call must happen outside of an async runtime.
    pub fn global() -> &'static ResourceCache {
        GLOBAL.get_or_init(default_global)
    }

    /// Configure the process-wide cache. Fails if it already exists.
    pub fn install_global(fetcher: Arc<dyn ImageFetcher>) -> Result<ResourceCache> {
        let cache = ResourceCache::new(fetcher);
        GLOBAL
            .set(cache.clone())
            .map_err(|_| Error::ConfigError("global resource cache is already initialized".into()))?;
        Ok(cache)
    }

    /// Look up `url`, starting its one and only fetch on first request
    pub fn request(&self, url: &str) -> LoadResult {
        let (tx, settled) = {
            let mut entries = lock(&self.inner.entries);
            if let Some(existing) = entries.get(url) {
                return existing.snapshot();
            }
            let (tx, rx) = oneshot::channel::<()>();
            let settled: Settled = rx.map(|_| ()).boxed().shared();
            entries.insert(
                url.to_string(),
                Resource::Pending {
                    settled: settled.clone(),
                    listeners: BTreeMap::new(),
                },
            );
            (tx, settled)
        };

        debug!("resource cache: fetching {}", url);
        let inner = Arc::downgrade(&self.inner);
        let key = url.to_string();
        let responder = FetchResponder::new(url, move |outcome| {
            if let Some(inner) = inner.upgrade() {
                settle(&inner, &key, outcome);
            }
            let _ = tx.send(());
        });
        // Outside the lock: fetchers may answer synchronously.
        self.inner.fetcher.fetch(url, responder);

        self.status(url).unwrap_or(LoadResult::Pending(settled))
    }

    /// Current state of `url` without starting a fetch
    pub fn status(&self, url: &str) -> Option<LoadResult> {
        lock(&self.inner.entries).get(url).map(Resource::snapshot)
    }

    /// Run `callback` once `url` settles.
    ///
    /// If the entry is not pending (already settled, or never requested) the
    /// callback runs immediately and an empty handle is returned. Releasing
    /// the handle before the entry settles cancels the callback.
    pub fn when_settled<F>(&self, url: &str, callback: F) -> Subscription
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let not_pending = {
            let mut entries = lock(&self.inner.entries);
            match entries.get_mut(url) {
                Some(Resource::Pending { listeners, .. }) => {
                    listeners.insert(id, Box::new(callback));
                    None
                }
                _ => Some(callback),
            }
        };
        if let Some(callback) = not_pending {
            callback();
            return Subscription::empty();
        }

        let inner = Arc::downgrade(&self.inner);
        let key = url.to_string();
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                if let Some(Resource::Pending { listeners, .. }) = lock(&inner.entries).get_mut(&key) {
                    listeners.remove(&id);
                }
            }
        })
    }

    /// Request `url` and wait for its outcome
    pub async fn load(&self, url: &str) -> std::result::Result<(), ImageError> {
        if let LoadResult::Pending(settled) = self.request(url) {
            settled.await;
        }
        match self.status(url) {
            Some(LoadResult::Success) => Ok(()),
            Some(LoadResult::Failure(e)) => Err(e),
            _ => Err(ImageError::new(url, "load did not settle")),
        }
    }

    /// Load several URLs concurrently; results follow the input order
    pub async fn preload<I, S>(&self, urls: I) -> Vec<std::result::Result<(), ImageError>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let urls: Vec<String> = urls.into_iter().map(Into::into).collect();
        join_all(urls.iter().map(|u| self.load(u))).await
    }

    pub fn contains(&self, url: &str) -> bool {
        lock(&self.inner.entries).contains_key(url)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache").field("entries", &self.len()).finish()
    }
}

fn settle(inner: &CacheInner, url: &str, outcome: std::result::Result<(), ImageError>) {
    let listeners = {
        let mut entries = lock(&inner.entries);
        let Some(entry) = entries.get_mut(url) else {
            return;
        };
        if !matches!(entry, Resource::Pending { .. }) {
            warn!("resource cache: ignoring second outcome for {}", url);
            return;
        }
        let next = match &outcome {
            Ok(()) => Resource::Success,
            Err(e) => Resource::Failure(e.clone()),
        };
        match std::mem::replace(entry, next) {
            Resource::Pending { listeners, .. } => listeners,
            _ => BTreeMap::new(),
        }
    };

    match &outcome {
        Ok(()) => debug!("resource cache: loaded {}", url),
        Err(e) => warn!("resource cache: {}", e),
    }
    for (_, listener) in listeners {
        listener();
    }
}
