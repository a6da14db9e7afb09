//! Media matcher: evaluates viewport media queries and notifies listeners
//! of match/unmatch transitions.

use super::device::{DeviceEmulation, DeviceMetrics};
use crate::lock;
use crate::media_query::{MediaContext, MediaQueryList};
use crate::subscription::Subscription;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Callback receiving the new match state of a query
pub type MediaListener = Box<dyn Fn(bool) + Send + Sync>;

pub trait MediaMatcher: Send + Sync {
    /// Watch `query`. The current state is the baseline; `on_change` fires on
    /// every later transition until the returned handle is released.
    fn subscribe(&self, query: &str, on_change: MediaListener) -> Subscription;

    /// One-shot check against the current viewport
    fn matches_now(&self, query: &str) -> bool;

    /// True iff none of `queries` currently match
    fn matches_none(&self, queries: &[String]) -> bool {
        queries.iter().all(|q| !self.matches_now(q))
    }
}

struct Listener {
    query: Option<MediaQueryList>,
    matches: bool,
    callback: Arc<dyn Fn(bool) + Send + Sync>,
}

struct MediaRegistry {
    metrics: DeviceMetrics,
    listeners: BTreeMap<u64, Listener>,
    next_id: u64,
}

/// In-process media matcher driven by `DeviceEmulation::set_metrics`.
///
/// Invalid queries never match, the same way `matchMedia` treats them as
/// `not all`. In a comma list only the invalid members are dropped.
#[derive(Clone)]
pub struct EmulatedMedia {
    registry: Arc<Mutex<MediaRegistry>>,
}

impl EmulatedMedia {
    pub fn new(metrics: DeviceMetrics) -> Self {
        EmulatedMedia {
            registry: Arc::new(Mutex::new(MediaRegistry {
                metrics,
                listeners: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Number of live subscriptions
    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Change only the viewport size, keeping dpr and touch
    pub fn resize(&self, width: u32, height: u32) {
        let mut m = self.metrics();
        m.width = width;
        m.height = height;
        self.set_metrics(m);
    }
}

impl Default for EmulatedMedia {
    fn default() -> Self {
        Self::new(DeviceMetrics::default())
    }
}

fn parse_query(query: &str) -> Option<MediaQueryList> {
    match MediaQueryList::parse_members(query) {
        Ok((list, errors)) => {
            for e in errors {
                warn!("ignoring invalid member of media query '{}': {}", query, e);
            }
            Some(list)
        }
        Err(e) => {
            warn!("ignoring invalid media query '{}': {}", query, e);
            None
        }
    }
}

fn evaluate(list: Option<&MediaQueryList>, metrics: &DeviceMetrics) -> bool {
    list.is_some_and(|l| MediaContext::from(metrics).evaluate_list(l))
}

impl MediaMatcher for EmulatedMedia {
    fn subscribe(&self, query: &str, on_change: MediaListener) -> Subscription {
        let parsed = parse_query(query);
        let id = {
            let mut reg = lock(&self.registry);
            let matches = evaluate(parsed.as_ref(), &reg.metrics);
            let id = reg.next_id;
            reg.next_id += 1;
            reg.listeners.insert(
                id,
                Listener {
                    query: parsed,
                    matches,
                    callback: Arc::from(on_change),
                },
            );
            id
        };

        let registry = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                lock(&registry).listeners.remove(&id);
            }
        })
    }

    fn matches_now(&self, query: &str) -> bool {
        let parsed = parse_query(query);
        let reg = lock(&self.registry);
        evaluate(parsed.as_ref(), &reg.metrics)
    }
}

impl DeviceEmulation for EmulatedMedia {
    fn set_metrics(&self, m: DeviceMetrics) {
        let transitions: Vec<_> = {
            let mut reg = lock(&self.registry);
            reg.metrics = m;
            let ctx = MediaContext::from(&reg.metrics);
            reg.listeners
                .values_mut()
                .filter_map(|l| {
                    let now = l.query.as_ref().is_some_and(|q| ctx.evaluate_list(q));
                    if now == l.matches {
                        return None;
                    }
                    l.matches = now;
                    Some((l.callback.clone(), now))
                })
                .collect()
        };

        debug!("media: {} listener(s) changed state", transitions.len());
        for (callback, matches) in transitions {
            callback(matches);
        }
    }

    fn metrics(&self) -> DeviceMetrics {
        lock(&self.registry).metrics.clone()
    }
}
