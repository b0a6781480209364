//! Meridian watch bus: fans committed resource events out to filtered live subscribers.
//!
//! Contract:
//! - explicit lifecycle: a bus delivers nothing until [`EventBus::start`] and closes every
//!   open subscription on [`EventBus::stop`] (subscribers observe end-of-stream)
//! - no replay: a subscriber only sees events published after it subscribed; callers that
//!   need the current set `list` first and reconcile the race themselves
//! - each subscription evaluates its own group/version/plural, namespace and label filter

#![forbid(unsafe_code)]

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use meridian_core::{matches_all, Gvp, LabelSelector, ResourceWatchEvent};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What a subscriber wants to see.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchFilter {
    pub gvp: Gvp,
    /// `None` watches every namespace (and cluster-scoped resources).
    pub namespace: Option<String>,
    pub selectors: Vec<LabelSelector>,
}

impl WatchFilter {
    pub fn new(gvp: Gvp) -> Self { Self { gvp, namespace: None, selectors: Vec::new() } }

    pub fn in_namespace(mut self, ns: &str) -> Self { self.namespace = Some(ns.to_string()); self }

    pub fn with_selectors(mut self, selectors: Vec<LabelSelector>) -> Self { self.selectors = selectors; self }

    pub fn matches(&self, ev: &ResourceWatchEvent) -> bool {
        if ev.gvp != self.gvp { return false; }
        if let Some(ns) = &self.namespace {
            if ev.resource.metadata.namespace.as_deref() != Some(ns.as_str()) { return false; }
        }
        matches_all(&self.selectors, &ev.resource.metadata.labels)
    }
}

struct Subscriber {
    id: u64,
    filter: WatchFilter,
    tx: mpsc::UnboundedSender<ResourceWatchEvent>,
}

struct BusInner {
    running: AtomicBool,
    next_id: AtomicU64,
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
}

impl BusInner {
    fn remove(&self, id: u64) {
        let mut removed = false;
        self.subscribers.rcu(|cur| {
            let next: Vec<Arc<Subscriber>> = cur.iter().filter(|s| s.id != id).cloned().collect();
            removed = next.len() != cur.len();
            next
        });
        if removed {
            gauge!("watch_subscribers", self.subscribers.load().len() as f64);
            debug!(id, "watch subscriber removed");
        }
    }
}

/// Process-wide broadcast component. Clone the handle; all clones share one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self { Self::new() }
}

impl EventBus {
    /// A stopped bus; call [`start`](Self::start) before use.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                subscribers: ArcSwap::from_pointee(Vec::new()),
            }),
        }
    }

    /// A bus that is already running.
    pub fn started() -> Self {
        let bus = Self::new();
        bus.start();
        bus
    }

    pub fn start(&self) {
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            info!("event bus started");
        }
    }

    /// Stop delivering and complete every open subscription.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            let closed = self.inner.subscribers.swap(Arc::new(Vec::new()));
            gauge!("watch_subscribers", 0.0);
            info!(closed = closed.len(), "event bus stopped");
        }
    }

    pub fn is_running(&self) -> bool { self.inner.running.load(Ordering::SeqCst) }

    pub fn subscriber_count(&self) -> usize { self.inner.subscribers.load().len() }

    pub fn subscribe(&self, filter: WatchFilter) -> Result<WatchStream> {
        if !self.is_running() {
            return Err(anyhow!("event bus is stopped"));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        info!(id, gvp = %filter.gvp, ns = ?filter.namespace, selectors = filter.selectors.len(), "watch subscribed");
        let sub = Arc::new(Subscriber { id, filter, tx });
        self.inner.subscribers.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push(sub.clone());
            next
        });
        // A stop racing with this subscribe must still complete the stream.
        if !self.is_running() {
            self.inner.remove(id);
        }
        gauge!("watch_subscribers", self.inner.subscribers.load().len() as f64);
        Ok(WatchStream { id, rx, bus: Arc::downgrade(&self.inner) })
    }

    /// Deliver `event` to every matching subscriber. Returns the number of deliveries.
    pub fn publish(&self, event: &ResourceWatchEvent) -> usize {
        if !self.is_running() {
            debug!(gvp = %event.gvp, "event dropped: bus stopped");
            return 0;
        }
        let subs = self.inner.subscribers.load();
        let mut delivered = 0usize;
        let mut gone = Vec::new();
        for s in subs.iter() {
            if !s.filter.matches(event) { continue; }
            if s.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(s.id);
            }
        }
        drop(subs);
        for id in gone { self.inner.remove(id); }
        counter!("watch_events_published_total", 1u64);
        debug!(gvp = %event.gvp, kind = ?event.kind, name = %event.resource.metadata.name, delivered, "event published");
        delivered
    }
}

/// Live subscription. Ends (`None`) when the bus stops; dropping it unsubscribes.
pub struct WatchStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<ResourceWatchEvent>,
    bus: std::sync::Weak<BusInner>,
}

impl WatchStream {
    pub async fn recv(&mut self) -> Option<ResourceWatchEvent> { self.rx.recv().await }

    /// Non-blocking poll used by tests and draining loops.
    pub fn try_recv(&mut self) -> Option<ResourceWatchEvent> { self.rx.try_recv().ok() }

    pub fn cancel(self) {}
}

impl futures::Stream for WatchStream {
    type Item = ResourceWatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{Resource, WatchEventType};

    fn gvp() -> Gvp { Gvp::new("example.io", "v1", "widgets") }

    fn ev(kind: WatchEventType, name: &str, ns: &str, env: &str) -> ResourceWatchEvent {
        ResourceWatchEvent { kind, gvp: gvp(), resource: Resource::new("example.io/v1", "Widget", name).with_namespace(ns).with_label("env", env) }
    }

    #[tokio::test]
    async fn filters_by_namespace_and_labels() {
        let bus = EventBus::started();
        let mut all = bus.subscribe(WatchFilter::new(gvp())).unwrap();
        let mut prod = bus.subscribe(WatchFilter::new(gvp()).in_namespace("a").with_selectors(vec![LabelSelector::equals("env", "prod")])).unwrap();
        let mut other = bus.subscribe(WatchFilter::new(Gvp::new("example.io", "v1", "gadgets"))).unwrap();

        assert_eq!(bus.publish(&ev(WatchEventType::Created, "w1", "a", "prod")), 2);
        assert_eq!(bus.publish(&ev(WatchEventType::Created, "w2", "b", "prod")), 1);
        assert_eq!(bus.publish(&ev(WatchEventType::Created, "w3", "a", "dev")), 1);

        let names: Vec<String> = std::iter::from_fn(|| all.try_recv()).map(|e| e.resource.metadata.name).collect();
        assert_eq!(names, vec!["w1", "w2", "w3"]);
        assert_eq!(prod.try_recv().map(|e| e.resource.metadata.name).as_deref(), Some("w1"));
        assert!(prod.try_recv().is_none());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn stop_completes_open_streams_and_rejects_new_ones() {
        let bus = EventBus::started();
        let mut s = bus.subscribe(WatchFilter::new(gvp())).unwrap();
        bus.stop();
        assert!(s.recv().await.is_none());
        assert!(bus.subscribe(WatchFilter::new(gvp())).is_err());
        assert_eq!(bus.publish(&ev(WatchEventType::Deleted, "w", "a", "x")), 0);
    }

    #[tokio::test]
    async fn dropping_a_stream_unsubscribes() {
        let bus = EventBus::started();
        let s = bus.subscribe(WatchFilter::new(gvp())).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(s);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
