//! Bookkeeping of the proxies currently managed, for gauges only.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Number of managed proxies, as last published.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProxyCounts {
    /// Services exposed to the tailnet.
    pub ingress: usize,
    /// Services forwarding to a tailnet target.
    pub egress: usize,
}

#[derive(Debug, Default)]
struct Inner {
    ingress: HashSet<String>,
    egress: HashSet<String>,
    published: ProxyCounts,
}

impl Inner {
    fn publish(&mut self) -> ProxyCounts {
        self.published = ProxyCounts {
            ingress: self.ingress.len(),
            egress: self.egress.len(),
        };
        tracing::debug!(
            k8s_ingress_proxies = self.published.ingress,
            k8s_egress_proxies = self.published.egress,
            "managed proxies"
        );
        self.published
    }
}

/// The set of ingress and egress proxies the controller manages, keyed by
/// `Service` UID.
///
/// Each update mutates and publishes under one lock, so published counts
/// always match some consistent state of the sets.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    inner: Mutex<Inner>,
}

impl ProxyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `uid` as an ingress proxy and nothing else.
    pub fn set_ingress(&self, uid: &str) -> ProxyCounts {
        let mut inner = self.inner.lock();
        inner.egress.remove(uid);
        inner.ingress.insert(uid.to_string());
        inner.publish()
    }

    /// Records `uid` as an egress proxy and nothing else.
    pub fn set_egress(&self, uid: &str) -> ProxyCounts {
        let mut inner = self.inner.lock();
        inner.ingress.remove(uid);
        inner.egress.insert(uid.to_string());
        inner.publish()
    }

    /// Forgets `uid` in both roles.
    pub fn remove(&self, uid: &str) -> ProxyCounts {
        let mut inner = self.inner.lock();
        inner.ingress.remove(uid);
        inner.egress.remove(uid);
        inner.publish()
    }

    /// The last published counts.
    #[must_use]
    pub fn counts(&self) -> ProxyCounts {
        self.inner.lock().published
    }
}
