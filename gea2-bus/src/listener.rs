//! Per-ERD publish listeners with explicit handles.

use bytes::Bytes;
use dashmap::DashMap;
use gea2_protocol::{Address, Erd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// One ERD value published to this participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErdPublication {
    pub source: Address,
    pub destination: Address,
    pub erd: Erd,
    pub data: Bytes,
}

type Callback = Arc<dyn Fn(&ErdPublication) + Send + Sync>;

/// Maps each ERD to its listeners, in registration order.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: DashMap<Erd, Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn add(
        self: &Arc<Self>,
        erd: Erd,
        callback: impl Fn(&ErdPublication) + Send + Sync + 'static,
    ) -> PublishListener {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(erd)
            .or_default()
            .push((id, Arc::new(callback)));

        PublishListener {
            erd,
            id,
            registry: Arc::downgrade(self),
            active: true,
        }
    }

    pub(crate) fn remove(&self, erd: Erd, id: u64) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.listeners.get_mut(&erd) {
            let before = entry.len();
            entry.retain(|(listener, _)| *listener != id);
            removed = entry.len() != before;
        }
        self.listeners
            .remove_if(&erd, |_, listeners| listeners.is_empty());
        removed
    }

    /// Invokes every listener for the publication's ERD; returns how many ran.
    pub(crate) fn notify(&self, publication: &ErdPublication) -> usize {
        // Clone out of the map so callbacks may add or remove listeners.
        let callbacks: Vec<Callback> = match self.listeners.get(&publication.erd) {
            Some(entry) => entry.iter().map(|(_, callback)| callback.clone()).collect(),
            None => return 0,
        };

        for callback in &callbacks {
            callback(publication);
        }
        callbacks.len()
    }

    pub(crate) fn count(&self, erd: Erd) -> usize {
        self.listeners
            .get(&erd)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}

/// Handle to a registered publish listener.
///
/// The listener stays registered until the handle is removed or dropped.
#[derive(Debug)]
pub struct PublishListener {
    erd: Erd,
    id: u64,
    registry: Weak<ListenerRegistry>,
    active: bool,
}

impl PublishListener {
    pub fn erd(&self) -> Erd {
        self.erd
    }

    /// Unregisters the listener. Returns false if it was already gone.
    pub fn remove(mut self) -> bool {
        self.unregister()
    }

    fn unregister(&mut self) -> bool {
        if !std::mem::replace(&mut self.active, false) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.erd, self.id),
            None => false,
        }
    }
}

impl Drop for PublishListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn publication(erd: Erd, data: &'static [u8]) -> ErdPublication {
        ErdPublication {
            source: 0xC0,
            destination: 0xBB,
            erd,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_notify_matching_erd_only() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _listener = registry.add(0x4003, move |p| sink.lock().push(p.data.clone()));

        assert_eq!(registry.notify(&publication(0x4003, &[0x82])), 1);
        assert_eq!(registry.notify(&publication(0x4004, &[0x01])), 0);
        assert_eq!(seen.lock().as_slice(), &[Bytes::from_static(&[0x82])]);
    }

    #[test]
    fn test_registration_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        let _a = registry.add(0x1, move |_| first.lock().push("a"));
        let second = order.clone();
        let _b = registry.add(0x1, move |_| second.lock().push("b"));

        registry.notify(&publication(0x1, &[]));
        assert_eq!(order.lock().as_slice(), &["a", "b"]);
    }

    #[test]
    fn test_remove_and_drop_detach() {
        let registry = ListenerRegistry::new();

        let kept = registry.add(0x1, |_| {});
        let removed = registry.add(0x1, |_| {});
        assert_eq!(registry.count(0x1), 2);

        assert!(removed.remove());
        assert_eq!(registry.count(0x1), 1);

        drop(kept);
        assert_eq!(registry.count(0x1), 0);
        assert_eq!(registry.notify(&publication(0x1, &[])), 0);
    }

    #[test]
    fn test_callback_may_remove_listeners() {
        let registry = ListenerRegistry::new();
        let slot: Arc<Mutex<Option<PublishListener>>> = Arc::new(Mutex::new(None));

        let inner = slot.clone();
        let listener = registry.add(0x1, move |_| {
            inner.lock().take();
        });
        *slot.lock() = Some(listener);

        assert_eq!(registry.notify(&publication(0x1, &[])), 1);
        assert_eq!(registry.count(0x1), 0);
    }

    #[test]
    fn test_handle_outlives_registry() {
        let registry = ListenerRegistry::new();
        let listener = registry.add(0x1, |_| {});
        drop(registry);
        assert!(!listener.remove());
    }
}
