//! Per-request cancellation registry.
//!
//! Every request carries a request id. Transports register the id when the
//! request enters the pipeline and flag it when the originating connection
//! drops; handlers poll their [`CancelHandle`] at suspension points and
//! bail out early with `COMMAND_FAILED: request canceled`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cheap cloneable flag observed by a single in-flight request.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Process-wide map of in-flight request ids to cancellation flags.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<String, CancelHandle>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id, returning its handle. Re-registering an id
    /// returns the existing handle so a retried id cannot shed a pending
    /// cancellation.
    pub fn register(&self, request_id: &str) -> CancelHandle {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(request_id.to_string()).or_default().clone()
    }

    /// Drop a completed request from the registry.
    pub fn unregister(&self, request_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(request_id);
    }

    /// Flag a single request as canceled.
    pub fn cancel(&self, request_id: &str) {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = map.get(request_id) {
            handle.cancel();
        }
    }

    /// Flag every id in the set; used on transport disconnect.
    pub fn cancel_all<'a>(&self, request_ids: impl IntoIterator<Item = &'a String>) {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for id in request_ids {
            if let Some(handle) = map.get(id) {
                handle.cancel();
            }
        }
    }

    /// Whether a request id is still registered (in flight).
    pub fn contains(&self, request_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(request_id)
    }

    /// Number of requests still registered.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_cancel() {
        let registry = CancelRegistry::new();
        let handle = registry.register("r-1");
        assert!(!handle.is_canceled());

        registry.cancel("r-1");
        assert!(handle.is_canceled());
    }

    #[test]
    fn test_cancel_unknown_id_is_noop() {
        let registry = CancelRegistry::new();
        registry.cancel("missing");
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_reregister_keeps_existing_flag() {
        let registry = CancelRegistry::new();
        let first = registry.register("r-1");
        registry.cancel("r-1");
        let second = registry.register("r-1");
        assert!(first.is_canceled());
        assert!(second.is_canceled());
    }

    #[test]
    fn test_unregister_removes_entry() {
        let registry = CancelRegistry::new();
        registry.register("r-1");
        assert_eq!(registry.in_flight(), 1);
        registry.unregister("r-1");
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_cancel_all() {
        let registry = CancelRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");
        let c = registry.register("c");

        let ids = vec!["a".to_string(), "b".to_string()];
        registry.cancel_all(ids.iter());

        assert!(a.is_canceled());
        assert!(b.is_canceled());
        assert!(!c.is_canceled());
    }

    #[test]
    fn test_handle_shared_across_clones() {
        let registry = CancelRegistry::new();
        let handle = registry.register("r-1");
        let clone = handle.clone();
        registry.cancel("r-1");
        assert!(clone.is_canceled());
    }
}
