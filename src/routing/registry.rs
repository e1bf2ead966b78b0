//! Handler registry.
//!
//! # Responsibilities
//! - Map signatures to handlers
//! - Resolve a request path to a handler
//!
//! # Design Decisions
//! - Readers take a snapshot (`Arc`) and release the lock before processing,
//!   so handlers may register or deregister others while serving
//! - Exact signature first; then recursive handlers whose signature prefixes
//!   the path, scanned in descending order so the longest prefix wins

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::handler::Handler;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`. Returns false if its signature is already taken.
    pub fn register(&self, handler: Arc<dyn Handler>) -> bool {
        let signature = handler.meta().signature().to_string();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&signature) {
            tracing::warn!(signature = %signature, "Handler already registered for signature");
            return false;
        }
        tracing::debug!(
            signature = %signature,
            name = %handler.meta().name(),
            recursive = handler.meta().is_recursive(),
            "Handler registered"
        );
        handlers.insert(signature, handler);
        true
    }

    pub fn deregister(&self, signature: &str) -> Option<Arc<dyn Handler>> {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(signature);
        if removed.is_some() {
            tracing::debug!(signature = %signature, "Handler deregistered");
        }
        removed
    }

    /// Resolve `path` (whose signature is `signature`) to a handler.
    pub fn lookup(&self, path: &str, signature: &str) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = handlers.get(signature) {
            return Some(Arc::clone(handler));
        }
        handlers
            .iter()
            .rev()
            .find(|(sig, h)| h.meta().is_recursive() && path.starts_with(sig.as_str()))
            .map(|(_, h)| Arc::clone(h))
    }

    /// Exact-signature lookup.
    pub fn get(&self, signature: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(signature)
            .cloned()
    }

    /// All handlers, ordered by signature.
    pub fn snapshot(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServerContext;
    use crate::http::Request;
    use crate::routing::HandlerMeta;

    struct Named(HandlerMeta);

    impl Handler for Named {
        fn meta(&self) -> &HandlerMeta {
            &self.0
        }
        fn process(&self, _: &ServerContext, _: &mut Request) {}
    }

    fn named(sig: &str, recursive: bool) -> Arc<dyn Handler> {
        let meta = HandlerMeta::new(sig, sig);
        Arc::new(Named(if recursive { meta.recursive() } else { meta }))
    }

    #[test]
    fn exact_then_longest_recursive_prefix() {
        let registry = HandlerRegistry::new();
        assert!(registry.register(named("/files/", true)));
        assert!(registry.register(named("/files/deep/", true)));
        assert!(registry.register(named("/files/deep/exact/", false)));

        let hit = registry.lookup("/files/deep/exact/x", "/files/deep/exact/").unwrap();
        assert_eq!(hit.meta().signature(), "/files/deep/exact/");

        let hit = registry.lookup("/files/deep/a/b/c", "/files/deep/a/b/").unwrap();
        assert_eq!(hit.meta().signature(), "/files/deep/");

        let hit = registry.lookup("/files/other/c", "/files/other/").unwrap();
        assert_eq!(hit.meta().signature(), "/files/");
    }

    #[test]
    fn services_prefix_catches_unregistered_paths() {
        let registry = HandlerRegistry::new();
        registry.register(named("/services/", true));
        registry.register(named("/services/network/", false));

        let hit = registry.lookup("/services/unknown/deep/Thing", "/services/unknown/deep/").unwrap();
        assert_eq!(hit.meta().signature(), "/services/");
        let hit = registry.lookup("/services/network/GetUuid", "/services/network/").unwrap();
        assert_eq!(hit.meta().signature(), "/services/network/");
        assert!(registry.lookup("/other/Thing", "/other/").is_none());
    }

    #[test]
    fn miss_without_recursive_match() {
        let registry = HandlerRegistry::new();
        registry.register(named("/services/", false));
        assert!(registry.lookup("/services/a/b", "/services/a/").is_none());
    }

    #[test]
    fn duplicate_and_deregister() {
        let registry = HandlerRegistry::new();
        assert!(registry.register(named("/a/", false)));
        assert!(!registry.register(named("/a/", true)));
        assert!(registry.deregister("/a/").is_some());
        assert!(registry.is_empty());
    }
}
