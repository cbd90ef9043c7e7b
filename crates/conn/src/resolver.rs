//! Service-name resolution.
//!
//! Deployments that address peers by service name rather than `host:port`
//! plug a resolver in here. The pipeline only needs the one operation:
//! turn a name into candidate endpoints.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Resolves a service name to candidate `(host, port)` endpoints.
pub trait ServiceResolver: Send + Sync {
    /// Endpoints for `service`, in preference order. Empty means unknown.
    fn resolve(&self, service: &str) -> Vec<(String, u16)>;
}

/// Resolver that knows nothing. The default when no discovery is wired up.
#[derive(Debug, Default)]
pub struct NullResolver;

impl ServiceResolver for NullResolver {
    fn resolve(&self, _service: &str) -> Vec<(String, u16)> {
        Vec::new()
    }
}

/// Fixed registry of service endpoints.
///
/// Useful for static deployments and tests; entries can be registered after
/// the resolver has been shared.
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: RwLock<HashMap<String, Vec<(String, u16)>>>,
}

impl StaticResolver {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the endpoints for a service
    pub fn register(&self, service: impl Into<String>, endpoints: Vec<(String, u16)>) {
        self.entries.write().insert(service.into(), endpoints);
    }
}

impl ServiceResolver for StaticResolver {
    fn resolve(&self, service: &str) -> Vec<(String, u16)> {
        self.entries.read().get(service).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_resolver_resolves_nothing() {
        assert!(NullResolver.resolve("anything").is_empty());
    }

    #[test]
    fn static_resolver_roundtrip() {
        let resolver = StaticResolver::new();
        resolver.register("logs-tier", vec![("10.0.0.1".into(), 1463)]);

        assert_eq!(
            resolver.resolve("logs-tier"),
            vec![("10.0.0.1".to_string(), 1463)]
        );
        assert!(resolver.resolve("unknown").is_empty());
    }

    #[test]
    fn static_resolver_replaces_entries() {
        let resolver = StaticResolver::new();
        resolver.register("tier", vec![("a".into(), 1)]);
        resolver.register("tier", vec![("b".into(), 2)]);

        assert_eq!(resolver.resolve("tier"), vec![("b".to_string(), 2)]);
    }
}
