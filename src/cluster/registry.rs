//! Domain → handler registry consulted by the state machine.
//!
//! Built-in domains are registered at startup by
//! [`crate::cluster::domains::register_defaults`]; additional domains can be
//! plugged in through the same [`CommandHandler`] trait before the consensus
//! core starts applying entries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rusqlite::Connection;

use super::command::Domain;

/// A mutation function for one domain.
///
/// Handlers run inside the state machine's transaction and must be
/// deterministic: the same `(action, payload)` applied to the same table
/// contents must produce the same rows on every replica.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, conn: &Connection, action: &str, payload: &[u8]) -> anyhow::Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Connection, &str, &[u8]) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, conn: &Connection, action: &str, payload: &[u8]) -> anyhow::Result<()> {
        self(conn, action, payload)
    }
}

/// Read-mostly map from domain name to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `domain`. The last registration wins.
    pub fn register(&self, domain: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let domain = domain.into();
        tracing::debug!(domain = %domain, "registering command handler");
        self.handlers
            .write()
            .expect("registry lock poisoned")
            .insert(domain, handler);
    }

    pub fn register_domain(&self, domain: Domain, handler: Arc<dyn CommandHandler>) {
        self.register(domain.as_str(), handler);
    }

    pub fn lookup(&self, domain: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .get(domain)
            .cloned()
    }

    /// Registered domain names, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lookup_unregistered_domain() {
        let registry = HandlerRegistry::new();
        assert!(registry.lookup("note").is_none());
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = HandlerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        registry.register(
            "custom",
            Arc::new(move |_: &Connection, _: &str, _: &[u8]| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let counter = second.clone();
        registry.register(
            "custom",
            Arc::new(move |_: &Connection, _: &str, _: &[u8]| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let conn = Connection::open_in_memory().unwrap();
        registry
            .lookup("custom")
            .unwrap()
            .handle(&conn, "create", b"{}")
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(registry.domains(), vec!["custom".to_string()]);
    }
}
