//! Thread-safe registry of prepared statement handles keyed by query text.
//!
//! Lookups take a shared lock and never block each other. `save` and `close_all` take
//! the exclusive lock for the duration of the map mutation only; any I/O a caller does
//! with a returned handle happens outside the lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// A statement handle the cache can retire.
pub trait StatementHandle: Send + Sync {
    /// Release the handle. Called at most once by the cache, during `close_all`.
    fn close(&self);
}

/// Registry of statement handles.
pub struct StatementCache<H: StatementHandle> {
    entries: RwLock<HashMap<String, Arc<H>>>,
}

impl<H: StatementHandle> Default for StatementCache<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: StatementHandle> StatementCache<H> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Look up the handle for `key`. A miss means the caller should prepare and save one.
    pub fn get(&self, key: &str) -> Option<Arc<H>> {
        self.entries.read().get(key).cloned()
    }

    /// Insert or replace the handle for `key`, or remove it when `handle` is `None`.
    ///
    /// Returns the displaced handle. The cache does not close it; ownership of that
    /// handle passes back to the caller.
    pub fn save(&self, key: impl Into<String>, handle: Option<Arc<H>>) -> Option<Arc<H>> {
        let key = key.into();
        let mut entries = self.entries.write();
        match handle {
            Some(handle) => entries.insert(key, handle),
            None => entries.remove(&key),
        }
    }

    /// Close every cached handle once and empty the registry.
    ///
    /// Returns how many handles were closed.
    pub fn close_all(&self) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        for (_, handle) in entries.drain() {
            handle.close();
        }
        count
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Cached query texts.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

/// Pool-bound prepared statement.
///
/// The handle records the pool generation it was prepared against. Each connection
/// prepares the text lazily and keeps the server-side plan in its own statement cache,
/// so one handle serves every connection in the pool. A handle from an earlier pool, or
/// one that was closed, is rejected with a connection error.
#[derive(Debug)]
pub struct PreparedStatement {
    id: Uuid,
    sql: String,
    generation: u64,
    closed: AtomicBool,
}

impl PreparedStatement {
    pub(crate) fn new(sql: impl Into<String>, generation: u64) -> Self {
        Self { id: Uuid::new_v4(), sql: sql.into(), generation, closed: AtomicBool::new(false) }
    }

    /// Unique handle identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Pool generation this handle is bound to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check if the handle was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail unless the handle is open and bound to `generation`.
    pub(crate) fn ensure_usable(&self, generation: u64) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::connection("Prepared statement has been closed"));
        }
        if self.generation != generation {
            return Err(DbError::connection(
                "Prepared statement belongs to a pool that has been closed",
            ));
        }
        Ok(())
    }
}

impl StatementHandle for PreparedStatement {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::trace!(statement_id = %self.id, "Prepared statement closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandle {
        closes: AtomicUsize,
    }

    impl StatementHandle for CountingHandle {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle() -> Arc<CountingHandle> {
        Arc::new(CountingHandle::default())
    }

    #[test]
    fn test_save_then_get() {
        let cache = StatementCache::new();
        let h = handle();

        assert!(cache.get("q1").is_none());
        assert!(cache.save("q1", Some(h.clone())).is_none());

        let got = cache.get("q1").unwrap();
        assert!(Arc::ptr_eq(&got, &h));
    }

    #[test]
    fn test_save_none_removes() {
        let cache = StatementCache::new();
        let h = handle();
        cache.save("q1", Some(h.clone()));

        let removed = cache.save("q1", None).unwrap();
        assert!(Arc::ptr_eq(&removed, &h));
        assert!(cache.get("q1").is_none());
        assert_eq!(h.closes.load(Ordering::SeqCst), 0);

        // removing an absent key is a no-op
        assert!(cache.save("q1", None).is_none());
    }

    #[test]
    fn test_replace_returns_previous_without_closing() {
        let cache = StatementCache::new();
        let first = handle();
        let second = handle();

        cache.save("q1", Some(first.clone()));
        let displaced = cache.save("q1", Some(second.clone())).unwrap();

        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(Arc::ptr_eq(&cache.get("q1").unwrap(), &second));
        assert_eq!(first.closes.load(Ordering::SeqCst), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_close_all_closes_each_once() {
        for size in [0usize, 1, 25] {
            let cache = StatementCache::new();
            let handles: Vec<_> = (0..size).map(|_| handle()).collect();
            for (i, h) in handles.iter().enumerate() {
                cache.save(format!("select {i}"), Some(h.clone()));
            }

            assert_eq!(cache.close_all(), size);
            assert!(cache.is_empty());
            for h in &handles {
                assert_eq!(h.closes.load(Ordering::SeqCst), 1);
            }

            // a second eviction finds nothing to close
            assert_eq!(cache.close_all(), 0);
            for h in &handles {
                assert_eq!(h.closes.load(Ordering::SeqCst), 1);
            }
        }
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(StatementCache::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("select {}", i % 10);
                        if t % 2 == 0 {
                            cache.save(key, Some(handle()));
                        } else {
                            let _ = cache.get(&key);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(cache.len(), 10);
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys.first().map(String::as_str), Some("select 0"));
    }

    #[test]
    fn test_prepared_statement_close_is_idempotent() {
        let stmt = PreparedStatement::new("select 1", 3);
        assert!(stmt.ensure_usable(3).is_ok());
        assert!(stmt.ensure_usable(4).unwrap_err().is_connection_error());

        stmt.close();
        stmt.close();
        assert!(stmt.is_closed());
        assert!(stmt.ensure_usable(3).is_err());
    }

    #[test]
    fn test_close_all_marks_prepared_statements_closed() {
        let cache = StatementCache::new();
        let stmt = Arc::new(PreparedStatement::new("select 1", 1));
        cache.save(stmt.sql().to_string(), Some(stmt.clone()));

        assert_eq!(cache.close_all(), 1);
        assert!(stmt.is_closed());
    }
}
