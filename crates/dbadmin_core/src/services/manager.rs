//! Connection lifecycle and query routing.
//!
//! A [`ConnectionManager`] owns one pool at a time together with the statement cache
//! bound to it. It is `Send + Sync`; share it by reference or behind an `Arc`.
//!
//! # Setup
//!
//! `setup` dials at most once per disconnected period no matter how many callers race
//! on it. Callers that queue behind a failed dial for the same locality adopt its outcome
//! instead of dialing again; a caller for the other locality, or one that finds the
//! manager disconnected again after a successful dial, runs its own dial.
//!
//! # Maintenance
//!
//! [`ConnectionManager::optimize`] runs `VACUUM ANALYZE`, which can hold a connection and
//! server I/O for a long time. Run it from a scheduled job, never from a request path.
//! Only one maintenance command runs per manager; a concurrent call is rejected with
//! [`DbError::MaintenanceInProgress`].

use crate::classify::{Dialect, ErrorClassifier};
use crate::config::{redact_dial_string, ConfigSource, ConnectionSettings};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionState, PoolStats};
use crate::services::connection::{ConnectionPool, PooledConnection};
use crate::services::statements::{PreparedStatement, StatementCache, StatementHandle};
use crate::tls::{build_mutual_tls, TlsConfigError};

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use uuid::Uuid;

/// Maintenance command issued by `optimize`.
pub const MAINTENANCE_COMMAND: &str = "VACUUM ANALYZE";

/// Outcome of the most recent dial, kept only while it is a failure.
#[derive(Debug, Clone)]
struct FailedDial {
    local: bool,
    tls: Option<TlsConfigError>,
}

/// Owns the pool, its lifecycle state and the statement cache.
pub struct ConnectionManager {
    id: Uuid,
    settings: ConnectionSettings,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
    statements: StatementCache<PreparedStatement>,
    dial_lock: tokio::sync::Mutex<()>,
    dial_attempts: AtomicU64,
    generation: AtomicU64,
    last_failure: Mutex<Option<FailedDial>>,
    maintenance: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Create a disconnected manager.
    pub fn new(settings: ConnectionSettings) -> DbResult<Self> {
        settings.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            settings,
            pool: RwLock::new(None),
            statements: StatementCache::new(),
            dial_lock: tokio::sync::Mutex::new(()),
            dial_attempts: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            maintenance: tokio::sync::Mutex::new(()),
        })
    }

    /// Create a disconnected manager from a configuration source.
    pub fn from_source(source: &dyn ConfigSource) -> DbResult<Self> {
        Self::new(ConnectionSettings::from_source(source)?)
    }

    /// Manager identifier used in log events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Settings this manager dials with.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Error classifier for this manager's store.
    pub fn classifier(&self) -> ErrorClassifier {
        ErrorClassifier::new(Dialect::Postgres)
    }

    // ========== Lifecycle ==========

    /// Connect if not already connected.
    ///
    /// Returns `Ok(true)` when connected (immediately, without side effects, if a pool
    /// is already open) and `Ok(false)` when the dial or liveness probe failed; the
    /// failure is logged and the manager stays disconnected, so a later retry is fine.
    ///
    /// Unusable TLS material is returned as `Err(DbError::Tls)` and logged as fatal.
    /// The embedding process should stop rather than run without the secured channel it
    /// was configured to require.
    pub async fn setup(&self, local: bool) -> DbResult<bool> {
        if self.is_connected() {
            return Ok(true);
        }

        let seen = self.dial_attempts.load(Ordering::Acquire);
        let _dial = self.dial_lock.lock().await;

        if self.is_connected() {
            return Ok(true);
        }
        if let Some(outcome) = self.queued_outcome(seen, local) {
            return outcome;
        }

        let outcome = self.dial(local).await;
        let connected = match outcome {
            Ok(pool) => {
                tracing::info!(
                    manager_id = %self.id,
                    generation = pool.generation(),
                    max_pool_size = self.settings.max_pool_size,
                    "Connection pool created successfully"
                );
                *self.last_failure.lock() = None;
                *self.pool.write() = Some(Arc::new(pool));
                Ok(true)
            }
            Err(DbError::Tls(e)) => {
                tracing::error!(manager_id = %self.id, fatal = true, error = %e, "TLS configuration failed");
                *self.last_failure.lock() = Some(FailedDial { local, tls: Some(e.clone()) });
                Err(DbError::Tls(e))
            }
            Err(e) => {
                tracing::error!(
                    manager_id = %self.id,
                    dial = %redact_dial_string(self.settings.dial_string_for(local)),
                    error = %e,
                    "Failed to connect"
                );
                *self.last_failure.lock() = Some(FailedDial { local, tls: None });
                Ok(false)
            }
        };
        self.dial_attempts.fetch_add(1, Ordering::AcqRel);
        connected
    }

    /// Outcome to adopt for a caller that queued behind another dial.
    ///
    /// Only a failed dial for the same locality that finished after the caller arrived
    /// is adopted. `None` means the caller must dial itself.
    fn queued_outcome(&self, seen: u64, local: bool) -> Option<DbResult<bool>> {
        if self.dial_attempts.load(Ordering::Acquire) == seen {
            return None;
        }
        let failure = self.last_failure.lock().clone()?;
        if failure.local != local {
            return None;
        }
        Some(match failure.tls {
            Some(e) => Err(DbError::Tls(e)),
            None => Ok(false),
        })
    }

    /// Hold the dial lock so `setup` callers queue behind it.
    #[cfg(test)]
    pub(crate) async fn hold_dial_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.dial_lock.lock().await
    }

    async fn dial(&self, local: bool) -> DbResult<ConnectionPool> {
        let dial = self.settings.dial_string_for(local);

        let tls = if self.settings.tls_enabled(local) {
            tracing::info!(manager_id = %self.id, "Configuring TLS...");
            let material = self.settings.tls_material()?;
            Some(build_mutual_tls(&material)?)
        } else {
            None
        };

        if dial.is_empty() {
            return Err(DbError::connection(format!(
                "No dial string configured for {} connections",
                if local { "local" } else { "production" }
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        ConnectionPool::open(dial, &self.settings, tls, generation).await
    }

    /// Check if a pool is open. Never blocks on a running dial.
    pub fn is_connected(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Number of dial sequences run so far.
    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts.load(Ordering::Acquire)
    }

    /// Release the pool and invalidate cached statements.
    ///
    /// No-op when disconnected. In-flight operations keep their checked-out connection
    /// until they finish; new operations fail with a connection error.
    pub fn close(&self) {
        let Some(pool) = self.pool.write().take() else {
            return;
        };
        pool.close();
        let closed_statements = self.statements.close_all();
        tracing::info!(
            manager_id = %self.id,
            generation = pool.generation(),
            closed_statements,
            "Connection pool closed"
        );
    }

    fn current_pool(&self) -> DbResult<Arc<ConnectionPool>> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| DbError::connection("Not connected. Call setup first"))
    }

    // ========== Queries ==========

    /// Check out a connection for scoped use, e.g. a transaction.
    ///
    /// The connection returns to the pool when the guard is dropped.
    pub async fn checkout(&self) -> DbResult<PooledConnection> {
        self.current_pool()?.get().await
    }

    /// Execute a query that returns rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> DbResult<Vec<Row>> {
        let conn = self.checkout().await?;
        if self.settings.explicit_prepare {
            let handle = self.statement_handle(sql, conn.generation());
            let statement = conn.prepare_cached(handle.sql()).await?;
            conn.query(&statement, params).await
        } else {
            conn.query(sql, params).await
        }
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> DbResult<u64> {
        let conn = self.checkout().await?;
        if self.settings.explicit_prepare {
            let handle = self.statement_handle(sql, conn.generation());
            let statement = conn.prepare_cached(handle.sql()).await?;
            conn.execute(&statement, params).await
        } else {
            conn.execute(sql, params).await
        }
    }

    /// Execute a query returning a single integer, such as `SELECT count(*) ...`.
    ///
    /// Errors are returned, never replaced by zero. A query that yields no row is a
    /// query error.
    pub async fn get_count(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> DbResult<i64> {
        let rows = self.query(sql, params).await?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::query("Count query returned no rows", None, None, None, None))?;
        scalar_to_count(row)
    }

    // ========== Prepared statements ==========

    /// Get or prepare a pool-bound handle for `sql`.
    ///
    /// The text is validated by the server on first use. The handle is cached and
    /// reused until the pool is closed or [`Self::close_prepared_statements`] runs.
    pub async fn prepare(&self, sql: &str) -> DbResult<Arc<PreparedStatement>> {
        let conn = self.checkout().await?;
        conn.prepare_cached(sql).await?;
        Ok(self.statement_handle(sql, conn.generation()))
    }

    /// Run a prepared query.
    pub async fn query_prepared(
        &self,
        statement: &PreparedStatement,
        params: &[&(dyn ToSql + Sync)],
    ) -> DbResult<Vec<Row>> {
        let conn = self.checkout().await?;
        statement.ensure_usable(conn.generation())?;
        let prepared = conn.prepare_cached(statement.sql()).await?;
        conn.query(&prepared, params).await
    }

    /// Run a prepared statement, returning the number of rows affected.
    pub async fn execute_prepared(
        &self,
        statement: &PreparedStatement,
        params: &[&(dyn ToSql + Sync)],
    ) -> DbResult<u64> {
        let conn = self.checkout().await?;
        statement.ensure_usable(conn.generation())?;
        let prepared = conn.prepare_cached(statement.sql()).await?;
        conn.execute(&prepared, params).await
    }

    /// The manager's statement cache.
    pub fn statements(&self) -> &StatementCache<PreparedStatement> {
        &self.statements
    }

    /// Close all cached statements without dropping the pool, e.g. after a schema change.
    ///
    /// Every pooled connection also drops its cached plans, so the next execution of any
    /// statement is prepared against the current schema.
    pub fn close_prepared_statements(&self) -> usize {
        let closed = self.statements.close_all();
        if let Some(pool) = self.pool.read().clone() {
            pool.clear_statement_caches();
        }
        tracing::debug!(manager_id = %self.id, closed, "Prepared statements closed");
        closed
    }

    fn statement_handle(&self, sql: &str, generation: u64) -> Arc<PreparedStatement> {
        if let Some(handle) = self.statements.get(sql) {
            if handle.generation() == generation && !handle.is_closed() {
                return handle;
            }
        }

        let handle = Arc::new(PreparedStatement::new(sql, generation));
        if let Some(displaced) = self.statements.save(sql, Some(handle.clone())) {
            // Handles from an older pool are dead; a same-generation one lost a race
            // and stays usable for whoever still holds it
            if displaced.generation() != generation {
                displaced.close();
            }
        }
        handle
    }

    // ========== Introspection & maintenance ==========

    /// Pool statistics. All counts are zero when disconnected.
    pub fn stats(&self) -> PoolStats {
        match self.pool.read().as_ref() {
            Some(pool) => pool.stats(),
            None => PoolStats::disconnected(self.settings.max_pool_size),
        }
    }

    /// Reclaim space and refresh planner statistics with `VACUUM ANALYZE`.
    ///
    /// Long-running and resource intensive: call it out of the request path. Returns
    /// [`DbError::MaintenanceInProgress`] if another call on this manager is running.
    pub async fn optimize(&self) -> DbResult<()> {
        let _maintenance = self
            .maintenance
            .try_lock()
            .map_err(|_| DbError::MaintenanceInProgress)?;
        let conn = self.checkout().await?;

        tracing::info!(manager_id = %self.id, "Running maintenance");
        let started = std::time::Instant::now();
        // VACUUM refuses to run inside a transaction block, so use the simple protocol
        conn.batch_execute(MAINTENANCE_COMMAND).await?;
        tracing::info!(
            manager_id = %self.id,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Maintenance completed"
        );
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("max_pool_size", &self.settings.max_pool_size)
            .field("cached_statements", &self.statements.len())
            .finish()
    }
}

/// Read the first column of `row` as an integer count.
fn scalar_to_count(row: &Row) -> DbResult<i64> {
    if let Ok(value) = row.try_get::<_, i64>(0) {
        return Ok(value);
    }
    if let Ok(value) = row.try_get::<_, i32>(0) {
        return Ok(i64::from(value));
    }
    row.try_get::<_, i16>(0).map(i64::from).map_err(DbError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use futures_util::future::join_all;

    /// Nothing listens on port 1; connections are refused right away.
    const UNREACHABLE: &str = "host=127.0.0.1 port=1 user=nobody dbname=nothing connect_timeout=2";

    fn unreachable_manager() -> ConnectionManager {
        let settings = ConnectionSettings::new(UNREACHABLE).without_tls().with_connect_timeout_secs(2);
        ConnectionManager::new(settings).unwrap()
    }

    #[test]
    fn test_new_manager_is_disconnected() {
        let manager = unreachable_manager();
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.dial_attempts(), 0);
    }

    #[test]
    fn test_new_rejects_zero_pool_size() {
        let settings = ConnectionSettings::new(UNREACHABLE).with_max_pool_size(0);
        assert!(matches!(ConnectionManager::new(settings), Err(DbError::Config { .. })));
    }

    #[test]
    fn test_from_source() {
        let source = MapConfig::new().with("CLOUDSQL", UNREACHABLE).with("DB_MAX_POOL_SIZE", 20);
        let manager = ConnectionManager::from_source(&source).unwrap();
        assert_eq!(manager.stats().max_pool_size, 20);
    }

    #[test]
    fn test_close_when_disconnected_is_noop() {
        let manager = unreachable_manager();
        manager.close();
        manager.close();
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_operations_while_disconnected_fail_fast() {
        let manager = unreachable_manager();

        assert!(manager.query("select 1", &[]).await.unwrap_err().is_connection_error());
        assert!(manager.execute("select 1", &[]).await.unwrap_err().is_connection_error());
        assert!(manager.get_count("select 39", &[]).await.unwrap_err().is_connection_error());
        assert!(manager.prepare("select 1").await.unwrap_err().is_connection_error());
        assert!(manager.optimize().await.unwrap_err().is_connection_error());
        assert!(manager.checkout().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_setup_stays_disconnected() {
        let manager = unreachable_manager();

        assert!(!manager.setup(false).await.unwrap());
        assert!(!manager.is_connected());
        assert_eq!(manager.dial_attempts(), 1);

        // callers may retry later; each retry is a fresh dial
        assert!(!manager.setup(false).await.unwrap());
        assert_eq!(manager.dial_attempts(), 2);
    }

    #[tokio::test]
    async fn test_missing_dial_string_is_connection_failure() {
        let manager = ConnectionManager::new(ConnectionSettings::default()).unwrap();
        assert!(!manager.setup(false).await.unwrap());
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_missing_tls_material_is_fatal() {
        let settings = ConnectionSettings::new(UNREACHABLE);
        let manager = ConnectionManager::new(settings).unwrap();

        let err = manager.setup(true).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, DbError::Tls(TlsConfigError::MissingPath { .. })));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_queued_callers_adopt_only_same_locality_failures() {
        // no TLS material: local dials fail fatally, production dials are refused
        let manager = ConnectionManager::new(ConnectionSettings::new(UNREACHABLE)).unwrap();

        let gate = manager.hold_dial_lock().await;
        let release = async move {
            tokio::task::yield_now().await;
            drop(gate);
        };
        let callers = join_all([true, true, false, false].map(|local| manager.setup(local)));
        let ((), results) = tokio::join!(release, callers);

        let mut results = results.into_iter();
        assert!(results.next().unwrap().unwrap_err().is_fatal());
        assert!(results.next().unwrap().unwrap_err().is_fatal());
        assert!(!results.next().unwrap().unwrap());
        assert!(!results.next().unwrap().unwrap());
        assert_eq!(manager.dial_attempts(), 2);
    }

    #[tokio::test]
    async fn test_production_caller_queued_behind_tls_failure_dials() {
        let manager = ConnectionManager::new(ConnectionSettings::new(UNREACHABLE)).unwrap();

        let gate = manager.hold_dial_lock().await;
        let release = async move {
            tokio::task::yield_now().await;
            drop(gate);
        };
        let callers = join_all([true, false].map(|local| manager.setup(local)));
        let ((), results) = tokio::join!(release, callers);

        let mut results = results.into_iter();
        assert!(matches!(results.next().unwrap(), Err(DbError::Tls(_))));
        assert!(!results.next().unwrap().unwrap());
        assert_eq!(manager.dial_attempts(), 2);
    }

    #[test]
    fn test_queued_outcome() {
        let manager = unreachable_manager();

        // no dial finished since the caller arrived
        assert!(manager.queued_outcome(0, false).is_none());

        // a dial finished and left no failure behind: it connected, and the pool has
        // been closed again since, so the caller must dial itself
        manager.dial_attempts.store(1, Ordering::Release);
        assert!(manager.queued_outcome(0, false).is_none());

        *manager.last_failure.lock() = Some(FailedDial { local: false, tls: None });
        assert!(matches!(manager.queued_outcome(0, false), Some(Ok(false))));
        assert!(manager.queued_outcome(0, true).is_none());
        assert!(manager.queued_outcome(1, false).is_none());

        *manager.last_failure.lock() =
            Some(FailedDial { local: true, tls: Some(TlsConfigError::missing("client key")) });
        assert!(matches!(manager.queued_outcome(0, true), Some(Err(DbError::Tls(_)))));
        assert!(manager.queued_outcome(0, false).is_none());
    }

    #[tokio::test]
    async fn test_stats_when_disconnected() {
        let manager = unreachable_manager();
        let stats = manager.stats();
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.max_pool_size, crate::config::DEFAULT_MAX_POOL_SIZE);
    }

    #[test]
    fn test_statement_handle_reuse_and_generation_rollover() {
        let manager = unreachable_manager();

        let first = manager.statement_handle("select 1", 1);
        let again = manager.statement_handle("select 1", 1);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(manager.statements().len(), 1);

        // a handle from an older pool is replaced and closed
        let newer = manager.statement_handle("select 1", 2);
        assert!(!Arc::ptr_eq(&first, &newer));
        assert!(first.is_closed());
        assert!(!newer.is_closed());

        assert_eq!(manager.close_prepared_statements(), 1);
        assert!(newer.is_closed());
        assert!(manager.statements().is_empty());
    }
}
