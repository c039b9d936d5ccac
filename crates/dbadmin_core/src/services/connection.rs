//! Database connection pooling with deadpool-postgres.
//!
//! Provides:
//! - Liveness probe on pool creation
//! - Pool statistics including wait accounting
//! - Bounded checkout with a configurable wait timeout
//! - RAII connection and transaction guards

use crate::config::ConnectionSettings;
use crate::error::{DbError, DbResult};
use crate::models::PoolStats;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use postgres_native_tls::MakeTlsConnector;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row, Statement, ToStatement};

/// Query used to probe a freshly opened pool.
pub const LIVENESS_QUERY: &str = "SELECT 1";

/// A bounded pool of store connections.
///
/// Each pool carries the generation number the manager assigned when it was opened;
/// prepared statement handles are bound to it.
pub struct ConnectionPool {
    pool: Pool,
    generation: u64,
    created_at: DateTime<Utc>,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
}

impl ConnectionPool {
    /// Open a pool for `dial` and verify it with a liveness probe.
    pub async fn open(
        dial: &str,
        settings: &ConnectionSettings,
        tls: Option<MakeTlsConnector>,
        generation: u64,
    ) -> DbResult<Self> {
        let connect_timeout = settings.connect_timeout();

        let mut pg_config: tokio_postgres::Config = dial
            .parse()
            .map_err(|e| DbError::connection_with_source("Invalid dial string", e))?;
        pg_config.connect_timeout(connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Fast };
        let manager = match tls {
            Some(tls) => Manager::from_config(pg_config, tls, manager_config),
            None => Manager::from_config(pg_config, NoTls, manager_config),
        };

        let pool = Pool::builder(manager)
            .max_size(settings.max_pool_size)
            .wait_timeout(Some(settings.wait_timeout()))
            .create_timeout(Some(connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DbError::connection(format!("Failed to create pool: {e}")))?;

        // Liveness probe; the pool itself dials lazily
        let client = pool
            .get()
            .await
            .map_err(|e| DbError::connection_with_source("Failed to establish connection", e))?;
        if let Err(e) = client.simple_query(LIVENESS_QUERY).await {
            drop(client);
            pool.close();
            return Err(DbError::connection_with_source("Liveness probe failed", e));
        }
        drop(client);

        Ok(Self {
            pool,
            generation,
            created_at: Utc::now(),
            wait_count: AtomicU64::new(0),
            wait_nanos: AtomicU64::new(0),
        })
    }

    /// Generation number assigned by the manager.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Get when this pool was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire a connection from the pool.
    ///
    /// Waits up to the configured timeout if the pool is saturated.
    pub async fn get(&self) -> DbResult<PooledConnection> {
        let status = self.pool.status();
        let saturated = status.available == 0 && status.size >= status.max_size;
        let started = Instant::now();

        let result = self.pool.get().await;

        if saturated {
            self.wait_count.fetch_add(1, Ordering::Relaxed);
            let waited = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.wait_nanos.fetch_add(waited, Ordering::Relaxed);
        }

        let client = result.map_err(|e| match e {
            PoolError::Timeout(_) => {
                let waiting = self.pool.status().waiting;
                tracing::warn!(waiting, generation = self.generation, "Pool exhausted after timeout");
                DbError::pool_timeout(format!("Pool exhausted after timeout: {e}"), waiting)
            }
            other => DbError::from(other),
        })?;

        Ok(PooledConnection { client, generation: self.generation })
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            open_connections: status.size,
            in_use: status.size.saturating_sub(status.available),
            idle: status.available,
            wait_count: self.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed)),
            max_pool_size: status.max_size,
            connected_at: Some(self.created_at),
        }
    }

    /// Drop every connection's cached statements.
    ///
    /// The next `prepare_cached` on each connection prepares the text again, picking up
    /// schema changes made since the plan was cached.
    pub fn clear_statement_caches(&self) {
        self.pool.manager().statement_caches.clear();
        tracing::debug!(generation = self.generation, "Connection statement caches cleared");
    }

    /// Close the pool. Idle connections are dropped now, checked-out ones on return.
    pub fn close(&self) {
        self.pool.close();
        tracing::debug!(generation = self.generation, "Connection pool closed");
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// A connection checked out of the pool.
///
/// Automatically returns to the pool when dropped, including on error and
/// cancellation paths.
pub struct PooledConnection {
    client: deadpool_postgres::Client,
    generation: u64,
}

impl PooledConnection {
    /// Generation of the pool this connection came from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Execute a query that returns rows.
    pub async fn query<T>(&self, statement: &T, params: &[&(dyn ToSql + Sync)]) -> DbResult<Vec<Row>>
    where
        T: ?Sized + ToStatement,
    {
        self.client.query(statement, params).await.map_err(DbError::from)
    }

    /// Execute a query that returns at most one row.
    pub async fn query_opt<T>(
        &self,
        statement: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> DbResult<Option<Row>>
    where
        T: ?Sized + ToStatement,
    {
        self.client.query_opt(statement, params).await.map_err(DbError::from)
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute<T>(&self, statement: &T, params: &[&(dyn ToSql + Sync)]) -> DbResult<u64>
    where
        T: ?Sized + ToStatement,
    {
        self.client.execute(statement, params).await.map_err(DbError::from)
    }

    /// Run one or more statements over the simple-query protocol.
    pub async fn batch_execute(&self, sql: &str) -> DbResult<()> {
        self.client.batch_execute(sql).await.map_err(DbError::from)
    }

    /// Prepare `sql` on this connection, reusing the connection's cached plan.
    pub async fn prepare_cached(&self, sql: &str) -> DbResult<Statement> {
        self.client.prepare_cached(sql).await.map_err(DbError::from)
    }

    /// Begin a transaction.
    pub async fn transaction(&mut self) -> DbResult<Transaction<'_>> {
        let txn = self.client.transaction().await.map_err(DbError::from)?;
        Ok(Transaction { txn })
    }
}

/// A database transaction.
///
/// Automatically rolls back on drop unless committed.
pub struct Transaction<'a> {
    txn: deadpool_postgres::Transaction<'a>,
}

impl<'a> Transaction<'a> {
    /// Execute a query within the transaction.
    pub async fn query<T>(&self, statement: &T, params: &[&(dyn ToSql + Sync)]) -> DbResult<Vec<Row>>
    where
        T: ?Sized + ToStatement,
    {
        self.txn.query(statement, params).await.map_err(DbError::from)
    }

    /// Execute a statement within the transaction.
    pub async fn execute<T>(&self, statement: &T, params: &[&(dyn ToSql + Sync)]) -> DbResult<u64>
    where
        T: ?Sized + ToStatement,
    {
        self.txn.execute(statement, params).await.map_err(DbError::from)
    }

    /// Commit the transaction.
    pub async fn commit(self) -> DbResult<()> {
        self.txn.commit().await.map_err(DbError::from)
    }

    /// Rollback the transaction explicitly.
    pub async fn rollback(self) -> DbResult<()> {
        self.txn.rollback().await.map_err(DbError::from)
    }
}
