//! Service layer for store connectivity.
//!
//! - `manager` - Connection lifecycle, query routing, statistics, maintenance
//! - `connection` - Database connection pooling with deadpool-postgres
//! - `statements` - Prepared statement registry
//! - `cancel` - Cancellation and deadline wrappers

pub mod cancel;
pub mod connection;
pub mod manager;
pub mod statements;

pub use cancel::{with_cancellation, with_timeout};
pub use connection::{ConnectionPool, PooledConnection, Transaction};
pub use manager::ConnectionManager;
pub use statements::{PreparedStatement, StatementCache, StatementHandle};
