//! Database connectivity layer for the dbadmin service.
//!
//! This crate owns the process's connection to its relational store:
//!
//! - **services**: Connection manager, pooling, prepared statement cache, cancellation
//! - **classify**: Mapping store error codes to duplicate-key and foreign-key kinds
//! - **tls**: Mutual TLS from a CA bundle, client certificate and key
//! - **config**: Connection settings and the configuration source they are read from
//! - **error**: Error handling with store-specific details
//! - **models**: Lifecycle state and pool statistics
//! - **convert**: Timestamp formatting and boolean/integer helpers
//! - **logging**: Structured logging setup

pub mod classify;
pub mod config;
pub mod convert;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod tls;


pub use classify::{Dialect, ErrorClassifier, ErrorKind};
pub use config::{ConfigSource, ConnectionSettings, EnvConfig, MapConfig};
pub use error::{DbError, DbResult, ErrorCode};
pub use models::{ConnectionState, PoolStats};
pub use services::{
    with_cancellation, with_timeout, ConnectionManager, PreparedStatement, StatementCache,
    StatementHandle,
};
pub use tls::{build_mutual_tls, TlsConfigError, TlsMaterial};
