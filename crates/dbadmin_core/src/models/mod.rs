//! Data models for the connectivity layer.
//!
//! - `connection` - ConnectionState, PoolStats

pub mod connection;

pub use connection::{ConnectionState, PoolStats};
