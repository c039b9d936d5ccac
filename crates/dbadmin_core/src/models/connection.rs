//! Connection state and pool statistics models.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Lifecycle state of a connection manager.
///
/// There is no externally observable "connecting" state: setup either completes a
/// dial-and-probe or leaves the manager disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    /// No pool
    #[default]
    Disconnected,
    /// Pool open and probed
    Connected,
}

impl ConnectionState {
    /// Check if the connection is active.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Convert to string representation for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
        }
    }
}

/// Read-only pool introspection.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    /// Established connections, both in use and idle
    pub open_connections: usize,
    /// Connections currently checked out
    pub in_use: usize,
    /// Idle connections
    pub idle: usize,
    /// Checkouts that had to wait for a connection
    pub wait_count: u64,
    /// Total time spent waiting for connections
    pub wait_duration: Duration,
    /// Maximum pool capacity
    pub max_pool_size: usize,
    /// When the current pool was opened
    pub connected_at: Option<DateTime<Utc>>,
}

impl PoolStats {
    /// Statistics for a manager with no pool.
    pub fn disconnected(max_pool_size: usize) -> Self {
        Self {
            open_connections: 0,
            in_use: 0,
            idle: 0,
            wait_count: 0,
            wait_duration: Duration::ZERO,
            max_pool_size,
            connected_at: None,
        }
    }

    /// Check if the pool has spare capacity.
    pub fn is_healthy(&self) -> bool {
        self.in_use < self.max_pool_size
    }

    /// Get pool utilization as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_pool_size == 0 {
            0.0
        } else {
            (self.in_use as f64 / self.max_pool_size as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_defaults_to_disconnected() {
        let state = ConnectionState::default();
        assert!(!state.is_connected());
        assert_eq!(state.as_str(), "disconnected");
        assert!(ConnectionState::Connected.is_connected());
    }

    #[test]
    fn test_disconnected_stats() {
        let stats = PoolStats::disconnected(20);
        assert_eq!(stats.max_pool_size, 20);
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.wait_duration, Duration::ZERO);
        assert!(stats.connected_at.is_none());
        assert!(stats.is_healthy());
    }

    #[test]
    fn test_utilization() {
        let stats = PoolStats { in_use: 5, open_connections: 8, idle: 3, ..PoolStats::disconnected(20) };
        assert!((stats.utilization() - 25.0).abs() < f64::EPSILON);

        let saturated = PoolStats { in_use: 20, ..stats };
        assert!(!saturated.is_healthy());
        assert_eq!(PoolStats::disconnected(0).utilization(), 0.0);
    }
}
