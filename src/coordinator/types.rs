// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the service coordinator.

/// Service lifecycle state.
///
/// Use [`super::CacheService::state()`] to check current state or
/// [`super::CacheService::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Just created, not yet started
    Created,
    /// Connecting to the store and the cache
    Connecting,
    /// Loading tag indexes before accepting traffic
    WarmingUp,
    /// Serving, workers running
    Running,
    /// Stopping workers and running the final flush
    ShuttingDown,
    /// Workers stopped
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::WarmingUp => write!(f, "WarmingUp"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time health snapshot, suitable for `/ready` and `/health`.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub state: ServiceState,
    /// Accepting requests
    pub ready: bool,
    /// A cache backend is attached (false = fallback-only)
    pub cache_configured: bool,
    /// PING result, `None` when no cache is attached
    pub cache_connected: Option<bool>,
    pub cache_latency_ms: Option<u64>,
    /// Pending eviction retries (`None` if unknown)
    pub retry_queue_len: Option<u64>,
    /// Eviction jobs past the retry cap (`None` if unknown)
    pub dead_letter_len: Option<u64>,
    /// Running, and the cache (if any) answers
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_state_display() {
        assert_eq!(format!("{}", ServiceState::Created), "Created");
        assert_eq!(format!("{}", ServiceState::WarmingUp), "WarmingUp");
        assert_eq!(format!("{}", ServiceState::Stopped), "Stopped");
    }
}
