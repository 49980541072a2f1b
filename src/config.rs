//! Runtime-configurable tuning parameters for the RDMA substrate.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `HELIX_RDMA_`) or by constructing a custom `RdmaConfig`.

use std::net::Ipv4Addr;

/// Tuning parameters for connection management and the block pool.
#[derive(Debug, Clone)]
pub struct RdmaConfig {
    /// Listen backlog for incoming connection requests.
    pub backlog: i32,

    /// Overall budget for connection establishment. Address and route
    /// resolution each get half of it.
    pub conn_timeout_ms: i32,

    /// Size of the block pool's first region, in MiB.
    pub pool_initial_size_mb: usize,

    /// Size of every subsequent region, in MiB.
    pub pool_increase_size_mb: usize,

    /// Hard cap on the number of registered regions.
    pub pool_max_regions: usize,

    /// Free-list shards per size class, to reduce lock contention.
    pub pool_buckets: usize,

    /// Address of the RDMA-capable NIC. When unset, the first
    /// non-loopback interface address is used.
    pub local_ip: Option<Ipv4Addr>,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            conn_timeout_ms: 500,
            pool_initial_size_mb: 1024,
            pool_increase_size_mb: 1024,
            pool_max_regions: 1,
            pool_buckets: 4,
            local_ip: None,
        }
    }
}

impl RdmaConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `HELIX_RDMA_BACKLOG`
    /// - `HELIX_RDMA_CONN_TIMEOUT_MS`
    /// - `HELIX_RDMA_MEMORY_POOL_INITIAL_SIZE_MB`
    /// - `HELIX_RDMA_MEMORY_POOL_INCREASE_SIZE_MB`
    /// - `HELIX_RDMA_MEMORY_POOL_MAX_REGIONS`
    /// - `HELIX_RDMA_MEMORY_POOL_BUCKETS`
    /// - `HELIX_RDMA_LOCAL_IP`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("HELIX_RDMA_BACKLOG") {
            if let Ok(n) = v.parse::<i32>() {
                cfg.backlog = n;
            }
        }
        if let Ok(v) = std::env::var("HELIX_RDMA_CONN_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<i32>() {
                cfg.conn_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("HELIX_RDMA_MEMORY_POOL_INITIAL_SIZE_MB") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.pool_initial_size_mb = n;
            }
        }
        if let Ok(v) = std::env::var("HELIX_RDMA_MEMORY_POOL_INCREASE_SIZE_MB") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.pool_increase_size_mb = n;
            }
        }
        if let Ok(v) = std::env::var("HELIX_RDMA_MEMORY_POOL_MAX_REGIONS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.pool_max_regions = n;
            }
        }
        if let Ok(v) = std::env::var("HELIX_RDMA_MEMORY_POOL_BUCKETS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.pool_buckets = n;
            }
        }
        if let Ok(v) = std::env::var("HELIX_RDMA_LOCAL_IP") {
            if let Ok(ip) = v.parse::<Ipv4Addr>() {
                cfg.local_ip = Some(ip);
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RdmaConfig::default();
        assert_eq!(cfg.backlog, 1024);
        assert_eq!(cfg.conn_timeout_ms, 500);
        assert_eq!(cfg.pool_initial_size_mb, 1024);
        assert_eq!(cfg.pool_increase_size_mb, 1024);
        assert_eq!(cfg.pool_max_regions, 1);
        assert_eq!(cfg.pool_buckets, 4);
        assert!(cfg.local_ip.is_none());
    }
}
