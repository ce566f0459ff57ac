//! Tunable constants collected in one place.
//!
//! The original implementation hard-codes these as scattered defaults
//! (`ThreadLoadCounter`'s `32` samples / `2_000_000` us window,
//! `SockUtil::getDomainIP`'s `60` second DNS TTL, the reactor's shared
//! receive-buffer size). An embedder of this crate has no single place to
//! override them, so we collect them into one builder-style struct.
use std::time::Duration;

#[cfg_attr(feature = "config-file", derive(serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Size, in bytes, of the buffer each reactor lends to its sockets for
    /// `recv`/`recvfrom` calls. The original reserves a trailing byte for a
    /// defensive NUL terminator; we keep that shape.
    pub shared_buffer_size: usize,
    /// Maximum number of retained load samples before the oldest is
    /// dropped.
    pub load_window_max_samples: usize,
    /// Maximum retained window, in microseconds, before the oldest sample
    /// is dropped even if the sample count has not been reached.
    pub load_window_max_micros: u64,
    /// Maximum number of readiness events drained from the kernel poller
    /// in a single `wait()` call.
    pub epoll_batch_size: usize,
    /// How long a resolved hostname-to-address mapping is cached.
    #[cfg_attr(feature = "config-file", serde(with = "duration_secs"))]
    pub dns_ttl: Duration,
    /// Worker pool size; `None` defaults to the number of logical CPUs.
    pub worker_pool_capacity: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            shared_buffer_size: 256 * 1024 + 1,
            load_window_max_samples: 32,
            load_window_max_micros: 2_000_000,
            epoll_batch_size: 1024,
            dns_ttl: Duration::from_secs(60),
            worker_pool_capacity: None,
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder(RuntimeConfig::default())
    }
}

/// Fluent builder over [`RuntimeConfig`]; every setter returns `Self` for
/// chaining, matching the rest of the crate's constructor style.
#[derive(Debug, Clone)]
pub struct RuntimeConfigBuilder(RuntimeConfig);

impl RuntimeConfigBuilder {
    pub fn shared_buffer_size(mut self, bytes: usize) -> Self {
        self.0.shared_buffer_size = bytes;
        self
    }

    pub fn load_window(mut self, max_samples: usize, max_micros: u64) -> Self {
        self.0.load_window_max_samples = max_samples;
        self.0.load_window_max_micros = max_micros;
        self
    }

    pub fn epoll_batch_size(mut self, n: usize) -> Self {
        self.0.epoll_batch_size = n;
        self
    }

    pub fn dns_ttl(mut self, ttl: Duration) -> Self {
        self.0.dns_ttl = ttl;
        self
    }

    pub fn worker_pool_capacity(mut self, n: usize) -> Self {
        self.0.worker_pool_capacity = Some(n);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.0
    }
}

#[cfg(feature = "config-file")]
mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(de: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.shared_buffer_size, 262_145);
        assert_eq!(cfg.load_window_max_samples, 32);
        assert_eq!(cfg.load_window_max_micros, 2_000_000);
        assert_eq!(cfg.dns_ttl, Duration::from_secs(60));
    }

    #[test]
    fn builder_overrides() {
        let cfg = RuntimeConfig::builder()
            .shared_buffer_size(4096)
            .load_window(8, 500_000)
            .worker_pool_capacity(2)
            .build();
        assert_eq!(cfg.shared_buffer_size, 4096);
        assert_eq!(cfg.load_window_max_samples, 8);
        assert_eq!(cfg.load_window_max_micros, 500_000);
        assert_eq!(cfg.worker_pool_capacity, Some(2));
    }
}
