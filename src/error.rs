use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub type Result<T> = std::result::Result<T, RdmaError>;

#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("address does not belong to any registered region")]
    NotFound,

    #[error("RDMA device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RdmaError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error wrapping an underlying error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Gate for log sites that must not fire more than once per second.
///
/// Device failures and pool exhaustion happen in bursts; one line per
/// second is enough for an operator and keeps the hot paths quiet.
pub(crate) struct LogThrottle(AtomicU64);

impl LogThrottle {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// True at most once per wall-clock second across all threads.
    pub(crate) fn should_log(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let last = self.0.load(Ordering::Relaxed);
        last != now
            && self
                .0
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_first_and_suppresses_burst() {
        let t = LogThrottle::new();
        assert!(t.should_log());
        // Same second: the rest of the burst is suppressed.
        for _ in 0..100 {
            assert!(!t.should_log());
        }
    }

    #[test]
    fn device_error_carries_source() {
        let io = std::io::Error::from_raw_os_error(libc::EAGAIN);
        let err = RdmaError::device_with_source("rdma_get_cm_event failed", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
