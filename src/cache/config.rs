//! Executor sizing for artifact caches.

use std::num::NonZeroUsize;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_QUEUE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Compilations allowed to run at the same time.
    pub workers: NonZeroUsize,
    /// Distinct keys allowed to wait for a worker before new keys are rejected.
    pub queue_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            workers: NonZeroUsize::new(DEFAULT_WORKERS).unwrap_or(NonZeroUsize::MIN),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl From<&crate::config::ExecutorSettings> for CacheConfig {
    fn from(settings: &crate::config::ExecutorSettings) -> Self {
        Self {
            workers: settings.workers,
            queue_size: settings.queue_size,
        }
    }
}

impl CacheConfig {
    /// Upper bound on flights that may exist at once, running or queued.
    pub fn admission_limit(&self) -> usize {
        self.workers.get().saturating_add(self.queue_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.workers.get(), 4);
        assert_eq!(config.queue_size, 32);
        assert_eq!(config.admission_limit(), 36);
    }

    #[test]
    fn admission_limit_saturates() {
        let config = CacheConfig {
            workers: NonZeroUsize::MIN,
            queue_size: usize::MAX,
        };
        assert_eq!(config.admission_limit(), usize::MAX);
    }
}
