//! Frame configuration.

use serde::{Deserialize, Serialize};

/// Per-frame tracer settings supplied by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// Film width in pixels.
    pub width: usize,
    /// Film height in pixels.
    pub height: usize,
    /// Seed shared by every rank; worker RNGs derive from it.
    pub frame_seed: u64,
    /// Adapter worker threads; `0` means hardware concurrency.
    pub threads: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            frame_seed: 0,
            threads: 0,
        }
    }
}

impl TracerConfig {
    /// Check the settings before any tracing starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!("film must be non-empty, got {}x{}", self.width, self.height));
        }
        Ok(())
    }

    /// Effective adapter thread count.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TracerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_film_rejected() {
        let cfg = TracerConfig {
            width: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_effective_threads_floor() {
        let cfg = TracerConfig {
            threads: 3,
            ..Default::default()
        };
        assert_eq!(cfg.effective_threads(), 3);
        let auto = TracerConfig::default();
        assert!(auto.effective_threads() >= 1);
    }
}
