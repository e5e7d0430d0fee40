//! Channel configuration.

use std::time::Duration;

use crate::error::ConfigError;

pub use shmchan_primitives::MAX_RECEIVERS;

/// Tuning knobs shared by every handle of one channel.
///
/// The geometry fields (`inline_size`, `align_size`, `slot_count`) are baked
/// into the object name and the mapped header, so handles with diverging
/// geometry land in disjoint objects or fail validation at attach.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Slot payload bytes.
    pub inline_size: u32,
    /// Slot payload alignment.
    pub align_size: u32,
    /// Ring capacity; must be a power of two.
    pub slot_count: u32,
    /// Threshold above which payloads take the large-pool path.
    pub large_limit: u32,
    /// Large-pool chunk alignment and smallest size class.
    pub large_align: u32,
    /// Chunks cached per size class.
    pub large_cache: u32,
    /// Lock-free retries before falling back to a blocking wait.
    pub spin_budget: u32,
    /// Silence after which a receiver is eligible for dead-peer reclaim.
    pub stale_after: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inline_size: 64,
            align_size: 16,
            slot_count: 256,
            large_limit: 64,
            large_align: 1024,
            large_cache: 32,
            spin_budget: 1024,
            stale_after: Duration::from_millis(500),
        }
    }
}

impl ChannelConfig {
    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inline_size == 0 {
            return Err(ConfigError("inline_size must be > 0"));
        }
        if !self.align_size.is_power_of_two() || self.align_size == 0 {
            return Err(ConfigError("align_size must be a nonzero power of two"));
        }
        if self.align_size > 4096 {
            return Err(ConfigError("align_size must not exceed a page"));
        }
        if !self.slot_count.is_power_of_two() || self.slot_count == 0 {
            return Err(ConfigError("slot_count must be a nonzero power of two"));
        }
        if self.large_limit < self.inline_size {
            return Err(ConfigError("large_limit must be >= inline_size"));
        }
        if !self.large_align.is_power_of_two() || self.large_align < 64 {
            return Err(ConfigError("large_align must be a power of two >= 64"));
        }
        if self.large_cache == 0 {
            return Err(ConfigError("large_cache must be > 0"));
        }
        Ok(())
    }

    /// True when the segmented band `(inline_size, large_limit]` is
    /// non-empty. With the default thresholds the band is empty and
    /// payloads above `inline_size` go straight to the large pool.
    #[inline]
    pub fn segmented_enabled(&self) -> bool {
        self.large_limit > self.inline_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChannelConfig::default();
        config.validate().unwrap();
        assert!(!config.segmented_enabled());
    }

    #[test]
    fn test_rejects_non_power_of_two_slot_count() {
        let config = ChannelConfig {
            slot_count: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_large_limit_below_inline() {
        let config = ChannelConfig {
            inline_size: 64,
            large_limit: 32,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_segmented_band() {
        let config = ChannelConfig {
            large_limit: 256,
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(config.segmented_enabled());
    }
}
