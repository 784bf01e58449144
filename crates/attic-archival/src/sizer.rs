// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tracing::debug;

use attic_config::BatchDefaults;

/// Adapts batch size to the observed fetch time: grow by 1.5× when
/// fetches run under the target window, halve when over, always clamped
/// to the configured bounds and the memory cap.
pub struct AdaptiveBatchSizer {
    current: usize,
    min: usize,
    max: usize,
    target: Duration,
    memory_cap_bytes: u64,
    avg_row_bytes: u64,
}

impl AdaptiveBatchSizer {
    pub fn new(defaults: &BatchDefaults, starting_size: usize) -> Self {
        Self {
            current: starting_size.clamp(defaults.min_batch_size, defaults.max_batch_size),
            min: defaults.min_batch_size,
            max: defaults.max_batch_size,
            target: Duration::from_secs_f64(
                defaults.target_fetch_secs.max(defaults.fetch_floor_secs),
            ),
            memory_cap_bytes: defaults.memory_cap_bytes,
            avg_row_bytes: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Feeds one batch observation back into the sizer.
    pub fn observe(&mut self, fetch_time: Duration, rows: usize, bytes: u64) {
        if rows > 0 {
            let observed = bytes / rows as u64;
            // Smooth: averages drift slowly so one wide row cannot
            // collapse the batch size.
            self.avg_row_bytes = if self.avg_row_bytes == 0 {
                observed
            } else {
                (self.avg_row_bytes * 3 + observed) / 4
            };
        }

        let lower = self.target.mul_f64(0.5);
        let upper = self.target.mul_f64(1.5);
        let proposed = if fetch_time < lower {
            (self.current as f64 * 1.5) as usize
        } else if fetch_time > upper {
            (self.current as f64 * 0.5) as usize
        } else {
            self.current
        };
        let clamped = proposed.clamp(self.min, self.max);

        // Estimated footprint is two copies of the batch (rows + the
        // serialized stream).
        // The memory cap wins over the configured minimum.
        let capped = if self.avg_row_bytes > 0 {
            let limit = (self.memory_cap_bytes / (self.avg_row_bytes * 2)).max(1) as usize;
            clamped.min(limit)
        } else {
            clamped
        };

        if capped != self.current {
            debug!(
                from = self.current,
                to = capped,
                fetch_ms = fetch_time.as_millis() as u64,
                "adaptive batch size changed"
            );
        }
        self.current = capped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> BatchDefaults {
        BatchDefaults {
            batch_size: 1_000,
            min_batch_size: 1_000,
            max_batch_size: 50_000,
            target_fetch_secs: 2.0,
            fetch_floor_secs: 0.1,
            memory_cap_bytes: 512 * 1024 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn fast_fetches_grow_the_batch() {
        let mut sizer = AdaptiveBatchSizer::new(&defaults(), 1_000);
        sizer.observe(Duration::from_millis(200), 1_000, 100_000);
        assert_eq!(sizer.current(), 1_500);
    }

    #[test]
    fn slow_fetches_shrink_with_a_floor() {
        let mut sizer = AdaptiveBatchSizer::new(&defaults(), 2_000);
        sizer.observe(Duration::from_secs(10), 2_000, 200_000);
        assert_eq!(sizer.current(), 1_000);
        // Already at the floor: stays clamped.
        sizer.observe(Duration::from_secs(10), 1_000, 100_000);
        assert_eq!(sizer.current(), 1_000);
    }

    #[test]
    fn in_window_fetches_hold_steady() {
        let mut sizer = AdaptiveBatchSizer::new(&defaults(), 4_000);
        sizer.observe(Duration::from_secs(2), 4_000, 400_000);
        assert_eq!(sizer.current(), 4_000);
    }

    #[test]
    fn growth_is_capped_at_max() {
        let mut sizer = AdaptiveBatchSizer::new(&defaults(), 40_000);
        sizer.observe(Duration::from_millis(100), 40_000, 400_000);
        assert_eq!(sizer.current(), 50_000);
    }

    #[test]
    fn memory_cap_overrides_growth() {
        let mut config = defaults();
        config.memory_cap_bytes = 1024 * 1024;
        let mut sizer = AdaptiveBatchSizer::new(&config, 1_000);
        // 1 KiB rows: cap allows 1 MiB / (1024 * 2) = 512 rows.
        sizer.observe(Duration::from_millis(100), 1_000, 1_024_000);
        assert!(sizer.current() <= 512);
    }
}
