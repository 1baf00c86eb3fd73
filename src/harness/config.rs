use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{HarnessError, HarnessResult};

/// Timings for the concurrency experiments. The delays only widen race
/// windows; no production path sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Readers in the concurrent-read experiment.
    #[serde(default = "default_readers")]
    pub readers: usize,

    /// Gap between a reader's two reads.
    #[serde(default = "default_read_gap_ms")]
    pub read_gap_ms: u64,

    /// How long a conflict writer holds its transaction open.
    #[serde(default = "default_writer_dwell_ms")]
    pub writer_dwell_ms: u64,

    /// Start offset between conflict readers.
    #[serde(default = "default_reader_stagger_ms")]
    pub reader_stagger_ms: u64,

    /// Wait before reading final state from every node.
    #[serde(default = "default_drain_delay_ms")]
    pub drain_delay_ms: u64,

    /// Work simulated between a writer's locking read and its update.
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,

    /// A locking read slower than this counts as a lock wait.
    #[serde(default = "default_lock_wait_threshold_ms")]
    pub lock_wait_threshold_ms: u64,
}

fn default_readers() -> usize {
    3
}

fn default_read_gap_ms() -> u64 {
    100
}

fn default_writer_dwell_ms() -> u64 {
    1_000
}

fn default_reader_stagger_ms() -> u64 {
    150
}

fn default_drain_delay_ms() -> u64 {
    500
}

fn default_processing_delay_ms() -> u64 {
    200
}

fn default_lock_wait_threshold_ms() -> u64 {
    100
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            readers: default_readers(),
            read_gap_ms: default_read_gap_ms(),
            writer_dwell_ms: default_writer_dwell_ms(),
            reader_stagger_ms: default_reader_stagger_ms(),
            drain_delay_ms: default_drain_delay_ms(),
            processing_delay_ms: default_processing_delay_ms(),
            lock_wait_threshold_ms: default_lock_wait_threshold_ms(),
        }
    }
}

impl HarnessSettings {
    pub fn read_gap(&self) -> Duration {
        Duration::from_millis(self.read_gap_ms)
    }

    pub fn writer_dwell(&self) -> Duration {
        Duration::from_millis(self.writer_dwell_ms)
    }

    pub fn reader_stagger(&self) -> Duration {
        Duration::from_millis(self.reader_stagger_ms)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    pub fn lock_wait_threshold(&self) -> Duration {
        Duration::from_millis(self.lock_wait_threshold_ms)
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.readers == 0 {
            return Err(HarnessError::invalid_input("harness.readers must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings: HarnessSettings =
            serde_json::from_str(r#"{"writer_dwell_ms": 50, "readers": 4}"#).unwrap();
        assert_eq!(settings.writer_dwell(), Duration::from_millis(50));
        assert_eq!(settings.readers, 4);
        assert_eq!(settings.read_gap_ms, 100);
        assert_eq!(settings.lock_wait_threshold_ms, 100);
    }

    #[test]
    fn test_zero_readers_rejected() {
        let settings = HarnessSettings {
            readers: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
