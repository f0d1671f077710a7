//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CourierError;

/// Batch fan-out limits.
///
/// Parallelism is `min(cap, cpus * factor)`, never below 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Upper bound on concurrently running item tasks.
    pub cap: usize,

    /// Workers per available CPU.
    pub factor: usize,
}

impl BatchConfig {
    pub const DEFAULT_CAP: usize = 24;
    pub const DEFAULT_FACTOR: usize = 3;

    pub fn new(cap: usize, factor: usize) -> Self {
        Self { cap, factor }
    }

    /// Parallelism on this machine.
    pub fn parallelism(&self) -> usize {
        self.parallelism_for(crate::context::available_parallelism())
    }

    pub fn parallelism_for(&self, cpus: usize) -> usize {
        self.cap.min(cpus.saturating_mul(self.factor)).max(1)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP, Self::DEFAULT_FACTOR)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the compute context. `None` means one slot per CPU.
    pub compute_threads: Option<usize>,
}

impl SchedulerConfig {
    pub fn compute_threads(&self) -> usize {
        self.compute_threads
            .unwrap_or_else(crate::context::available_parallelism)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub batch: BatchConfig,
    pub scheduler: SchedulerConfig,
}

impl CourierConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, CourierError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CourierError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CourierError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), CourierError> {
        if self.batch.cap == 0 {
            return Err(CourierError::InvalidConfig("batch.cap must be positive".into()));
        }
        if self.batch.factor == 0 {
            return Err(CourierError::InvalidConfig(
                "batch.factor must be positive".into(),
            ));
        }
        if self.scheduler.compute_threads == Some(0) {
            return Err(CourierError::InvalidConfig(
                "scheduler.compute_threads must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_documented_values() {
        let config = CourierConfig::from_json_str("{}").unwrap();
        assert_eq!(config.batch.cap, 24);
        assert_eq!(config.batch.factor, 3);
        assert_eq!(config.scheduler.compute_threads, None);
    }

    #[rstest]
    #[case::cpu_bound(24, 3, 2, 6)]
    #[case::capped(24, 3, 16, 24)]
    #[case::small_cap(4, 3, 8, 4)]
    #[case::never_zero(24, 3, 0, 1)]
    fn parallelism_is_min_of_cap_and_scaled_cpus(
        #[case] cap: usize,
        #[case] factor: usize,
        #[case] cpus: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(BatchConfig::new(cap, factor).parallelism_for(cpus), expected);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config = CourierConfig::from_json_str(r#"{"batch": {"cap": 8}}"#).unwrap();
        assert_eq!(config.batch.cap, 8);
        assert_eq!(config.batch.factor, 3);
    }

    #[rstest]
    #[case::zero_cap(r#"{"batch": {"cap": 0}}"#)]
    #[case::zero_factor(r#"{"batch": {"factor": 0}}"#)]
    #[case::zero_compute(r#"{"scheduler": {"compute_threads": 0}}"#)]
    fn invalid_values_are_rejected(#[case] raw: &str) {
        let err = CourierConfig::from_json_str(raw).unwrap_err();
        assert!(matches!(err, CourierError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = CourierConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, CourierError::ConfigParse(_)));
    }
}
