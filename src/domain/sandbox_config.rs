//! Sandbox limits, read from the `[sandbox]` configuration section.

use std::time::{Duration, Instant};

use crate::domain::error::QuantscriptError;
use crate::ports::config_port::ConfigPort;

const SECTION: &str = "sandbox";

/// Longest accepted `timeout_secs`; one hour.
pub const MAX_TIMEOUT_SECS: f64 = 3600.0;

/// Resource ceilings applied to every evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Wall-clock budget for one (script, row) evaluation.
    pub timeout: Duration,
    pub max_call_depth: usize,
    pub max_collection_len: usize,
    /// Elements one evaluation may allocate across all of its collections.
    pub max_total_elements: usize,
    /// Upper bound on inline script source size, in bytes.
    pub max_script_bytes: usize,
    /// Batch worker threads.
    pub workers: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_call_depth: 64,
            max_collection_len: 1_000_000,
            max_total_elements: 10_000_000,
            max_script_bytes: 100_000,
            workers: 4,
        }
    }
}

impl SandboxConfig {
    /// Reads `[sandbox]`, falling back to defaults for absent keys and
    /// rejecting zero, negative or non-numeric values. `timeout_secs` is
    /// capped at [`MAX_TIMEOUT_SECS`].
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, QuantscriptError> {
        let defaults = Self::default();
        let timeout_secs = read_positive_f64(config, "timeout_secs", defaults.timeout.as_secs_f64())?;
        if timeout_secs > MAX_TIMEOUT_SECS {
            return Err(invalid(
                "timeout_secs",
                format!("timeout_secs must be at most {MAX_TIMEOUT_SECS}"),
            ));
        }
        let timeout = Duration::try_from_secs_f64(timeout_secs)
            .map_err(|e| invalid("timeout_secs", format!("timeout_secs is out of range: {e}")))?;
        Ok(Self {
            timeout,
            max_call_depth: read_positive(config, "max_call_depth", defaults.max_call_depth)?,
            max_collection_len: read_positive(
                config,
                "max_collection_len",
                defaults.max_collection_len,
            )?,
            max_total_elements: read_positive(
                config,
                "max_total_elements",
                defaults.max_total_elements,
            )?,
            max_script_bytes: read_positive(config, "max_script_bytes", defaults.max_script_bytes)?,
            workers: read_positive(config, "workers", defaults.workers)?,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deadline for an evaluation starting at `started`, with the budget
    /// clamped to [`MAX_TIMEOUT_SECS`].
    pub fn deadline_from(&self, started: Instant) -> Instant {
        started + self.timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS as u64))
    }
}

fn invalid(key: &str, reason: String) -> QuantscriptError {
    QuantscriptError::ConfigInvalid {
        section: SECTION.to_string(),
        key: key.to_string(),
        reason,
    }
}

fn read_positive(config: &dyn ConfigPort, key: &str, default: usize) -> Result<usize, QuantscriptError> {
    let Some(raw) = config.get_trimmed(SECTION, key) else {
        return Ok(default);
    };
    let value: i64 = raw
        .parse()
        .map_err(|_| invalid(key, format!("{key} must be an integer, got '{raw}'")))?;
    if value <= 0 {
        return Err(invalid(key, format!("{key} must be positive")));
    }
    usize::try_from(value).map_err(|_| invalid(key, format!("{key} is too large")))
}

fn read_positive_f64(config: &dyn ConfigPort, key: &str, default: f64) -> Result<f64, QuantscriptError> {
    let Some(raw) = config.get_trimmed(SECTION, key) else {
        return Ok(default);
    };
    let value: f64 = raw
        .parse()
        .map_err(|_| invalid(key, format!("{key} must be a number, got '{raw}'")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(key, format!("{key} must be positive")));
    }
    Ok(value)
}
