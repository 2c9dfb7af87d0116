//! Configuration for averaging steps.
//!
//! Parsed from TOML with environment variable overrides (prefix `AVG_`) and
//! validated before use.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::control::StepControl;
use crate::error::{ControlError, Result};

/// Defaults applied when constructing new steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Time budget for matchmaking, seconds.
    pub matchmaking_time_s: f64,
    /// Budget for the whole step (matchmaking, trigger wait and exchange),
    /// seconds.
    pub step_timeout_s: f64,
    /// Whether failed matchmaking may be retried within the deadline.
    pub allow_retries: bool,
    /// Default averaging weight for this peer.
    pub default_weight: f64,
    /// Prefix for shared memory segment names.
    pub shm_prefix: String,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            matchmaking_time_s: 15.0,
            step_timeout_s: 60.0,
            allow_retries: true,
            default_weight: 1.0,
            shm_prefix: "avg_step".to_string(),
        }
    }
}

impl FromStr for StepConfig {
    type Err = ControlError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ControlError::config_with_source("failed to parse TOML config", e))
    }
}

impl StepConfig {
    /// Loads configuration from a TOML file and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ControlError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment variable overrides:
    /// - `AVG_MATCHMAKING_TIME_S`
    /// - `AVG_STEP_TIMEOUT_S`
    /// - `AVG_ALLOW_RETRIES`
    /// - `AVG_DEFAULT_WEIGHT`
    /// - `AVG_SHM_PREFIX`
    ///
    /// Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("AVG_MATCHMAKING_TIME_S") {
            if let Ok(v) = val.parse() {
                self.matchmaking_time_s = v;
            }
        }
        if let Ok(val) = std::env::var("AVG_STEP_TIMEOUT_S") {
            if let Ok(v) = val.parse() {
                self.step_timeout_s = v;
            }
        }
        if let Ok(val) = std::env::var("AVG_ALLOW_RETRIES") {
            if let Ok(v) = val.parse() {
                self.allow_retries = v;
            }
        }
        if let Ok(val) = std::env::var("AVG_DEFAULT_WEIGHT") {
            if let Ok(v) = val.parse() {
                self.default_weight = v;
            }
        }
        if let Ok(val) = std::env::var("AVG_SHM_PREFIX") {
            self.shm_prefix = val;
        }
        self
    }

    /// Validates all configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !self.matchmaking_time_s.is_finite() || self.matchmaking_time_s <= 0.0 {
            return Err(ControlError::config(
                "matchmaking_time_s must be a positive number of seconds",
            ));
        }
        if !self.step_timeout_s.is_finite() || self.step_timeout_s <= 0.0 {
            return Err(ControlError::config(
                "step_timeout_s must be a positive number of seconds",
            ));
        }
        if self.step_timeout_s < self.matchmaking_time_s {
            return Err(ControlError::config(
                "step_timeout_s must not be smaller than matchmaking_time_s",
            ));
        }
        if !self.default_weight.is_finite() || self.default_weight < 0.0 {
            return Err(ControlError::config(
                "default_weight must be finite and non-negative",
            ));
        }
        if self.shm_prefix.is_empty() {
            return Err(ControlError::config("shm_prefix must not be empty"));
        }
        Ok(())
    }

    /// Builds a step control from these defaults: the step is scheduled
    /// `matchmaking_time_s` from now and expires `step_timeout_s` from now.
    ///
    /// # Errors
    ///
    /// Propagates construction failures from [`StepControl`].
    pub fn begin_step(&self, gather_payload: Vec<u8>) -> Result<StepControl> {
        let now = clock::now();
        StepControl::with_shm_prefix(
            &self.shm_prefix,
            now + self.matchmaking_time_s,
            now + self.step_timeout_s,
            self.allow_retries,
            self.default_weight,
            gather_payload,
        )
    }
}
