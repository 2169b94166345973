//! Engine configuration
//!
//! Every field has a default; `from_env` overrides them from `LOCKSTEP_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::domain::recover_strategy::{Backoff, RecoverStrategy};
use crate::CoreError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of each instance mailbox
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Retries for steps whose workflow sets no recover strategy
    #[serde(default)]
    pub default_max_retries: u32,

    /// Backoff for steps whose workflow sets no recover strategy
    #[serde(default)]
    pub default_backoff: Backoff,

    /// Step timeout when neither the step nor the workflow sets one
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,

    /// Log filter directive
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            default_max_retries: 0,
            default_backoff: Backoff::default(),
            default_step_timeout_ms: None,
            log_filter: default_log_filter(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(capacity) = env::var("LOCKSTEP_MAILBOX_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                config.mailbox_capacity = capacity;
            } else {
                warn!("Invalid LOCKSTEP_MAILBOX_CAPACITY value: {}", capacity);
            }
        }

        if let Ok(retries) = env::var("LOCKSTEP_DEFAULT_MAX_RETRIES") {
            if let Ok(retries) = retries.parse::<u32>() {
                config.default_max_retries = retries;
            } else {
                warn!("Invalid LOCKSTEP_DEFAULT_MAX_RETRIES value: {}", retries);
            }
        }

        if let Ok(backoff) = env::var("LOCKSTEP_DEFAULT_BACKOFF_MS") {
            if let Ok(delay_ms) = backoff.parse::<u64>() {
                config.default_backoff = Backoff::Fixed { delay_ms };
            } else {
                warn!("Invalid LOCKSTEP_DEFAULT_BACKOFF_MS value: {}", backoff);
            }
        }

        if let Ok(timeout) = env::var("LOCKSTEP_DEFAULT_STEP_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                config.default_step_timeout_ms = Some(timeout);
            } else {
                warn!("Invalid LOCKSTEP_DEFAULT_STEP_TIMEOUT_MS value: {}", timeout);
            }
        }

        if let Ok(filter) = env::var("LOCKSTEP_LOG") {
            config.log_filter = filter;
        }

        config
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.mailbox_capacity == 0 {
            return Err(CoreError::ConfigurationError(
                "mailbox_capacity must be greater than zero".to_string(),
            ));
        }

        if self.default_step_timeout_ms == Some(0) {
            return Err(CoreError::ConfigurationError(
                "default_step_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Recover strategy applied when a workflow sets none
    pub fn default_recover_strategy(&self) -> RecoverStrategy {
        RecoverStrategy {
            max_retries: self.default_max_retries,
            backoff: self.default_backoff.clone(),
            failover: None,
        }
    }

    /// Step timeout applied when a workflow sets none
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_ms.map(Duration::from_millis)
    }
}
