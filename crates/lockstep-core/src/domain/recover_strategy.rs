use crate::{domain::workflow_instance::StepName, DataPacket};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay policy between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every attempt
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },

    /// `min(initial * multiplier^(attempt-1), max)`, optionally jittered by ±20%
    Exponential {
        /// Delay before the first retry
        initial_ms: u64,
        /// Growth factor per attempt
        multiplier: f64,
        /// Upper bound
        max_ms: u64,
        /// Apply ±20% jitter
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 0 }
    }
}

impl Backoff {
    /// Fixed delay
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Exponential delay without jitter
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Backoff::Exponential {
            initial_ms: initial.as_millis() as u64,
            multiplier,
            max_ms: max.as_millis() as u64,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let raw = (*initial_ms as f64) * multiplier.max(1.0).powi(exponent);
                let mut delay = raw.min(*max_ms as f64);

                if *jitter {
                    let factor = rand::thread_rng().gen_range(0.8..1.2);
                    delay = (delay * factor).min(*max_ms as f64);
                }

                Duration::from_millis(delay.max(0.0) as u64)
            }
        }
    }
}

/// Step reached when retries are exhausted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failover {
    /// Failover step
    pub step: StepName,

    /// Input for the failover step; the failed step's input is used when absent
    pub input: Option<DataPacket>,
}

/// Retry and failover policy applied on step failure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecoverStrategy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Delay between attempts
    #[serde(default)]
    pub backoff: Backoff,

    /// Where to go once retries are exhausted; `None` fails the instance
    pub failover: Option<Failover>,
}

impl RecoverStrategy {
    /// Strategy with `max_retries` and no delay
    pub fn max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fail over to `step` once retries are exhausted
    pub fn failover_to(mut self, step: impl Into<String>) -> Self {
        self.failover = Some(Failover {
            step: StepName::new(step),
            input: None,
        });
        self
    }

    /// Fail over to `step` with `input` once retries are exhausted
    pub fn failover_to_with_input(mut self, step: impl Into<String>, input: DataPacket) -> Self {
        self.failover = Some(Failover {
            step: StepName::new(step),
            input: Some(input),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::fixed(Duration::from_millis(25));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(25));
        assert_eq!(backoff.delay_for(7), Duration::from_millis(25));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::exponential(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(500),
        );

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(30), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_jitter_stays_in_range() {
        let backoff = Backoff::Exponential {
            initial_ms: 1000,
            multiplier: 2.0,
            max_ms: 10_000,
            jitter: true,
        };

        for _ in 0..50 {
            let delay = backoff.delay_for(2).as_millis();
            assert!((1600..=2400).contains(&delay), "delay out of range: {}", delay);
        }
    }

    #[test]
    fn test_strategy_builders() {
        let strategy = RecoverStrategy::max_retries(3)
            .with_backoff(Backoff::fixed(Duration::from_millis(10)))
            .failover_to("compensate");

        assert_eq!(strategy.max_retries, 3);
        assert_eq!(
            strategy.failover,
            Some(Failover {
                step: StepName::new("compensate"),
                input: None
            })
        );
        assert_eq!(RecoverStrategy::default().max_retries, 0);
    }

    #[test]
    fn test_strategy_deserializes_with_defaults() {
        let strategy: RecoverStrategy =
            serde_json::from_str(r#"{"max_retries": 2, "failover": null}"#).unwrap();
        assert_eq!(strategy.backoff, Backoff::Fixed { delay_ms: 0 });
    }
}
