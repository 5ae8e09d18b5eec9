//! Per-data-source cache health.
//!
//! Read-only reporting. A health label never blocks reads or writes.

use std::fmt;
use std::time::Duration;

use rowscope_core::DataSourceId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Ordinal health scale, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLabel {
    Excellent,
    Good,
    Degraded,
    Stale,
    /// Never warmed and nothing indexed.
    Cold,
}

impl HealthLabel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Degraded => "degraded",
            Self::Stale => "stale",
            Self::Cold => "cold",
        }
    }
}

impl fmt::Display for HealthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which dimension kinds are present in the production index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    pub has_measure: bool,
    pub has_facility: bool,
}

impl Coverage {
    /// 1.0 with both kinds, 0.5 with one, 0.0 with none.
    pub fn score(&self) -> f64 {
        (f64::from(u8::from(self.has_measure)) + f64::from(u8::from(self.has_facility))) / 2.0
    }

    pub fn is_complete(&self) -> bool {
        self.has_measure && self.has_facility
    }

    pub fn is_empty(&self) -> bool {
        !self.has_measure && !self.has_facility
    }
}

/// Relative weights of the three health inputs. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub recency: f64,
    pub hit_rate: f64,
    pub coverage: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            recency: 0.4,
            hit_rate: 0.35,
            coverage: 0.25,
        }
    }
}

impl HealthWeights {
    pub fn sum(&self) -> f64 {
        self.recency + self.hit_rate + self.coverage
    }
}

/// Health scoring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub weights: HealthWeights,

    /// A warm younger than this earns the full recency score.
    #[serde(with = "humantime_serde")]
    pub fresh_within: Duration,

    /// A warm older than this earns nothing and labels the source stale.
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    /// Hit-rate window length in minutes.
    pub hit_rate_window_minutes: u32,

    /// Score used for the hit-rate input when there was no traffic.
    pub idle_hit_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            weights: HealthWeights::default(),
            fresh_within: Duration::from_secs(3600),
            stale_after: Duration::from_secs(24 * 3600),
            hit_rate_window_minutes: crate::stats::DEFAULT_WINDOW_MINUTES,
            idle_hit_rate: 0.5,
        }
    }
}

/// Raw inputs gathered from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HealthInputs {
    pub last_warmed: Option<OffsetDateTime>,
    pub hit_rate: Option<f64>,
    pub coverage: Coverage,
}

/// Health of one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub data_source: DataSourceId,
    pub label: HealthLabel,
    pub score: f64,
    #[serde(with = "time::serde::timestamp::option")]
    pub last_warmed: Option<OffsetDateTime>,
    pub hit_rate: Option<f64>,
    pub coverage: Coverage,
}

const EXCELLENT_THRESHOLD: f64 = 0.85;
const GOOD_THRESHOLD: f64 = 0.65;

/// Turns [`HealthInputs`] into a [`HealthReport`].
#[derive(Debug, Clone, Default)]
pub struct HealthScorer {
    config: HealthConfig,
}

impl HealthScorer {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Recency component in `[0, 1]`: full inside `fresh_within`, falling
    /// linearly to zero at `stale_after`.
    pub fn recency_score(&self, last_warmed: Option<OffsetDateTime>, now: OffsetDateTime) -> f64 {
        let Some(last_warmed) = last_warmed else {
            return 0.0;
        };
        let age = (now - last_warmed).max(time::Duration::ZERO).as_seconds_f64();
        let fresh = self.config.fresh_within.as_secs_f64();
        let stale = self.config.stale_after.as_secs_f64();
        if age <= fresh {
            1.0
        } else if age >= stale || stale <= fresh {
            0.0
        } else {
            1.0 - (age - fresh) / (stale - fresh)
        }
    }

    pub fn score(&self, ds: &DataSourceId, inputs: HealthInputs, now: OffsetDateTime) -> HealthReport {
        let weights = &self.config.weights;
        let recency = self.recency_score(inputs.last_warmed, now);
        let hit_rate = inputs
            .hit_rate
            .unwrap_or(self.config.idle_hit_rate)
            .clamp(0.0, 1.0);
        let score = weights.recency * recency
            + weights.hit_rate * hit_rate
            + weights.coverage * inputs.coverage.score();

        let label = if inputs.last_warmed.is_none() && inputs.coverage.is_empty() {
            HealthLabel::Cold
        } else if inputs.last_warmed.is_some() && recency == 0.0 {
            HealthLabel::Stale
        } else if score >= EXCELLENT_THRESHOLD {
            HealthLabel::Excellent
        } else if score >= GOOD_THRESHOLD {
            HealthLabel::Good
        } else {
            HealthLabel::Degraded
        };

        HealthReport {
            data_source: ds.clone(),
            label,
            score,
            last_warmed: inputs.last_warmed,
            hit_rate: inputs.hit_rate,
            coverage: inputs.coverage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

    fn ds() -> DataSourceId {
        DataSourceId::parse("claims").unwrap()
    }

    fn full() -> Coverage {
        Coverage {
            has_measure: true,
            has_facility: true,
        }
    }

    fn inputs(age: Option<Duration>, hit_rate: Option<f64>, coverage: Coverage) -> HealthInputs {
        HealthInputs {
            last_warmed: age.map(|a| NOW - a),
            hit_rate,
            coverage,
        }
    }

    #[test]
    fn test_fresh_busy_covered_is_excellent() {
        let report = HealthScorer::default().score(
            &ds(),
            inputs(Some(Duration::from_secs(60)), Some(0.9), full()),
            NOW,
        );
        assert_eq!(report.label, HealthLabel::Excellent);
        assert!((report.score - (0.4 + 0.35 * 0.9 + 0.25)).abs() < 1e-9);
    }

    #[test]
    fn test_never_warmed_and_empty_is_cold() {
        let report = HealthScorer::default().score(&ds(), HealthInputs::default(), NOW);
        assert_eq!(report.label, HealthLabel::Cold);
    }

    #[test]
    fn test_old_warm_is_stale() {
        let report = HealthScorer::default().score(
            &ds(),
            inputs(Some(Duration::from_secs(48 * 3600)), Some(1.0), full()),
            NOW,
        );
        assert_eq!(report.label, HealthLabel::Stale);
    }

    #[test]
    fn test_low_hit_rate_degrades() {
        // Half-way to stale, poor hit rate, facility dimension missing.
        let report = HealthScorer::default().score(
            &ds(),
            inputs(
                Some(Duration::from_secs(12 * 3600 + 1800)),
                Some(0.1),
                Coverage {
                    has_measure: true,
                    has_facility: false,
                },
            ),
            NOW,
        );
        assert_eq!(report.label, HealthLabel::Degraded);
    }

    #[test]
    fn test_recency_is_linear() {
        let scorer = HealthScorer::default();
        assert_eq!(scorer.recency_score(None, NOW), 0.0);
        assert_eq!(scorer.recency_score(Some(NOW), NOW), 1.0);
        let midpoint = NOW - Duration::from_secs(3600 + 23 * 1800);
        assert!((scorer.recency_score(Some(midpoint), NOW) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_labels_are_ordered() {
        assert!(HealthLabel::Excellent < HealthLabel::Good);
        assert!(HealthLabel::Stale < HealthLabel::Cold);
        assert_eq!(HealthLabel::Degraded.to_string(), "degraded");
    }
}
