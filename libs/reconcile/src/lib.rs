//! Convergence primitives.
//!
//! Helpers shared by anything that drives an instance towards the state its
//! apply-spec describes:
//!
//! - [`UpdateConfig`]: the `update` section of an apply-spec (canaries,
//!   in-flight limits, watch windows).
//! - [`WatchTime`]: a `min-max` millisecond window and the polling schedule
//!   derived from it.
//! - [`ConvergenceStatus`]: what an agent-reported job state means for
//!   convergence.
//! - [`SpecHash`]: deterministic digest of a JSON document.
//!
//! # Invariants
//!
//! - Parsing is total: every malformed input maps to a [`ReconcileError`]
//! - Digests are independent of object key order

use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// A watch time was neither a number nor a `min-max` range.
    #[error("invalid watch time '{0}'")]
    InvalidWatchTime(String),

    /// The `update` section could not be understood.
    #[error("invalid update config: {0}")]
    InvalidUpdateConfig(String),
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (current is moving toward desired).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,

    /// Status is unknown (insufficient data).
    Unknown,
}

impl ConvergenceStatus {
    /// Map a job state reported by an agent (`running`, `starting`,
    /// `failing`, ...) onto a convergence status.
    pub fn from_job_state(job_state: &str) -> Self {
        match job_state {
            "running" => Self::Converged,
            "starting" | "stopped" => Self::Converging,
            "failing" => Self::Diverged,
            _ => Self::Unknown,
        }
    }
}

/// A spec hash for deterministic comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Minimum gap between two agent polls while watching a job come up.
const MIN_POLL_STEP: Duration = Duration::from_millis(1000);

/// Number of polls a watch window is split into.
const WATCH_INTERVALS: u32 = 10;

/// A watch window in milliseconds, written `1000-60000` or as a bare number
/// (`30000` means `30000-30000`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTime {
    pub min: Duration,
    pub max: Duration,
}

impl WatchTime {
    /// Parse a watch time string.
    pub fn parse(raw: &str) -> Result<Self, ReconcileError> {
        let invalid = || ReconcileError::InvalidWatchTime(raw.to_string());
        let raw_trimmed = raw.trim();

        let (min, max) = match raw_trimmed.split_once('-') {
            Some((min, max)) => (
                min.trim().parse::<u64>().map_err(|_| invalid())?,
                max.trim().parse::<u64>().map_err(|_| invalid())?,
            ),
            None => {
                let single = raw_trimmed.parse::<u64>().map_err(|_| invalid())?;
                (single, single)
            }
        };

        if min > max {
            return Err(invalid());
        }

        Ok(Self::from_millis(min, max))
    }

    pub fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    /// Sleep intervals between polls: first the minimum, then even steps of
    /// at least one second until the maximum is used up.
    pub fn schedule(&self) -> Vec<Duration> {
        let delta = self.max.saturating_sub(self.min);
        let step = MIN_POLL_STEP.max(delta / (WATCH_INTERVALS - 1));
        let steps = (delta.as_millis() / step.as_millis()) as usize;

        let mut schedule = Vec::with_capacity(steps + 1);
        schedule.push(self.min);
        schedule.extend(std::iter::repeat(step).take(steps));
        schedule
    }
}

impl<'de> Deserialize<'de> for WatchTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Range(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Self::from_millis(ms, ms)),
            Raw::Range(s) => Self::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// A count that may be given absolutely (`2`) or relative to the group size
/// (`"25%"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlight {
    Count(u32),
    Percent(u32),
}

impl<'de> Deserialize<'de> for InFlight {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(Self::Count(n)),
            Raw::Text(s) => {
                let parsed = match s.trim().strip_suffix('%') {
                    Some(pct) => pct.trim().parse().map(Self::Percent),
                    None => s.trim().parse().map(Self::Count),
                };
                parsed.map_err(|_| serde::de::Error::custom(format!("invalid count '{s}'")))
            }
        }
    }
}

/// The `update` section of an apply-spec.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateConfig {
    pub canaries: InFlight,
    pub max_in_flight: InFlight,
    pub canary_watch_time: WatchTime,
    pub update_watch_time: WatchTime,
    #[serde(default)]
    pub serial: Option<bool>,
}

impl UpdateConfig {
    /// Parse from the JSON `update` section.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ReconcileError> {
        Self::deserialize(value).map_err(|e| ReconcileError::InvalidUpdateConfig(e.to_string()))
    }

    /// Watch window to use for a canary or a regular instance.
    pub fn watch_time(&self, canary: bool) -> WatchTime {
        if canary {
            self.canary_watch_time
        } else {
            self.update_watch_time
        }
    }
}

/// Default watch window when an instance carries no update config.
pub const DEFAULT_WATCH_TIME: WatchTime = WatchTime {
    min: Duration::from_millis(0),
    max: Duration::from_millis(60_000),
};

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, "x"], "x": null}});
        let json2 = serde_json::json!({"a": {"x": null, "y": [1, "x"]}, "b": 2});

        assert_eq!(SpecHash::from_json(&json1), SpecHash::from_json(&json2));
        assert!(SpecHash::from_json(&json1).as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_differs_on_content() {
        let a = SpecHash::from_json(&serde_json::json!({"a": "1"}));
        let b = SpecHash::from_json(&serde_json::json!({"a": 1}));
        assert_ne!(a, b);
    }

    #[rstest]
    #[case("1000-60000", 1_000, 60_000)]
    #[case("30000", 30_000, 30_000)]
    #[case(" 500 - 1500 ", 500, 1_500)]
    fn test_watch_time_parse(#[case] raw: &str, #[case] min: u64, #[case] max: u64) {
        assert_eq!(WatchTime::parse(raw).unwrap(), WatchTime::from_millis(min, max));
    }

    #[rstest]
    #[case("")]
    #[case("fast")]
    #[case("60000-1000")]
    #[case("1-2-3")]
    fn test_watch_time_rejects(#[case] raw: &str) {
        assert!(matches!(
            WatchTime::parse(raw),
            Err(ReconcileError::InvalidWatchTime(_))
        ));
    }

    #[test]
    fn test_watch_schedule_small_window_uses_one_second_steps() {
        let schedule = WatchTime::from_millis(1_000, 4_000).schedule();
        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(1_000),
                Duration::from_millis(1_000),
                Duration::from_millis(1_000),
            ]
        );
    }

    #[test]
    fn test_watch_schedule_large_window_splits_evenly() {
        let schedule = WatchTime::from_millis(0, 90_000).schedule();
        assert_eq!(schedule.len(), 10);
        assert_eq!(schedule[0], Duration::ZERO);
        assert!(schedule[1..].iter().all(|d| *d == Duration::from_millis(10_000)));
    }

    #[test]
    fn test_watch_schedule_fixed_window() {
        let schedule = WatchTime::from_millis(5_000, 5_000).schedule();
        assert_eq!(schedule, vec![Duration::from_millis(5_000)]);
    }

    #[test]
    fn test_update_config_from_json() {
        let config = UpdateConfig::from_json(&serde_json::json!({
            "canaries": 1,
            "max_in_flight": "25%",
            "canary_watch_time": "1000-30000",
            "update_watch_time": 20000,
        }))
        .unwrap();

        assert_eq!(config.canaries, InFlight::Count(1));
        assert_eq!(config.max_in_flight, InFlight::Percent(25));
        assert_eq!(config.watch_time(true), WatchTime::from_millis(1_000, 30_000));
        assert_eq!(config.watch_time(false), WatchTime::from_millis(20_000, 20_000));
        assert_eq!(config.serial, None);
    }

    #[test]
    fn test_update_config_rejects_garbage() {
        let err = UpdateConfig::from_json(&serde_json::json!({"canaries": "lots"})).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidUpdateConfig(_)));
    }

    #[rstest]
    #[case(serde_json::json!(2), InFlight::Count(2))]
    #[case(serde_json::json!("3"), InFlight::Count(3))]
    #[case(serde_json::json!(" 40% "), InFlight::Percent(40))]
    fn test_in_flight_forms(#[case] raw: serde_json::Value, #[case] expected: InFlight) {
        assert_eq!(serde_json::from_value::<InFlight>(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("running", ConvergenceStatus::Converged)]
    #[case("starting", ConvergenceStatus::Converging)]
    #[case("failing", ConvergenceStatus::Diverged)]
    #[case("unmonitored", ConvergenceStatus::Unknown)]
    fn test_job_state_mapping(#[case] state: &str, #[case] expected: ConvergenceStatus) {
        assert_eq!(ConvergenceStatus::from_job_state(state), expected);
    }
}
