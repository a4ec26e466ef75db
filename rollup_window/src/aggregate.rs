//! Reductions from a window's samples to the single value emitted for it.
//!
//! Windows do not keep their samples. Every supported [`Mode`] can be computed
//! from a running [`Summary`] -- count, sum, min and max -- so a window costs
//! the same handful of bytes whether it saw one sample or a million. The sum
//! is folded in arrival order, which makes the summary of a sequence produce
//! exactly the value [`compute`] produces for that sequence.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Errors produced when parsing a [`Mode`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The name does not match any supported aggregation.
    #[error("unknown aggregation mode '{0}', expected one of sum, min, max, avg")]
    UnknownMode(String),
}

/// The aggregation applied to every window, fixed for the life of the
/// process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Arithmetic sum of all samples.
    #[default]
    Sum,
    /// Smallest sample.
    Min,
    /// Largest sample.
    Max,
    /// Sum divided by the number of samples.
    Avg,
}

impl Mode {
    /// Reduce a window summary to the value this mode emits.
    #[must_use]
    pub fn reduce(self, summary: &Summary) -> f64 {
        match self {
            Mode::Sum => summary.sum,
            Mode::Min => summary.min,
            Mode::Max => summary.max,
            Mode::Avg => summary.mean(),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Sum => "sum",
            Mode::Min => "min",
            Mode::Max => "max",
            Mode::Avg => "avg",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Mode::Sum),
            "min" => Ok(Mode::Min),
            "max" => Ok(Mode::Max),
            "avg" => Ok(Mode::Avg),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// Running summary of the samples recorded into one window.
///
/// A `Summary` always holds at least one sample: the only constructor takes
/// the first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Summary {
    /// Start a summary from its first sample.
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    /// Fold another sample into the summary.
    #[inline]
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Number of samples recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of samples recorded.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Smallest sample recorded.
    #[must_use]
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest sample recorded.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Sum over count.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// Reduce `samples` with `mode`.
///
/// # Panics
///
/// Panics if `samples` is empty. Every window holds at least one sample, an
/// empty input means the caller's bookkeeping is broken.
#[must_use]
pub fn compute(mode: Mode, samples: &[f64]) -> f64 {
    let Some((first, rest)) = samples.split_first() else {
        panic!("attempted to aggregate an empty sample set with mode {mode}");
    };
    let mut summary = Summary::new(*first);
    for value in rest {
        summary.record(*value);
    }
    mode.reduce(&summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MODES: [Mode; 4] = [Mode::Sum, Mode::Min, Mode::Max, Mode::Avg];

    fn finite_samples() -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(-1.0e12f64..1.0e12f64, 1..256)
    }

    #[test]
    fn avg_of_known_samples() {
        assert_eq!(compute(Mode::Avg, &[2.0, 4.0, 9.0]), 5.0);
    }

    #[test]
    fn single_sample_is_every_aggregate() {
        for mode in MODES {
            assert_eq!(compute(mode, &[7.5]), 7.5, "mode {mode}");
        }
    }

    #[test]
    fn known_aggregates() {
        let samples = [1.0, -3.0, 2.0, 8.0];
        assert_eq!(compute(Mode::Sum, &samples), 8.0);
        assert_eq!(compute(Mode::Min, &samples), -3.0);
        assert_eq!(compute(Mode::Max, &samples), 8.0);
        assert_eq!(compute(Mode::Avg, &samples), 2.0);
    }

    #[test]
    #[should_panic(expected = "empty sample set")]
    fn empty_samples_panic() {
        let _ = compute(Mode::Sum, &[]);
    }

    #[test]
    fn mode_names_round_trip() {
        for mode in MODES {
            assert_eq!(mode.to_string().parse::<Mode>(), Ok(mode));
        }
    }

    #[test]
    fn unknown_mode_rejected() {
        assert_eq!(
            "median".parse::<Mode>(),
            Err(Error::UnknownMode("median".to_string()))
        );
        assert!("SUM".parse::<Mode>().is_err());
    }

    proptest! {
        #[test]
        fn sum_matches_left_fold(samples in finite_samples()) {
            let expected = samples.iter().fold(0.0, |acc, v| acc + v);
            prop_assert_eq!(compute(Mode::Sum, &samples), expected);
        }

        #[test]
        fn min_max_are_extreme_elements(samples in finite_samples()) {
            let min = compute(Mode::Min, &samples);
            let max = compute(Mode::Max, &samples);
            prop_assert!(samples.contains(&min));
            prop_assert!(samples.contains(&max));
            for v in &samples {
                prop_assert!(min <= *v);
                prop_assert!(*v <= max);
            }
        }

        #[test]
        fn avg_is_sum_over_len(samples in finite_samples()) {
            let sum = samples.iter().fold(0.0, |acc, v| acc + v);
            let expected = sum / samples.len() as f64;
            prop_assert_eq!(compute(Mode::Avg, &samples), expected);
        }
    }
}
