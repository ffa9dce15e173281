//! The seam between engine components and whatever schedules them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

/// A component that does its work in discrete cycles.
///
/// A cycle is atomic with respect to the component's public getters. The
/// scheduler calls `run_cycle` once per `interval`; an error is logged and
/// the next tick starts again from scratch.
pub trait Periodic: Send + Sync {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;
    fn run_cycle(&self) -> Result<()>;
    fn status(&self) -> StatusSnapshot;
}

/// Counts and aggregate scores for the monitoring layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub component: String,
    pub counts: BTreeMap<String, u64>,
    pub scores: BTreeMap<String, f64>,
}

impl StatusSnapshot {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..Self::default()
        }
    }

    pub fn count(mut self, key: &str, value: u64) -> Self {
        self.counts.insert(key.to_string(), value);
        self
    }

    pub fn score(mut self, key: &str, value: f64) -> Self {
        self.scores.insert(key.to_string(), value);
        self
    }
}

/// Mean of an iterator of floats, 0 when empty.
pub(crate) fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_builder() {
        let s = StatusSnapshot::new("detector")
            .count("patterns", 3)
            .score("mean_strength", 0.5);
        assert_eq!(s.component, "detector");
        assert_eq!(s.counts["patterns"], 3);
        assert_eq!(s.scores["mean_strength"], 0.5);
    }

    #[test]
    fn test_mean_empty_is_zero() {
        assert_eq!(mean(Vec::<f64>::new()), 0.0);
        assert_eq!(mean([1.0, 2.0, 3.0]), 2.0);
    }
}
