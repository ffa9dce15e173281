use serde::{Deserialize, Serialize};

/// Tolerance for `Eq` comparisons between floats.
const EQ_TOLERANCE: f64 = 1e-9;

/// Numeric comparison used by rule conditions and template constraints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
    /// Satisfied whenever the value is present.
    Exists,
}

impl Comparison {
    /// Compare an optional reading against `expected`. A missing reading
    /// satisfies nothing, not even `Exists`.
    pub fn apply(self, actual: Option<f64>, expected: f64) -> bool {
        let Some(a) = actual else {
            return false;
        };
        match self {
            Comparison::Eq => (a - expected).abs() < EQ_TOLERANCE,
            Comparison::Gt => a > expected,
            Comparison::Lt => a < expected,
            Comparison::Gte => a >= expected,
            Comparison::Lte => a <= expected,
            Comparison::Exists => true,
        }
    }
}
