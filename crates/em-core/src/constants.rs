/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// Capacity of every per-component event log (detection, generation, rule,
/// match, transition, amplifier metric history).
pub const EVENT_LOG_CAPACITY: usize = 1000;

/// Per-property value/stability history length.
pub const PROPERTY_HISTORY_CAPACITY: usize = 100;

/// Number of recent history values folded into a property's stability.
pub const STABILITY_WINDOW: usize = 10;

/// Half-life of the temporal term in pattern correlation (1 hour).
pub const CORRELATION_HALF_LIFE_MS: f64 = 3_600_000.0;

/// Maximum normalized phase delta for two layers to resonate: π/4.
pub const MAX_LAYER_PHASE_DELTA: f64 = std::f64::consts::FRAC_PI_4;

/// Fraction of a transferred energy amount applied to layer field strength.
pub const FIELD_STRENGTH_NUDGE: f64 = 0.1;

/// Tolerance for template weights summing to 1.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;
