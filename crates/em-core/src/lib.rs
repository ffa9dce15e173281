//! Emergence engine core.
//!
//! Watches an evolving field snapshot for recurring patterns, synthesizes
//! properties from pattern combinations, fires and learns rules, amplifies
//! resonances, matches patterns against templates, and stratifies them into
//! layers that trade energy over bridges.
//!
//! Zero I/O and no async runtime. Scheduling lives in `em-runtime`.

pub mod amplifier;
pub mod comparison;
pub mod config;
pub mod constants;
pub mod cross;
pub mod detector;
pub mod error;
pub mod field;
pub mod generator;
pub mod history;
pub mod matcher;
pub mod pattern;
pub mod periodic;
pub mod rules;
pub mod time;

pub use amplifier::{AmplifierMetrics, FeedbackLoop, MetricPoint, Resonance, ResonanceAmplifier};
pub use comparison::Comparison;
pub use config::{
    AmplifierConfig, CrossConfig, DetectorConfig, EngineConfig, FieldConfig, GeneratorConfig,
    MatcherConfig, RuleConfig,
};
pub use constants::{EPSILON, EVENT_LOG_CAPACITY, PROPERTY_HISTORY_CAPACITY};
pub use cross::{
    Bridge, Channel, ChannelDirection, ChannelKind, ChannelState, CrossResonance, Layer, TransitionEvent,
};
pub use detector::{DetectionEvent, PatternDetector, pair_interaction};
pub use error::{EngineError, Result};
pub use field::{Category, EnergyGrid, Field, FieldState, QuantumState, SimField, relation_factor};
pub use generator::{GenerationEvent, GenerationReport, Property, PropertyGenerator, Role};
pub use history::BoundedLog;
pub use matcher::{
    Constraint, ConstraintTarget, Feature, FeatureValue, Match, PatternMatcher, Shape, Template,
    default_templates,
};
pub use pattern::{Component, ComponentSource, Pattern, PatternKind, PatternSource};
pub use periodic::{Periodic, StatusSnapshot};
pub use rules::{Action, Condition, Rule, RuleEngine, RuleOrigin, Subject, default_rules};
