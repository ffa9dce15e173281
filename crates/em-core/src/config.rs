//! Engine configuration. Every section deserializes with defaults so a
//! partial TOML file only needs to name the values it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::matcher::Template;
use crate::rules::{Rule, RuleOrigin};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub field: FieldConfig,
    pub detector: DetectorConfig,
    pub generator: GeneratorConfig,
    pub rules: RuleConfig,
    pub amplifier: AmplifierConfig,
    pub matcher: MatcherConfig,
    pub cross: CrossConfig,
}

/// Parameters of the simulated field used by the CLI and the field driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub grid_width: usize,
    pub grid_height: usize,
    pub initial_energy: f64,
    /// Max relative change per perturbation step.
    pub drift: f64,
    pub update_interval_ms: u64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            grid_width: 8,
            grid_height: 8,
            initial_energy: 5.0,
            drift: 0.05,
            update_interval_ms: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub sensitivity: f64,
    pub pattern_threshold: f64,
    pub min_confidence: f64,
    pub time_window_ms: u64,
    pub max_cluster_radius: usize,
    pub flow_stride: usize,
    pub max_flow_patterns: usize,
    pub update_interval_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.1,
            pattern_threshold: 0.3,
            min_confidence: 0.2,
            time_window_ms: 3_600_000,
            max_cluster_radius: 3,
            flow_stride: 2,
            max_flow_patterns: 16,
            update_interval_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub complexity_threshold: f64,
    pub stability_threshold: f64,
    pub probability_threshold: f64,
    pub evolution_rate: f64,
    pub max_combination_inputs: usize,
    pub max_properties: usize,
    /// Field stability a potential property requires.
    pub min_field_stability: f64,
    /// Field coherence a potential property requires.
    pub min_field_coherence: f64,
    /// Base time frame (ms) divided by stability for potential properties.
    pub base_time_frame_ms: u64,
    pub update_interval_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            complexity_threshold: 0.1,
            stability_threshold: 0.3,
            probability_threshold: 0.5,
            evolution_rate: 0.1,
            max_combination_inputs: 24,
            max_properties: 256,
            min_field_stability: 0.0,
            min_field_coherence: 0.0,
            base_time_frame_ms: 60_000,
            update_interval_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Weighted fraction of satisfied conditions a rule needs to fire.
    pub threshold: f64,
    /// Minimum rule confidence to fire, and minimum correlation to learn.
    pub min_confidence: f64,
    /// Cap on configured rules.
    pub max_rules: usize,
    /// Cap on learned rules, counted separately from configured ones.
    pub max_learned_rules: usize,
    pub update_interval_ms: u64,
    /// Extra rules registered at startup alongside the built-in set. A rule
    /// sharing a built-in's ID replaces it.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            min_confidence: 0.5,
            max_rules: 100,
            max_learned_rules: 100,
            update_interval_ms: 1000,
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmplifierConfig {
    pub gain_factor: f64,
    pub max_amplitude: f64,
    pub stability_threshold: f64,
    pub update_interval_ms: u64,
}

impl Default for AmplifierConfig {
    fn default() -> Self {
        Self {
            gain_factor: 1.5,
            max_amplitude: 10.0,
            stability_threshold: 0.3,
            update_interval_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub min_similarity: f64,
    pub match_timeout_ms: u64,
    pub max_pattern_age_ms: u64,
    pub update_interval_ms: u64,
    /// Extra templates registered at startup alongside the built-in set. A
    /// template sharing a built-in's ID replaces it.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.6,
            match_timeout_ms: 300_000,
            max_pattern_age_ms: 600_000,
            update_interval_ms: 1000,
            templates: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossConfig {
    pub resonance_threshold: f64,
    pub coherence_threshold: f64,
    pub coupling_strength: f64,
    pub min_coherence: f64,
    pub bridge_max_age_ms: u64,
    pub channel_capacity: f64,
    pub coherence_mismatch: f64,
    pub min_transfer_energy: f64,
    pub update_interval_ms: u64,
}

impl Default for CrossConfig {
    fn default() -> Self {
        Self {
            resonance_threshold: 0.1,
            coherence_threshold: 0.3,
            coupling_strength: 0.8,
            min_coherence: 0.3,
            bridge_max_age_ms: 600_000,
            channel_capacity: 1.0,
            coherence_mismatch: 0.5,
            min_transfer_energy: 0.01,
            update_interval_ms: 1000,
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::validation(format!(
            "{name} must be in [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value.is_finite()) {
        return Err(EngineError::validation(format!(
            "{name} must be positive, got {value}"
        )));
    }
    Ok(())
}

fn check_interval(name: &str, ms: u64) -> Result<()> {
    if ms == 0 {
        return Err(EngineError::validation(format!(
            "{name}.update_interval_ms must be non-zero"
        )));
    }
    Ok(())
}

impl EngineConfig {
    /// Reject thresholds and ratios outside their valid range.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        check_unit("detector.sensitivity", d.sensitivity)?;
        check_unit("detector.min_confidence", d.min_confidence)?;
        if d.pattern_threshold < 0.0 {
            return Err(EngineError::validation("detector.pattern_threshold must be >= 0"));
        }
        if d.flow_stride == 0 {
            return Err(EngineError::validation("detector.flow_stride must be >= 1"));
        }
        check_interval("detector", d.update_interval_ms)?;

        let g = &self.generator;
        check_unit("generator.complexity_threshold", g.complexity_threshold)?;
        check_unit("generator.stability_threshold", g.stability_threshold)?;
        check_unit("generator.probability_threshold", g.probability_threshold)?;
        check_unit("generator.evolution_rate", g.evolution_rate)?;
        check_interval("generator", g.update_interval_ms)?;

        let r = &self.rules;
        check_unit("rules.threshold", r.threshold)?;
        check_unit("rules.min_confidence", r.min_confidence)?;
        check_interval("rules", r.update_interval_ms)?;
        for (i, rule) in r.rules.iter().enumerate() {
            rule.validate()?;
            if rule.origin != RuleOrigin::Configured {
                return Err(EngineError::validation(format!(
                    "rules.rules: {} must be a configured rule",
                    rule.id
                )));
            }
            if r.rules[..i].iter().any(|other| other.id == rule.id) {
                return Err(EngineError::validation(format!("rules.rules: duplicate id {}", rule.id)));
            }
        }
        if r.rules.len() > r.max_rules {
            return Err(EngineError::validation(format!(
                "rules.rules: {} rules exceed max_rules {}",
                r.rules.len(),
                r.max_rules
            )));
        }

        let a = &self.amplifier;
        check_positive("amplifier.gain_factor", a.gain_factor)?;
        check_positive("amplifier.max_amplitude", a.max_amplitude)?;
        check_unit("amplifier.stability_threshold", a.stability_threshold)?;
        check_interval("amplifier", a.update_interval_ms)?;

        let m = &self.matcher;
        check_unit("matcher.min_similarity", m.min_similarity)?;
        check_interval("matcher", m.update_interval_ms)?;
        for (i, template) in m.templates.iter().enumerate() {
            template.validate()?;
            if m.templates[..i].iter().any(|other| other.id == template.id) {
                return Err(EngineError::validation(format!(
                    "matcher.templates: duplicate id {}",
                    template.id
                )));
            }
        }

        let c = &self.cross;
        check_unit("cross.coherence_threshold", c.coherence_threshold)?;
        check_unit("cross.min_coherence", c.min_coherence)?;
        check_positive("cross.coupling_strength", c.coupling_strength)?;
        check_positive("cross.channel_capacity", c.channel_capacity)?;
        if c.resonance_threshold < 0.0 {
            return Err(EngineError::validation("cross.resonance_threshold must be >= 0"));
        }
        check_interval("cross", c.update_interval_ms)?;

        check_interval("field", self.field.update_interval_ms)?;
        if self.field.grid_width == 0 || self.field.grid_height == 0 {
            return Err(EngineError::validation("field grid dimensions must be non-zero"));
        }
        Ok(())
    }
}

pub(crate) fn interval(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}
