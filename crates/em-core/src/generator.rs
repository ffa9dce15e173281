//! Property synthesis from combinations of active patterns.
//!
//! Every cycle scores all 1-, 2- and 3-pattern combinations, turns the
//! promising ones into potential properties, materializes those that clear
//! the probability and resource gates, then revalidates and evolves the
//! properties that already exist.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{GeneratorConfig, interval};
use crate::constants::{EVENT_LOG_CAPACITY, PROPERTY_HISTORY_CAPACITY, STABILITY_WINDOW};
use crate::detector::PatternDetector;
use crate::error::{EngineError, Result};
use crate::field::{Field, FieldState};
use crate::history::BoundedLog;
use crate::pattern::{Pattern, PatternFamily, PatternKind};
use crate::periodic::{Periodic, StatusSnapshot, mean};
use crate::time::now_millis;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Core,
    Catalyst,
    Container,
    Enhancer,
    Support,
}

impl Role {
    /// Multiplier applied to a component's contribution to the property value.
    pub fn factor(self) -> f64 {
        match self {
            Role::Core => 1.0,
            Role::Catalyst => 1.2,
            Role::Container => 0.9,
            Role::Enhancer => 1.1,
            Role::Support => 0.8,
        }
    }

    fn type_match_bonus(self) -> f64 {
        match self {
            Role::Core => 0.1,
            Role::Enhancer => 0.05,
            _ => 0.0,
        }
    }
}

/// Role of a source pattern inside a property of kind `property`.
pub fn assign_role(source: PatternKind, property: PatternKind) -> Role {
    if source == property {
        return Role::Core;
    }
    match source.family() {
        PatternFamily::Resonance => Role::Catalyst,
        PatternFamily::Field => Role::Container,
        PatternFamily::Elemental if source.enhances(property) => Role::Enhancer,
        PatternFamily::Elemental => Role::Support,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PropertyComponent {
    pub pattern_id: String,
    pub weight: f64,
    pub role: Role,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PropertySample {
    pub timestamp: u64,
    pub value: f64,
    pub stability: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Property {
    pub id: String,
    pub kind: PatternKind,
    pub value: f64,
    pub components: Vec<PropertyComponent>,
    pub stability: f64,
    pub required_energy: f64,
    pub history: BoundedLog<PropertySample>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Property {
    /// Sorted IDs of the backing patterns.
    pub fn signature(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.components.iter().map(|c| c.pattern_id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn attribute(&self, name: &str) -> Option<f64> {
        match name {
            "value" => Some(self.value),
            "stability" => Some(self.stability),
            "required_energy" => Some(self.required_energy),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Energy,
    Stability,
    Coherence,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Requirement {
    pub kind: RequirementKind,
    pub minimum: f64,
}

impl Requirement {
    pub fn holds(&self, state: &FieldState) -> bool {
        let available = match self.kind {
            RequirementKind::Energy => state.energy,
            RequirementKind::Stability => state.stability,
            RequirementKind::Coherence => state.coherence(),
        };
        available >= self.minimum
    }
}

/// A scored pattern combination that may become a property.
#[derive(Clone, Debug, Serialize)]
pub struct PotentialProperty {
    pub kind: PatternKind,
    pub pattern_ids: Vec<String>,
    pub probability: f64,
    pub coherence: f64,
    pub stability: f64,
    pub complexity: f64,
    pub required_energy: f64,
    pub time_frame_ms: u64,
    pub requirements: Vec<Requirement>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    PatternMissing,
    PatternWeak,
    InsufficientEnergy,
    Unstable,
    Manual,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GenerationEvent {
    Created {
        timestamp: u64,
        property_id: String,
        kind: PatternKind,
        pattern_ids: Vec<String>,
        probability: Option<f64>,
    },
    Removed {
        timestamp: u64,
        property_id: String,
        reason: RemovalReason,
    },
}

/// Outcome of one generation cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationReport {
    pub potentials: usize,
    pub created: Vec<String>,
    pub removed: Vec<String>,
    pub evolved: usize,
}

struct GeneratorState {
    properties: BTreeMap<String, Property>,
    potentials: Vec<PotentialProperty>,
    events: BoundedLog<GenerationEvent>,
    cycles: u64,
}

pub struct PropertyGenerator {
    detector: Arc<PatternDetector>,
    field: Arc<dyn Field>,
    config: GeneratorConfig,
    state: RwLock<GeneratorState>,
}

impl PropertyGenerator {
    pub fn new(detector: Arc<PatternDetector>, field: Arc<dyn Field>, config: GeneratorConfig) -> Self {
        Self {
            detector,
            field,
            config,
            state: RwLock::new(GeneratorState {
                properties: BTreeMap::new(),
                potentials: Vec::new(),
                events: BoundedLog::new(EVENT_LOG_CAPACITY),
                cycles: 0,
            }),
        }
    }

    pub fn generate(&self) -> Result<GenerationReport> {
        self.generate_at(now_millis())
    }

    /// Detect, then synthesize over the fresh pattern set.
    pub fn generate_at(&self, now: u64) -> Result<GenerationReport> {
        let patterns = self.detector.detect_at(now)?;
        let snapshot = self.field.state()?;
        Ok(self.generate_from(&patterns, &snapshot, now))
    }

    /// One generation cycle over an explicit pattern set and snapshot.
    pub fn generate_from(&self, patterns: &[Pattern], snapshot: &FieldState, now: u64) -> GenerationReport {
        let by_id: HashMap<&str, &Pattern> = patterns.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut potentials = self.find_potentials(patterns);
        potentials.sort_by(|a, b| b.probability.total_cmp(&a.probability));

        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut report = GenerationReport {
            potentials: potentials.len(),
            ..GenerationReport::default()
        };

        let mut live: HashSet<Vec<String>> = state.properties.values().map(|p| p.signature()).collect();
        for potential in &potentials {
            if state.properties.len() >= self.config.max_properties {
                break;
            }
            if potential.probability < self.config.probability_threshold {
                continue;
            }
            let mut signature = potential.pattern_ids.clone();
            signature.sort();
            if live.contains(&signature) {
                continue;
            }
            if snapshot.energy < potential.required_energy {
                tracing::debug!(
                    required = potential.required_energy,
                    available = snapshot.energy,
                    "potential property skipped: insufficient energy"
                );
                continue;
            }
            if !potential.requirements.iter().all(|r| r.holds(snapshot)) {
                continue;
            }

            let property = build_property(
                potential.kind,
                &potential.pattern_ids,
                &by_id,
                potential.stability,
                potential.required_energy,
                now,
            );
            let Some(property) = property else {
                continue;
            };
            state.events.push(GenerationEvent::Created {
                timestamp: now,
                property_id: property.id.clone(),
                kind: property.kind,
                pattern_ids: potential.pattern_ids.clone(),
                probability: Some(potential.probability),
            });
            tracing::debug!(property = %property.id, kind = %property.kind, "property generated");
            live.insert(signature);
            report.created.push(property.id.clone());
            state.properties.insert(property.id.clone(), property);
        }

        let mut doomed = Vec::new();
        for (id, property) in state.properties.iter_mut() {
            match self.revalidate(property, &by_id, snapshot) {
                Some(reason) => doomed.push((id.clone(), reason)),
                None => {
                    self.evolve(property, &by_id, now);
                    report.evolved += 1;
                }
            }
        }
        for (id, reason) in doomed {
            state.properties.remove(&id);
            state.events.push(GenerationEvent::Removed {
                timestamp: now,
                property_id: id.clone(),
                reason,
            });
            tracing::debug!(property = %id, ?reason, "property removed");
            report.removed.push(id);
        }

        state.potentials = potentials;
        state.cycles += 1;
        report
    }

    fn find_potentials(&self, patterns: &[Pattern]) -> Vec<PotentialProperty> {
        let mut inputs: Vec<&Pattern> = patterns.iter().collect();
        inputs.sort_by(|a, b| b.strength.total_cmp(&a.strength));
        inputs.truncate(self.config.max_combination_inputs);

        let n = inputs.len();
        let mut out = Vec::new();
        for i in 0..n {
            out.extend(self.score(&[inputs[i]]));
            for j in i + 1..n {
                out.extend(self.score(&[inputs[i], inputs[j]]));
                for k in j + 1..n {
                    out.extend(self.score(&[inputs[i], inputs[j], inputs[k]]));
                }
            }
        }
        out
    }

    fn score(&self, combo: &[&Pattern]) -> Option<PotentialProperty> {
        let coherence = mean(combo.iter().map(|p| p.coherence()));
        let stability = mean(combo.iter().map(|p| p.stability));
        let complexity = combination_complexity(combo);
        if complexity < self.config.complexity_threshold || stability < self.config.stability_threshold {
            return None;
        }
        let dominant = combo
            .iter()
            .copied()
            .reduce(|best, p| if p.strength > best.strength { p } else { best })?;
        let required_energy: f64 = combo.iter().map(|p| p.energy.max(0.0)).sum();
        let time_frame_ms = (self.config.base_time_frame_ms as f64 / stability.max(0.01)) as u64;

        Some(PotentialProperty {
            kind: dominant.kind,
            pattern_ids: combo.iter().map(|p| p.id.clone()).collect(),
            probability: (coherence + stability + complexity) / 3.0,
            coherence,
            stability,
            complexity,
            required_energy,
            time_frame_ms,
            requirements: vec![
                Requirement {
                    kind: RequirementKind::Energy,
                    minimum: required_energy,
                },
                Requirement {
                    kind: RequirementKind::Stability,
                    minimum: self.config.min_field_stability,
                },
                Requirement {
                    kind: RequirementKind::Coherence,
                    minimum: self.config.min_field_coherence,
                },
            ],
        })
    }

    fn revalidate(
        &self,
        property: &Property,
        patterns: &HashMap<&str, &Pattern>,
        snapshot: &FieldState,
    ) -> Option<RemovalReason> {
        let min_strength = self.detector.config().sensitivity;
        for c in &property.components {
            match patterns.get(c.pattern_id.as_str()) {
                None => return Some(RemovalReason::PatternMissing),
                Some(p) if p.strength < min_strength => return Some(RemovalReason::PatternWeak),
                Some(_) => {}
            }
        }
        if snapshot.energy < property.required_energy {
            return Some(RemovalReason::InsufficientEnergy);
        }
        if property.stability < self.config.stability_threshold {
            return Some(RemovalReason::Unstable);
        }
        None
    }

    /// `new = old + (effect − old) × rate`; stability from the variance of
    /// the recent window plus the new value.
    fn evolve(&self, property: &mut Property, patterns: &HashMap<&str, &Pattern>, now: u64) {
        let Some(effect) = component_effect(&property.components, patterns) else {
            return;
        };
        let next = property.value + (effect - property.value) * self.config.evolution_rate;
        let mut window: Vec<f64> = property.history.recent(STABILITY_WINDOW).map(|s| s.value).collect();
        window.push(next);
        property.value = next;
        property.stability = 1.0 / (1.0 + variance(&window));
        property.updated_at = now;
        property.history.push(PropertySample {
            timestamp: now,
            value: next,
            stability: property.stability,
        });
    }

    /// Register a property directly, bypassing the probability gates.
    pub fn register_property(&self, kind: PatternKind, value: f64, pattern_ids: &[String]) -> Result<String> {
        self.register_property_at(kind, value, pattern_ids, now_millis())
    }

    pub fn register_property_at(
        &self,
        kind: PatternKind,
        value: f64,
        pattern_ids: &[String],
        now: u64,
    ) -> Result<String> {
        if pattern_ids.is_empty() {
            return Err(EngineError::validation("property needs at least one pattern"));
        }
        if !value.is_finite() {
            return Err(EngineError::validation(format!("property value must be finite, got {value}")));
        }
        let mut patterns = Vec::with_capacity(pattern_ids.len());
        for id in pattern_ids {
            let p = self
                .detector
                .pattern(id)
                .ok_or_else(|| EngineError::not_found("pattern", id.clone()))?;
            patterns.push(p);
        }
        let by_id: HashMap<&str, &Pattern> = patterns.iter().map(|p| (p.id.as_str(), p)).collect();
        let stability = mean(patterns.iter().map(|p| p.stability));
        let required_energy: f64 = patterns.iter().map(|p| p.energy.max(0.0)).sum();

        let mut state = self.state.write();
        if state.properties.len() >= self.config.max_properties {
            return Err(EngineError::validation(format!(
                "property limit of {} reached",
                self.config.max_properties
            )));
        }
        let mut property = build_property(kind, pattern_ids, &by_id, stability, required_energy, now)
            .ok_or_else(|| EngineError::validation("property components could not be resolved"))?;
        property.value = value;
        let seed = property.history.last().copied();
        if let Some(sample) = seed {
            property.history.clear();
            property.history.push(PropertySample { value, ..sample });
        }
        let id = property.id.clone();
        state.events.push(GenerationEvent::Created {
            timestamp: now,
            property_id: id.clone(),
            kind,
            pattern_ids: pattern_ids.to_vec(),
            probability: None,
        });
        state.properties.insert(id.clone(), property);
        Ok(id)
    }

    pub fn remove_property(&self, id: &str) -> Result<Property> {
        let mut state = self.state.write();
        let property = state
            .properties
            .remove(id)
            .ok_or_else(|| EngineError::not_found("property", id))?;
        state.events.push(GenerationEvent::Removed {
            timestamp: now_millis(),
            property_id: id.to_string(),
            reason: RemovalReason::Manual,
        });
        Ok(property)
    }

    pub fn properties(&self) -> Vec<Property> {
        self.state.read().properties.values().cloned().collect()
    }

    pub fn property(&self, id: &str) -> Option<Property> {
        self.state.read().properties.get(id).cloned()
    }

    pub fn potentials(&self) -> Vec<PotentialProperty> {
        self.state.read().potentials.clone()
    }

    pub fn events(&self) -> Vec<GenerationEvent> {
        self.state.read().events.to_vec()
    }
}

fn build_property(
    kind: PatternKind,
    pattern_ids: &[String],
    patterns: &HashMap<&str, &Pattern>,
    stability: f64,
    required_energy: f64,
    now: u64,
) -> Option<Property> {
    let mut components = Vec::with_capacity(pattern_ids.len());
    for id in pattern_ids {
        let p = patterns.get(id.as_str())?;
        let role = assign_role(p.kind, kind);
        let weight = p.strength * (1.0 + p.stability) / 2.0 * (1.0 + role.type_match_bonus());
        components.push(PropertyComponent {
            pattern_id: id.clone(),
            weight,
            role,
        });
    }
    let value = component_effect(&components, patterns)?;
    let mut history = BoundedLog::new(PROPERTY_HISTORY_CAPACITY);
    history.push(PropertySample {
        timestamp: now,
        value,
        stability,
    });
    Some(Property {
        id: Uuid::new_v4().to_string(),
        kind,
        value,
        components,
        stability,
        required_energy,
        history,
        created_at: now,
        updated_at: now,
    })
}

/// Role-weighted mean strength of the backing patterns, in [0, 1].
fn component_effect(components: &[PropertyComponent], patterns: &HashMap<&str, &Pattern>) -> Option<f64> {
    let total: f64 = components.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        return Some(0.0);
    }
    let mut sum = 0.0;
    for c in components {
        let p = patterns.get(c.pattern_id.as_str())?;
        sum += c.weight * p.strength * c.role.factor();
    }
    Some((sum / total).clamp(0.0, 1.0))
}

/// mean(components/10, same-kind component pairs/10, properties/10) over
/// the whole combination, each term capped at 1.
fn combination_complexity(combo: &[&Pattern]) -> f64 {
    let sources: Vec<_> = combo.iter().flat_map(|p| p.components.iter().map(|c| &c.source)).collect();
    let mut pairs = 0usize;
    for (i, a) in sources.iter().enumerate() {
        pairs += sources[i + 1..].iter().filter(|b| a.same_kind(b)).count();
    }
    let properties: usize = combo.iter().map(|p| p.properties.len()).sum();
    let terms = [
        sources.len() as f64 / 10.0,
        pairs as f64 / 10.0,
        properties as f64 / 10.0,
    ];
    terms.iter().map(|t| t.min(1.0)).sum::<f64>() / 3.0
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values.iter().copied());
    mean(values.iter().map(|v| (v - m).powi(2)))
}

impl Periodic for PropertyGenerator {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn interval(&self) -> Duration {
        interval(self.config.update_interval_ms)
    }

    fn run_cycle(&self) -> Result<()> {
        self.generate().map(|_| ())
    }

    fn status(&self) -> StatusSnapshot {
        let state = self.state.read();
        let created = state
            .events
            .iter()
            .filter(|e| matches!(e, GenerationEvent::Created { .. }))
            .count();
        StatusSnapshot::new(self.name())
            .count("properties", state.properties.len() as u64)
            .count("potentials", state.potentials.len() as u64)
            .count("cycles", state.cycles)
            .count("events", state.events.total_pushed())
            .count("recent_created", created as u64)
            .score("mean_value", mean(state.properties.values().map(|p| p.value)))
            .score("mean_stability", mean(state.properties.values().map(|p| p.stability)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::field::{Category, QuantumState, SimField};

    fn wood_fire(energy: f64) -> FieldState {
        FieldState::default()
            .with_energy(energy)
            .with_category(Category::Wood, 0.8)
            .with_category(Category::Fire, 0.6)
    }

    fn setup(state: FieldState) -> (Arc<SimField>, PropertyGenerator) {
        let field = Arc::new(SimField::new(state));
        let detector = Arc::new(PatternDetector::new(field.clone(), DetectorConfig::default()));
        let generator = PropertyGenerator::new(detector, field.clone(), GeneratorConfig::default());
        (field, generator)
    }

    #[test]
    fn test_role_table() {
        use PatternKind::*;
        assert_eq!(assign_role(CategoryPair, CategoryPair), Role::Core);
        assert_eq!(assign_role(QuantumCoherence, CategoryPair), Role::Catalyst);
        assert_eq!(assign_role(EnergyFlow, CategoryPair), Role::Container);
        assert_eq!(assign_role(CategoryPair, EnergyCluster), Role::Enhancer);
        assert_eq!(assign_role(CategoryPair, EnergyFlow), Role::Support);
    }

    #[test]
    fn test_single_pair_yields_one_core_property() {
        let (_, generator) = setup(wood_fire(2.0));
        let report = generator.generate_at(0).unwrap();
        assert_eq!(report.created.len(), 1);

        let properties = generator.properties();
        assert_eq!(properties.len(), 1);
        let property = &properties[0];
        assert_eq!(property.kind, PatternKind::CategoryPair);
        assert_eq!(property.components.len(), 1);
        assert_eq!(property.components[0].role, Role::Core);
        assert_eq!(property.components[0].pattern_id, "pair:wood:fire");
        assert!((property.required_energy - 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_insufficient_energy_skips_creation() {
        let (_, generator) = setup(wood_fire(1.0));
        let report = generator.generate_at(0).unwrap();
        assert_eq!(report.potentials, 1);
        assert!(report.created.is_empty());
    }

    #[test]
    fn test_same_combination_not_regenerated() {
        let (_, generator) = setup(wood_fire(2.0));
        generator.generate_at(0).unwrap();
        let report = generator.generate_at(1_000).unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.evolved, 1);
        assert_eq!(generator.properties().len(), 1);
    }

    #[test]
    fn test_property_removed_when_pattern_disappears() {
        let (field, generator) = setup(wood_fire(2.0));
        generator.generate_at(0).unwrap();
        field.replace_state(FieldState::default().with_energy(2.0).with_category(Category::Wood, 0.8));
        let report = generator.generate_at(1_000).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(generator.properties().is_empty());
        let removed = generator
            .events()
            .into_iter()
            .any(|e| matches!(e, GenerationEvent::Removed { reason: RemovalReason::PatternMissing, .. }));
        assert!(removed);
    }

    fn removal_reasons(generator: &PropertyGenerator) -> Vec<RemovalReason> {
        generator
            .events()
            .into_iter()
            .filter_map(|e| match e {
                GenerationEvent::Removed { reason, .. } => Some(reason),
                GenerationEvent::Created { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_property_removed_when_field_energy_runs_short() {
        let (field, generator) = setup(wood_fire(2.0));
        let patterns = generator.detector.detect_at(0).unwrap();
        let snapshot = field.state().unwrap();
        generator.generate_from(&patterns, &snapshot, 0);
        assert_eq!(generator.properties().len(), 1);

        // required energy is 1.4
        let drained = snapshot.with_energy(1.0);
        let report = generator.generate_from(&patterns, &drained, 1_000);
        assert_eq!(report.removed.len(), 1);
        assert!(report.created.is_empty());
        assert!(generator.properties().is_empty());
        assert_eq!(removal_reasons(&generator), vec![RemovalReason::InsufficientEnergy]);
    }

    #[test]
    fn test_property_removed_when_backing_pattern_weakens() {
        let (field, generator) = setup(wood_fire(2.0));
        let mut patterns = generator.detector.detect_at(0).unwrap();
        let snapshot = field.state().unwrap();
        generator.generate_from(&patterns, &snapshot, 0);
        assert_eq!(generator.properties().len(), 1);

        patterns[0].strength = 0.05;
        let report = generator.generate_from(&patterns, &snapshot, 1_000);
        assert_eq!(report.removed.len(), 1);
        assert!(generator.properties().is_empty());
        assert_eq!(removal_reasons(&generator), vec![RemovalReason::PatternWeak]);
    }

    #[test]
    fn test_registered_property_uses_caller_time() {
        let (_, generator) = setup(wood_fire(2.0));
        generator.detector.detect_at(0).unwrap();
        let id = generator
            .register_property_at(PatternKind::CategoryPair, 0.3, &["pair:wood:fire".to_string()], 42)
            .unwrap();
        let property = generator.property(&id).unwrap();
        assert_eq!(property.created_at, 42);
        assert_eq!(property.updated_at, 42);
        assert_eq!(property.history.len(), 1);
        let sample = property.history.last().copied().unwrap();
        assert_eq!(sample.timestamp, 42);
        assert_eq!(sample.value, 0.3);
    }

    #[test]
    fn test_evolution_moves_toward_effect_and_tracks_history() {
        let (field, generator) = setup(wood_fire(2.0));
        generator.generate_at(0).unwrap();
        let initial = generator.properties()[0].value;

        // Stronger categories: the effect rises, the value follows at the evolution rate.
        field.replace_state(
            FieldState::default()
                .with_energy(2.0)
                .with_category(Category::Wood, 1.2)
                .with_category(Category::Fire, 1.0),
        );
        for t in 1..=5 {
            generator.generate_at(t * 1_000).unwrap();
        }
        let properties = generator.properties();
        assert_eq!(properties.len(), 1);
        let property = &properties[0];
        assert!(property.value > initial);
        // creation sample, then one evolution per cycle (t = 0..=5)
        assert_eq!(property.history.len(), 7);
        assert!(property.stability > 0.0 && property.stability <= 1.0);
    }

    #[test]
    fn test_combinations_of_three_patterns() {
        let state = wood_fire(4.0).with_quantum(QuantumState {
            coherence: 0.8,
            entanglement: 0.0,
            phase: 0.1,
            amplitudes: vec![0.5],
        });
        let (field, generator) = setup(state);
        let patterns = generator.detector.detect_at(0).unwrap();
        assert_eq!(patterns.len(), 2);
        let snapshot = field.state().unwrap();
        let potentials = generator.find_potentials(&patterns);
        // two singles plus one pair, all clearing the default gates
        assert_eq!(potentials.len(), 3);
        assert!(potentials.iter().any(|p| p.pattern_ids.len() == 2));
        let report = generator.generate_from(&patterns, &snapshot, 0);
        assert!(!report.created.is_empty());
    }

    #[test]
    fn test_register_property_requires_known_patterns() {
        let (_, generator) = setup(wood_fire(2.0));
        generator.detector.detect_at(0).unwrap();
        let err = generator
            .register_property(PatternKind::CategoryPair, 0.5, &["nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let id = generator
            .register_property(PatternKind::EnergyCluster, 0.5, &["pair:wood:fire".to_string()])
            .unwrap();
        let property = generator.property(&id).unwrap();
        assert_eq!(property.value, 0.5);
        assert_eq!(property.components[0].role, Role::Enhancer);
    }

    #[test]
    fn test_variance() {
        assert_eq!(variance(&[1.0]), 0.0);
        assert!((variance(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
    }
}
