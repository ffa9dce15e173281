//! Template matching: scores live patterns against declared target shapes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::comparison::Comparison;
use crate::config::{MatcherConfig, interval};
use crate::constants::{EPSILON, EVENT_LOG_CAPACITY, WEIGHT_SUM_TOLERANCE};
use crate::error::{EngineError, Result};
use crate::history::BoundedLog;
use crate::pattern::{Pattern, PatternKind, PatternSource};
use crate::periodic::{Periodic, StatusSnapshot, mean};
use crate::time::{elapsed, now_millis};

/// Derived structural signature of a pattern.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub complexity: f64,
    pub coherence: f64,
    pub symmetry: f64,
}

impl Shape {
    pub fn of(pattern: &Pattern) -> Self {
        Self {
            complexity: pattern.complexity(),
            coherence: pattern.coherence(),
            symmetry: pattern.symmetry(),
        }
    }

    fn mean_distance(&self, other: &Shape) -> f64 {
        ((self.complexity - other.complexity).abs()
            + (self.coherence - other.coherence).abs()
            + (self.symmetry - other.symmetry).abs())
            / 3.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureValue {
    /// Compared against the pattern attribute named by the feature.
    Numeric(f64),
    /// Compared against `type`/`kind` (pattern kind) or `family`.
    Categorical(String),
    Structural(Shape),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub expected: FeatureValue,
    #[serde(default)]
    pub tolerance: f64,
}

impl Feature {
    pub fn numeric(name: &str, expected: f64, tolerance: f64) -> Self {
        Self {
            name: name.to_string(),
            expected: FeatureValue::Numeric(expected),
            tolerance,
        }
    }

    pub fn categorical(name: &str, expected: &str) -> Self {
        Self {
            name: name.to_string(),
            expected: FeatureValue::Categorical(expected.to_string()),
            tolerance: 0.0,
        }
    }

    pub fn structural(expected: Shape, tolerance: f64) -> Self {
        Self {
            name: "shape".to_string(),
            expected: FeatureValue::Structural(expected),
            tolerance,
        }
    }

    /// Similarity in [0, 1] and whether the reading is within tolerance.
    fn score(&self, pattern: &Pattern) -> (f64, bool) {
        match &self.expected {
            FeatureValue::Numeric(expected) => match pattern.attribute(&self.name) {
                Some(actual) => {
                    let scale = actual.abs().max(expected.abs());
                    let diff = (actual - expected).abs();
                    let sim = if scale < EPSILON { 1.0 } else { 1.0 - diff / scale };
                    (sim.clamp(0.0, 1.0), diff <= self.tolerance)
                }
                None => (0.0, false),
            },
            FeatureValue::Categorical(expected) => {
                let actual = match self.name.as_str() {
                    "type" | "kind" => Some(pattern.kind.as_str()),
                    "family" => Some(pattern.kind.family().as_str()),
                    _ => None,
                };
                let hit = actual == Some(expected.as_str());
                (if hit { 1.0 } else { 0.0 }, hit)
            }
            FeatureValue::Structural(expected) => {
                let distance = Shape::of(pattern).mean_distance(expected);
                ((1.0 - distance).clamp(0.0, 1.0), distance <= self.tolerance)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintTarget {
    Strength,
    Coherence,
    Complexity,
    Stability,
    Property(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub target: ConstraintTarget,
    pub operator: Comparison,
    pub value: f64,
}

impl Constraint {
    pub fn new(target: ConstraintTarget, operator: Comparison, value: f64) -> Self {
        Self { target, operator, value }
    }

    /// A missing named property fails the constraint.
    pub fn holds(&self, pattern: &Pattern) -> bool {
        let actual = match &self.target {
            ConstraintTarget::Strength => Some(pattern.strength),
            ConstraintTarget::Coherence => Some(pattern.coherence()),
            ConstraintTarget::Complexity => Some(pattern.complexity()),
            ConstraintTarget::Stability => Some(pattern.stability),
            ConstraintTarget::Property(name) => pattern.property(name),
        };
        self.operator.apply(actual, self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub features: Vec<Feature>,
    /// One weight per feature, summing to 1.
    pub weights: Vec<f64>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Template {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(EngineError::validation("template id must not be empty"));
        }
        if self.features.is_empty() {
            return Err(EngineError::validation(format!("template {} has no features", self.id)));
        }
        if self.weights.len() != self.features.len() {
            return Err(EngineError::validation(format!(
                "template {} has {} features but {} weights",
                self.id,
                self.features.len(),
                self.weights.len()
            )));
        }
        if self.weights.iter().any(|w| !(*w >= 0.0)) {
            return Err(EngineError::validation(format!(
                "template {} has a negative weight",
                self.id
            )));
        }
        let sum: f64 = self.weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::validation(format!(
                "template {} weights sum to {sum}, expected 1",
                self.id
            )));
        }
        if self.features.iter().any(|f| !(f.tolerance >= 0.0)) {
            return Err(EngineError::validation(format!(
                "template {} has a negative tolerance",
                self.id
            )));
        }
        Ok(())
    }

    /// `(similarity, feature match degree)`, both weighted by feature.
    fn score(&self, pattern: &Pattern) -> (f64, f64) {
        let mut similarity = 0.0;
        let mut degree = 0.0;
        for (feature, weight) in self.features.iter().zip(&self.weights) {
            let (sim, within) = feature.score(pattern);
            similarity += weight * sim;
            if within {
                degree += weight;
            }
        }
        (similarity.clamp(0.0, 1.0), degree.clamp(0.0, 1.0))
    }
}

/// One template per pattern kind: the kind itself plus a mid-range
/// strength reading, weighted evenly.
pub fn default_templates() -> Vec<Template> {
    PatternKind::ALL
        .into_iter()
        .map(|kind| Template {
            id: kind.as_str().to_string(),
            features: vec![
                Feature::categorical("kind", kind.as_str()),
                Feature::numeric("strength", 0.5, 0.5),
            ],
            weights: vec![0.5, 0.5],
            constraints: Vec::new(),
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Match {
    pub id: String,
    pub template_id: String,
    pub pattern: Pattern,
    pub similarity: f64,
    pub feature_match: f64,
    pub confidence: f64,
    pub started_at: u64,
    pub updated_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchEventKind {
    Matched,
    Expired,
}

#[derive(Clone, Debug, Serialize)]
pub struct MatchEvent {
    pub timestamp: u64,
    pub match_id: String,
    pub kind: MatchEventKind,
    pub confidence: f64,
}

struct MatcherState {
    templates: BTreeMap<String, Template>,
    matches: BTreeMap<String, Match>,
    events: BoundedLog<MatchEvent>,
    cycles: u64,
    expired: u64,
}

pub struct PatternMatcher {
    source: Arc<dyn PatternSource>,
    config: MatcherConfig,
    state: RwLock<MatcherState>,
}

impl PatternMatcher {
    pub fn new(source: Arc<dyn PatternSource>, config: MatcherConfig) -> Self {
        Self {
            source,
            config,
            state: RwLock::new(MatcherState {
                templates: BTreeMap::new(),
                matches: BTreeMap::new(),
                events: BoundedLog::new(EVENT_LOG_CAPACITY),
                cycles: 0,
                expired: 0,
            }),
        }
    }

    pub fn register_template(&self, template: Template) -> Result<()> {
        template.validate()?;
        let mut state = self.state.write();
        if state.templates.contains_key(&template.id) {
            return Err(EngineError::validation(format!(
                "template {} already registered",
                template.id
            )));
        }
        state.templates.insert(template.id.clone(), template);
        Ok(())
    }

    /// Remove a template together with its matches.
    pub fn unregister_template(&self, id: &str) -> Result<Template> {
        let mut state = self.state.write();
        let template = state
            .templates
            .remove(id)
            .ok_or_else(|| EngineError::not_found("template", id))?;
        state.matches.retain(|_, m| m.template_id != id);
        Ok(template)
    }

    pub fn templates(&self) -> Vec<Template> {
        self.state.read().templates.values().cloned().collect()
    }

    pub fn matches(&self) -> Vec<Match> {
        self.state.read().matches.values().cloned().collect()
    }

    pub fn events(&self) -> Vec<MatchEvent> {
        self.state.read().events.to_vec()
    }

    pub fn run_match(&self) -> Result<Vec<Match>> {
        self.match_at(now_millis())
    }

    /// Score every live pattern against every template, upsert the survivors
    /// and expire matches that have gone idle.
    pub fn match_at(&self, now: u64) -> Result<Vec<Match>> {
        let patterns = self.source.active_patterns()?;

        let mut guard = self.state.write();
        let state = &mut *guard;

        for template in state.templates.values() {
            for pattern in &patterns {
                let Some((similarity, feature_match, confidence)) = self.evaluate(template, pattern) else {
                    continue;
                };
                let id = format!("{}:{}", template.id, pattern.id);
                match state.matches.get_mut(&id) {
                    Some(existing) => {
                        existing.pattern = pattern.clone();
                        existing.similarity = similarity;
                        existing.feature_match = feature_match;
                        existing.confidence = confidence;
                        existing.updated_at = now;
                    }
                    None => {
                        state.events.push(MatchEvent {
                            timestamp: now,
                            match_id: id.clone(),
                            kind: MatchEventKind::Matched,
                            confidence,
                        });
                        state.matches.insert(
                            id.clone(),
                            Match {
                                id,
                                template_id: template.id.clone(),
                                pattern: pattern.clone(),
                                similarity,
                                feature_match,
                                confidence,
                                started_at: now,
                                updated_at: now,
                            },
                        );
                    }
                }
            }
        }

        let idle: Vec<String> = state
            .matches
            .values()
            .filter(|m| elapsed(now, m.updated_at) > self.config.match_timeout_ms)
            .map(|m| m.id.clone())
            .collect();
        for id in idle {
            if let Some(m) = state.matches.remove(&id) {
                state.expired += 1;
                state.events.push(MatchEvent {
                    timestamp: now,
                    match_id: id,
                    kind: MatchEventKind::Expired,
                    confidence: m.confidence,
                });
            }
        }

        state.cycles += 1;
        Ok(state.matches.values().cloned().collect())
    }

    /// `Some((similarity, feature match, confidence))` when the pattern
    /// clears the similarity floor and every constraint.
    fn evaluate(&self, template: &Template, pattern: &Pattern) -> Option<(f64, f64, f64)> {
        let (similarity, feature_match) = template.score(pattern);
        if similarity < self.config.min_similarity {
            return None;
        }
        if !template.constraints.iter().all(|c| c.holds(pattern)) {
            return None;
        }
        // Constraints are a hard gate, so any survivor satisfies all of them.
        let satisfied = 1.0;
        let confidence = (0.4 * similarity + 0.3 * feature_match + 0.3 * satisfied).clamp(0.0, 1.0);
        Some((similarity, feature_match, confidence))
    }

    pub fn get_active_patterns(&self) -> Vec<Pattern> {
        self.active_patterns_at(now_millis())
    }

    /// Patterns backing matches younger than `max_pattern_age_ms`, one per
    /// pattern ID, taking the most recently refreshed snapshot.
    pub fn active_patterns_at(&self, now: u64) -> Vec<Pattern> {
        let state = self.state.read();
        let mut fresh: HashMap<&str, &Match> = HashMap::new();
        for m in state.matches.values() {
            if elapsed(now, m.updated_at) >= self.config.max_pattern_age_ms {
                continue;
            }
            let slot = fresh.entry(m.pattern.id.as_str()).or_insert(m);
            if m.updated_at > slot.updated_at {
                *slot = m;
            }
        }
        let mut out: Vec<Pattern> = fresh.into_values().map(|m| m.pattern.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

impl PatternSource for PatternMatcher {
    fn active_patterns(&self) -> Result<Vec<Pattern>> {
        Ok(self.get_active_patterns())
    }
}

impl Periodic for PatternMatcher {
    fn name(&self) -> &'static str {
        "matcher"
    }

    fn interval(&self) -> Duration {
        interval(self.config.update_interval_ms)
    }

    fn run_cycle(&self) -> Result<()> {
        self.run_match().map(|_| ())
    }

    fn status(&self) -> StatusSnapshot {
        let state = self.state.read();
        StatusSnapshot::new(self.name())
            .count("templates", state.templates.len() as u64)
            .count("matches", state.matches.len() as u64)
            .count("expired_total", state.expired)
            .count("cycles", state.cycles)
            .score("mean_confidence", mean(state.matches.values().map(|m| m.confidence)))
            .score("mean_similarity", mean(state.matches.values().map(|m| m.similarity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Category;
    use crate::pattern::{Component, ComponentSource, PatternKind};
    use approx::assert_relative_eq;
    use parking_lot::Mutex;

    struct SwapSource(Mutex<Vec<Pattern>>);

    impl PatternSource for SwapSource {
        fn active_patterns(&self) -> Result<Vec<Pattern>> {
            Ok(self.0.lock().clone())
        }
    }

    fn pair(strength: f64) -> Pattern {
        let components = vec![
            Component::new(ComponentSource::Category { category: Category::Wood }, "primary", 0.5),
            Component::new(ComponentSource::Category { category: Category::Fire }, "secondary", 0.5),
        ];
        let mut p = Pattern::new("pair:wood:fire", PatternKind::CategoryPair, components, 0);
        p.strength = strength;
        p.stability = 0.8;
        p.energy = 1.4;
        p.set_property("interaction", 0.9);
        p
    }

    fn matcher_with(patterns: Vec<Pattern>) -> (Arc<SwapSource>, PatternMatcher) {
        let source = Arc::new(SwapSource(Mutex::new(patterns)));
        let matcher = PatternMatcher::new(source.clone(), MatcherConfig::default());
        (source, matcher)
    }

    fn strength_template(expected: f64) -> Template {
        Template {
            id: "strong_pair".into(),
            features: vec![
                Feature::numeric("strength", expected, 0.05),
                Feature::categorical("kind", "category_pair"),
            ],
            weights: vec![0.5, 0.5],
            constraints: vec![],
        }
    }

    #[test]
    fn test_register_validates_weights() {
        let (_, matcher) = matcher_with(vec![]);
        let mut bad = strength_template(0.4);
        bad.weights = vec![0.5, 0.4];
        assert!(matches!(matcher.register_template(bad), Err(EngineError::Validation(_))));

        let mut short = strength_template(0.4);
        short.weights = vec![1.0];
        assert!(matcher.register_template(short).is_err());

        matcher.register_template(strength_template(0.4)).unwrap();
        assert!(matcher.register_template(strength_template(0.4)).is_err());
    }

    #[test]
    fn test_exact_match_confidence() {
        let (_, matcher) = matcher_with(vec![pair(0.4)]);
        matcher.register_template(strength_template(0.4)).unwrap();
        let matches = matcher.match_at(0).unwrap();
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.id, "strong_pair:pair:wood:fire");
        assert_relative_eq!(m.similarity, 1.0);
        assert_relative_eq!(m.confidence, 1.0);
    }

    #[test]
    fn test_partial_similarity() {
        let (_, matcher) = matcher_with(vec![pair(0.3)]);
        matcher.register_template(strength_template(0.4)).unwrap();
        let m = &matcher.match_at(0).unwrap()[0];
        // numeric: 1 − 0.1/0.4 = 0.75, categorical hit
        assert_relative_eq!(m.similarity, 0.875, epsilon = 1e-12);
        assert_relative_eq!(m.feature_match, 0.5, epsilon = 1e-12);
        assert_relative_eq!(m.confidence, 0.4 * 0.875 + 0.15 + 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_below_min_similarity_rejected() {
        let (_, matcher) = matcher_with(vec![pair(0.4)]);
        let template = Template {
            id: "cluster".into(),
            features: vec![Feature::categorical("kind", "energy_cluster")],
            weights: vec![1.0],
            constraints: vec![],
        };
        matcher.register_template(template).unwrap();
        assert!(matcher.match_at(0).unwrap().is_empty());
    }

    #[test]
    fn test_unsatisfiable_constraint_blocks_perfect_match() {
        let (_, matcher) = matcher_with(vec![pair(0.4)]);
        let mut template = strength_template(0.4);
        template.constraints = vec![Constraint::new(ConstraintTarget::Strength, Comparison::Gt, 0.9)];
        matcher.register_template(template).unwrap();
        assert!(matcher.match_at(0).unwrap().is_empty());
    }

    #[test]
    fn test_missing_property_fails_constraint() {
        let p = pair(0.4);
        let c = Constraint::new(ConstraintTarget::Property("absent".into()), Comparison::Exists, 0.0);
        assert!(!c.holds(&p));
        let c = Constraint::new(ConstraintTarget::Property("interaction".into()), Comparison::Gte, 0.9);
        assert!(c.holds(&p));
    }

    #[test]
    fn test_structural_feature() {
        let p = pair(0.4);
        let f = Feature::structural(Shape::of(&p), 0.01);
        let (sim, within) = f.score(&p);
        assert_relative_eq!(sim, 1.0);
        assert!(within);
        // symmetric weights give symmetry 1
        assert_relative_eq!(Shape::of(&p).symmetry, 1.0);
    }

    #[test]
    fn test_idle_match_expires_and_is_logged() {
        let (source, matcher) = matcher_with(vec![pair(0.4)]);
        matcher.register_template(strength_template(0.4)).unwrap();
        matcher.match_at(0).unwrap();
        source.0.lock().clear();

        matcher.match_at(300_000).unwrap();
        assert_eq!(matcher.matches().len(), 1);
        matcher.match_at(300_001).unwrap();
        assert!(matcher.matches().is_empty());

        let kinds: Vec<_> = matcher.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![MatchEventKind::Matched, MatchEventKind::Expired]);
    }

    #[test]
    fn test_upsert_keeps_start_time() {
        let (_, matcher) = matcher_with(vec![pair(0.4)]);
        matcher.register_template(strength_template(0.4)).unwrap();
        matcher.match_at(0).unwrap();
        let m = &matcher.match_at(1_000).unwrap()[0];
        assert_eq!(m.started_at, 0);
        assert_eq!(m.updated_at, 1_000);
        assert_eq!(matcher.events().len(), 1);
    }

    #[test]
    fn test_active_patterns_deduped_and_aged() {
        let (_, matcher) = matcher_with(vec![pair(0.4)]);
        matcher.register_template(strength_template(0.4)).unwrap();
        let mut family = strength_template(0.4);
        family.id = "elemental".into();
        family.features[1] = Feature::categorical("family", "elemental");
        matcher.register_template(family).unwrap();

        matcher.match_at(0).unwrap();
        assert_eq!(matcher.matches().len(), 2);
        let active = matcher.active_patterns_at(1);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "pair:wood:fire");
        assert!(matcher.active_patterns_at(600_000).is_empty());
    }

    #[test]
    fn test_unregister_drops_matches() {
        let (_, matcher) = matcher_with(vec![pair(0.4)]);
        matcher.register_template(strength_template(0.4)).unwrap();
        matcher.match_at(0).unwrap();
        matcher.unregister_template("strong_pair").unwrap();
        assert!(matcher.matches().is_empty());
        assert!(matches!(
            matcher.unregister_template("strong_pair"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_default_templates_match_by_kind() {
        let templates = default_templates();
        assert_eq!(templates.len(), PatternKind::ALL.len());

        let (_, matcher) = matcher_with(vec![pair(0.6)]);
        for template in templates {
            matcher.register_template(template).unwrap();
        }
        matcher.match_at(0).unwrap();
        let matches = matcher.matches();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "category_pair:pair:wood:fire");
        assert_relative_eq!(matches[0].similarity, 0.5 + 0.5 * (1.0 - 0.1 / 0.6), epsilon = 1e-12);
    }
}
