//! Condition→action rules over patterns, properties and the field, plus
//! rule learning from correlated pattern pairs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::comparison::Comparison;
use crate::config::{RuleConfig, interval};
use crate::constants::{CORRELATION_HALF_LIFE_MS, EPSILON, EVENT_LOG_CAPACITY};
use crate::detector::PatternDetector;
use crate::error::{EngineError, Result};
use crate::field::{Category, Field, FieldState, relation_factor};
use crate::generator::{Property, PropertyGenerator};
use crate::history::BoundedLog;
use crate::pattern::{ComponentSource, Pattern, PatternFamily, PatternKind};
use crate::periodic::{Periodic, StatusSnapshot, mean};
use crate::time::{elapsed, now_millis};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Pattern,
    Property,
    Field,
}

/// A weighted predicate. Pattern and property targets match by ID or kind
/// name; field targets name a field scalar and ignore `attribute`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub subject: Subject,
    pub target: String,
    #[serde(default)]
    pub attribute: String,
    pub operator: Comparison,
    #[serde(default)]
    pub value: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Condition {
    pub fn pattern(target: &str, attribute: &str, operator: Comparison, value: f64) -> Self {
        Self {
            subject: Subject::Pattern,
            target: target.to_string(),
            attribute: attribute.to_string(),
            operator,
            value,
            weight: 1.0,
        }
    }

    pub fn property(target: &str, attribute: &str, operator: Comparison, value: f64) -> Self {
        Self {
            subject: Subject::Property,
            target: target.to_string(),
            attribute: attribute.to_string(),
            operator,
            value,
            weight: 1.0,
        }
    }

    pub fn field(target: &str, operator: Comparison, value: f64) -> Self {
        Self {
            subject: Subject::Field,
            target: target.to_string(),
            attribute: String::new(),
            operator,
            value,
            weight: 1.0,
        }
    }

    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreateProperty {
        kind: PatternKind,
        value: f64,
        patterns: Vec<String>,
    },
    ModifyField {
        property: String,
        value: f64,
    },
    /// Multiply the target's strength by `1 + adjustment`. The target is a
    /// pattern ID, or a kind name to adjust every pattern of that kind.
    AdjustPattern {
        target: String,
        adjustment: f64,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    #[default]
    Configured,
    Learned,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub origin: RuleOrigin,
    /// Source and target pattern IDs of a learned rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learned_from: Option<(String, String)>,
    #[serde(default)]
    pub trigger_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<u64>,
}

fn default_priority() -> i32 {
    10
}

fn default_confidence() -> f64 {
    1.0
}

impl Rule {
    pub fn configured(id: &str, conditions: Vec<Condition>, actions: Vec<Action>) -> Self {
        Self {
            id: id.to_string(),
            conditions,
            actions,
            priority: default_priority(),
            confidence: default_confidence(),
            origin: RuleOrigin::Configured,
            learned_from: None,
            trigger_count: 0,
            failure_count: 0,
            last_triggered: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(EngineError::validation("rule id must not be empty"));
        }
        if self.conditions.is_empty() || self.actions.is_empty() {
            return Err(EngineError::validation(format!(
                "rule {} needs at least one condition and one action",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::validation(format!(
                "rule {} confidence must be in [0, 1], got {}",
                self.id, self.confidence
            )));
        }
        if self.conditions.iter().any(|c| c.weight < 0.0 || !c.weight.is_finite()) {
            return Err(EngineError::validation(format!(
                "rule {} has a negative or non-finite condition weight",
                self.id
            )));
        }
        let total: f64 = self.conditions.iter().map(|c| c.weight).sum();
        if total <= 0.0 {
            return Err(EngineError::validation(format!(
                "rule {} condition weights must sum to a positive value",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEventKind {
    Executed,
    Failed,
    Learned,
    Evicted,
}

#[derive(Clone, Debug, Serialize)]
pub struct RuleEvent {
    pub timestamp: u64,
    pub rule_id: String,
    pub kind: RuleEventKind,
    pub error: Option<String>,
}

/// Per-pattern bookkeeping refreshed at the start of every cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PatternActivity {
    pub first_seen: u64,
    pub last_seen: u64,
    pub duration_ms: u64,
    pub active: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleReport {
    pub fired: Vec<String>,
    pub failed: Vec<String>,
    pub learned: Vec<String>,
    pub evicted: Vec<String>,
}

struct RuleState {
    rules: Vec<Rule>,
    activity: HashMap<String, PatternActivity>,
    events: BoundedLog<RuleEvent>,
    cycles: u64,
}

pub struct RuleEngine {
    detector: Arc<PatternDetector>,
    generator: Arc<PropertyGenerator>,
    field: Arc<dyn Field>,
    config: RuleConfig,
    state: RwLock<RuleState>,
}

struct EvalContext<'a> {
    patterns: &'a [Pattern],
    properties: &'a [Property],
    snapshot: &'a FieldState,
}

impl RuleEngine {
    pub fn new(
        detector: Arc<PatternDetector>,
        generator: Arc<PropertyGenerator>,
        field: Arc<dyn Field>,
        config: RuleConfig,
    ) -> Self {
        Self {
            detector,
            generator,
            field,
            config,
            state: RwLock::new(RuleState {
                rules: Vec::new(),
                activity: HashMap::new(),
                events: BoundedLog::new(EVENT_LOG_CAPACITY),
                cycles: 0,
            }),
        }
    }

    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        let mut state = self.state.write();
        self.insert_rule(&mut state, rule)
    }

    /// Configured and learned rules are capped separately, so learning can
    /// never crowd out an operator's rules.
    fn insert_rule(&self, state: &mut RuleState, rule: Rule) -> Result<()> {
        rule.validate()?;
        if state.rules.iter().any(|r| r.id == rule.id) {
            return Err(EngineError::validation(format!("rule {} already exists", rule.id)));
        }
        let (limit, label) = match rule.origin {
            RuleOrigin::Configured => (self.config.max_rules, "configured"),
            RuleOrigin::Learned => (self.config.max_learned_rules, "learned"),
        };
        let count = state.rules.iter().filter(|r| r.origin == rule.origin).count();
        if count >= limit {
            return Err(EngineError::validation(format!("{label} rule limit of {limit} reached")));
        }
        state.rules.push(rule);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> Result<Rule> {
        let mut state = self.state.write();
        let idx = state
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| EngineError::not_found("rule", id))?;
        Ok(state.rules.remove(idx))
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.state.read().rules.clone()
    }

    pub fn rule(&self, id: &str) -> Option<Rule> {
        self.state.read().rules.iter().find(|r| r.id == id).cloned()
    }

    pub fn events(&self) -> Vec<RuleEvent> {
        self.state.read().events.to_vec()
    }

    pub fn activity(&self) -> HashMap<String, PatternActivity> {
        self.state.read().activity.clone()
    }

    /// Weighted fraction of a rule's conditions satisfied right now.
    pub fn satisfaction(&self, rule_id: &str) -> Result<f64> {
        let rule = self
            .rule(rule_id)
            .ok_or_else(|| EngineError::not_found("rule", rule_id))?;
        let patterns = self.detector.active_patterns();
        let properties = self.generator.properties();
        let snapshot = self.field.state()?;
        let ctx = EvalContext {
            patterns: &patterns,
            properties: &properties,
            snapshot: &snapshot,
        };
        Ok(satisfaction(&rule, &ctx))
    }

    pub fn process_rules(&self) -> Result<RuleReport> {
        self.process_rules_at(now_millis())
    }

    /// Refresh activity, fire rules by descending priority, then learn.
    pub fn process_rules_at(&self, now: u64) -> Result<RuleReport> {
        let snapshot = self.field.state()?;
        let patterns = self.detector.active_patterns();
        let properties = self.generator.properties();
        let ctx = EvalContext {
            patterns: &patterns,
            properties: &properties,
            snapshot: &snapshot,
        };

        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut report = RuleReport::default();

        self.refresh_activity(state, &patterns, now);
        report.evicted = evict_orphaned(state, now);

        let mut order: Vec<usize> = (0..state.rules.len()).collect();
        order.sort_by(|&a, &b| state.rules[b].priority.cmp(&state.rules[a].priority));

        for idx in order {
            let rule = &state.rules[idx];
            if rule.confidence < self.config.min_confidence {
                continue;
            }
            if satisfaction(rule, &ctx) < self.config.threshold {
                continue;
            }
            let outcome = rule.actions.iter().try_for_each(|a| self.execute(a, now));
            let rule = &mut state.rules[idx];
            match outcome {
                Ok(()) => {
                    rule.trigger_count += 1;
                    rule.last_triggered = Some(now);
                    report.fired.push(rule.id.clone());
                    state.events.push(RuleEvent {
                        timestamp: now,
                        rule_id: rule.id.clone(),
                        kind: RuleEventKind::Executed,
                        error: None,
                    });
                }
                Err(e) => {
                    rule.failure_count += 1;
                    tracing::warn!(rule = %rule.id, "rule action failed: {e}");
                    report.failed.push(rule.id.clone());
                    state.events.push(RuleEvent {
                        timestamp: now,
                        rule_id: rule.id.clone(),
                        kind: RuleEventKind::Failed,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        for candidate in self.learn(&patterns) {
            let id = candidate.id.clone();
            match self.insert_rule(state, candidate) {
                Ok(()) => {
                    state.events.push(RuleEvent {
                        timestamp: now,
                        rule_id: id.clone(),
                        kind: RuleEventKind::Learned,
                        error: None,
                    });
                    report.learned.push(id);
                }
                Err(e) => tracing::trace!(rule = %id, "learned rule rejected: {e}"),
            }
        }

        state.cycles += 1;
        Ok(report)
    }

    fn refresh_activity(&self, state: &mut RuleState, patterns: &[Pattern], now: u64) {
        let seen: HashSet<&str> = patterns.iter().map(|p| p.id.as_str()).collect();
        for p in patterns {
            let entry = state.activity.entry(p.id.clone()).or_insert(PatternActivity {
                first_seen: now,
                last_seen: now,
                duration_ms: 0,
                active: true,
            });
            entry.active = true;
            entry.last_seen = now;
            entry.duration_ms = elapsed(now, entry.first_seen);
        }
        let window = self.detector.config().time_window_ms;
        let mut stale = Vec::new();
        for (id, entry) in state.activity.iter_mut() {
            if !seen.contains(id.as_str()) {
                entry.active = false;
                if elapsed(now, entry.last_seen) > window {
                    stale.push(id.clone());
                }
            }
        }
        for id in stale {
            state.activity.remove(&id);
        }
    }

    fn execute(&self, action: &Action, now: u64) -> Result<()> {
        match action {
            Action::ModifyField { property, value } => self.field.set_property_value(property, *value),
            Action::AdjustPattern { target, adjustment } => {
                let factor = 1.0 + adjustment;
                if self.detector.contains(target) {
                    return self.detector.adjust_strength(target, factor).map(|_| ());
                }
                let kind = PatternKind::parse(target).ok_or_else(|| EngineError::not_found("pattern", target.clone()))?;
                let ids: Vec<String> = self
                    .detector
                    .active_patterns()
                    .into_iter()
                    .filter(|p| p.kind == kind)
                    .map(|p| p.id)
                    .collect();
                if ids.is_empty() {
                    return Err(EngineError::not_found("pattern", target.clone()));
                }
                for id in ids {
                    self.detector.adjust_strength(&id, factor)?;
                }
                Ok(())
            }
            Action::CreateProperty { kind, value, patterns } => {
                self.generator
                    .register_property_at(*kind, *value, patterns, now)
                    .map(|_| ())
            }
        }
    }

    /// Candidate rules for every ordered pair of correlated active patterns.
    fn learn(&self, patterns: &[Pattern]) -> Vec<Rule> {
        let mut out = Vec::new();
        for a in patterns {
            for b in patterns {
                if a.id == b.id {
                    continue;
                }
                let correlation = correlation(a, b);
                if correlation <= self.config.min_confidence {
                    continue;
                }
                let scale = a.strength.max(b.strength).max(EPSILON);
                let effect = ((a.strength - b.strength) / scale).clamp(-0.5, 0.5);
                out.push(Rule {
                    id: format!("learned:{}->{}", a.id, b.id),
                    conditions: vec![Condition::pattern(
                        a.kind.as_str(),
                        "strength",
                        Comparison::Gt,
                        0.8 * a.strength,
                    )],
                    actions: vec![Action::AdjustPattern {
                        target: b.id.clone(),
                        adjustment: effect,
                    }],
                    priority: 0,
                    confidence: correlation.clamp(0.0, 1.0),
                    origin: RuleOrigin::Learned,
                    learned_from: Some((a.id.clone(), b.id.clone())),
                    trigger_count: 0,
                    failure_count: 0,
                    last_triggered: None,
                });
            }
        }
        out
    }
}

/// Drop learned rules whose source or target pattern is no longer tracked.
fn evict_orphaned(state: &mut RuleState, now: u64) -> Vec<String> {
    let RuleState {
        rules,
        activity,
        events,
        ..
    } = state;
    let mut evicted = Vec::new();
    rules.retain(|rule| {
        let Some((source, target)) = &rule.learned_from else {
            return true;
        };
        if activity.contains_key(source) && activity.contains_key(target) {
            return true;
        }
        evicted.push(rule.id.clone());
        events.push(RuleEvent {
            timestamp: now,
            rule_id: rule.id.clone(),
            kind: RuleEventKind::Evicted,
            error: None,
        });
        false
    });
    if !evicted.is_empty() {
        tracing::debug!(count = evicted.len(), "learned rules evicted");
    }
    evicted
}

/// Rules every engine starts with.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::configured(
            "flag_coherent_field",
            vec![Condition::field("coherence", Comparison::Gte, 0.7)],
            vec![Action::ModifyField {
                property: "coherent".to_string(),
                value: 1.0,
            }],
        ),
        Rule::configured(
            "flag_dense_clusters",
            vec![Condition::pattern("energy_cluster", "strength", Comparison::Gte, 0.5)],
            vec![Action::ModifyField {
                property: "cluster_pressure".to_string(),
                value: 1.0,
            }],
        )
        .with_priority(5),
    ]
}

fn condition_holds(c: &Condition, ctx: &EvalContext<'_>) -> bool {
    match c.subject {
        Subject::Pattern => ctx
            .patterns
            .iter()
            .filter(|p| p.id == c.target || p.kind.as_str() == c.target)
            .any(|p| c.operator.apply(p.attribute(&c.attribute), c.value)),
        Subject::Property => ctx
            .properties
            .iter()
            .filter(|p| p.id == c.target || p.kind.as_str() == c.target)
            .any(|p| c.operator.apply(p.attribute(&c.attribute), c.value)),
        Subject::Field => c.operator.apply(ctx.snapshot.scalar(&c.target), c.value),
    }
}

fn satisfaction(rule: &Rule, ctx: &EvalContext<'_>) -> f64 {
    let total: f64 = rule.conditions.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let met: f64 = rule
        .conditions
        .iter()
        .filter(|c| condition_holds(c, ctx))
        .map(|c| c.weight)
        .sum();
    met / total
}

/// 0.4 × strength similarity + 0.3 × temporal decay + 0.3 × spatial term.
pub fn correlation(a: &Pattern, b: &Pattern) -> f64 {
    let similarity = 1.0 - (a.strength - b.strength).abs().min(1.0);
    let dt = a.formed_at.abs_diff(b.formed_at) as f64;
    let temporal = 0.5f64.powf(dt / CORRELATION_HALF_LIFE_MS);
    0.4 * similarity + 0.3 * temporal + 0.3 * spatial_correlation(a, b)
}

fn first_category(p: &Pattern) -> Option<Category> {
    p.components.iter().find_map(|c| match c.source {
        ComponentSource::Category { category } => Some(category),
        _ => None,
    })
}

fn spatial_correlation(a: &Pattern, b: &Pattern) -> f64 {
    match (a.kind.family(), b.kind.family()) {
        (PatternFamily::Elemental, PatternFamily::Elemental) => {
            match (first_category(a), first_category(b)) {
                (Some(ca), Some(cb)) => relation_factor(ca, cb) / 1.3,
                _ => 0.0,
            }
        }
        (PatternFamily::Field, PatternFamily::Field) => 1.0 / (1.0 + (a.energy - b.energy).abs()),
        (PatternFamily::Resonance, PatternFamily::Resonance) => {
            let pa = a.property("phase").unwrap_or(0.0);
            let pb = b.property("phase").unwrap_or(0.0);
            (1.0 + (pa - pb).cos()) / 2.0
        }
        _ => {
            let sa = a.source_set();
            let sb = b.source_set();
            let union = sa.union(&sb).count();
            if union == 0 {
                0.0
            } else {
                sa.intersection(&sb).count() as f64 / union as f64
            }
        }
    }
}

impl Periodic for RuleEngine {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn interval(&self) -> Duration {
        interval(self.config.update_interval_ms)
    }

    fn run_cycle(&self) -> Result<()> {
        self.process_rules().map(|_| ())
    }

    fn status(&self) -> StatusSnapshot {
        let state = self.state.read();
        let learned = state.rules.iter().filter(|r| r.origin == RuleOrigin::Learned).count();
        StatusSnapshot::new(self.name())
            .count("rules", state.rules.len() as u64)
            .count("learned_rules", learned as u64)
            .count("tracked_patterns", state.activity.len() as u64)
            .count("cycles", state.cycles)
            .count("events", state.events.total_pushed())
            .count("triggers", state.rules.iter().map(|r| r.trigger_count).sum())
            .score("mean_confidence", mean(state.rules.iter().map(|r| r.confidence)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorConfig, GeneratorConfig};
    use crate::field::SimField;

    struct Fixture {
        field: Arc<SimField>,
        detector: Arc<PatternDetector>,
        generator: Arc<PropertyGenerator>,
        engine: RuleEngine,
    }

    fn fixture(state: FieldState, config: RuleConfig) -> Fixture {
        let field = Arc::new(SimField::new(state));
        let detector = Arc::new(PatternDetector::new(field.clone(), DetectorConfig::default()));
        let generator = Arc::new(PropertyGenerator::new(
            detector.clone(),
            field.clone(),
            GeneratorConfig::default(),
        ));
        let engine = RuleEngine::new(detector.clone(), generator.clone(), field.clone(), config);
        Fixture {
            field,
            detector,
            generator,
            engine,
        }
    }

    fn three_pairs() -> FieldState {
        FieldState::default()
            .with_energy(2.0)
            .with_category(Category::Wood, 0.8)
            .with_category(Category::Fire, 0.6)
            .with_category(Category::Earth, 0.5)
    }

    fn no_learning() -> RuleConfig {
        RuleConfig {
            min_confidence: 0.99,
            ..RuleConfig::default()
        }
    }

    #[test]
    fn test_field_rule_fires_and_modifies_field() {
        let f = fixture(three_pairs(), no_learning());
        let rule = Rule::configured(
            "energetic",
            vec![Condition::field("energy", Comparison::Gt, 1.0)],
            vec![Action::ModifyField {
                property: "alert".into(),
                value: 1.0,
            }],
        );
        f.engine.add_rule(rule).unwrap();
        let report = f.engine.process_rules_at(0).unwrap();
        assert_eq!(report.fired, vec!["energetic".to_string()]);
        assert_eq!(f.field.property_value("alert"), Some(1.0));
        let rule = f.engine.rule("energetic").unwrap();
        assert_eq!(rule.trigger_count, 1);
        assert_eq!(rule.last_triggered, Some(0));
    }

    #[test]
    fn test_low_confidence_rule_does_not_fire() {
        let f = fixture(three_pairs(), RuleConfig::default());
        let rule = Rule::configured(
            "timid",
            vec![Condition::field("energy", Comparison::Gt, 1.0)],
            vec![Action::ModifyField {
                property: "alert".into(),
                value: 1.0,
            }],
        )
        .with_confidence(0.1);
        f.engine.add_rule(rule).unwrap();
        f.engine.process_rules_at(0).unwrap();
        assert_eq!(f.field.property_value("alert"), None);
    }

    #[test]
    fn test_weighted_threshold() {
        let f = fixture(three_pairs(), no_learning());
        let heavy_met = Rule::configured(
            "heavy",
            vec![
                Condition::field("energy", Comparison::Gt, 1.0).weighted(0.8),
                Condition::field("energy", Comparison::Lt, 1.0).weighted(0.2),
            ],
            vec![Action::ModifyField {
                property: "heavy".into(),
                value: 1.0,
            }],
        );
        let light_met = Rule::configured(
            "light",
            vec![
                Condition::field("energy", Comparison::Lt, 1.0).weighted(0.8),
                Condition::field("energy", Comparison::Gt, 1.0).weighted(0.2),
            ],
            vec![Action::ModifyField {
                property: "light".into(),
                value: 1.0,
            }],
        );
        f.engine.add_rule(heavy_met).unwrap();
        f.engine.add_rule(light_met).unwrap();
        assert!((f.engine.satisfaction("heavy").unwrap() - 0.8).abs() < 1e-12);
        let report = f.engine.process_rules_at(0).unwrap();
        assert_eq!(report.fired, vec!["heavy".to_string()]);
        assert!(matches!(
            f.engine.satisfaction("missing"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_failed_action_does_not_stop_other_rules() {
        let f = fixture(three_pairs(), no_learning());
        f.detector.detect_at(0).unwrap();
        let broken = Rule::configured(
            "broken",
            vec![Condition::field("energy", Comparison::Exists, 0.0)],
            vec![Action::AdjustPattern {
                target: "pair:nope:nope".into(),
                adjustment: 0.1,
            }],
        )
        .with_priority(20);
        let fine = Rule::configured(
            "fine",
            vec![Condition::pattern("category_pair", "strength", Comparison::Gt, 0.0)],
            vec![Action::AdjustPattern {
                target: "pair:wood:fire".into(),
                adjustment: 0.1,
            }],
        )
        .with_priority(5);
        f.engine.add_rule(fine).unwrap();
        f.engine.add_rule(broken).unwrap();

        let before = f.detector.pattern("pair:wood:fire").unwrap().strength;
        let report = f.engine.process_rules_at(0).unwrap();
        assert_eq!(report.failed, vec!["broken".to_string()]);
        assert_eq!(report.fired, vec!["fine".to_string()]);

        let after = f.detector.pattern("pair:wood:fire").unwrap().strength;
        assert!((after - before * 1.1).abs() < 1e-12);

        let broken = f.engine.rule("broken").unwrap();
        assert_eq!(broken.trigger_count, 0);
        assert_eq!(broken.failure_count, 1);
        assert_eq!(broken.last_triggered, None);

        let events = f.engine.events();
        assert_eq!(events[0].kind, RuleEventKind::Failed);
        assert_eq!(events[1].kind, RuleEventKind::Executed);
    }

    #[test]
    fn test_create_property_action() {
        let f = fixture(three_pairs(), no_learning());
        f.detector.detect_at(0).unwrap();
        let rule = Rule::configured(
            "spawn",
            vec![Condition::pattern("pair:wood:fire", "interaction", Comparison::Gte, 0.5)],
            vec![Action::CreateProperty {
                kind: PatternKind::CategoryPair,
                value: 0.7,
                patterns: vec!["pair:wood:fire".into()],
            }],
        );
        f.engine.add_rule(rule).unwrap();
        f.engine.process_rules_at(5_000).unwrap();
        let properties = f.generator.properties();
        assert_eq!(properties.len(), 1);
        assert_eq!(properties[0].value, 0.7);
        assert_eq!(properties[0].created_at, 5_000);
    }

    #[test]
    fn test_add_rule_validation() {
        let f = fixture(three_pairs(), RuleConfig::default());
        let empty = Rule::configured("empty", vec![], vec![]);
        assert!(matches!(f.engine.add_rule(empty), Err(EngineError::Validation(_))));

        let ok = Rule::configured(
            "ok",
            vec![Condition::field("energy", Comparison::Exists, 0.0)],
            vec![Action::ModifyField {
                property: "x".into(),
                value: 0.0,
            }],
        );
        f.engine.add_rule(ok.clone()).unwrap();
        assert!(f.engine.add_rule(ok).is_err());
        assert!(f.engine.remove_rule("ok").is_ok());
        assert!(matches!(f.engine.remove_rule("ok"), Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_learning_from_correlated_patterns() {
        let f = fixture(three_pairs(), RuleConfig::default());
        f.detector.detect_at(0).unwrap();
        let report = f.engine.process_rules_at(0).unwrap();
        // three category pairs → six ordered pairs, all strongly correlated
        assert_eq!(report.learned.len(), 6);
        assert!(f.engine.rule("learned:pair:wood:fire->pair:fire:earth").is_some());
        assert!(f.engine.rules().iter().all(|r| r.origin == RuleOrigin::Learned));

        let again = f.engine.process_rules_at(1_000).unwrap();
        assert!(again.learned.is_empty());
        assert_eq!(f.engine.rules().len(), 6);
    }

    fn marker(id: &str) -> Rule {
        Rule::configured(
            id,
            vec![Condition::field("energy", Comparison::Exists, 0.0)],
            vec![Action::ModifyField {
                property: id.to_string(),
                value: 1.0,
            }],
        )
    }

    #[test]
    fn test_learning_respects_max_learned_rules() {
        let config = RuleConfig {
            max_learned_rules: 4,
            ..RuleConfig::default()
        };
        let f = fixture(three_pairs(), config);
        f.detector.detect_at(0).unwrap();
        f.engine.process_rules_at(0).unwrap();
        assert_eq!(f.engine.rules().len(), 4);
    }

    #[test]
    fn test_configured_rules_unaffected_by_saturated_learning() {
        let config = RuleConfig {
            max_rules: 1,
            max_learned_rules: 4,
            ..RuleConfig::default()
        };
        let f = fixture(three_pairs(), config);
        f.detector.detect_at(0).unwrap();
        f.engine.process_rules_at(0).unwrap();
        assert_eq!(f.engine.rules().len(), 4);

        f.engine.add_rule(marker("first")).unwrap();
        let err = f.engine.add_rule(marker("second")).unwrap_err();
        assert!(err.to_string().contains("configured rule limit of 1"));
        assert_eq!(f.engine.rules().len(), 5);
    }

    #[test]
    fn test_learned_rules_evicted_with_their_patterns() {
        let f = fixture(three_pairs(), RuleConfig::default());
        f.engine.add_rule(marker("keep")).unwrap();
        f.detector.detect_at(0).unwrap();
        f.engine.process_rules_at(0).unwrap();
        assert_eq!(f.engine.rules().len(), 7);

        // Earth leaves: both earth pairs drop out of detection.
        f.field.replace_state(
            FieldState::default()
                .with_energy(2.0)
                .with_category(Category::Wood, 0.8)
                .with_category(Category::Fire, 0.6),
        );
        f.detector.detect_at(1_000).unwrap();
        let report = f.engine.process_rules_at(1_000).unwrap();
        assert!(report.evicted.is_empty());

        let later = 1_000 + f.detector.config().time_window_ms + 1;
        let report = f.engine.process_rules_at(later).unwrap();
        // every ordered pair touched an earth pattern
        assert_eq!(report.evicted.len(), 6);
        let ids: Vec<String> = f.engine.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["keep".to_string()]);
        assert!(f.engine.events().iter().any(|e| e.kind == RuleEventKind::Evicted));
    }

    #[test]
    fn test_default_rules_validate() {
        let f = fixture(three_pairs(), RuleConfig::default());
        for rule in default_rules() {
            assert_eq!(rule.origin, RuleOrigin::Configured);
            f.engine.add_rule(rule).unwrap();
        }
    }

    #[test]
    fn test_learned_effect_is_clamped() {
        let f = fixture(three_pairs(), RuleConfig::default());
        f.detector.detect_at(0).unwrap();
        f.engine.process_rules_at(0).unwrap();
        for rule in f.engine.rules() {
            let Action::AdjustPattern { adjustment, .. } = &rule.actions[0] else {
                panic!("learned rules adjust patterns");
            };
            assert!((-0.5..=0.5).contains(adjustment));
        }
    }

    #[test]
    fn test_correlation_terms() {
        let f = fixture(three_pairs(), RuleConfig::default());
        f.detector.detect_at(0).unwrap();
        let a = f.detector.pattern("pair:wood:fire").unwrap();
        let b = f.detector.pattern("pair:wood:earth").unwrap();
        let expected = 0.4 * (1.0 - (a.strength - b.strength).abs()) + 0.3 + 0.3 * (1.0 / 1.3);
        assert!((correlation(&a, &b) - expected).abs() < 1e-12);

        let mut late = b.clone();
        late.formed_at = 3_600_000;
        let decayed = correlation(&a, &late);
        assert!((expected - decayed - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_activity_tracking() {
        let f = fixture(three_pairs(), no_learning());
        f.detector.detect_at(0).unwrap();
        f.engine.process_rules_at(0).unwrap();
        f.engine.process_rules_at(5_000).unwrap();
        let activity = f.engine.activity();
        let wf = activity["pair:wood:fire"];
        assert!(wf.active);
        assert_eq!(wf.duration_ms, 5_000);
    }
}
