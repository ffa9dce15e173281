//! Pattern detection: turns a field snapshot into the set of active patterns.
//!
//! Four families are extracted every cycle: category pairs, energy clusters
//! (bounded region growing over the grid), energy flows between sampled
//! cell pairs, and quantum entanglement/coherence. Already-active patterns
//! are re-verified against the same snapshot and dropped when a component
//! disappears, they weaken, they destabilize, or they go stale.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{DetectorConfig, interval};
use crate::constants::EVENT_LOG_CAPACITY;
use crate::error::{EngineError, Result};
use crate::field::{Category, Field, FieldState, relation_factor};
use crate::history::BoundedLog;
use crate::pattern::{Component, ComponentSource, Pattern, PatternKind, PatternSource, QuantumAspect};
use crate::periodic::{Periodic, StatusSnapshot, mean};
use crate::time::{elapsed, now_millis};

/// Audit record of a newly created pattern.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionEvent {
    pub timestamp: u64,
    pub pattern_id: String,
    pub kind: PatternKind,
    pub strength: f64,
    pub stability: f64,
    pub energy: f64,
    pub properties: BTreeMap<String, f64>,
}

/// Why an active pattern was dropped during re-verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    ComponentMissing,
    Weak,
    Unstable,
    Expired,
}

struct DetectorState {
    active: BTreeMap<String, Pattern>,
    events: BoundedLog<DetectionEvent>,
    cycles: u64,
    dropped: u64,
}

pub struct PatternDetector {
    field: Arc<dyn Field>,
    config: DetectorConfig,
    state: RwLock<DetectorState>,
}

/// `√(E₁·E₂) × relation(from, to)`.
pub fn pair_interaction(from: Category, e1: f64, to: Category, e2: f64) -> f64 {
    (e1.max(0.0) * e2.max(0.0)).sqrt() * relation_factor(from, to)
}

impl PatternDetector {
    pub fn new(field: Arc<dyn Field>, config: DetectorConfig) -> Self {
        Self {
            field,
            config,
            state: RwLock::new(DetectorState {
                active: BTreeMap::new(),
                events: BoundedLog::new(EVENT_LOG_CAPACITY),
                cycles: 0,
                dropped: 0,
            }),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn detect(&self) -> Result<Vec<Pattern>> {
        self.detect_at(now_millis())
    }

    /// One detection cycle at an explicit timestamp.
    ///
    /// A field failure or a malformed grid aborts before any state is
    /// touched.
    pub fn detect_at(&self, now: u64) -> Result<Vec<Pattern>> {
        let snapshot = self.field.state()?;
        snapshot.grid.check()?;
        let candidates = self.find_candidates(&snapshot, now);

        let mut guard = self.state.write();
        let state = &mut *guard;

        for candidate in candidates {
            match state.active.get_mut(&candidate.id) {
                Some(existing) => absorb(existing, candidate, now),
                None => {
                    state.events.push(DetectionEvent {
                        timestamp: now,
                        pattern_id: candidate.id.clone(),
                        kind: candidate.kind,
                        strength: candidate.strength,
                        stability: candidate.stability,
                        energy: candidate.energy,
                        properties: candidate.properties.clone(),
                    });
                    tracing::debug!(pattern = %candidate.id, "new pattern");
                    state.active.insert(candidate.id.clone(), candidate);
                }
            }
        }

        let mut stale = Vec::new();
        for (id, pattern) in state.active.iter_mut() {
            if let Some(reason) = self.verify(pattern, &snapshot, now) {
                stale.push((id.clone(), reason));
            }
        }
        for (id, reason) in stale {
            state.active.remove(&id);
            state.dropped += 1;
            tracing::debug!(pattern = %id, ?reason, "pattern dropped");
        }

        state.cycles += 1;
        Ok(state.active.values().cloned().collect())
    }

    /// Recompute scores and decide whether the pattern survives.
    fn verify(&self, pattern: &mut Pattern, snapshot: &FieldState, now: u64) -> Option<DropReason> {
        if !pattern.components_exist(snapshot) || !pattern.refresh_scores(snapshot) {
            return Some(DropReason::ComponentMissing);
        }
        if pattern.strength < self.config.sensitivity {
            return Some(DropReason::Weak);
        }
        if pattern.stability < self.config.min_confidence {
            return Some(DropReason::Unstable);
        }
        if elapsed(now, pattern.updated_at) > self.config.time_window_ms {
            return Some(DropReason::Expired);
        }
        None
    }

    fn admit(&self, mut pattern: Pattern, snapshot: &FieldState) -> Option<Pattern> {
        if !pattern.refresh_scores(snapshot) {
            return None;
        }
        if pattern.strength < self.config.sensitivity || pattern.stability < self.config.min_confidence {
            return None;
        }
        Some(pattern)
    }

    fn find_candidates(&self, snapshot: &FieldState, now: u64) -> Vec<Pattern> {
        let mut raw = self.category_pairs(snapshot, now);
        raw.extend(self.energy_clusters(snapshot, now));
        raw.extend(self.energy_flows(snapshot, now));
        raw.extend(self.quantum_patterns(snapshot, now));
        raw.into_iter()
            .filter_map(|p| self.admit(p, snapshot))
            .collect()
    }

    fn category_pairs(&self, snapshot: &FieldState, now: u64) -> Vec<Pattern> {
        let cats: Vec<(Category, f64)> = snapshot.categories.iter().map(|(c, e)| (*c, *e)).collect();
        let mut out = Vec::new();
        for (i, &(a, ea)) in cats.iter().enumerate() {
            for &(b, eb) in &cats[i + 1..] {
                let interaction = pair_interaction(a, ea, b, eb);
                if interaction < self.config.pattern_threshold {
                    continue;
                }
                let components = vec![
                    Component::new(ComponentSource::Category { category: a }, "primary", 0.5)
                        .with_state("energy", ea.clamp(0.0, 1.0)),
                    Component::new(ComponentSource::Category { category: b }, "secondary", 0.5)
                        .with_state("energy", eb.clamp(0.0, 1.0)),
                ];
                let mut p = Pattern::new(
                    format!("pair:{}:{}", a.as_str(), b.as_str()),
                    PatternKind::CategoryPair,
                    components,
                    now,
                );
                p.energy = ea.max(0.0) + eb.max(0.0);
                p.set_property("interaction", interaction);
                p.set_property("relation_factor", relation_factor(a, b));
                p.set_property("energy_a", ea);
                p.set_property("energy_b", eb);
                out.push(p);
            }
        }
        out
    }

    /// Region growing from every unvisited cell at or above sensitivity,
    /// bounded to `max_cluster_radius` (Chebyshev) around the seed.
    fn energy_clusters(&self, snapshot: &FieldState, now: u64) -> Vec<Pattern> {
        let grid = &snapshot.grid;
        let max_cell = grid.max();
        let radius = self.config.max_cluster_radius;
        let mut visited = vec![false; grid.cells.len()];
        let mut out = Vec::new();

        for sy in 0..grid.height {
            for sx in 0..grid.width {
                let seed_idx = sy * grid.width + sx;
                let seed_energy = grid.cells[seed_idx];
                if visited[seed_idx] || seed_energy < self.config.sensitivity {
                    continue;
                }
                visited[seed_idx] = true;
                let mut queue = VecDeque::from([(sx, sy)]);
                let mut members = Vec::new();
                while let Some((cx, cy)) = queue.pop_front() {
                    members.push((cx, cy, grid.cells[cy * grid.width + cx]));
                    for (nx, ny) in grid.neighbors(cx, cy) {
                        let idx = ny * grid.width + nx;
                        if visited[idx] || nx.abs_diff(sx).max(ny.abs_diff(sy)) > radius {
                            continue;
                        }
                        if grid.cells[idx] < self.config.sensitivity {
                            continue;
                        }
                        visited[idx] = true;
                        queue.push_back((nx, ny));
                    }
                }

                let aggregate: f64 = members.iter().map(|m| m.2).sum();
                if aggregate < self.config.pattern_threshold {
                    continue;
                }

                let cx = members.iter().map(|m| m.0 as f64 * m.2).sum::<f64>() / aggregate;
                let cy = members.iter().map(|m| m.1 as f64 * m.2).sum::<f64>() / aggregate;
                let spread = members
                    .iter()
                    .map(|m| ((m.0 as f64 - cx).powi(2) + (m.1 as f64 - cy).powi(2)).sqrt())
                    .fold(0.0, f64::max);
                let hi = members.iter().map(|m| m.2).fold(0.0, f64::max);
                let lo = members.iter().map(|m| m.2).fold(f64::INFINITY, f64::min);
                let gradient = (hi - lo) / spread.max(1.0);
                let side = (2 * radius + 1) as f64;
                let density = members.len() as f64 / (side * side);

                let components = members
                    .iter()
                    .map(|&(x, y, e)| {
                        Component::new(ComponentSource::Cell { x, y }, "member", e / aggregate)
                            .with_state("energy", normalized(e, max_cell))
                    })
                    .collect();
                let mut p = Pattern::new(
                    format!("cluster:{sx}:{sy}"),
                    PatternKind::EnergyCluster,
                    components,
                    now,
                );
                p.energy = aggregate;
                p.set_property("aggregate_energy", aggregate);
                p.set_property("radius", spread);
                p.set_property("gradient", gradient);
                p.set_property("density", density);
                p.set_property("size", members.len() as f64);
                p.set_property("centroid_x", cx);
                p.set_property("centroid_y", cy);
                out.push(p);
            }
        }
        out
    }

    /// Every cell paired with the cell `flow_stride` to the right and below.
    /// Only the steepest `max_flow_patterns` gradients are kept.
    fn energy_flows(&self, snapshot: &FieldState, now: u64) -> Vec<Pattern> {
        let grid = &snapshot.grid;
        let stride = self.config.flow_stride.max(1);
        let max_cell = grid.max();
        let mut flows: Vec<(Pattern, f64)> = Vec::new();

        for y in 0..grid.height {
            for x in 0..grid.width {
                let e1 = grid.cells[y * grid.width + x];
                for (x2, y2) in [(x + stride, y), (x, y + stride)] {
                    let Some(e2) = grid.get(x2, y2) else {
                        continue;
                    };
                    let distance = stride as f64;
                    let gradient = (e2 - e1).abs() / distance;
                    if gradient <= self.config.sensitivity {
                        continue;
                    }
                    // Flow runs from the higher to the lower energy point.
                    let ((fx, fy, fe), (tx, ty, te)) = if e1 >= e2 {
                        ((x, y, e1), (x2, y2, e2))
                    } else {
                        ((x2, y2, e2), (x, y, e1))
                    };
                    let direction = (ty as f64 - fy as f64).atan2(tx as f64 - fx as f64);
                    let intensity = (e1 + e2) / 2.0;

                    let components = vec![
                        Component::new(ComponentSource::Cell { x: fx, y: fy }, "source", 0.5)
                            .with_state("energy", normalized(fe, max_cell)),
                        Component::new(ComponentSource::Cell { x: tx, y: ty }, "sink", 0.5)
                            .with_state("energy", normalized(te, max_cell)),
                    ];
                    let mut p = Pattern::new(
                        format!("flow:{fx}:{fy}:{tx}:{ty}"),
                        PatternKind::EnergyFlow,
                        components,
                        now,
                    );
                    p.energy = intensity;
                    p.set_property("rate", gradient);
                    p.set_property("direction", direction);
                    p.set_property("intensity", intensity);
                    p.set_property("distance", distance);
                    flows.push((p, gradient));
                }
            }
        }

        flows.sort_by(|a, b| b.1.total_cmp(&a.1));
        flows.truncate(self.config.max_flow_patterns);
        flows.into_iter().map(|(p, _)| p).collect()
    }

    fn quantum_patterns(&self, snapshot: &FieldState, now: u64) -> Vec<Pattern> {
        let q = &snapshot.quantum;
        let amplitude_energy: f64 = q.amplitudes.iter().map(|a| a * a).sum();
        let mut out = Vec::new();

        if q.entanglement > self.config.sensitivity {
            let components = vec![
                Component::new(
                    ComponentSource::Quantum { aspect: QuantumAspect::Entanglement },
                    "entanglement",
                    1.0,
                )
                .with_state("entanglement", q.entanglement),
            ];
            let mut p = Pattern::new("quantum:entanglement", PatternKind::QuantumEntanglement, components, now);
            p.energy = q.entanglement * (1.0 + amplitude_energy);
            p.set_property("entanglement", q.entanglement);
            p.set_property("phase", q.phase);
            p.set_property("duration", 0.0);
            out.push(p);
        }

        if q.coherence > self.config.sensitivity {
            let components = vec![
                Component::new(
                    ComponentSource::Quantum { aspect: QuantumAspect::Coherence },
                    "coherence",
                    1.0,
                )
                .with_state("coherence", q.coherence),
            ];
            let mut p = Pattern::new("quantum:coherence", PatternKind::QuantumCoherence, components, now);
            p.energy = q.coherence * (1.0 + amplitude_energy);
            p.set_property("coherence", q.coherence);
            p.set_property("mean_amplitude", q.mean_amplitude());
            p.set_property("phase", q.phase);
            p.set_property("decoherence", 1.0 - q.coherence);
            out.push(p);
        }
        out
    }

    pub fn active_patterns(&self) -> Vec<Pattern> {
        self.state.read().active.values().cloned().collect()
    }

    pub fn pattern(&self, id: &str) -> Option<Pattern> {
        self.state.read().active.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().active.contains_key(id)
    }

    /// Multiply a pattern's strength by `factor`, clamped to [0, 1].
    /// The nudge holds until the next re-verification recomputes it.
    pub fn adjust_strength(&self, id: &str, factor: f64) -> Result<f64> {
        if !factor.is_finite() || factor < 0.0 {
            return Err(EngineError::validation(format!(
                "strength factor must be a non-negative number, got {factor}"
            )));
        }
        let mut state = self.state.write();
        let pattern = state
            .active
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("pattern", id))?;
        pattern.strength = (pattern.strength * factor).clamp(0.0, 1.0);
        Ok(pattern.strength)
    }

    pub fn detection_events(&self) -> Vec<DetectionEvent> {
        self.state.read().events.to_vec()
    }
}

/// Refresh an existing pattern from a re-detection, keeping its formation time.
fn absorb(existing: &mut Pattern, candidate: Pattern, now: u64) {
    let formed_at = existing.formed_at;
    *existing = candidate;
    existing.formed_at = formed_at;
    existing.updated_at = now;
    if existing.kind == PatternKind::QuantumEntanglement {
        existing.set_property("duration", elapsed(now, formed_at) as f64 / 1000.0);
    }
}

fn normalized(value: f64, max: f64) -> f64 {
    if max <= 0.0 { 0.0 } else { (value / max).clamp(0.0, 1.0) }
}

impl PatternSource for PatternDetector {
    fn active_patterns(&self) -> Result<Vec<Pattern>> {
        Ok(PatternDetector::active_patterns(self))
    }
}

impl Periodic for PatternDetector {
    fn name(&self) -> &'static str {
        "detector"
    }

    fn interval(&self) -> Duration {
        interval(self.config.update_interval_ms)
    }

    fn run_cycle(&self) -> Result<()> {
        self.detect().map(|_| ())
    }

    fn status(&self) -> StatusSnapshot {
        let state = self.state.read();
        let mut snapshot = StatusSnapshot::new(self.name())
            .count("active_patterns", state.active.len() as u64)
            .count("cycles", state.cycles)
            .count("detected_total", state.events.total_pushed())
            .count("dropped_total", state.dropped)
            .score("mean_strength", mean(state.active.values().map(|p| p.strength)))
            .score("mean_stability", mean(state.active.values().map(|p| p.stability)));
        for kind in PatternKind::ALL {
            let n = state.active.values().filter(|p| p.kind == kind).count();
            snapshot = snapshot.count(kind.as_str(), n as u64);
        }
        snapshot
    }
}
