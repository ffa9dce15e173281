//! Stratifies matched patterns into complexity layers and moves energy,
//! coherence and patterns between adjacent layers over bridges.
//!
//! A pass runs four stages in order: stratify, inter-layer resonance,
//! bridge management, then transitions over saturated channels.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::amplifier::wrap_phase;
use crate::config::{CrossConfig, interval};
use crate::constants::{EPSILON, EVENT_LOG_CAPACITY, FIELD_STRENGTH_NUDGE, MAX_LAYER_PHASE_DELTA};
use crate::error::{EngineError, Result};
use crate::field::Field;
use crate::history::BoundedLog;
use crate::pattern::{Pattern, PatternSource};
use crate::periodic::{Periodic, StatusSnapshot, mean};
use crate::time::{elapsed, now_millis};

/// Field property receiving the total stratified energy after each pass.
pub const STRATIFIED_ENERGY_PROPERTY: &str = "stratified_energy";

/// Component count scaled up by property richness.
pub fn structural_complexity(pattern: &Pattern) -> f64 {
    pattern.components.len() as f64 * (1.0 + pattern.properties.len() as f64 / 10.0)
}

/// `max(0, floor(log2(complexity × energy)))`.
pub fn stratum_level(pattern: &Pattern) -> u32 {
    let product = structural_complexity(pattern) * pattern.energy;
    if !(product >= 1.0) || !product.is_finite() {
        return 0;
    }
    product.log2().floor() as u32
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Layer {
    pub level: u32,
    pub patterns: BTreeMap<String, Pattern>,
    pub energy: f64,
    pub coherence: f64,
    pub phase: f64,
    pub properties: BTreeMap<String, f64>,
}

impl Layer {
    fn new(level: u32) -> Self {
        Self {
            level,
            patterns: BTreeMap::new(),
            energy: 0.0,
            coherence: 0.0,
            phase: 0.0,
            properties: BTreeMap::new(),
        }
    }

    fn recompute(&mut self) {
        self.energy = self.patterns.values().map(|p| p.energy.max(0.0)).sum();
        self.coherence = mean(self.patterns.values().map(|p| p.coherence()));
        self.phase = mean(self.patterns.values().map(|p| p.property("phase").unwrap_or(0.0)));
    }

    pub fn field_strength(&self) -> f64 {
        self.properties.get("field_strength").copied().unwrap_or(0.0)
    }

    fn nudge_field_strength(&mut self, delta: f64) {
        *self.properties.entry("field_strength".to_string()).or_insert(0.0) += delta;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Energy,
    Coherence,
}

/// A channel opens in `Open` and is assessed by every bridge pass after.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Open,
    Active,
    Idle,
    Blocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDirection {
    /// Lower level to higher level, the only direction bridges carry.
    Upward,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Channel {
    pub kind: ChannelKind,
    pub direction: ChannelDirection,
    pub capacity: f64,
    pub load: f64,
    pub state: ChannelState,
}

impl Channel {
    fn at_capacity(&self) -> bool {
        self.load >= self.capacity - EPSILON
    }
}

/// Transfer path from a layer (source) to the layer one level above (target).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Bridge {
    pub id: String,
    pub source_level: u32,
    pub target_level: u32,
    pub strength: f64,
    pub phase_delta: f64,
    pub channels: Vec<Channel>,
    /// Set while any channel is active.
    pub active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LayerResonance {
    pub timestamp: u64,
    pub lower: u32,
    pub upper: u32,
    pub coupling: f64,
    pub phase_delta: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub timestamp: u64,
    pub pattern_id: String,
    pub from_level: u32,
    pub to_level: u32,
    pub channel: ChannelKind,
    pub amount: f64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessReport {
    pub layers: usize,
    pub resonances: usize,
    pub bridges_dropped: usize,
    pub transitions: usize,
    pub failed_transitions: usize,
}

struct CrossState {
    layers: BTreeMap<u32, Layer>,
    bridges: BTreeMap<String, Bridge>,
    overrides: HashMap<String, u32>,
    resonances: BoundedLog<LayerResonance>,
    transitions: BoundedLog<TransitionEvent>,
    cycles: u64,
}

pub struct CrossResonance {
    source: Arc<dyn PatternSource>,
    field: Arc<dyn Field>,
    config: CrossConfig,
    state: RwLock<CrossState>,
}

fn bridge_id(lower: u32, upper: u32) -> String {
    format!("bridge:{lower}->{upper}")
}

fn phase_delta(a: f64, b: f64) -> f64 {
    wrap_phase(a - b).abs()
}

impl CrossResonance {
    pub fn new(source: Arc<dyn PatternSource>, field: Arc<dyn Field>, config: CrossConfig) -> Self {
        Self {
            source,
            field,
            config,
            state: RwLock::new(CrossState {
                layers: BTreeMap::new(),
                bridges: BTreeMap::new(),
                overrides: HashMap::new(),
                resonances: BoundedLog::new(EVENT_LOG_CAPACITY),
                transitions: BoundedLog::new(EVENT_LOG_CAPACITY),
                cycles: 0,
            }),
        }
    }

    pub fn process(&self) -> Result<ProcessReport> {
        self.process_at(now_millis())
    }

    pub fn process_at(&self, now: u64) -> Result<ProcessReport> {
        let patterns = self.source.active_patterns()?;

        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut report = ProcessReport::default();

        stratify(state, &patterns);
        report.resonances = self.resonate(state, now);
        report.bridges_dropped = self.manage_bridges(state, now);
        let (ok, failed) = self.run_transitions(state, now);
        report.transitions = ok;
        report.failed_transitions = failed;
        report.layers = state.layers.len();
        state.cycles += 1;

        let total: f64 = state.layers.values().map(|l| l.energy).sum();
        drop(guard);
        if let Err(e) = self.field.set_property_value(STRATIFIED_ENERGY_PROPERTY, total) {
            tracing::warn!("failed to publish stratified energy: {e}");
        }
        Ok(report)
    }

    /// `√(E₁·E₂) × mean(c₁, c₂) × coupling_strength`.
    fn coupling(&self, a: &Layer, b: &Layer) -> f64 {
        (a.energy.max(0.0) * b.energy.max(0.0)).sqrt()
            * ((a.coherence + b.coherence) / 2.0)
            * self.config.coupling_strength
    }

    fn resonate(&self, state: &mut CrossState, now: u64) -> usize {
        let mut found = 0;
        let levels: Vec<u32> = state.layers.keys().copied().collect();
        for pair in levels.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if hi != lo + 1 {
                continue;
            }
            let (Some(lower), Some(upper)) = (state.layers.get(&lo), state.layers.get(&hi)) else {
                continue;
            };
            let coupling = self.coupling(lower, upper);
            let delta = phase_delta(lower.phase, upper.phase);
            if coupling < self.config.resonance_threshold
                || delta > MAX_LAYER_PHASE_DELTA
                || lower.coherence < self.config.coherence_threshold
                || upper.coherence < self.config.coherence_threshold
            {
                continue;
            }

            state.resonances.push(LayerResonance {
                timestamp: now,
                lower: lo,
                upper: hi,
                coupling,
                phase_delta: delta,
            });
            found += 1;

            let id = bridge_id(lo, hi);
            let capacity = self.config.channel_capacity;
            let bridge = state.bridges.entry(id.clone()).or_insert_with(|| {
                tracing::debug!(bridge = %id, coupling, "bridge opened");
                Bridge {
                    id: id.clone(),
                    source_level: lo,
                    target_level: hi,
                    strength: coupling,
                    phase_delta: delta,
                    channels: [ChannelKind::Energy, ChannelKind::Coherence]
                        .into_iter()
                        .map(|kind| Channel {
                            kind,
                            direction: ChannelDirection::Upward,
                            capacity,
                            load: 0.0,
                            state: ChannelState::Open,
                        })
                        .collect(),
                    active: false,
                    created_at: now,
                    updated_at: now,
                }
            });
            bridge.strength = coupling;
            bridge.phase_delta = delta;
            bridge.updated_at = now;
        }
        found
    }

    /// Drop stale or decoupled bridges and refresh channel load and state.
    /// Returns how many bridges were dropped.
    fn manage_bridges(&self, state: &mut CrossState, now: u64) -> usize {
        let empty_lo = Layer::new(0);
        let empty_hi = Layer::new(0);
        let mut dropped = Vec::new();

        for (id, bridge) in state.bridges.iter_mut() {
            let src = state.layers.get(&bridge.source_level).unwrap_or(&empty_lo);
            let tgt = state.layers.get(&bridge.target_level).unwrap_or(&empty_hi);
            let coupling = self.coupling(src, tgt);
            let stale = elapsed(now, bridge.updated_at) > self.config.bridge_max_age_ms;
            if stale || coupling < self.config.resonance_threshold {
                dropped.push(id.clone());
                continue;
            }
            bridge.strength = coupling;

            let mismatch = (src.coherence - tgt.coherence).abs();
            let blocked = src.energy < self.config.min_transfer_energy
                || mismatch > self.config.coherence_mismatch;
            for channel in &mut bridge.channels {
                let offered = match channel.kind {
                    ChannelKind::Energy => src.energy * coupling,
                    ChannelKind::Coherence => (src.coherence + tgt.coherence) / 2.0 * coupling,
                };
                channel.load = offered.max(0.0).min(channel.capacity);
                channel.state = if blocked {
                    ChannelState::Blocked
                } else if channel.load > 0.0 {
                    ChannelState::Active
                } else {
                    ChannelState::Idle
                };
            }
            bridge.active = bridge.channels.iter().any(|c| c.state == ChannelState::Active);
        }

        for id in &dropped {
            state.bridges.remove(id);
            tracing::debug!(bridge = %id, "bridge dropped");
        }
        dropped.len()
    }

    fn eligible(&self, kind: ChannelKind, pattern: &Pattern, target: &Layer) -> bool {
        match kind {
            ChannelKind::Energy => {
                pattern.energy <= target.energy
                    && target
                        .patterns
                        .values()
                        .any(|t| t.kind == pattern.kind || pattern.kind.enhances(t.kind))
            }
            ChannelKind::Coherence => {
                let phase = pattern.property("phase").unwrap_or(0.0);
                pattern.coherence() >= self.config.min_coherence
                    && phase_delta(phase, target.phase) <= MAX_LAYER_PHASE_DELTA
                    && (pattern.coherence() - target.coherence).abs() <= self.config.coherence_threshold
            }
        }
    }

    /// Returns `(succeeded, failed)`.
    fn run_transitions(&self, state: &mut CrossState, now: u64) -> (usize, usize) {
        let plans: Vec<(u32, u32, ChannelKind)> = state
            .bridges
            .values()
            .flat_map(|b| {
                b.channels
                    .iter()
                    .filter(|c| c.state == ChannelState::Active && c.at_capacity())
                    .map(|c| (b.source_level, b.target_level, c.kind))
            })
            .collect();

        let (mut ok, mut failed) = (0, 0);
        for (from, to, kind) in plans {
            let candidates: Vec<String> = match (state.layers.get(&from), state.layers.get(&to)) {
                (Some(src), Some(tgt)) => src
                    .patterns
                    .values()
                    .filter(|p| self.eligible(kind, p, tgt))
                    .map(|p| p.id.clone())
                    .collect(),
                _ => continue,
            };
            for pattern_id in candidates {
                let amount = state
                    .layers
                    .get(&from)
                    .and_then(|l| l.patterns.get(&pattern_id))
                    .map_or(0.0, |p| p.energy.max(0.0));
                let outcome = self.transition(state, &pattern_id, from, to, amount);
                if let Err(e) = &outcome {
                    tracing::debug!(pattern = %pattern_id, "transition failed: {e}");
                }
                let success = outcome.is_ok();
                if success {
                    ok += 1;
                } else {
                    failed += 1;
                }
                state.transitions.push(TransitionEvent {
                    timestamp: now,
                    pattern_id,
                    from_level: from,
                    to_level: to,
                    channel: kind,
                    amount,
                    success,
                    error: outcome.err().map(|e| e.to_string()),
                });
            }
        }
        (ok, failed)
    }

    /// Move one pattern up a level and redistribute energy and coherence.
    fn transition(&self, state: &mut CrossState, pattern_id: &str, from: u32, to: u32, amount: f64) -> Result<()> {
        if !state.layers.contains_key(&to) {
            return Err(EngineError::not_found("layer", to.to_string()));
        }
        let mut src = state
            .layers
            .remove(&from)
            .ok_or_else(|| EngineError::not_found("layer", from.to_string()))?;
        if src.energy + EPSILON < amount {
            let err = EngineError::InsufficientEnergy {
                required: amount,
                available: src.energy,
            };
            state.layers.insert(from, src);
            return Err(err);
        }
        let Some(pattern) = src.patterns.remove(pattern_id) else {
            state.layers.insert(from, src);
            return Err(EngineError::not_found("pattern", pattern_id));
        };
        let Some(tgt) = state.layers.get_mut(&to) else {
            state.layers.insert(from, src);
            return Err(EngineError::not_found("layer", to.to_string()));
        };

        tgt.patterns.insert(pattern_id.to_string(), pattern);
        src.energy = (src.energy - amount).max(0.0);
        tgt.energy += amount * self.config.coupling_strength;
        let shared = (src.coherence + tgt.coherence) / 2.0;
        src.coherence = shared;
        tgt.coherence = shared;
        src.nudge_field_strength(-FIELD_STRENGTH_NUDGE * amount);
        tgt.nudge_field_strength(FIELD_STRENGTH_NUDGE * amount);

        state.layers.insert(from, src);
        state.overrides.insert(pattern_id.to_string(), to);
        Ok(())
    }

    pub fn layers(&self) -> Vec<Layer> {
        self.state.read().layers.values().cloned().collect()
    }

    pub fn layer(&self, level: u32) -> Option<Layer> {
        self.state.read().layers.get(&level).cloned()
    }

    pub fn bridges(&self) -> Vec<Bridge> {
        self.state.read().bridges.values().cloned().collect()
    }

    pub fn bridge(&self, id: &str) -> Option<Bridge> {
        self.state.read().bridges.get(id).cloned()
    }

    pub fn layer_resonances(&self) -> Vec<LayerResonance> {
        self.state.read().resonances.to_vec()
    }

    pub fn transitions(&self) -> Vec<TransitionEvent> {
        self.state.read().transitions.to_vec()
    }
}

/// Rebuild layers from the live pattern set. Layer properties survive for
/// levels that stay populated; transitioned patterns keep their new level.
fn stratify(state: &mut CrossState, patterns: &[Pattern]) {
    let live: HashSet<&str> = patterns.iter().map(|p| p.id.as_str()).collect();
    state.overrides.retain(|id, _| live.contains(id.as_str()));

    let mut previous = std::mem::take(&mut state.layers);
    for p in patterns {
        let level = state
            .overrides
            .get(&p.id)
            .copied()
            .unwrap_or_else(|| stratum_level(p));
        state
            .layers
            .entry(level)
            .or_insert_with(|| {
                let mut layer = Layer::new(level);
                if let Some(old) = previous.remove(&level) {
                    layer.properties = old.properties;
                }
                layer
            })
            .patterns
            .insert(p.id.clone(), p.clone());
    }
    for layer in state.layers.values_mut() {
        layer.recompute();
    }
}

impl Periodic for CrossResonance {
    fn name(&self) -> &'static str {
        "cross_resonance"
    }

    fn interval(&self) -> Duration {
        interval(self.config.update_interval_ms)
    }

    fn run_cycle(&self) -> Result<()> {
        self.process().map(|_| ())
    }

    fn status(&self) -> StatusSnapshot {
        let state = self.state.read();
        let active_channels = state
            .bridges
            .values()
            .flat_map(|b| &b.channels)
            .filter(|c| c.state == ChannelState::Active)
            .count();
        StatusSnapshot::new(self.name())
            .count("layers", state.layers.len() as u64)
            .count("bridges", state.bridges.len() as u64)
            .count("active_channels", active_channels as u64)
            .count("layer_resonances_total", state.resonances.total_pushed())
            .count("transitions_total", state.transitions.total_pushed())
            .count("cycles", state.cycles)
            .score("total_energy", state.layers.values().map(|l| l.energy).sum())
            .score("mean_coherence", mean(state.layers.values().map(|l| l.coherence)))
    }
}
