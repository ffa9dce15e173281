//! Feedback-controlled amplification of oscillatory signatures.

use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{AmplifierConfig, interval};
use crate::constants::EVENT_LOG_CAPACITY;
use crate::error::{EngineError, Result};
use crate::field::Field;
use crate::history::BoundedLog;
use crate::pattern::PatternSource;
use crate::periodic::{Periodic, StatusSnapshot, mean};
use crate::time::now_millis;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resonance {
    pub id: String,
    pub frequency: f64,
    pub phase: f64,
    pub amplitude: f64,
    /// Effective amplitude ratio of the last amplification.
    pub gain: f64,
    pub stability: f64,
}

impl Resonance {
    pub fn new(id: &str, frequency: f64, phase: f64, amplitude: f64, stability: f64) -> Self {
        Self {
            id: id.to_string(),
            frequency,
            phase,
            amplitude,
            gain: 1.0,
            stability,
        }
    }
}

/// Routes a share of one resonance's output into another's gain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedbackLoop {
    pub source: String,
    pub target: String,
    pub ratio: f64,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AmplifierMetrics {
    pub total_gain: f64,
    /// Mean of `1 / gain` across tracked resonances.
    pub efficiency: f64,
    pub stability: f64,
    pub amplifications: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MetricPoint {
    pub timestamp: u64,
    pub total_gain: f64,
    pub efficiency: f64,
    pub stability: f64,
}

struct AmplifierState {
    resonances: BTreeMap<String, Resonance>,
    loops: Vec<FeedbackLoop>,
    metrics: AmplifierMetrics,
    history: BoundedLog<MetricPoint>,
    cycles: u64,
}

pub struct ResonanceAmplifier {
    field: Arc<dyn Field>,
    source: Arc<dyn PatternSource>,
    config: AmplifierConfig,
    state: RwLock<AmplifierState>,
}

/// Wrap an angle into [-π, π].
pub fn wrap_phase(phase: f64) -> f64 {
    let wrapped = (phase + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped < -PI { wrapped + 2.0 * PI } else { wrapped }
}

fn check_signal(frequency: f64, phase: f64) -> Result<()> {
    if !(frequency > 0.0 && frequency.is_finite()) {
        return Err(EngineError::validation(format!(
            "frequency must be positive, got {frequency}"
        )));
    }
    if !phase.is_finite() || phase.abs() > PI {
        return Err(EngineError::validation(format!(
            "phase must be within [-π, π], got {phase}"
        )));
    }
    Ok(())
}

impl ResonanceAmplifier {
    pub fn new(field: Arc<dyn Field>, source: Arc<dyn PatternSource>, config: AmplifierConfig) -> Self {
        Self {
            field,
            source,
            config,
            state: RwLock::new(AmplifierState {
                resonances: BTreeMap::new(),
                loops: Vec::new(),
                metrics: AmplifierMetrics::default(),
                history: BoundedLog::new(EVENT_LOG_CAPACITY),
                cycles: 0,
            }),
        }
    }

    pub fn amplify(&self, resonance: Resonance) -> Result<Resonance> {
        self.amplify_at(resonance, now_millis())
    }

    /// Amplify and store a resonance, pushing its energy and phase into the
    /// field. Rejected input leaves both the amplifier and the field untouched.
    pub fn amplify_at(&self, mut resonance: Resonance, now: u64) -> Result<Resonance> {
        check_signal(resonance.frequency, resonance.phase)?;
        let max = self.config.max_amplitude;
        if !(0.0..=max).contains(&resonance.amplitude) {
            return Err(EngineError::validation(format!(
                "amplitude must be in [0, {max}], got {}",
                resonance.amplitude
            )));
        }
        if !(resonance.stability >= self.config.stability_threshold) {
            return Err(EngineError::validation(format!(
                "resonance {} stability {} is below {}",
                resonance.id, resonance.stability, self.config.stability_threshold
            )));
        }

        let mut guard = self.state.write();
        let state = &mut *guard;

        let feedback = feedback_factor(&state.loops, &resonance.id);
        let raw = self.config.gain_factor * resonance.amplitude * resonance.stability.sqrt() * feedback;
        let gain = raw.clamp(1.0, max);
        let before = resonance.amplitude;
        let after = (before * gain).min(max);

        // gain >= 1, so the injection is never negative and can be undone
        let injected = after * after - before * before;
        self.field.add_energy(injected)?;
        if let Err(e) = self.field.set_phase(resonance.phase) {
            if let Err(undo) = self.field.add_energy(-injected) {
                tracing::error!(resonance = %resonance.id, "energy rollback failed: {undo}");
            }
            return Err(e);
        }

        resonance.amplitude = after;
        resonance.gain = if before > 0.0 { after / before } else { gain };
        state.resonances.insert(resonance.id.clone(), resonance.clone());
        state.metrics.amplifications += 1;
        refresh_metrics(state, now);
        tracing::debug!(resonance = %resonance.id, gain = resonance.gain, "amplified");
        Ok(resonance)
    }

    /// Rewrite frequency and phase, then recompute stability.
    pub fn tune(&self, id: &str, frequency: f64, phase: f64) -> Result<Resonance> {
        check_signal(frequency, phase)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let resonance = state
            .resonances
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("resonance", id))?;
        resonance.frequency = frequency;
        resonance.phase = phase;
        resonance.stability = tuned_stability(resonance, &self.config);
        let tuned = resonance.clone();
        refresh_metrics(state, now_millis());
        Ok(tuned)
    }

    /// Add a loop, replacing any existing loop with the same endpoints.
    pub fn add_feedback_loop(&self, feedback: FeedbackLoop) -> Result<()> {
        if feedback.source.is_empty() || feedback.target.is_empty() {
            return Err(EngineError::validation("feedback loop needs a source and a target"));
        }
        if !(0.0..=1.0).contains(&feedback.ratio) {
            return Err(EngineError::validation(format!(
                "feedback ratio must be in [0, 1], got {}",
                feedback.ratio
            )));
        }
        let mut state = self.state.write();
        state
            .loops
            .retain(|l| !(l.source == feedback.source && l.target == feedback.target));
        state.loops.push(feedback);
        Ok(())
    }

    pub fn remove_feedback_loop(&self, source: &str, target: &str) -> Result<FeedbackLoop> {
        let mut state = self.state.write();
        let idx = state
            .loops
            .iter()
            .position(|l| l.source == source && l.target == target)
            .ok_or_else(|| EngineError::not_found("feedback loop", format!("{source}->{target}")))?;
        Ok(state.loops.remove(idx))
    }

    pub fn feedback_loops(&self) -> Vec<FeedbackLoop> {
        self.state.read().loops.clone()
    }

    pub fn resonance(&self, id: &str) -> Option<Resonance> {
        self.state.read().resonances.get(id).cloned()
    }

    pub fn resonances(&self) -> Vec<Resonance> {
        self.state.read().resonances.values().cloned().collect()
    }

    pub fn metrics(&self) -> AmplifierMetrics {
        self.state.read().metrics
    }

    pub fn history(&self) -> Vec<MetricPoint> {
        self.state.read().history.to_vec()
    }

    /// Amplify a resonance for every newly seen phase-carrying pattern and
    /// forget resonances whose pattern is gone.
    pub fn amplify_patterns_at(&self, now: u64) -> Result<usize> {
        let patterns = self.source.active_patterns()?;
        let live: HashSet<String> = patterns.iter().map(|p| format!("res:{}", p.id)).collect();
        {
            let mut state = self.state.write();
            let gone: Vec<String> = state
                .resonances
                .keys()
                .filter(|id| id.starts_with("res:") && !live.contains(*id))
                .cloned()
                .collect();
            for id in gone {
                state.resonances.remove(&id);
            }
            state.cycles += 1;
        }

        let mut amplified = 0;
        for p in &patterns {
            let Some(phase) = p.property("phase") else {
                continue;
            };
            let id = format!("res:{}", p.id);
            if self.state.read().resonances.contains_key(&id) {
                continue;
            }
            let resonance = Resonance::new(
                &id,
                1.0 + p.strength,
                wrap_phase(phase),
                p.energy.clamp(0.0, self.config.max_amplitude),
                p.stability,
            );
            match self.amplify_at(resonance, now) {
                Ok(_) => amplified += 1,
                Err(e) if matches!(e, EngineError::Validation(_)) || e.is_resource() => {
                    tracing::debug!(resonance = %id, "not amplified: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(amplified)
    }
}

fn feedback_factor(loops: &[FeedbackLoop], target: &str) -> f64 {
    let ratios: Vec<f64> = loops
        .iter()
        .filter(|l| l.active && l.target == target)
        .map(|l| l.ratio)
        .collect();
    if ratios.is_empty() {
        1.0
    } else {
        1.0 + mean(ratios)
    }
}

/// mean(1 − amplitude/max, |cos φ|, 1 − gain/(2·gain_factor)), clamped to [0, 1].
fn tuned_stability(r: &Resonance, config: &AmplifierConfig) -> f64 {
    let headroom = 1.0 - r.amplitude / config.max_amplitude;
    let alignment = r.phase.cos().abs();
    let restraint = 1.0 - r.gain / (2.0 * config.gain_factor);
    ((headroom + alignment + restraint) / 3.0).clamp(0.0, 1.0)
}

fn refresh_metrics(state: &mut AmplifierState, now: u64) {
    let resonances = &state.resonances;
    state.metrics.total_gain = resonances.values().map(|r| r.gain).sum();
    state.metrics.efficiency = mean(
        resonances
            .values()
            .filter(|r| r.gain > 0.0)
            .map(|r| 1.0 / r.gain),
    );
    state.metrics.stability = mean(resonances.values().map(|r| r.stability));
    state.history.push(MetricPoint {
        timestamp: now,
        total_gain: state.metrics.total_gain,
        efficiency: state.metrics.efficiency,
        stability: state.metrics.stability,
    });
}

impl Periodic for ResonanceAmplifier {
    fn name(&self) -> &'static str {
        "amplifier"
    }

    fn interval(&self) -> Duration {
        interval(self.config.update_interval_ms)
    }

    fn run_cycle(&self) -> Result<()> {
        self.amplify_patterns_at(now_millis()).map(|_| ())
    }

    fn status(&self) -> StatusSnapshot {
        let state = self.state.read();
        StatusSnapshot::new(self.name())
            .count("resonances", state.resonances.len() as u64)
            .count("feedback_loops", state.loops.len() as u64)
            .count("amplifications", state.metrics.amplifications)
            .count("cycles", state.cycles)
            .score("total_gain", state.metrics.total_gain)
            .score("efficiency", state.metrics.efficiency)
            .score("stability", state.metrics.stability)
    }
}
