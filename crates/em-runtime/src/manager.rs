//! Builds the component graph and drives every tick loop.
//!
//! Components are wired by explicit `Arc` injection: the detector feeds the
//! generator, rule engine, amplifier and matcher; the matcher feeds the
//! cross-resonance layers. Start order follows the data flow, stop order is
//! the reverse.

use std::sync::Arc;

use em_core::{
    CrossResonance, EngineConfig, PatternDetector, PatternMatcher, Periodic, PropertyGenerator,
    ResonanceAmplifier, Rule, RuleEngine, SimField, StatusSnapshot, Template, default_rules,
    default_templates,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio_util::sync::CancellationToken;

use crate::driver::FieldDriver;
use crate::error::{Result, RuntimeError};
use crate::handle::ComponentHandle;

pub struct Manager {
    config: EngineConfig,
    field: Arc<SimField>,
    detector: Arc<PatternDetector>,
    generator: Arc<PropertyGenerator>,
    rules: Arc<RuleEngine>,
    amplifier: Arc<ResonanceAmplifier>,
    matcher: Arc<PatternMatcher>,
    cross: Arc<CrossResonance>,
    /// Field driver first, then components in dependency order.
    handles: Vec<ComponentHandle>,
    token: Mutex<Option<CancellationToken>>,
}

impl Manager {
    pub fn new(config: EngineConfig, field: Arc<SimField>) -> Result<Self> {
        Self::with_rng(config, field, SmallRng::from_os_rng())
    }

    /// Deterministic field drift for reproducible runs.
    pub fn with_seed(config: EngineConfig, field: Arc<SimField>, seed: u64) -> Result<Self> {
        Self::with_rng(config, field, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(config: EngineConfig, field: Arc<SimField>, rng: SmallRng) -> Result<Self> {
        config.validate()?;

        let detector = Arc::new(PatternDetector::new(field.clone(), config.detector.clone()));
        let generator = Arc::new(PropertyGenerator::new(
            detector.clone(),
            field.clone(),
            config.generator.clone(),
        ));
        let rules = Arc::new(RuleEngine::new(
            detector.clone(),
            generator.clone(),
            field.clone(),
            config.rules.clone(),
        ));
        let amplifier = Arc::new(ResonanceAmplifier::new(
            field.clone(),
            detector.clone(),
            config.amplifier.clone(),
        ));
        for rule in with_overrides(default_rules(), &config.rules.rules, |r: &Rule| &r.id) {
            rules.add_rule(rule)?;
        }
        let matcher = Arc::new(PatternMatcher::new(detector.clone(), config.matcher.clone()));
        for template in with_overrides(default_templates(), &config.matcher.templates, |t: &Template| &t.id) {
            matcher.register_template(template)?;
        }
        let cross = Arc::new(CrossResonance::new(
            matcher.clone(),
            field.clone(),
            config.cross.clone(),
        ));
        let driver = Arc::new(FieldDriver::new(field.clone(), config.field.clone(), rng));

        let components: [Arc<dyn Periodic>; 7] = [
            driver,
            detector.clone(),
            generator.clone(),
            rules.clone(),
            amplifier.clone(),
            matcher.clone(),
            cross.clone(),
        ];
        let handles = components.into_iter().map(ComponentHandle::new).collect();

        Ok(Self {
            config,
            field,
            detector,
            generator,
            rules,
            amplifier,
            matcher,
            cross,
            handles,
            token: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.token.lock().is_some()
    }

    /// Start every tick loop under a fresh shared cancellation token.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.token.lock();
        if slot.is_some() {
            return Err(RuntimeError::AlreadyRunning("manager"));
        }
        let token = CancellationToken::new();
        for handle in &self.handles {
            handle.start(&token)?;
        }
        *slot = Some(token);
        tracing::info!(components = self.handles.len(), "engine started");
        Ok(())
    }

    /// Cancel the shared token, then stop components in reverse start
    /// order. Every component is stopped even if an earlier one fails.
    pub async fn stop(&self) -> Result<()> {
        let Some(token) = self.token.lock().take() else {
            return Err(RuntimeError::NotRunning("manager"));
        };
        token.cancel();

        let mut errors = Vec::new();
        for handle in self.handles.iter().rev() {
            if let Err(e) = handle.stop().await {
                tracing::error!(component = handle.name(), "stop failed: {e}");
                errors.push(e);
            }
        }
        if !errors.is_empty() {
            return Err(RuntimeError::Shutdown(errors));
        }
        tracing::info!("engine stopped");
        Ok(())
    }

    /// One snapshot per component, in start order.
    pub fn status(&self) -> Vec<StatusSnapshot> {
        self.handles.iter().map(|h| h.status()).collect()
    }

    pub fn component_names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|h| h.name()).collect()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn field(&self) -> &Arc<SimField> {
        &self.field
    }

    pub fn detector(&self) -> &Arc<PatternDetector> {
        &self.detector
    }

    pub fn generator(&self) -> &Arc<PropertyGenerator> {
        &self.generator
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn amplifier(&self) -> &Arc<ResonanceAmplifier> {
        &self.amplifier
    }

    pub fn matcher(&self) -> &Arc<PatternMatcher> {
        &self.matcher
    }

    pub fn cross(&self) -> &Arc<CrossResonance> {
        &self.cross
    }
}

/// Built-ins first, minus any whose ID the configured set reuses.
fn with_overrides<T: Clone>(builtin: Vec<T>, configured: &[T], id: impl Fn(&T) -> &String) -> Vec<T> {
    let mut out: Vec<T> = builtin
        .into_iter()
        .filter(|b| !configured.iter().any(|c| id(c) == id(b)))
        .collect();
    out.extend(configured.iter().cloned());
    out
}
