use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use em_core::{Field, FieldConfig, Periodic, SimField, StatusSnapshot};
use parking_lot::Mutex;
use rand::rngs::SmallRng;

/// Keeps a `SimField` moving by applying a bounded random walk every tick.
pub struct FieldDriver {
    field: Arc<SimField>,
    config: FieldConfig,
    rng: Mutex<SmallRng>,
    steps: AtomicU64,
}

impl FieldDriver {
    pub fn new(field: Arc<SimField>, config: FieldConfig, rng: SmallRng) -> Self {
        Self {
            field,
            config,
            rng: Mutex::new(rng),
            steps: AtomicU64::new(0),
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }
}

impl Periodic for FieldDriver {
    fn name(&self) -> &'static str {
        "field"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.update_interval_ms.max(1))
    }

    fn run_cycle(&self) -> em_core::Result<()> {
        self.field.perturb(self.config.drift, &mut *self.rng.lock());
        self.steps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn status(&self) -> StatusSnapshot {
        StatusSnapshot::new(self.name())
            .count("steps", self.steps())
            .score("energy", self.field.energy())
            .score("stability", self.field.stability())
            .score("coherence", self.field.coherence())
    }
}
