//! The simulated field as seen by the engine: a read/write snapshot contract
//! plus an in-memory implementation.
//!
//! The field's own evolution is not modelled here. `SimField` only offers a
//! random-walk `perturb` so that long-running demos have something to see.

use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::FieldConfig;
use crate::error::{EngineError, Result};

/// The five resource categories, in generating-cycle order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Wood,
    Fire,
    Earth,
    Metal,
    Water,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Wood,
        Category::Fire,
        Category::Earth,
        Category::Metal,
        Category::Water,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Wood => "wood",
            Category::Fire => "fire",
            Category::Earth => "earth",
            Category::Metal => "metal",
            Category::Water => "water",
        }
    }

    /// The category this one generates (next in the cycle).
    pub fn generates(self) -> Category {
        Category::ALL[(self.index() + 1) % 5]
    }

    /// The category this one constrains (two ahead in the cycle).
    pub fn constrains(self) -> Category {
        Category::ALL[(self.index() + 2) % 5]
    }
}

const GEN: f64 = 1.3;
const CON: f64 = 0.8;
const NIL: f64 = 1.0;

/// Directional relation multiplier: `RELATION[from][to]`.
pub static RELATION: [[f64; 5]; 5] = [
    // wood  fire  earth metal water
    [NIL, GEN, CON, NIL, NIL], // wood
    [NIL, NIL, GEN, CON, NIL], // fire
    [NIL, NIL, NIL, GEN, CON], // earth
    [CON, NIL, NIL, NIL, GEN], // metal
    [GEN, CON, NIL, NIL, NIL], // water
];

pub fn relation_factor(from: Category, to: Category) -> f64 {
    RELATION[from.index()][to.index()]
}

/// Complementary magnitudes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Duality {
    pub yin: f64,
    pub yang: f64,
}

impl Duality {
    /// 1.0 when balanced, falling toward 0 as one side dominates.
    pub fn harmony(&self) -> f64 {
        let total = self.yin.abs() + self.yang.abs();
        if total <= f64::EPSILON {
            return 1.0;
        }
        1.0 - (self.yin - self.yang).abs() / total
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantumState {
    pub coherence: f64,
    pub entanglement: f64,
    pub phase: f64,
    pub amplitudes: Vec<f64>,
}

impl QuantumState {
    pub fn mean_amplitude(&self) -> f64 {
        if self.amplitudes.is_empty() {
            return 0.0;
        }
        self.amplitudes.iter().map(|a| a.abs()).sum::<f64>() / self.amplitudes.len() as f64
    }
}

/// Row-major grid of point energies.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyGrid {
    pub width: usize,
    pub height: usize,
    pub cells: Vec<f64>,
}

impl EnergyGrid {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![0.0; width * height],
        }
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        if self.contains(x, y) {
            self.cells.get(y * self.width + x).copied()
        } else {
            None
        }
    }

    pub fn set(&mut self, x: usize, y: usize, value: f64) {
        if !self.contains(x, y) {
            return;
        }
        if let Some(cell) = self.cells.get_mut(y * self.width + x) {
            *cell = value;
        }
    }

    /// Cell storage must cover exactly `width × height` cells.
    pub fn check(&self) -> Result<()> {
        let expected = self.width.checked_mul(self.height);
        if expected != Some(self.cells.len()) {
            return Err(EngineError::FieldUnavailable(format!(
                "grid is {}x{} but holds {} cells",
                self.width,
                self.height,
                self.cells.len()
            )));
        }
        Ok(())
    }

    pub fn max(&self) -> f64 {
        self.cells.iter().copied().fold(0.0, f64::max)
    }

    /// 4-connected neighbors inside the grid.
    pub fn neighbors(&self, x: usize, y: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let candidates = [
            (x.checked_sub(1), Some(y)),
            (Some(x + 1), Some(y)),
            (Some(x), y.checked_sub(1)),
            (Some(x), Some(y + 1)),
        ];
        candidates.into_iter().filter_map(move |c| match c {
            (Some(nx), Some(ny)) if self.contains(nx, ny) => Some((nx, ny)),
            _ => None,
        })
    }
}

/// One read of the field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    pub energy: f64,
    pub stability: f64,
    pub phase: f64,
    pub categories: BTreeMap<Category, f64>,
    pub duality: Duality,
    pub quantum: QuantumState,
    pub grid: EnergyGrid,
    pub properties: HashMap<String, f64>,
}

impl Default for FieldState {
    fn default() -> Self {
        Self {
            energy: 0.0,
            stability: 1.0,
            phase: 0.0,
            categories: BTreeMap::new(),
            duality: Duality::default(),
            quantum: QuantumState::default(),
            grid: EnergyGrid::default(),
            properties: HashMap::new(),
        }
    }
}

impl FieldState {
    pub fn with_energy(mut self, energy: f64) -> Self {
        self.energy = energy;
        self
    }

    pub fn with_category(mut self, category: Category, energy: f64) -> Self {
        self.categories.insert(category, energy);
        self
    }

    pub fn with_grid(mut self, grid: EnergyGrid) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_quantum(mut self, quantum: QuantumState) -> Self {
        self.quantum = quantum;
        self
    }

    pub fn category_energy(&self, category: Category) -> Option<f64> {
        self.categories.get(&category).copied()
    }

    pub fn coherence(&self) -> f64 {
        self.quantum.coherence
    }

    /// Named scalar lookup covering the built-in aggregates and the open map.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        match name {
            "energy" => Some(self.energy),
            "stability" => Some(self.stability),
            "coherence" => Some(self.quantum.coherence),
            "entanglement" => Some(self.quantum.entanglement),
            "phase" => Some(self.phase),
            "harmony" => Some(self.duality.harmony()),
            _ => self.properties.get(name).copied(),
        }
    }
}

/// Read/write access to the external field.
pub trait Field: Send + Sync {
    /// Snapshot of the whole state. Failure aborts the caller's cycle.
    fn state(&self) -> Result<FieldState>;
    fn energy(&self) -> f64;
    fn stability(&self) -> f64;
    fn coherence(&self) -> f64;
    fn property_value(&self, name: &str) -> Option<f64>;
    fn set_property_value(&self, name: &str, value: f64) -> Result<()>;
    fn add_energy(&self, delta: f64) -> Result<()>;
    fn set_phase(&self, phase: f64) -> Result<()>;
}

/// In-memory field backed by a single lock.
pub struct SimField {
    state: RwLock<FieldState>,
}

impl SimField {
    pub fn new(state: FieldState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Random starting state: every category populated, a few grid hotspots,
    /// a partially coherent quantum sub-state.
    pub fn seeded(config: &FieldConfig, rng: &mut impl Rng) -> Self {
        let mut categories = BTreeMap::new();
        for category in Category::ALL {
            categories.insert(category, rng.random_range(0.2..1.0));
        }

        let mut grid = EnergyGrid::new(config.grid_width, config.grid_height);
        for cell in grid.cells.iter_mut() {
            *cell = rng.random_range(0.0..0.08);
        }
        let hotspots = (config.grid_width * config.grid_height / 16).max(1);
        for _ in 0..hotspots {
            let x = rng.random_range(0..config.grid_width);
            let y = rng.random_range(0..config.grid_height);
            grid.set(x, y, rng.random_range(0.4..1.0));
            let spill: Vec<_> = grid.neighbors(x, y).collect();
            for (nx, ny) in spill {
                grid.set(nx, ny, rng.random_range(0.15..0.4));
            }
        }

        let quantum = QuantumState {
            coherence: rng.random_range(0.3..0.9),
            entanglement: rng.random_range(0.1..0.7),
            phase: rng.random_range(-PI..PI),
            amplitudes: (0..4).map(|_| rng.random_range(-1.0..1.0)).collect(),
        };

        let mut properties = HashMap::new();
        properties.insert("field_strength".to_string(), rng.random_range(0.3..0.8));

        Self::new(FieldState {
            energy: config.initial_energy,
            stability: rng.random_range(0.5..1.0),
            phase: quantum.phase,
            categories,
            duality: Duality {
                yin: rng.random_range(0.3..0.7),
                yang: rng.random_range(0.3..0.7),
            },
            quantum,
            grid,
            properties,
        })
    }

    pub fn replace_state(&self, state: FieldState) {
        *self.state.write() = state;
    }

    /// Multiplicative random walk over every scalar in the state.
    pub fn perturb(&self, drift: f64, rng: &mut impl Rng) {
        let drift = drift.abs();
        if drift == 0.0 {
            return;
        }
        let mut step = |v: f64| v * (1.0 + rng.random_range(-drift..drift));
        let mut state = self.state.write();
        for energy in state.categories.values_mut() {
            *energy = step(*energy).max(0.0);
        }
        for cell in state.grid.cells.iter_mut() {
            *cell = step(*cell).max(0.0);
        }
        state.quantum.coherence = step(state.quantum.coherence).clamp(0.0, 1.0);
        state.quantum.entanglement = step(state.quantum.entanglement).clamp(0.0, 1.0);
        state.stability = step(state.stability).clamp(0.0, 1.0);
        state.duality.yin = step(state.duality.yin).max(0.0);
        state.duality.yang = step(state.duality.yang).max(0.0);
    }
}

impl Field for SimField {
    fn state(&self) -> Result<FieldState> {
        Ok(self.state.read().clone())
    }

    fn energy(&self) -> f64 {
        self.state.read().energy
    }

    fn stability(&self) -> f64 {
        self.state.read().stability
    }

    fn coherence(&self) -> f64 {
        self.state.read().quantum.coherence
    }

    fn property_value(&self, name: &str) -> Option<f64> {
        self.state.read().scalar(name)
    }

    fn set_property_value(&self, name: &str, value: f64) -> Result<()> {
        if name.is_empty() {
            return Err(EngineError::validation("property name must not be empty"));
        }
        if !value.is_finite() {
            return Err(EngineError::validation(format!(
                "property {name} must be finite, got {value}"
            )));
        }
        self.state.write().properties.insert(name.to_string(), value);
        Ok(())
    }

    fn add_energy(&self, delta: f64) -> Result<()> {
        if !delta.is_finite() {
            return Err(EngineError::validation(format!(
                "energy delta must be finite, got {delta}"
            )));
        }
        let mut state = self.state.write();
        let next = state.energy + delta;
        if next < 0.0 {
            return Err(EngineError::InsufficientEnergy {
                required: -delta,
                available: state.energy,
            });
        }
        state.energy = next;
        Ok(())
    }

    fn set_phase(&self, phase: f64) -> Result<()> {
        if !phase.is_finite() || phase.abs() > PI {
            return Err(EngineError::validation(format!(
                "phase must be within [-π, π], got {phase}"
            )));
        }
        self.state.write().phase = phase;
        Ok(())
    }
}
