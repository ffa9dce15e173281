//! Detected regularities and the components they are built from.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::field::{Category, FieldState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    CategoryPair,
    EnergyCluster,
    EnergyFlow,
    QuantumEntanglement,
    QuantumCoherence,
}

/// Coarse grouping used for role assignment and correlation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatternFamily {
    Elemental,
    Field,
    Resonance,
}

impl PatternFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternFamily::Elemental => "elemental",
            PatternFamily::Field => "field",
            PatternFamily::Resonance => "resonance",
        }
    }
}

impl PatternKind {
    pub const ALL: [PatternKind; 5] = [
        PatternKind::CategoryPair,
        PatternKind::EnergyCluster,
        PatternKind::EnergyFlow,
        PatternKind::QuantumEntanglement,
        PatternKind::QuantumCoherence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::CategoryPair => "category_pair",
            PatternKind::EnergyCluster => "energy_cluster",
            PatternKind::EnergyFlow => "energy_flow",
            PatternKind::QuantumEntanglement => "quantum_entanglement",
            PatternKind::QuantumCoherence => "quantum_coherence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn family(self) -> PatternFamily {
        match self {
            PatternKind::CategoryPair => PatternFamily::Elemental,
            PatternKind::EnergyCluster | PatternKind::EnergyFlow => PatternFamily::Field,
            PatternKind::QuantumEntanglement | PatternKind::QuantumCoherence => {
                PatternFamily::Resonance
            }
        }
    }

    /// Declared enhancing relations between pattern kinds.
    pub fn enhances(self, target: PatternKind) -> bool {
        matches!(
            (self, target),
            (PatternKind::CategoryPair, PatternKind::EnergyCluster)
                | (PatternKind::CategoryPair, PatternKind::QuantumCoherence)
                | (PatternKind::EnergyFlow, PatternKind::EnergyCluster)
                | (PatternKind::QuantumEntanglement, PatternKind::QuantumCoherence)
        )
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantumAspect {
    Coherence,
    Entanglement,
}

/// Where in the field a component reads its value from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum ComponentSource {
    Category { category: Category },
    Cell { x: usize, y: usize },
    Quantum { aspect: QuantumAspect },
}

impl ComponentSource {
    /// Same-kind test used for pairing density and type matching.
    pub fn same_kind(&self, other: &ComponentSource) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn exists_in(&self, state: &FieldState) -> bool {
        match self {
            ComponentSource::Category { category } => state.categories.contains_key(category),
            ComponentSource::Cell { x, y } => state.grid.contains(*x, *y),
            ComponentSource::Quantum { aspect } => match aspect {
                QuantumAspect::Coherence => state.quantum.coherence > 0.0,
                QuantumAspect::Entanglement => state.quantum.entanglement > 0.0,
            },
        }
    }

    /// Raw reading in the snapshot, `None` when the source is gone.
    pub fn reading(&self, state: &FieldState) -> Option<f64> {
        match self {
            ComponentSource::Category { category } => state.category_energy(*category),
            ComponentSource::Cell { x, y } => state.grid.get(*x, *y),
            ComponentSource::Quantum { aspect } => match aspect {
                QuantumAspect::Coherence => Some(state.quantum.coherence),
                QuantumAspect::Entanglement => Some(state.quantum.entanglement),
            },
        }
    }

    /// Normalized strength of this source in [0, 1]: category energy over
    /// field energy, cell energy over the hottest cell, or the quantum value.
    pub fn strength(&self, state: &FieldState) -> Option<f64> {
        let raw = self.reading(state)?;
        let s = match self {
            ComponentSource::Category { .. } => ratio(raw, state.energy),
            ComponentSource::Cell { .. } => ratio(raw, state.grid.max()),
            ComponentSource::Quantum { .. } => raw,
        };
        Some(s.clamp(0.0, 1.0))
    }
}

fn ratio(value: f64, total: f64) -> f64 {
    if total <= 0.0 { 0.0 } else { value / total }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub source: ComponentSource,
    pub role: String,
    pub weight: f64,
    /// Normalized state readings; 0.5 is the balanced point.
    pub state: BTreeMap<String, f64>,
    pub properties: BTreeMap<String, f64>,
}

impl Component {
    pub fn new(source: ComponentSource, role: &str, weight: f64) -> Self {
        Self {
            source,
            role: role.to_string(),
            weight,
            state: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, key: &str, value: f64) -> Self {
        self.state.insert(key.to_string(), value);
        self
    }

    /// `1 / (1 + Σ|s − 0.5|)`: the more centered the state, the more stable.
    pub fn stability(&self) -> f64 {
        let deviation: f64 = self.state.values().map(|v| (v - 0.5).abs()).sum();
        1.0 / (1.0 + deviation)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub kind: PatternKind,
    pub components: Vec<Component>,
    pub strength: f64,
    pub stability: f64,
    pub energy: f64,
    pub formed_at: u64,
    pub updated_at: u64,
    pub properties: BTreeMap<String, f64>,
}

impl Pattern {
    pub fn new(id: impl Into<String>, kind: PatternKind, components: Vec<Component>, now: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            components,
            strength: 0.0,
            stability: 0.0,
            energy: 0.0,
            formed_at: now,
            updated_at: now,
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<f64> {
        self.properties.get(name).copied()
    }

    pub fn set_property(&mut self, name: &str, value: f64) {
        self.properties.insert(name.to_string(), value);
    }

    fn total_weight(&self) -> f64 {
        self.components.iter().map(|c| c.weight.max(0.0)).sum()
    }

    /// Weighted average of per-component strength against a snapshot.
    /// `None` if any component's source no longer exists.
    pub fn compute_strength(&self, state: &FieldState) -> Option<f64> {
        let total = self.total_weight();
        if self.components.is_empty() || total <= 0.0 {
            return Some(0.0);
        }
        let mut sum = 0.0;
        for c in &self.components {
            sum += c.weight.max(0.0) * c.source.strength(state)?;
        }
        Some((sum / total).clamp(0.0, 1.0))
    }

    /// Weighted average of component stability.
    pub fn compute_stability(&self) -> f64 {
        let total = self.total_weight();
        if self.components.is_empty() || total <= 0.0 {
            return 0.0;
        }
        let sum: f64 = self
            .components
            .iter()
            .map(|c| c.weight.max(0.0) * c.stability())
            .sum();
        (sum / total).clamp(0.0, 1.0)
    }

    /// Recompute strength and stability from the current components.
    /// Returns false when a component has vanished from the snapshot.
    pub fn refresh_scores(&mut self, state: &FieldState) -> bool {
        match self.compute_strength(state) {
            Some(strength) => {
                self.strength = strength;
                self.stability = self.compute_stability();
                true
            }
            None => false,
        }
    }

    pub fn components_exist(&self, state: &FieldState) -> bool {
        self.components.iter().all(|c| c.source.exists_in(state))
    }

    /// Geometric mean of strength and stability.
    pub fn coherence(&self) -> f64 {
        (self.strength.max(0.0) * self.stability.max(0.0)).sqrt()
    }

    /// Same-kind component pairs.
    pub fn same_kind_pairs(&self) -> usize {
        let mut pairs = 0;
        for (i, a) in self.components.iter().enumerate() {
            for b in &self.components[i + 1..] {
                if a.source.same_kind(&b.source) {
                    pairs += 1;
                }
            }
        }
        pairs
    }

    /// mean(components/10, same-kind pairs/10, properties/10), each capped at 1.
    pub fn complexity(&self) -> f64 {
        let terms = [
            self.components.len() as f64 / 10.0,
            self.same_kind_pairs() as f64 / 10.0,
            self.properties.len() as f64 / 10.0,
        ];
        terms.iter().map(|t| t.min(1.0)).sum::<f64>() / 3.0
    }

    /// Ratio of lightest to heaviest component weight.
    pub fn symmetry(&self) -> f64 {
        let max = self.components.iter().map(|c| c.weight).fold(0.0, f64::max);
        if max <= 0.0 {
            return 0.0;
        }
        let min = self
            .components
            .iter()
            .map(|c| c.weight)
            .fold(f64::INFINITY, f64::min);
        (min / max).clamp(0.0, 1.0)
    }

    /// Numeric attribute lookup shared by rules, templates and constraints.
    pub fn attribute(&self, name: &str) -> Option<f64> {
        match name {
            "strength" => Some(self.strength),
            "stability" => Some(self.stability),
            "energy" => Some(self.energy),
            "coherence" => Some(self.coherence()),
            "complexity" => Some(self.complexity()),
            "symmetry" => Some(self.symmetry()),
            _ => self.property(name),
        }
    }

    pub fn source_set(&self) -> HashSet<&ComponentSource> {
        self.components.iter().map(|c| &c.source).collect()
    }
}

/// Anything that can hand out the currently live patterns.
pub trait PatternSource: Send + Sync {
    fn active_patterns(&self) -> crate::error::Result<Vec<Pattern>>;
}
