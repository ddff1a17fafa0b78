//! Phase-plan construction.
//!
//! A plan is a pure function of task weight: it is built at scheduling time
//! and never persisted. The weight-to-phases mapping is table-driven.

use crate::task::Weight;
use serde::{Deserialize, Serialize};

/// How a phase transition is approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// Proceed automatically once completion criteria are met.
    #[default]
    Auto,
    /// Park the worker and wait for external resumption.
    Human,
}

/// Status of a phase within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

/// One step of a task's plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDisplay {
    /// Stable phase identifier (e.g. "implement").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub status: PhaseState,
    pub gate: GateKind,
}

impl PhaseDisplay {
    pub fn new(id: &str, name: &str, gate: GateKind) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: PhaseState::Pending,
            gate,
        }
    }
}

/// Phase table rows: (id, name, gate).
const TRIVIAL: &[(&str, &str, GateKind)] = &[("implement", "Implement", GateKind::Auto)];

const SMALL: &[(&str, &str, GateKind)] = &[
    ("implement", "Implement", GateKind::Auto),
    ("test", "Test", GateKind::Auto),
];

const MEDIUM: &[(&str, &str, GateKind)] = &[
    ("spec", "Specify", GateKind::Auto),
    ("implement", "Implement", GateKind::Auto),
    ("test", "Test", GateKind::Auto),
];

const LARGE: &[(&str, &str, GateKind)] = &[
    ("spec", "Specify", GateKind::Auto),
    ("implement", "Implement", GateKind::Auto),
    ("test", "Test", GateKind::Auto),
    ("review", "Review", GateKind::Human),
];

const GREENFIELD: &[(&str, &str, GateKind)] = &[
    ("scaffold", "Scaffold", GateKind::Auto),
    ("spec", "Specify", GateKind::Auto),
    ("implement", "Implement", GateKind::Auto),
    ("test", "Test", GateKind::Auto),
    ("review", "Review", GateKind::Human),
];

/// Build the phase plan for a task weight.
pub fn plan_for(weight: Weight) -> Vec<PhaseDisplay> {
    let rows = match weight {
        Weight::Trivial => TRIVIAL,
        Weight::Small => SMALL,
        Weight::Medium => MEDIUM,
        Weight::Large => LARGE,
        Weight::Greenfield => GREENFIELD,
    };
    rows.iter()
        .map(|(id, name, gate)| PhaseDisplay::new(id, name, *gate))
        .collect()
}

/// Phase identifiers for a weight, in plan order.
pub fn phase_order(weight: Weight) -> Vec<String> {
    plan_for(weight).into_iter().map(|p| p.id).collect()
}
