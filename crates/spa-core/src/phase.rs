//! Planning pass state machine
//!
//! `Start -> Analyze -> ResolveTarget -> PlanSplit -> (EmitIntent | NoAction) -> End`
//!
//! `NoAction` is also reachable from `Analyze` (insufficient data or a failed
//! usage query) and from `ResolveTarget` (a failed recommendation query).

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Phase of one category's planning pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Pass created
    Start,
    /// Measuring coverage
    Analyze,
    /// Resolving the target
    ResolveTarget,
    /// Sizing the purchase
    PlanSplit,
    /// Publishing (or, in dry run, announcing) the intent
    EmitIntent,
    /// Nothing to publish this cycle
    NoAction,
    /// Pass finished
    End,
}

impl Phase {
    /// Check if `next` may follow this phase
    #[must_use]
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::{Analyze, EmitIntent, End, NoAction, PlanSplit, ResolveTarget, Start};
        matches!(
            (self, next),
            (Start, Analyze)
                | (Analyze, ResolveTarget | NoAction)
                | (ResolveTarget, PlanSplit | NoAction)
                | (PlanSplit, EmitIntent | NoAction)
                | (EmitIntent | NoAction, End)
        )
    }

    /// Phase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Analyze => "analyze",
            Phase::ResolveTarget => "resolve_target",
            Phase::PlanSplit => "plan_split",
            Phase::EmitIntent => "emit_intent",
            Phase::NoAction => "no_action",
            Phase::End => "end",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid planning transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current phase
    pub from: Phase,
    /// Requested phase
    pub to: Phase,
}

/// Ordered record of the phases a pass went through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTrace {
    phases: Vec<Phase>,
}

impl PhaseTrace {
    /// Start a new trace
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { phases: vec![Phase::Start] }
    }

    /// Current phase
    #[inline]
    #[must_use]
    pub fn current(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Start)
    }

    /// Move to `next`
    ///
    /// # Errors
    /// Returns [`InvalidTransition`] if `next` cannot follow the current phase
    pub fn advance(&mut self, next: Phase) -> Result<(), InvalidTransition> {
        let from = self.current();
        if !from.can_advance_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.phases.push(next);
        Ok(())
    }

    /// Phases visited so far
    #[inline]
    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Check if the trace reached `End`
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.current() == Phase::End
    }
}

impl Default for PhaseTrace {
    fn default() -> Self {
        Self::new()
    }
}
