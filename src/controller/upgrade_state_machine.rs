//! State machine for Kubernetes upgrade phase transitions.
//!
//! Each reconciliation condenses what it observed into an
//! [`UpgradeTransitionContext`], picks one [`UpgradeEvent`] with
//! [`determine_upgrade_event`], and looks up the resulting phase in the
//! [`UpgradeStateMachine`] transition table.

use crate::crd::UpgradePhase;

// ============================================================================
// Upgrade Events
// ============================================================================

/// Events that can trigger upgrade phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeEvent {
    /// Versions differ but the cluster itself is not running and ready.
    ClusterNotReady,

    /// No steps remain and every component is ready.
    Converged,

    /// The desired version went back to the last converged version while
    /// steps remain: roll every pending change back at once.
    RevertRequested,

    /// Everything is ready and at least one step remains: take the next one.
    StepReady,

    /// Some component is not ready yet.
    ComponentsNotReady,

    /// None of the above applies.
    Unresolved,
}

impl std::fmt::Display for UpgradeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeEvent::ClusterNotReady => write!(f, "ClusterNotReady"),
            UpgradeEvent::Converged => write!(f, "Converged"),
            UpgradeEvent::RevertRequested => write!(f, "RevertRequested"),
            UpgradeEvent::StepReady => write!(f, "StepReady"),
            UpgradeEvent::ComponentsNotReady => write!(f, "ComponentsNotReady"),
            UpgradeEvent::Unresolved => write!(f, "Unresolved"),
        }
    }
}

// ============================================================================
// Transition Context
// ============================================================================

/// Context data used to pick an event and evaluate transition guards.
#[derive(Debug, Clone, Default)]
pub struct UpgradeTransitionContext {
    /// The cluster health subsystem reports the cluster running and ready.
    pub cluster_ready: bool,

    /// The desired version differs from the last converged version.
    pub version_mismatch: bool,

    /// The upgrade path has at least one step.
    pub has_steps: bool,

    /// Every component on every node reports ready.
    pub all_components_ready: bool,
}

impl UpgradeTransitionContext {
    /// Whether a forward step may be applied.
    pub fn can_step(&self) -> bool {
        self.has_steps && self.all_components_ready
    }

    /// Whether the cluster is fully converged.
    pub fn is_converged(&self) -> bool {
        !self.has_steps && self.all_components_ready
    }
}

// ============================================================================
// Upgrade Transition
// ============================================================================

/// Represents a single state transition.
#[derive(Debug, Clone)]
pub struct UpgradeTransition {
    /// Source phase.
    pub from: UpgradePhase,

    /// Target phase.
    pub to: UpgradePhase,

    /// Event that triggers this transition.
    pub event: UpgradeEvent,

    /// Human-readable description.
    pub description: &'static str,
}

// ============================================================================
// Upgrade State Machine
// ============================================================================

/// State machine for validating upgrade phase transitions.
#[derive(Debug, Clone)]
pub struct UpgradeStateMachine {
    /// All valid transitions.
    transitions: Vec<UpgradeTransition>,
}

impl Default for UpgradeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeStateMachine {
    /// Create a new state machine with all valid transitions.
    pub fn new() -> Self {
        let mut transitions = Vec::new();

        for from in UpgradePhase::ALL {
            transitions.push(UpgradeTransition {
                from,
                to: UpgradePhase::Done,
                event: UpgradeEvent::Converged,
                description: "All components at the desired version and ready",
            });
            transitions.push(UpgradeTransition {
                from,
                to: UpgradePhase::Upgrading,
                event: UpgradeEvent::StepReady,
                description: "Apply the next upgrade step",
            });
            transitions.push(UpgradeTransition {
                from,
                to: UpgradePhase::Unknown,
                event: UpgradeEvent::Unresolved,
                description: "State could not be classified",
            });
            // Waiting never changes the phase.
            transitions.push(UpgradeTransition {
                from,
                to: from,
                event: UpgradeEvent::ComponentsNotReady,
                description: "Wait for components to become ready",
            });
            transitions.push(UpgradeTransition {
                from,
                to: from,
                event: UpgradeEvent::ClusterNotReady,
                description: "Wait for the cluster to become ready",
            });
        }

        for from in [
            UpgradePhase::Unknown,
            UpgradePhase::Upgrading,
            UpgradePhase::Reverting,
        ] {
            transitions.push(UpgradeTransition {
                from,
                to: UpgradePhase::Reverting,
                event: UpgradeEvent::RevertRequested,
                description: "Roll back all pending changes",
            });
        }

        Self { transitions }
    }

    /// Attempt to transition from one phase to another given an event.
    ///
    /// Returns the transition if valid, None otherwise.
    pub fn transition(
        &self,
        from: UpgradePhase,
        event: UpgradeEvent,
        ctx: &UpgradeTransitionContext,
    ) -> Option<UpgradeTransition> {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == from && t.event == event)?;

        if !self.evaluate_guards(transition, ctx) {
            return None;
        }

        Some(transition.clone())
    }

    /// Evaluate guards for a transition.
    fn evaluate_guards(
        &self,
        transition: &UpgradeTransition,
        ctx: &UpgradeTransitionContext,
    ) -> bool {
        match transition.event {
            UpgradeEvent::Converged => ctx.is_converged(),
            UpgradeEvent::StepReady => ctx.can_step(),
            UpgradeEvent::RevertRequested => ctx.has_steps && !ctx.version_mismatch,
            UpgradeEvent::ClusterNotReady => !ctx.cluster_ready && ctx.version_mismatch,
            UpgradeEvent::ComponentsNotReady => !ctx.all_components_ready,
            UpgradeEvent::Unresolved => true,
        }
    }

    /// Check if a phase transition is valid (without guards).
    pub fn can_transition(&self, from: UpgradePhase, to: UpgradePhase) -> bool {
        if from == to {
            return true;
        }

        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Get the list of valid next phases from a given phase.
    pub fn valid_transitions(&self, from: UpgradePhase) -> Vec<UpgradePhase> {
        let mut phases: Vec<UpgradePhase> = self
            .transitions
            .iter()
            .filter(|t| t.from == from && t.to != from)
            .map(|t| t.to)
            .collect();
        phases.dedup();
        phases
    }

    /// Phase after applying an event; stays put when no transition matches.
    pub fn next_phase(
        &self,
        from: UpgradePhase,
        event: UpgradeEvent,
        ctx: &UpgradeTransitionContext,
    ) -> UpgradePhase {
        self.transition(from, event, ctx)
            .map(|t| t.to)
            .unwrap_or(from)
    }
}

/// Determine the appropriate upgrade event based on context.
///
/// Event priority:
/// 1. Cluster not ready while versions differ
/// 2. Converged
/// 3. Revert (steps remain, no version change, not yet done)
/// 4. Next forward step
/// 5. Components not ready
/// 6. Unresolved
pub fn determine_upgrade_event(
    phase: UpgradePhase,
    ctx: &UpgradeTransitionContext,
) -> UpgradeEvent {
    if !ctx.cluster_ready && ctx.version_mismatch {
        return UpgradeEvent::ClusterNotReady;
    }

    if ctx.is_converged() {
        return UpgradeEvent::Converged;
    }

    if ctx.has_steps && !ctx.version_mismatch && phase != UpgradePhase::Done {
        return UpgradeEvent::RevertRequested;
    }

    if ctx.can_step() {
        return UpgradeEvent::StepReady;
    }

    if !ctx.all_components_ready {
        return UpgradeEvent::ComponentsNotReady;
    }

    UpgradeEvent::Unresolved
}
