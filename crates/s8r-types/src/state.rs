//! The canonical lifecycle state enumeration.
//!
//! There is exactly one state enumeration for every subject kind.  Each state
//! carries a [`Phase`] tag; composites and machines use constrained subsets of
//! the same enumeration (the subsets live in the kernel's transition table).

use std::fmt;

use serde::{Deserialize, Serialize};

/// The four phases a [`LifecycleState`] can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Early setup, from conception through feature development.
    Structural,
    /// Runtime status of a constructed subject.
    Operational,
    /// Adaptive variants used by long-lived subjects.
    Advanced,
    /// End of life.
    Termination,
}

/// Closed, ordered enumeration of lifecycle states.
///
/// The discriminants are stable: the kernel stores the current state in an
/// `AtomicU8` so that snapshot reads never take a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    Conception = 0,
    Initializing = 1,
    Configuring = 2,
    Specializing = 3,
    DevelopingFeatures = 4,
    Ready = 5,
    Active = 6,
    Waiting = 7,
    Paused = 8,
    Error = 9,
    Recovering = 10,
    Degraded = 11,
    Maintaining = 12,
    Adapting = 13,
    Transforming = 14,
    Stable = 15,
    Spawning = 16,
    Deactivating = 17,
    Terminating = 18,
    Terminated = 19,
    Archived = 20,
}

impl LifecycleState {
    /// Every state, in declaration order.
    pub const ALL: [LifecycleState; 21] = [
        Self::Conception,
        Self::Initializing,
        Self::Configuring,
        Self::Specializing,
        Self::DevelopingFeatures,
        Self::Ready,
        Self::Active,
        Self::Waiting,
        Self::Paused,
        Self::Error,
        Self::Recovering,
        Self::Degraded,
        Self::Maintaining,
        Self::Adapting,
        Self::Transforming,
        Self::Stable,
        Self::Spawning,
        Self::Deactivating,
        Self::Terminating,
        Self::Terminated,
        Self::Archived,
    ];

    pub fn phase(self) -> Phase {
        use LifecycleState::*;
        match self {
            Conception | Configuring | Specializing | DevelopingFeatures => Phase::Structural,
            Initializing | Ready | Active | Waiting | Paused | Error | Recovering | Degraded
            | Maintaining => Phase::Operational,
            Adapting | Transforming | Stable | Spawning => Phase::Advanced,
            Deactivating | Terminating | Terminated | Archived => Phase::Termination,
        }
    }

    /// `true` for the absorbing end states `Terminated` and `Archived`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Archived)
    }

    /// `true` when a subject in this state is eligible to process work.
    pub fn is_operational(self) -> bool {
        use LifecycleState::*;
        matches!(
            self,
            Ready | Active | Waiting | Degraded | Adapting | Stable | Spawning
        )
    }

    pub fn description(self) -> &'static str {
        use LifecycleState::*;
        match self {
            Conception => "Initial creation",
            Initializing => "Early structure formation",
            Configuring => "Establishing boundaries",
            Specializing => "Determining core functions",
            DevelopingFeatures => "Building specific capabilities",
            Ready => "Prepared but not active",
            Active => "Fully operational",
            Waiting => "Temporarily inactive but responsive",
            Paused => "Temporarily stopped but resumable",
            Error => "Encountered an error during operation",
            Recovering => "Attempting to recover from error",
            Degraded => "Experiencing performance issues",
            Maintaining => "Undergoing repair operations",
            Adapting => "Adjusting to environmental changes",
            Transforming => "Undergoing major changes",
            Stable => "Optimal performance",
            Spawning => "Creating child components",
            Deactivating => "Preparing to shut down",
            Terminating => "Shutting down",
            Terminated => "Completed shutdown",
            Archived => "Knowledge preserved after termination",
        }
    }

    /// Biological analog of the state, where one exists.
    pub fn analog(self) -> Option<&'static str> {
        use LifecycleState::*;
        let analog = match self {
            Conception => "Fertilization/Zygote",
            Initializing => "Cleavage",
            Configuring => "Blastulation",
            Specializing => "Gastrulation",
            DevelopingFeatures => "Organogenesis",
            Adapting => "Environmental Adaptation",
            Transforming => "Metamorphosis",
            Stable => "Maturity",
            Spawning => "Reproduction",
            Degraded => "Senescence",
            Maintaining => "Healing",
            Terminating => "Death",
            Terminated => "Deceased",
            Archived => "Legacy",
            _ => return None,
        };
        Some(analog)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    fn name(self) -> &'static str {
        use LifecycleState::*;
        match self {
            Conception => "conception",
            Initializing => "initializing",
            Configuring => "configuring",
            Specializing => "specializing",
            DevelopingFeatures => "developing_features",
            Ready => "ready",
            Active => "active",
            Waiting => "waiting",
            Paused => "paused",
            Error => "error",
            Recovering => "recovering",
            Degraded => "degraded",
            Maintaining => "maintaining",
            Adapting => "adapting",
            Transforming => "transforming",
            Stable => "stable",
            Spawning => "spawning",
            Deactivating => "deactivating",
            Terminating => "terminating",
            Terminated => "terminated",
            Archived => "archived",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_match_table_positions() {
        for (i, state) in LifecycleState::ALL.iter().enumerate() {
            assert_eq!(usize::from(state.as_u8()), i);
            assert_eq!(LifecycleState::from_u8(state.as_u8()), Some(*state));
        }
        assert_eq!(LifecycleState::from_u8(200), None);
    }

    #[test]
    fn only_terminated_and_archived_are_terminal() {
        let terminal: Vec<_> = LifecycleState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![&LifecycleState::Terminated, &LifecycleState::Archived]
        );
    }

    #[test]
    fn terminal_states_are_in_termination_phase() {
        for state in LifecycleState::ALL.iter().filter(|s| s.is_terminal()) {
            assert_eq!(state.phase(), Phase::Termination);
        }
    }

    #[test]
    fn creation_states_are_not_operational() {
        assert!(!LifecycleState::Conception.is_operational());
        assert!(!LifecycleState::Specializing.is_operational());
        assert!(LifecycleState::Active.is_operational());
        assert!(!LifecycleState::Terminating.is_operational());
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&LifecycleState::DevelopingFeatures).unwrap();
        assert_eq!(json, "\"developing_features\"");
        assert_eq!(LifecycleState::DevelopingFeatures.to_string(), "developing_features");
    }

    #[test]
    fn analogs_cover_lifecycle_states() {
        assert_eq!(LifecycleState::Conception.analog(), Some("Fertilization/Zygote"));
        assert_eq!(LifecycleState::Paused.analog(), None);
    }
}
