//! Transition-legality tables.
//!
//! Legality is decided by looking the current state up in a static table for
//! the subject's [`SubjectKind`]; no other code path decides whether an edge
//! exists.  Components use the full state enumeration, composites and machines
//! use constrained subsets of it.
//!
//! Every table satisfies two properties (checked exhaustively in the tests
//! below):
//!
//! - every non-terminal state has at least one outbound edge, and
//! - `Terminated` is reachable from every state in the subset.
//!
//! Every non-terminal state other than `Terminating` has a direct edge to
//! `Terminating`, which is what [`Kernel::terminate`][crate::Kernel::terminate]
//! relies on.
//!
//! # Example
//!
//! ```
//! use s8r_kernel::lifecycle;
//! use s8r_types::{LifecycleState, SubjectKind};
//!
//! assert!(lifecycle::is_legal(SubjectKind::Component, LifecycleState::Conception, LifecycleState::Initializing));
//! assert!(!lifecycle::is_legal(SubjectKind::Component, LifecycleState::Conception, LifecycleState::Active));
//! ```

use std::collections::{HashMap, VecDeque};

use s8r_types::{LifecycleState, OperationKind, Phase, SubjectKind};

use LifecycleState::*;

/// State every subject starts in.
pub const INITIAL_STATE: LifecycleState = Conception;

// ────────────────────────────────────────────────────────────────────────────
// State subsets
// ────────────────────────────────────────────────────────────────────────────

const COMPOSITE_STATES: &[LifecycleState] = &[
    Conception,
    Initializing,
    Ready,
    Active,
    Waiting,
    Paused,
    Error,
    Recovering,
    Degraded,
    Maintaining,
    Deactivating,
    Terminating,
    Terminated,
    Archived,
];

/// created / ready / running / stopped / paused / error / destroyed.
const MACHINE_STATES: &[LifecycleState] = &[
    Conception,
    Ready,
    Active,
    Waiting,
    Paused,
    Error,
    Terminating,
    Terminated,
    Archived,
];

/// States a subject of `kind` can ever occupy.
pub fn states(kind: SubjectKind) -> &'static [LifecycleState] {
    match kind {
        SubjectKind::Component => &LifecycleState::ALL,
        SubjectKind::Composite => COMPOSITE_STATES,
        SubjectKind::Machine => MACHINE_STATES,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Legality tables
// ────────────────────────────────────────────────────────────────────────────

/// Legal next states for a component in state `from`.
fn component_targets(from: LifecycleState) -> &'static [LifecycleState] {
    match from {
        Conception => &[Initializing, Terminating],
        Initializing => &[Configuring, Error, Terminating],
        Configuring => &[Specializing, Error, Terminating],
        Specializing => &[DevelopingFeatures, Error, Terminating],
        DevelopingFeatures => &[Ready, Error, Terminating],
        Ready => &[Active, Waiting, Paused, Maintaining, Error, Deactivating, Terminating],
        Active => &[
            Ready,
            Waiting,
            Paused,
            Degraded,
            Maintaining,
            Adapting,
            Transforming,
            Stable,
            Spawning,
            Error,
            Deactivating,
            Terminating,
        ],
        Waiting => &[Active, Ready, Paused, Error, Deactivating, Terminating],
        Paused => &[Active, Ready, Error, Deactivating, Terminating],
        Error => &[Recovering, Degraded, Terminating],
        Recovering => &[Ready, Active, Degraded, Error, Terminating],
        Degraded => &[Maintaining, Recovering, Active, Error, Terminating],
        Maintaining => &[Ready, Active, Degraded, Error, Terminating],
        Adapting => &[Active, Stable, Transforming, Error, Terminating],
        Transforming => &[Active, Adapting, Stable, Error, Terminating],
        Stable => &[Active, Adapting, Spawning, Degraded, Error, Deactivating, Terminating],
        Spawning => &[Stable, Active, Error, Terminating],
        Deactivating => &[Terminating],
        Terminating => &[Terminated],
        Terminated => &[Archived],
        Archived => &[],
    }
}

fn composite_targets(from: LifecycleState) -> &'static [LifecycleState] {
    match from {
        Conception => &[Initializing, Terminating],
        Initializing => &[Ready, Error, Terminating],
        Ready => &[Active, Waiting, Maintaining, Error, Deactivating, Terminating],
        Active => &[
            Ready,
            Waiting,
            Paused,
            Degraded,
            Maintaining,
            Error,
            Deactivating,
            Terminating,
        ],
        Waiting => &[Active, Ready, Error, Deactivating, Terminating],
        Paused => &[Active, Error, Deactivating, Terminating],
        Error => &[Recovering, Terminating],
        Recovering => &[Ready, Degraded, Error, Terminating],
        Degraded => &[Maintaining, Recovering, Active, Error, Terminating],
        Maintaining => &[Ready, Active, Error, Terminating],
        Deactivating => &[Terminating],
        Terminating => &[Terminated],
        Terminated => &[Archived],
        _ => &[],
    }
}

fn machine_targets(from: LifecycleState) -> &'static [LifecycleState] {
    match from {
        Conception => &[Ready, Error, Terminating],
        Ready => &[Active, Error, Terminating],
        Active => &[Waiting, Paused, Error, Terminating],
        Waiting => &[Active, Error, Terminating],
        Paused => &[Active, Error, Terminating],
        Error => &[Ready, Terminating],
        Terminating => &[Terminated],
        Terminated => &[Archived],
        _ => &[],
    }
}

/// Legal next states for a subject of `kind` in state `from`.
pub fn legal_targets(kind: SubjectKind, from: LifecycleState) -> &'static [LifecycleState] {
    match kind {
        SubjectKind::Component => component_targets(from),
        SubjectKind::Composite => composite_targets(from),
        SubjectKind::Machine => machine_targets(from),
    }
}

pub fn is_legal(kind: SubjectKind, from: LifecycleState, to: LifecycleState) -> bool {
    legal_targets(kind, from).contains(&to)
}

/// Shortest sequence of legal transitions leading from `from` to `to`,
/// excluding `from` itself.  `Some(vec![])` when `from == to`.
pub fn shortest_path(
    kind: SubjectKind,
    from: LifecycleState,
    to: LifecycleState,
) -> Option<Vec<LifecycleState>> {
    let mut previous: HashMap<LifecycleState, LifecycleState> = HashMap::new();
    let mut queue = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        if current == to {
            let mut path = Vec::new();
            let mut cursor = current;
            while cursor != from {
                path.push(cursor);
                cursor = previous[&cursor];
            }
            path.reverse();
            return Some(path);
        }
        for &next in legal_targets(kind, current) {
            if next != from && !previous.contains_key(&next) {
                previous.insert(next, current);
                queue.push_back(next);
            }
        }
    }
    None
}

// ────────────────────────────────────────────────────────────────────────────
// Operation tables
// ────────────────────────────────────────────────────────────────────────────

/// States in which a container of `kind` accepts structural changes
/// (membership changes and version updates).
pub fn is_modifiable(kind: SubjectKind, state: LifecycleState) -> bool {
    match kind {
        SubjectKind::Component => false,
        SubjectKind::Composite => matches!(
            state,
            Conception | Initializing | Ready | Waiting | Maintaining
        ),
        SubjectKind::Machine => matches!(state, Conception | Ready | Waiting),
    }
}

/// Operation-to-allowed-states table.
pub fn operation_allowed(operation: OperationKind, state: LifecycleState) -> bool {
    let live = state.phase() != Phase::Termination;
    match operation {
        OperationKind::Transition => !state.is_terminal() && state != Terminating,
        OperationKind::Terminate => true,
        OperationKind::Archive => state == Terminated,
        OperationKind::Reclaim => state.is_terminal(),
        OperationKind::DeriveChild
        | OperationKind::AddMember
        | OperationKind::RemoveMember
        | OperationKind::SetEnvironment
        | OperationKind::SetVersion => live,
    }
}
