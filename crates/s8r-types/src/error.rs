use std::time::Duration;

use thiserror::Error;

use crate::identity::SubjectId;
use crate::operation::{OperationKind, SubjectKind};
use crate::state::LifecycleState;

/// Core error type covering construction, lifecycle, composition, and hook
/// failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S8rError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state transition on {subject}: {from} -> {to}")]
    InvalidStateTransition {
        subject: SubjectId,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Composition error: {0}")]
    Composition(#[from] CompositionError),

    #[error("Subject {subject} is terminated; {operation} rejected")]
    TerminatedSubject {
        subject: SubjectId,
        operation: OperationKind,
    },

    #[error("Operation {operation} is not permitted on {subject} while {state}")]
    IllegalOperation {
        subject: SubjectId,
        operation: OperationKind,
        state: LifecycleState,
    },

    #[error("Hook '{hook}' exceeded its {timeout:?} timeout")]
    HookTimeout { hook: String, timeout: Duration },

    #[error("Hook '{hook}' failed: {details}")]
    HookFailed { hook: String, details: String },

    #[error("Subject not found: {0}")]
    NotFound(SubjectId),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Membership-related failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositionError {
    #[error("{member} is already a member of {container}")]
    DuplicateMembership {
        container: SubjectId,
        member: SubjectId,
    },

    #[error("{member} already belongs to another container ({current})")]
    AlreadyContained {
        member: SubjectId,
        current: SubjectId,
    },

    #[error("adding {member} to {container} would create a containment cycle")]
    Cycle {
        container: SubjectId,
        member: SubjectId,
    },

    #[error("{member} is not a member of {container}")]
    NotAMember {
        container: SubjectId,
        member: SubjectId,
    },

    #[error("{container} cannot change membership while {state}")]
    NotModifiable {
        container: SubjectId,
        state: LifecycleState,
    },

    #[error("a {container_kind} cannot hold a {member_kind}")]
    IncompatibleMember {
        container_kind: SubjectKind,
        member_kind: SubjectKind,
    },
}
