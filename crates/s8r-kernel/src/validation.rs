//! [`ValidationChain`] – ordered, fail-fast operation gate.
//!
//! Before the kernel mutates a subject it describes the request as an
//! [`OperationDescriptor`] and passes it through [`ValidationChain::verify`].
//! Every registered [`Check`] is evaluated in order; the first rejection is
//! returned and the remaining checks are skipped.
//!
//! The standard chain ([`ValidationChain::standard`]) runs:
//!
//! 1. [`NotTerminatedCheck`] – terminal subjects only accept operations that
//!    are meaningful after termination.
//! 2. [`OperationStateCheck`] – the operation must be allowed in the current
//!    state according to [`lifecycle::operation_allowed`].
//! 3. [`StructuralCheck`] – kind and container constraints, e.g. membership
//!    changes require a container in a modifiable state.

use s8r_types::{
    CompositionError, LifecycleState, OperationKind, S8rError, SubjectId, SubjectKind,
};

use crate::lifecycle;

/// What is being attempted, on which subject, from which state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub subject: SubjectId,
    pub kind: SubjectKind,
    pub operation: OperationKind,
    pub current_state: LifecycleState,
}

// ────────────────────────────────────────────────────────────────────────────
// Check trait
// ────────────────────────────────────────────────────────────────────────────

/// A single independent gate an operation must pass.
///
/// Implement this trait to add custom checks to a [`ValidationChain`] via
/// [`ValidationChain::add_check`].
pub trait Check: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// `Ok(())` to accept, or the typed error describing the rejection.
    fn check(&self, op: &OperationDescriptor) -> Result<(), S8rError>;
}

// ────────────────────────────────────────────────────────────────────────────
// ValidationChain
// ────────────────────────────────────────────────────────────────────────────

/// Ordered sequence of [`Check`]s.
///
/// # Example
///
/// ```
/// use s8r_kernel::validation::{OperationDescriptor, ValidationChain};
/// use s8r_types::{LifecycleState, OperationKind, SubjectId, SubjectKind};
///
/// let chain = ValidationChain::standard();
/// let op = OperationDescriptor {
///     subject: SubjectId::new(),
///     kind: SubjectKind::Component,
///     operation: OperationKind::Transition,
///     current_state: LifecycleState::Terminated,
/// };
/// assert!(chain.verify(&op).is_err());
/// ```
#[derive(Default)]
pub struct ValidationChain {
    checks: Vec<Box<dyn Check>>,
}

impl ValidationChain {
    /// Create an empty chain that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// The three standard checks, in order.
    pub fn standard() -> Self {
        let mut chain = Self::new();
        chain.add_check(Box::new(NotTerminatedCheck));
        chain.add_check(Box::new(OperationStateCheck));
        chain.add_check(Box::new(StructuralCheck));
        chain
    }

    /// Append a [`Check`].  Checks run in insertion order.
    pub fn add_check(&mut self, check: Box<dyn Check>) {
        self.checks.push(check);
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check; the first rejection short-circuits.
    pub fn verify(&self, op: &OperationDescriptor) -> Result<(), S8rError> {
        for check in &self.checks {
            if let Err(e) = check.check(op) {
                tracing::debug!(
                    check = check.name(),
                    subject = %op.subject,
                    operation = %op.operation,
                    state = %op.current_state,
                    "operation rejected"
                );
                return Err(e);
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Standard checks
// ────────────────────────────────────────────────────────────────────────────

/// Rejects everything but terminate/archive/reclaim on a terminal subject.
pub struct NotTerminatedCheck;

impl Check for NotTerminatedCheck {
    fn name(&self) -> &str {
        "not_terminated"
    }

    fn check(&self, op: &OperationDescriptor) -> Result<(), S8rError> {
        if op.current_state.is_terminal() && !op.operation.permitted_after_termination() {
            return Err(S8rError::TerminatedSubject {
                subject: op.subject,
                operation: op.operation,
            });
        }
        Ok(())
    }
}

/// Consults the operation-to-allowed-states table.
pub struct OperationStateCheck;

impl Check for OperationStateCheck {
    fn name(&self) -> &str {
        "operation_state"
    }

    fn check(&self, op: &OperationDescriptor) -> Result<(), S8rError> {
        if lifecycle::operation_allowed(op.operation, op.current_state) {
            Ok(())
        } else {
            Err(S8rError::IllegalOperation {
                subject: op.subject,
                operation: op.operation,
                state: op.current_state,
            })
        }
    }
}

/// Kind and container constraints.
pub struct StructuralCheck;

impl Check for StructuralCheck {
    fn name(&self) -> &str {
        "structural"
    }

    fn check(&self, op: &OperationDescriptor) -> Result<(), S8rError> {
        let illegal = || S8rError::IllegalOperation {
            subject: op.subject,
            operation: op.operation,
            state: op.current_state,
        };
        match op.operation {
            OperationKind::DeriveChild if op.kind != SubjectKind::Component => Err(illegal()),
            OperationKind::SetVersion if op.kind != SubjectKind::Machine => Err(illegal()),
            OperationKind::AddMember | OperationKind::RemoveMember if !op.kind.is_container() => {
                Err(illegal())
            }
            operation
                if operation.is_structural()
                    && !lifecycle::is_modifiable(op.kind, op.current_state) =>
            {
                Err(CompositionError::NotModifiable {
                    container: op.subject,
                    state: op.current_state,
                }
                .into())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------ helpers

    fn op(
        kind: SubjectKind,
        operation: OperationKind,
        current_state: LifecycleState,
    ) -> OperationDescriptor {
        OperationDescriptor {
            subject: SubjectId::new(),
            kind,
            operation,
            current_state,
        }
    }

    struct AlwaysReject(&'static str);

    impl Check for AlwaysReject {
        fn name(&self) -> &str {
            self.0
        }

        fn check(&self, _op: &OperationDescriptor) -> Result<(), S8rError> {
            Err(S8rError::InvalidArgument(self.0.to_string()))
        }
    }

    // ------------------------------------------------------------------ chain mechanics

    #[test]
    fn empty_chain_accepts_everything() {
        let chain = ValidationChain::new();
        assert!(chain.is_empty());
        assert!(chain
            .verify(&op(
                SubjectKind::Component,
                OperationKind::AddMember,
                LifecycleState::Archived
            ))
            .is_ok());
    }

    #[test]
    fn first_rejection_short_circuits() {
        let mut chain = ValidationChain::new();
        chain.add_check(Box::new(AlwaysReject("first")));
        chain.add_check(Box::new(AlwaysReject("second")));

        let result = chain.verify(&op(
            SubjectKind::Component,
            OperationKind::Transition,
            LifecycleState::Ready,
        ));
        assert!(matches!(result, Err(S8rError::InvalidArgument(ref m)) if m == "first"));
    }

    #[test]
    fn standard_chain_has_three_checks() {
        assert_eq!(ValidationChain::standard().len(), 3);
    }

    // ------------------------------------------------------------------ (a) not terminated

    #[test]
    fn terminated_subject_rejects_transition() {
        let result = ValidationChain::standard().verify(&op(
            SubjectKind::Component,
            OperationKind::Transition,
            LifecycleState::Terminated,
        ));
        assert!(matches!(result, Err(S8rError::TerminatedSubject { .. })));
    }

    #[test]
    fn terminated_subject_accepts_terminate() {
        assert!(ValidationChain::standard()
            .verify(&op(
                SubjectKind::Component,
                OperationKind::Terminate,
                LifecycleState::Terminated
            ))
            .is_ok());
    }

    #[test]
    fn terminated_check_runs_before_structural_check() {
        // A terminated component adding a member fails on termination, not on
        // being a component.
        let result = ValidationChain::standard().verify(&op(
            SubjectKind::Component,
            OperationKind::AddMember,
            LifecycleState::Terminated,
        ));
        assert!(matches!(result, Err(S8rError::TerminatedSubject { .. })));
    }

    // ------------------------------------------------------------------ (b) operation state

    #[test]
    fn derive_child_rejected_while_terminating() {
        let result = ValidationChain::standard().verify(&op(
            SubjectKind::Component,
            OperationKind::DeriveChild,
            LifecycleState::Terminating,
        ));
        assert!(matches!(result, Err(S8rError::IllegalOperation { .. })));
    }

    // ------------------------------------------------------------------ (c) structural

    #[test]
    fn add_member_requires_container() {
        let result = ValidationChain::standard().verify(&op(
            SubjectKind::Component,
            OperationKind::AddMember,
            LifecycleState::Ready,
        ));
        assert!(matches!(result, Err(S8rError::IllegalOperation { .. })));
    }

    #[test]
    fn add_member_requires_modifiable_state() {
        let result = ValidationChain::standard().verify(&op(
            SubjectKind::Machine,
            OperationKind::AddMember,
            LifecycleState::Active,
        ));
        assert!(matches!(
            result,
            Err(S8rError::Composition(CompositionError::NotModifiable { .. }))
        ));
    }

    #[test]
    fn add_member_accepted_on_ready_composite() {
        assert!(ValidationChain::standard()
            .verify(&op(
                SubjectKind::Composite,
                OperationKind::AddMember,
                LifecycleState::Ready
            ))
            .is_ok());
    }

    #[test]
    fn set_version_is_machine_only() {
        let result = ValidationChain::standard().verify(&op(
            SubjectKind::Composite,
            OperationKind::SetVersion,
            LifecycleState::Ready,
        ));
        assert!(matches!(result, Err(S8rError::IllegalOperation { .. })));
    }
}
