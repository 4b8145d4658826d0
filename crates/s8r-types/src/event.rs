//! Domain events emitted by the kernel and the [`EventSink`] port they are
//! emitted through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{LineageAnomaly, SubjectId};
use crate::operation::{OperationKind, SubjectKind};
use crate::state::LifecycleState;

/// Immutable record of a lifecycle or structural change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    /// The subject whose history this event belongs to.  Ordering guarantees
    /// are per `subject_id`.
    pub subject_id: SubjectId,
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(subject_id: SubjectId, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            subject_id,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Created { .. } => EventKind::Created,
            EventPayload::StateChanged { .. } => EventKind::StateChanged,
            EventPayload::MemberAdded { .. } => EventKind::MemberAdded,
            EventPayload::MemberRemoved { .. } => EventKind::MemberRemoved,
            EventPayload::ValidationRejected { .. } => EventKind::ValidationRejected,
            EventPayload::Terminated { .. } => EventKind::Terminated,
            EventPayload::LineageAnomaly(_) => EventKind::LineageAnomaly,
        }
    }

    /// [`EventPriority::Critical`] for `Terminated` and for state changes into
    /// a terminal state; everything else may be shed under overload.
    pub fn priority(&self) -> EventPriority {
        match &self.payload {
            EventPayload::Terminated { .. } => EventPriority::Critical,
            EventPayload::StateChanged { to, .. } if to.is_terminal() => EventPriority::Critical,
            _ => EventPriority::Droppable,
        }
    }
}

/// Discriminant of an [`EventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    StateChanged,
    MemberAdded,
    MemberRemoved,
    ValidationRejected,
    Terminated,
    LineageAnomaly,
}

/// Delivery priority used by bounded queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventPriority {
    /// May be dropped (oldest first) when a subject's queue is full.
    Droppable,
    /// Never dropped.
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Created {
        subject_kind: SubjectKind,
        reason: String,
        parent: Option<SubjectId>,
    },
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    /// Emitted on the container's subject stream.
    MemberAdded { member: SubjectId },
    /// Emitted on the container's subject stream.
    MemberRemoved { member: SubjectId },
    ValidationRejected {
        operation: OperationKind,
        state: LifecycleState,
        reason: String,
    },
    Terminated {
        reason: String,
        /// Set when termination had to be forced past children that did not
        /// finish terminating.
        partial_failure: bool,
    },
    /// Warning: an ancestor entry was dropped while restoring an identity.
    LineageAnomaly(LineageAnomaly),
}

/// Port through which the kernel hands off events.
///
/// Implementations must not block: the kernel calls `publish` while holding a
/// subject's write lock.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_change(to: LifecycleState) -> DomainEvent {
        DomainEvent::new(
            SubjectId::new(),
            EventPayload::StateChanged {
                from: LifecycleState::Active,
                to,
            },
        )
    }

    #[test]
    fn terminal_state_changes_are_critical() {
        assert_eq!(
            state_change(LifecycleState::Terminated).priority(),
            EventPriority::Critical
        );
        assert_eq!(
            state_change(LifecycleState::Archived).priority(),
            EventPriority::Critical
        );
        assert_eq!(
            state_change(LifecycleState::Terminating).priority(),
            EventPriority::Droppable
        );
    }

    #[test]
    fn structural_events_are_droppable() {
        let added = DomainEvent::new(
            SubjectId::new(),
            EventPayload::MemberAdded {
                member: SubjectId::new(),
            },
        );
        assert_eq!(added.kind(), EventKind::MemberAdded);
        assert_eq!(added.priority(), EventPriority::Droppable);
    }

    #[test]
    fn terminated_event_is_critical() {
        let event = DomainEvent::new(
            SubjectId::new(),
            EventPayload::Terminated {
                reason: "shutdown".into(),
                partial_failure: false,
            },
        );
        assert_eq!(event.kind(), EventKind::Terminated);
        assert_eq!(event.priority(), EventPriority::Critical);
    }

    #[test]
    fn event_roundtrip() {
        let event = state_change(LifecycleState::Ready);
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
