//! Closed enumerations of subject kinds and operation kinds.
//!
//! Operations are dispatched on [`OperationKind`] variants, never on free-form
//! strings, so an unknown operation cannot be expressed at all.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What sort of subject an identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// Smallest unit carrying identity and lifecycle state.  Owns its
    /// children.
    Component,
    /// Non-owning grouping of components (and nested composites).
    Composite,
    /// Non-owning grouping of composites; the largest orchestration unit.
    Machine,
}

impl SubjectKind {
    /// `true` for kinds that hold members.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Composite | Self::Machine)
    }

    /// Whether a subject of `member` kind may be placed inside a container of
    /// this kind.
    pub fn accepts_member(self, member: SubjectKind) -> bool {
        matches!(
            (self, member),
            (Self::Composite, Self::Component)
                | (Self::Composite, Self::Composite)
                | (Self::Machine, Self::Composite)
        )
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Component => "component",
            Self::Composite => "composite",
            Self::Machine => "machine",
        })
    }
}

/// Every mutating operation the kernel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Transition,
    Terminate,
    Archive,
    DeriveChild,
    AddMember,
    RemoveMember,
    SetEnvironment,
    SetVersion,
    Reclaim,
}

impl OperationKind {
    /// Operations that remain meaningful once a subject is terminated.
    pub fn permitted_after_termination(self) -> bool {
        matches!(self, Self::Terminate | Self::Archive | Self::Reclaim)
    }

    /// Operations that change container membership or container metadata.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Self::AddMember | Self::RemoveMember | Self::SetVersion
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transition => "transition",
            Self::Terminate => "terminate",
            Self::Archive => "archive",
            Self::DeriveChild => "derive_child",
            Self::AddMember => "add_member",
            Self::RemoveMember => "remove_member",
            Self::SetEnvironment => "set_environment",
            Self::SetVersion => "set_version",
            Self::Reclaim => "reclaim",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_containers_accept_members() {
        assert!(!SubjectKind::Component.accepts_member(SubjectKind::Component));
        assert!(SubjectKind::Composite.accepts_member(SubjectKind::Component));
        assert!(SubjectKind::Machine.accepts_member(SubjectKind::Composite));
        assert!(!SubjectKind::Machine.accepts_member(SubjectKind::Component));
        assert!(!SubjectKind::Composite.accepts_member(SubjectKind::Machine));
    }

    #[test]
    fn terminate_and_archive_survive_termination() {
        assert!(OperationKind::Terminate.permitted_after_termination());
        assert!(OperationKind::Archive.permitted_after_termination());
        assert!(!OperationKind::Transition.permitted_after_termination());
        assert!(!OperationKind::AddMember.permitted_after_termination());
    }
}
