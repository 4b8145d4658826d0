//! Membership of components in composites and of composites in machines.
//!
//! Membership is non-owning and orthogonal to lineage: adding a component to
//! a composite does not change its parent, and terminating a member leaves it
//! listed in its container until someone removes it.  A subject belongs to at
//! most one container at a time, and the containment graph never has cycles.
//!
//! There is no kernel-wide membership lock.  `add_member` locks the member,
//! the container and every container above it, all in id order, and checks
//! that the chain it read before locking is still the chain it holds.  A
//! subject's container only changes with that subject locked, so the locked
//! chain cannot move while the cycle check runs.  Every other place that
//! holds two subject locks takes them in the same id order, apart from a
//! parent locking a child it has just created and not yet published.

use std::sync::Arc;

use s8r_types::{CompositionError, EventPayload, OperationKind, S8rError, SubjectId};
use tracing::debug;

use crate::kernel::Kernel;
use crate::subject::{LockSet, Subject, SubjectBody, lock_pair};

/// Containers above some subject, innermost first, as read without locks.
struct ContainerChain {
    outer: Vec<Arc<Subject>>,
    /// Container id the walk could not resolve, if it ended on one.
    dangling: Option<SubjectId>,
}

impl Kernel {
    /// Place `member` inside `container`.
    ///
    /// # Errors
    ///
    /// - [`CompositionError::DuplicateMembership`] – already a member here.
    /// - [`CompositionError::AlreadyContained`] – a member of another container.
    /// - [`CompositionError::Cycle`] – `member` contains `container`, directly
    ///   or through nested composites.
    /// - [`CompositionError::IncompatibleMember`] – e.g. a component in a machine.
    /// - [`CompositionError::NotModifiable`] – the container is running.
    /// - [`S8rError::TerminatedSubject`] – either side is terminated.
    pub fn add_member(&self, container: SubjectId, member: SubjectId) -> Result<(), S8rError> {
        let owner = self.lookup(container)?;
        let joining = self.lookup(member)?;

        if container == member {
            let mut body = owner.body.lock();
            self.verify(&owner, &mut body, OperationKind::AddMember)?;
            let err = CompositionError::Cycle { container, member }.into();
            return Err(self.rejected(&owner, &mut body, OperationKind::AddMember, err));
        }

        loop {
            let chain = self.container_chain(&owner);
            let mut held: Vec<Arc<Subject>> = chain.outer.clone();
            held.push(Arc::clone(&owner));
            held.push(Arc::clone(&joining));
            let mut locks = LockSet::acquire(&held);
            if !chain_is_current(&locks, container, &chain) {
                debug!(%container, %member, "container chain moved; retrying");
                continue;
            }

            let cycle = chain.outer.iter().any(|s| s.id() == member);
            let Some((cbody, mbody)) = locks.pair_mut(container, member) else {
                return Err(S8rError::NotFound(member));
            };
            self.verify(&owner, cbody, OperationKind::AddMember)?;
            let admitted = if cycle {
                Err(CompositionError::Cycle { container, member }.into())
            } else {
                check_admission(&owner, cbody, &joining, mbody)
            };
            if let Err(err) = admitted {
                return Err(self.rejected(&owner, cbody, OperationKind::AddMember, err));
            }

            cbody.members.push(member);
            cbody.remember(format!("Added member: {}", member.short()));
            mbody.container = Some(container);
            mbody.remember(format!("Joined container: {}", container.short()));
            self.emit(container, EventPayload::MemberAdded { member });
            debug!(%container, %member, "member added");
            return Ok(());
        }
    }

    /// Take `member` out of `container`.  The member's own lifecycle is not
    /// touched.
    pub fn remove_member(&self, container: SubjectId, member: SubjectId) -> Result<(), S8rError> {
        let owner = self.lookup(container)?;

        let leaving = match self.lookup(member) {
            Ok(leaving) if member != container => leaving,
            _ => {
                let mut body = owner.body.lock();
                self.verify(&owner, &mut body, OperationKind::RemoveMember)?;
                let err = CompositionError::NotAMember { container, member }.into();
                return Err(self.rejected(&owner, &mut body, OperationKind::RemoveMember, err));
            }
        };

        let (mut cbody, mut mbody) = lock_pair(&owner, &leaving);
        self.verify(&owner, &mut cbody, OperationKind::RemoveMember)?;
        if !cbody.members.contains(&member) {
            let err = CompositionError::NotAMember { container, member }.into();
            return Err(self.rejected(&owner, &mut cbody, OperationKind::RemoveMember, err));
        }

        cbody.members.retain(|m| *m != member);
        cbody.remember(format!("Removed member: {}", member.short()));
        if mbody.container == Some(container) {
            mbody.container = None;
            mbody.remember(format!("Left container: {}", container.short()));
        }
        self.emit(container, EventPayload::MemberRemoved { member });
        debug!(%container, %member, "member removed");
        Ok(())
    }

    /// Members of `container`, in insertion order.
    pub fn members(&self, container: SubjectId) -> Result<Vec<SubjectId>, S8rError> {
        Ok(self.lookup(container)?.body.lock().members.clone())
    }

    /// The container `member` currently belongs to.
    pub fn container_of(&self, member: SubjectId) -> Result<Option<SubjectId>, S8rError> {
        Ok(self.lookup(member)?.body.lock().container)
    }

    /// Walk up from `subject` through its containers, one lock at a time.
    fn container_chain(&self, subject: &Subject) -> ContainerChain {
        let mut outer: Vec<Arc<Subject>> = Vec::new();
        let mut cursor = subject.body.lock().container;
        while let Some(id) = cursor {
            if id == subject.id() || outer.iter().any(|s| s.id() == id) {
                break;
            }
            match self.lookup(id) {
                Ok(next) => {
                    cursor = next.body.lock().container;
                    outer.push(next);
                }
                Err(_) => {
                    return ContainerChain {
                        outer,
                        dangling: Some(id),
                    };
                }
            }
        }
        ContainerChain {
            outer,
            dangling: None,
        }
    }

    /// Remove every member of a terminating container.
    pub(crate) fn sever_members(&self, container: &Subject) {
        let members = std::mem::take(&mut container.body.lock().members);
        for member in members {
            match self.lookup(member) {
                Ok(subject) if subject.id() != container.id() => {
                    let (mut cbody, mut mbody) = lock_pair(container, &subject);
                    if mbody.container == Some(container.id()) {
                        mbody.container = None;
                        mbody.remember(format!(
                            "Released by container: {}",
                            container.id().short()
                        ));
                    }
                    cbody.remember(format!("Severed member: {}", member.short()));
                    self.emit(container.id(), EventPayload::MemberRemoved { member });
                }
                _ => {
                    let mut cbody = container.body.lock();
                    cbody.remember(format!("Severed member: {}", member.short()));
                    self.emit(container.id(), EventPayload::MemberRemoved { member });
                }
            }
        }
    }

    /// Drop `member` from whatever container holds it.
    pub(crate) fn detach_from_container(&self, member: &Subject) {
        let Some(container) = member.body.lock().container else {
            return;
        };
        match self.lookup(container) {
            Ok(owner) if owner.id() != member.id() => {
                let (mut cbody, mut mbody) = lock_pair(&owner, member);
                if mbody.container != Some(container) {
                    return;
                }
                cbody.members.retain(|m| *m != member.id());
                cbody.remember(format!("Removed member: {}", member.id().short()));
                mbody.container = None;
                self.emit(container, EventPayload::MemberRemoved { member: member.id() });
            }
            _ => {
                let mut body = member.body.lock();
                if body.container == Some(container) {
                    body.container = None;
                }
            }
        }
    }
}

/// `true` when the locked container fields still describe `chain`.
fn chain_is_current(locks: &LockSet<'_>, container: SubjectId, chain: &ContainerChain) -> bool {
    let mut cursor = locks.get(container).and_then(|body| body.container);
    for outer in &chain.outer {
        if cursor != Some(outer.id()) {
            return false;
        }
        cursor = locks.get(outer.id()).and_then(|body| body.container);
    }
    // A walk that stopped on a repeat ends on a container it already holds.
    cursor == chain.dangling
        || cursor.is_some_and(|id| id == container || chain.outer.iter().any(|s| s.id() == id))
}

fn check_admission(
    owner: &Subject,
    cbody: &SubjectBody,
    joining: &Subject,
    mbody: &SubjectBody,
) -> Result<(), S8rError> {
    let (container, member) = (owner.id(), joining.id());
    if joining.state().is_terminal() {
        return Err(S8rError::TerminatedSubject {
            subject: member,
            operation: OperationKind::AddMember,
        });
    }
    if !owner.kind().accepts_member(joining.kind()) {
        return Err(CompositionError::IncompatibleMember {
            container_kind: owner.kind(),
            member_kind: joining.kind(),
        }
        .into());
    }
    if cbody.members.contains(&member) {
        return Err(CompositionError::DuplicateMembership { container, member }.into());
    }
    if let Some(current) = mbody.container {
        return Err(CompositionError::AlreadyContained { member, current }.into());
    }
    Ok(())
}
