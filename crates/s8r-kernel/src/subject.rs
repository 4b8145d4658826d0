//! Arena cell holding one subject.
//!
//! The current state lives in an `AtomicU8` outside the write lock so
//! readers get a lock-free snapshot.  Every mutation (state, environment,
//! children, membership) happens with [`Subject::body`] locked, which is what
//! serializes writers on a single subject.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use s8r_types::{Identity, LifecycleState, SubjectId, SubjectKind};

pub(crate) struct Subject {
    identity: Identity,
    kind: SubjectKind,
    state: AtomicU8,
    pub(crate) body: Mutex<SubjectBody>,
}

/// Everything about a subject that only changes under its write lock.
pub(crate) struct SubjectBody {
    pub environment: BTreeMap<String, String>,
    /// Owned children, in creation order.  Components only.
    pub children: Vec<Arc<Subject>>,
    /// Non-owning member references, in insertion order.  Containers only.
    pub members: Vec<SubjectId>,
    /// The container this subject is currently a member of.
    pub container: Option<SubjectId>,
    /// Semantic version.  Machines only.
    pub version: Option<String>,
    pub termination_in_progress: bool,
    pub partial_failure: bool,
    memory: VecDeque<String>,
    memory_capacity: usize,
}

impl SubjectBody {
    /// Append a timestamped entry to the subject's memory log, evicting the
    /// oldest entry once the log is full.
    pub fn remember(&mut self, entry: impl AsRef<str>) {
        if self.memory_capacity == 0 {
            return;
        }
        while self.memory.len() >= self.memory_capacity {
            self.memory.pop_front();
        }
        self.memory
            .push_back(format!("{} - {}", Utc::now().to_rfc3339(), entry.as_ref()));
    }

    pub fn memory_log(&self) -> Vec<String> {
        self.memory.iter().cloned().collect()
    }
}

impl Subject {
    pub fn new(
        identity: Identity,
        kind: SubjectKind,
        state: LifecycleState,
        environment: BTreeMap<String, String>,
        memory_capacity: usize,
    ) -> Self {
        Self {
            identity,
            kind,
            state: AtomicU8::new(state.as_u8()),
            body: Mutex::new(SubjectBody {
                environment,
                children: Vec::new(),
                members: Vec::new(),
                container: None,
                version: None,
                termination_in_progress: false,
                partial_failure: false,
                memory: VecDeque::new(),
                memory_capacity,
            }),
        }
    }

    pub fn id(&self) -> SubjectId {
        self.identity.id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    /// Lock-free snapshot of the current state.
    pub fn state(&self) -> LifecycleState {
        match LifecycleState::from_u8(self.state.load(Ordering::Acquire)) {
            Some(state) => state,
            None => unreachable!("state cell only ever holds LifecycleState discriminants"),
        }
    }

    /// Replace the current state.  The caller must hold `body`, which the
    /// guard parameter enforces.
    pub fn store_state(&self, _held: &mut MutexGuard<'_, SubjectBody>, state: LifecycleState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// This subject and all of its owned descendants, deepest first
    /// (children in creation order, each child's subtree before the child).
    pub fn subtree_post_order(self: &Arc<Self>) -> Vec<Arc<Subject>> {
        let mut out = Vec::new();
        let children = self.body.lock().children.clone();
        for child in &children {
            out.extend(child.subtree_post_order());
        }
        out.push(Arc::clone(self));
        out
    }
}

/// Lock two distinct subjects in id order and return the guards as
/// `(first, second)` matching the argument order.
pub(crate) fn lock_pair<'a>(
    first: &'a Subject,
    second: &'a Subject,
) -> (MutexGuard<'a, SubjectBody>, MutexGuard<'a, SubjectBody>) {
    if first.id() < second.id() {
        let a = first.body.lock();
        let b = second.body.lock();
        (a, b)
    } else {
        let b = second.body.lock();
        let a = first.body.lock();
        (a, b)
    }
}

/// Guards for a set of distinct subjects, acquired in id order.
pub(crate) struct LockSet<'a> {
    guards: Vec<(SubjectId, MutexGuard<'a, SubjectBody>)>,
}

impl<'a> LockSet<'a> {
    /// Lock every distinct subject in `subjects`.  Duplicates are locked once.
    pub fn acquire(subjects: &'a [Arc<Subject>]) -> Self {
        let mut ordered: Vec<&'a Subject> = subjects.iter().map(Arc::as_ref).collect();
        ordered.sort_by_key(|s| s.id());
        ordered.dedup_by_key(|s| s.id());
        Self {
            guards: ordered.into_iter().map(|s| (s.id(), s.body.lock())).collect(),
        }
    }

    pub fn get(&self, id: SubjectId) -> Option<&SubjectBody> {
        self.guards
            .iter()
            .find(|(held, _)| *held == id)
            .map(|(_, guard)| &**guard)
    }

    /// Mutable access to two different subjects of the set at once.
    pub fn pair_mut(
        &mut self,
        first: SubjectId,
        second: SubjectId,
    ) -> Option<(&mut SubjectBody, &mut SubjectBody)> {
        let (mut a, mut b) = (None, None);
        for (held, guard) in self.guards.iter_mut() {
            if *held == first {
                a = Some(&mut **guard);
            } else if *held == second {
                b = Some(&mut **guard);
            }
        }
        Some((a?, b?))
    }
}
