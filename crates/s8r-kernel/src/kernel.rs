//! [`Kernel`] – the exposed surface of the lifecycle core.
//!
//! The kernel owns an arena of subjects.  Origin subjects (roots) are owned by
//! the kernel itself; derived components are owned by their parent's child
//! list.  A secondary index of weak references resolves any id to its
//! subject without taking ownership, so ancestors are always looked up by id
//! and never cached.
//!
//! Every mutating call follows the same shape: look the subject up, take its
//! write lock, run the [`ValidationChain`], apply the change, and hand the
//! resulting [`DomainEvent`] to the [`EventSink`] before releasing the lock.
//! Publishing under the lock is what keeps each subject's event stream in
//! generation order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use s8r_kernel::{Kernel, KernelConfig};
//! use s8r_types::{DomainEvent, EventSink, LifecycleState, SubjectKind};
//!
//! #[derive(Default)]
//! struct Recorder(Mutex<Vec<DomainEvent>>);
//! impl EventSink for Recorder {
//!     fn publish(&self, event: DomainEvent) {
//!         self.0.lock().push(event);
//!     }
//! }
//!
//! let kernel = Kernel::new(KernelConfig::default(), Arc::new(Recorder::default()));
//! let root = kernel.create_root(SubjectKind::Component, "orchestrator").unwrap();
//! let child = kernel.derive_child(root, "worker").unwrap();
//!
//! kernel.advance_to(child, LifecycleState::Active).unwrap();
//! assert_eq!(kernel.current_state(child).unwrap(), LifecycleState::Active);
//! assert_eq!(kernel.ancestor_chain(child).unwrap(), vec![root]);
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::MutexGuard;
use s8r_types::{
    DomainEvent, EventPayload, EventSink, Identity, LifecycleState, OperationKind, Phase,
    S8rError, SubjectId, SubjectKind, SubjectSnapshot,
};
use tracing::{debug, info, instrument, warn};

use crate::lifecycle;
use crate::subject::{Subject, SubjectBody};
use crate::termination::{KnowledgeArchive, TerminationHooks};
use crate::validation::{OperationDescriptor, ValidationChain};

/// Version a machine carries until [`Kernel::set_version`] changes it.
pub const DEFAULT_MACHINE_VERSION: &str = "1.0.0";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tunables for termination and per-subject bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelConfig {
    /// Upper bound on each termination hook invocation.
    pub hook_timeout: Duration,
    /// How many passes a parent makes over unfinished children before it is
    /// forced into `Terminated` with the partial-failure flag.
    pub termination_max_attempts: u32,
    /// Pause between those passes.
    pub termination_retry_backoff: Duration,
    /// Entries retained in each subject's memory log.
    pub memory_log_capacity: usize,
    /// Knowledge snapshots the archive keeps; the oldest is evicted first.
    pub knowledge_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hook_timeout: Duration::from_secs(5),
            termination_max_attempts: 3,
            termination_retry_backoff: Duration::from_millis(10),
            memory_log_capacity: 256,
            knowledge_capacity: 1024,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Kernel
// ────────────────────────────────────────────────────────────────────────────

/// Arena of components, composites, and machines.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    chain: ValidationChain,
    sink: Arc<dyn EventSink>,
    pub(crate) hooks: TerminationHooks,
    roots: DashMap<SubjectId, Arc<Subject>>,
    index: DashMap<SubjectId, Weak<Subject>>,
    pub(crate) knowledge: KnowledgeArchive,
}

impl Kernel {
    /// Create an empty kernel with the standard [`ValidationChain`] and no
    /// termination hooks.
    pub fn new(config: KernelConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            chain: ValidationChain::standard(),
            sink,
            hooks: TerminationHooks::default(),
            roots: DashMap::new(),
            index: DashMap::new(),
            knowledge: KnowledgeArchive::new(config.knowledge_capacity),
            config,
        }
    }

    /// Hooks used by [`Kernel::terminate`].
    pub fn with_hooks(mut self, hooks: TerminationHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the standard chain, e.g. to append custom checks.
    pub fn with_validation_chain(mut self, chain: ValidationChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create an origin subject with no ancestors.
    ///
    /// # Errors
    ///
    /// [`S8rError::InvalidArgument`] when `reason` is empty.
    pub fn create_root(&self, kind: SubjectKind, reason: &str) -> Result<SubjectId, S8rError> {
        self.create_root_with_environment(kind, reason, BTreeMap::new())
    }

    /// Like [`Kernel::create_root`], seeding the subject's environment.
    #[instrument(level = "debug", skip(self, environment))]
    pub fn create_root_with_environment(
        &self,
        kind: SubjectKind,
        reason: &str,
        mut environment: BTreeMap<String, String>,
    ) -> Result<SubjectId, S8rError> {
        let identity = Identity::root(reason)?;
        environment
            .entry("component.type".to_string())
            .or_insert_with(|| kind.to_string());
        environment
            .entry("component.origin".to_string())
            .or_insert_with(|| "primary".to_string());

        let subject = Arc::new(Subject::new(
            identity,
            kind,
            lifecycle::INITIAL_STATE,
            environment,
            self.config.memory_log_capacity,
        ));
        let id = subject.id();
        {
            let mut body = subject.body.lock();
            if kind == SubjectKind::Machine {
                body.version = Some(DEFAULT_MACHINE_VERSION.to_string());
            }
            body.remember(format!("Created as origin {kind} with reason: {reason}"));
            self.index.insert(id, Arc::downgrade(&subject));
            self.roots.insert(id, Arc::clone(&subject));
            self.emit(
                id,
                EventPayload::Created {
                    subject_kind: kind,
                    reason: reason.to_string(),
                    parent: None,
                },
            );
        }
        info!(subject = %id, %kind, reason, "origin subject created");
        Ok(id)
    }

    /// Derive a component owned by `parent`.
    ///
    /// # Errors
    ///
    /// - [`S8rError::NotFound`] – `parent` is unknown.
    /// - [`S8rError::TerminatedSubject`] – `parent` is terminated.
    /// - [`S8rError::IllegalOperation`] – `parent` is shutting down or is not a
    ///   component.
    /// - [`S8rError::InvalidArgument`] – `reason` is empty.
    pub fn derive_child(&self, parent: SubjectId, reason: &str) -> Result<SubjectId, S8rError> {
        self.derive_child_with_environment(parent, reason, BTreeMap::new())
    }

    #[instrument(level = "debug", skip(self, environment))]
    pub fn derive_child_with_environment(
        &self,
        parent: SubjectId,
        reason: &str,
        mut environment: BTreeMap<String, String>,
    ) -> Result<SubjectId, S8rError> {
        let owner = self.lookup(parent)?;
        let mut body = owner.body.lock();
        self.verify(&owner, &mut body, OperationKind::DeriveChild)?;

        let identity = owner.identity().derive_child(reason)?;
        environment
            .entry("parent.id".to_string())
            .or_insert_with(|| parent.to_string());
        environment
            .entry("creation.reason".to_string())
            .or_insert_with(|| reason.to_string());

        let child = Arc::new(Subject::new(
            identity,
            SubjectKind::Component,
            lifecycle::INITIAL_STATE,
            environment,
            self.config.memory_log_capacity,
        ));
        let id = child.id();
        {
            // Nobody can reach the child before it is indexed, so holding its
            // lock here keeps `Created` ahead of anything else it emits.
            let mut child_body = child.body.lock();
            child_body.remember(format!("Created with parent identity: {parent}"));
            self.index.insert(id, Arc::downgrade(&child));
            self.emit(
                id,
                EventPayload::Created {
                    subject_kind: SubjectKind::Component,
                    reason: reason.to_string(),
                    parent: Some(parent),
                },
            );
        }
        body.children.push(child);
        body.remember(format!("Derived child: {}", id.short()));
        info!(subject = %id, %parent, reason, "child component derived");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Move `id` to `target` if the transition table has that edge.
    ///
    /// On rejection the state is unchanged and a `ValidationRejected` event is
    /// queued.
    ///
    /// # Errors
    ///
    /// - [`S8rError::InvalidStateTransition`] – no such edge.
    /// - [`S8rError::TerminatedSubject`] – the subject is terminated.
    /// - [`S8rError::IllegalOperation`] – the subject is terminating.
    #[instrument(level = "debug", skip(self))]
    pub fn transition(&self, id: SubjectId, target: LifecycleState) -> Result<(), S8rError> {
        let subject = self.lookup(id)?;
        let mut body = subject.body.lock();
        self.verify(&subject, &mut body, OperationKind::Transition)?;

        let from = subject.state();
        if !lifecycle::is_legal(subject.kind(), from, target) {
            let err = S8rError::InvalidStateTransition {
                subject: id,
                from,
                to: target,
            };
            return Err(self.rejected(&subject, &mut body, OperationKind::Transition, err));
        }
        self.apply_transition(&subject, &mut body, target);
        Ok(())
    }

    /// Walk the shortest legal path from the current state to `target`,
    /// applying every step under a single acquisition of the write lock.
    /// Returns the states passed through, ending with `target`.
    ///
    /// Termination-phase targets other than `Deactivating` are refused; use
    /// [`Kernel::terminate`] to shut a subject down.
    pub fn advance_to(
        &self,
        id: SubjectId,
        target: LifecycleState,
    ) -> Result<Vec<LifecycleState>, S8rError> {
        let subject = self.lookup(id)?;
        let mut body = subject.body.lock();
        self.verify(&subject, &mut body, OperationKind::Transition)?;

        let from = subject.state();
        if target.phase() == Phase::Termination && target != LifecycleState::Deactivating {
            let err = S8rError::IllegalOperation {
                subject: id,
                operation: OperationKind::Transition,
                state: from,
            };
            return Err(self.rejected(&subject, &mut body, OperationKind::Transition, err));
        }
        let Some(path) = lifecycle::shortest_path(subject.kind(), from, target) else {
            let err = S8rError::InvalidStateTransition {
                subject: id,
                from,
                to: target,
            };
            return Err(self.rejected(&subject, &mut body, OperationKind::Transition, err));
        };
        for &step in &path {
            self.apply_transition(&subject, &mut body, step);
        }
        Ok(path)
    }

    /// Move a terminated subject to `Archived`.
    pub fn archive(&self, id: SubjectId) -> Result<(), S8rError> {
        let subject = self.lookup(id)?;
        let mut body = subject.body.lock();
        self.verify(&subject, &mut body, OperationKind::Archive)?;
        self.apply_transition(&subject, &mut body, LifecycleState::Archived);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Environment & version
    // -----------------------------------------------------------------------

    pub fn set_environment(
        &self,
        id: SubjectId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), S8rError> {
        let subject = self.lookup(id)?;
        let mut body = subject.body.lock();
        self.verify(&subject, &mut body, OperationKind::SetEnvironment)?;
        let (key, value) = (key.into(), value.into());
        body.remember(format!("Environment updated: {key}={value}"));
        body.environment.insert(key, value);
        Ok(())
    }

    /// Change a machine's semantic version.  Only allowed while the machine is
    /// in a modifiable state.
    pub fn set_version(&self, id: SubjectId, version: &str) -> Result<(), S8rError> {
        let subject = self.lookup(id)?;
        let mut body = subject.body.lock();
        self.verify(&subject, &mut body, OperationKind::SetVersion)?;
        if !is_semver(version) {
            return Err(S8rError::InvalidArgument(format!(
                "'{version}' is not a semantic version"
            )));
        }
        body.version = Some(version.to_string());
        body.remember(format!("Version updated to: {version}"));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Lock-free read of the current state.
    pub fn current_state(&self, id: SubjectId) -> Result<LifecycleState, S8rError> {
        Ok(self.lookup(id)?.state())
    }

    pub fn identity(&self, id: SubjectId) -> Result<Identity, S8rError> {
        Ok(self.lookup(id)?.identity().clone())
    }

    pub fn kind(&self, id: SubjectId) -> Result<SubjectKind, S8rError> {
        Ok(self.lookup(id)?.kind())
    }

    /// Ancestor ids of `id`, origin first.
    pub fn ancestor_chain(&self, id: SubjectId) -> Result<Vec<SubjectId>, S8rError> {
        Ok(self.lookup(id)?.identity().ancestor_chain().to_vec())
    }

    pub fn parent_of(&self, id: SubjectId) -> Result<Option<SubjectId>, S8rError> {
        Ok(self.lookup(id)?.identity().parent_id())
    }

    /// Owned children of `id`, in creation order.
    pub fn children(&self, id: SubjectId) -> Result<Vec<SubjectId>, S8rError> {
        let subject = self.lookup(id)?;
        let body = subject.body.lock();
        Ok(body.children.iter().map(|c| c.id()).collect())
    }

    pub fn environment(&self, id: SubjectId) -> Result<BTreeMap<String, String>, S8rError> {
        Ok(self.lookup(id)?.body.lock().environment.clone())
    }

    pub fn version(&self, id: SubjectId) -> Result<Option<String>, S8rError> {
        Ok(self.lookup(id)?.body.lock().version.clone())
    }

    pub fn memory_log(&self, id: SubjectId) -> Result<Vec<String>, S8rError> {
        Ok(self.lookup(id)?.body.lock().memory_log())
    }

    /// `true` when termination of `id` was forced past unfinished children.
    pub fn partial_failure(&self, id: SubjectId) -> Result<bool, S8rError> {
        Ok(self.lookup(id)?.body.lock().partial_failure)
    }

    pub fn valid_next_states(&self, id: SubjectId) -> Result<Vec<LifecycleState>, S8rError> {
        let subject = self.lookup(id)?;
        Ok(lifecycle::legal_targets(subject.kind(), subject.state()).to_vec())
    }

    pub fn contains(&self, id: SubjectId) -> bool {
        self.lookup(id).is_ok()
    }

    /// Ids of every subject in the arena, in no particular order.
    pub fn subject_ids(&self) -> Vec<SubjectId> {
        self.index.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of live subjects in the arena.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    // -----------------------------------------------------------------------
    // Snapshot / restore
    // -----------------------------------------------------------------------

    /// Capture `{identity, state, environment}` for a persistence backend.
    pub fn snapshot(&self, id: SubjectId) -> Result<SubjectSnapshot, S8rError> {
        let subject = self.lookup(id)?;
        let body = subject.body.lock();
        Ok(SubjectSnapshot {
            identity: subject.identity().to_record(),
            kind: subject.kind(),
            state: subject.state(),
            environment: body.environment.clone(),
            version: body.version.clone(),
        })
    }

    /// Rebuild a subject from a persisted snapshot.
    ///
    /// Malformed ancestor entries are dropped and reported as
    /// `LineageAnomaly` warning events rather than failing the restore.  When
    /// the restored identity's parent is a live, non-terminating component
    /// the subject is re-attached as that parent's child; otherwise it becomes
    /// an origin-owned subject of the kernel.
    ///
    /// # Errors
    ///
    /// [`S8rError::InvalidArgument`] when the snapshot's own id or reason is
    /// malformed, the id is already live, or the state is outside the kind's
    /// state subset.
    #[instrument(level = "debug", skip(self, snapshot), fields(subject = %snapshot.identity.id))]
    pub fn restore(&self, snapshot: &SubjectSnapshot) -> Result<SubjectId, S8rError> {
        let (identity, anomalies) = Identity::restore(&snapshot.identity)?;
        let id = identity.id();
        if self.contains(id) {
            return Err(S8rError::InvalidArgument(format!("{id} is already live")));
        }
        if !lifecycle::states(snapshot.kind).contains(&snapshot.state) {
            return Err(S8rError::InvalidArgument(format!(
                "a {} cannot be in state {}",
                snapshot.kind, snapshot.state
            )));
        }
        if let Some(version) = snapshot.version.as_deref()
            && !is_semver(version)
        {
            return Err(S8rError::InvalidArgument(format!(
                "'{version}' is not a semantic version"
            )));
        }

        let parent = identity.parent_id();
        let reason = identity.reason().to_string();
        let subject = Arc::new(Subject::new(
            identity,
            snapshot.kind,
            snapshot.state,
            snapshot.environment.clone(),
            self.config.memory_log_capacity,
        ));
        // Held until `Created` is out; the subject becomes reachable below.
        let mut restored = subject.body.lock();
        restored.version = snapshot.version.clone();
        restored.remember(format!("Restored in state {}", snapshot.state));

        let owner = parent
            .and_then(|p| self.lookup(p).ok())
            .filter(|p| p.kind() == SubjectKind::Component);
        let attached = match owner {
            Some(owner) => {
                let mut body = owner.body.lock();
                if owner.state().phase() == Phase::Termination {
                    false
                } else {
                    self.index.insert(id, Arc::downgrade(&subject));
                    body.children.push(Arc::clone(&subject));
                    body.remember(format!("Re-attached restored child: {}", id.short()));
                    true
                }
            }
            None => false,
        };
        if !attached {
            if parent.is_some() {
                debug!(subject = %id, "restored without a live owner; kept as origin-owned");
            }
            self.index.insert(id, Arc::downgrade(&subject));
            self.roots.insert(id, Arc::clone(&subject));
        }

        self.emit(
            id,
            EventPayload::Created {
                subject_kind: snapshot.kind,
                reason,
                parent,
            },
        );
        for anomaly in anomalies {
            warn!(
                subject = %id,
                position = anomaly.position,
                entry = %anomaly.entry,
                detail = %anomaly.detail,
                "dropped malformed ancestor while restoring lineage"
            );
            self.emit(id, EventPayload::LineageAnomaly(anomaly));
        }
        drop(restored);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Reclamation
    // -----------------------------------------------------------------------

    /// Drop a terminal origin subject and its terminal subtree from the arena.
    /// Returns the number of subjects released.
    ///
    /// Preserved knowledge stays retrievable after reclamation until it is
    /// taken with [`Kernel::take_preserved_knowledge`] or evicted by the
    /// archive's capacity bound.
    ///
    /// # Errors
    ///
    /// - [`S8rError::IllegalOperation`] – the subject, or one of its
    ///   descendants, is not terminal yet.
    /// - [`S8rError::InvalidArgument`] – `id` is owned by a parent; reclaim
    ///   the origin instead.
    pub fn reclaim(&self, id: SubjectId) -> Result<usize, S8rError> {
        let subject = self.lookup(id)?;
        {
            let mut body = subject.body.lock();
            self.verify(&subject, &mut body, OperationKind::Reclaim)?;
        }
        if !self.roots.contains_key(&id) {
            return Err(S8rError::InvalidArgument(format!(
                "{id} is owned by its parent; reclaim the origin subject instead"
            )));
        }

        let subtree = subject.subtree_post_order();
        if let Some(live) = subtree.iter().find(|s| !s.state().is_terminal()) {
            return Err(S8rError::IllegalOperation {
                subject: live.id(),
                operation: OperationKind::Reclaim,
                state: live.state(),
            });
        }
        for s in &subtree {
            self.detach_from_container(s);
        }
        for s in &subtree {
            self.index.remove(&s.id());
        }
        self.roots.remove(&id);
        info!(subject = %id, released = subtree.len(), "subtree reclaimed");
        Ok(subtree.len())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    pub(crate) fn lookup(&self, id: SubjectId) -> Result<Arc<Subject>, S8rError> {
        self.index
            .get(&id)
            .and_then(|weak| weak.upgrade())
            .ok_or(S8rError::NotFound(id))
    }

    pub(crate) fn emit(&self, subject: SubjectId, payload: EventPayload) {
        self.sink.publish(DomainEvent::new(subject, payload));
    }

    /// Run the validation chain for `operation` against `subject`'s current
    /// state, queueing a `ValidationRejected` event on failure.
    pub(crate) fn verify(
        &self,
        subject: &Subject,
        body: &mut SubjectBody,
        operation: OperationKind,
    ) -> Result<(), S8rError> {
        let op = OperationDescriptor {
            subject: subject.id(),
            kind: subject.kind(),
            operation,
            current_state: subject.state(),
        };
        self.chain
            .verify(&op)
            .map_err(|e| self.rejected(subject, body, operation, e))
    }

    /// Record and publish a rejection, handing the error back.
    pub(crate) fn rejected(
        &self,
        subject: &Subject,
        body: &mut SubjectBody,
        operation: OperationKind,
        err: S8rError,
    ) -> S8rError {
        body.remember(format!("Rejected {operation}: {err}"));
        self.emit(
            subject.id(),
            EventPayload::ValidationRejected {
                operation,
                state: subject.state(),
                reason: err.to_string(),
            },
        );
        err
    }

    /// Store `to` and publish `StateChanged`.  Legality is the caller's job.
    pub(crate) fn apply_transition(
        &self,
        subject: &Subject,
        body: &mut MutexGuard<'_, SubjectBody>,
        to: LifecycleState,
    ) {
        let from = subject.state();
        subject.store_state(body, to);
        body.remember(format!("State changed: {from} -> {to}"));
        self.emit(subject.id(), EventPayload::StateChanged { from, to });
        debug!(subject = %subject.id(), %from, %to, "state changed");
    }
}

/// `MAJOR.MINOR.PATCH` with optional `-pre` / `+build` suffix.
fn is_semver(version: &str) -> bool {
    let (core, suffix) = match version.find(|c| c == '-' || c == '+') {
        Some(i) => (&version[..i], Some(&version[i + 1..])),
        None => (version, None),
    };
    if suffix.is_some_and(str::is_empty) {
        return false;
    }
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.chars().all(|c| c.is_ascii_digit())
                && (p.len() == 1 || !p.starts_with('0'))
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use s8r_types::{CompositionError, EventKind, IdentityRecord};

    // ------------------------------------------------------------------ helpers

    #[derive(Default)]
    pub(crate) struct Recorder(Mutex<Vec<DomainEvent>>);

    impl EventSink for Recorder {
        fn publish(&self, event: DomainEvent) {
            self.0.lock().push(event);
        }
    }

    impl Recorder {
        pub(crate) fn events(&self) -> Vec<DomainEvent> {
            self.0.lock().clone()
        }

        pub(crate) fn kinds_for(&self, subject: SubjectId) -> Vec<EventKind> {
            self.0
                .lock()
                .iter()
                .filter(|e| e.subject_id == subject)
                .map(DomainEvent::kind)
                .collect()
        }
    }

    pub(crate) fn kernel() -> (Kernel, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let kernel = Kernel::new(KernelConfig::default(), recorder.clone());
        (kernel, recorder)
    }

    // ------------------------------------------------------------------ creation

    #[test]
    fn root_starts_in_conception() {
        let (k, rec) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();
        assert_eq!(k.current_state(id).unwrap(), LifecycleState::Conception);
        assert!(k.ancestor_chain(id).unwrap().is_empty());
        assert_eq!(rec.kinds_for(id), vec![EventKind::Created]);
    }

    #[test]
    fn empty_reason_is_invalid_argument() {
        let (k, _) = kernel();
        assert!(matches!(
            k.create_root(SubjectKind::Component, " "),
            Err(S8rError::InvalidArgument(_))
        ));
    }

    #[test]
    fn creation_seeds_environment() {
        let (k, _) = kernel();
        let root = k.create_root(SubjectKind::Component, "origin").unwrap();
        let child = k.derive_child(root, "worker").unwrap();

        let env = k.environment(child).unwrap();
        assert_eq!(env.get("parent.id"), Some(&root.to_string()));
        assert_eq!(env.get("creation.reason").map(String::as_str), Some("worker"));
        assert_eq!(
            k.environment(root).unwrap().get("component.origin").map(String::as_str),
            Some("primary")
        );
    }

    #[test]
    fn lineage_scenario_three_generations() {
        let (k, _) = kernel();
        let r = k.create_root(SubjectKind::Component, "R").unwrap();
        let c1 = k.derive_child(r, "C1").unwrap();
        let c2 = k.derive_child(c1, "C2").unwrap();

        assert_eq!(k.ancestor_chain(c2).unwrap(), vec![r, c1]);
        assert_eq!(k.parent_of(c2).unwrap(), Some(c1));
        assert_eq!(k.children(r).unwrap(), vec![c1]);
        for _ in 0..5 {
            assert_eq!(k.ancestor_chain(c1).unwrap().last(), Some(&r));
        }
    }

    #[test]
    fn composites_cannot_derive_children() {
        let (k, _) = kernel();
        let composite = k.create_root(SubjectKind::Composite, "group").unwrap();
        assert!(matches!(
            k.derive_child(composite, "nope"),
            Err(S8rError::IllegalOperation { .. })
        ));
    }

    #[test]
    fn unknown_subject_is_not_found() {
        let (k, _) = kernel();
        let ghost = SubjectId::new();
        assert_eq!(k.current_state(ghost), Err(S8rError::NotFound(ghost)));
    }

    // ------------------------------------------------------------------ transitions

    #[test]
    fn legal_transition_changes_state_and_emits_event() {
        let (k, rec) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();
        k.transition(id, LifecycleState::Initializing).unwrap();

        assert_eq!(k.current_state(id).unwrap(), LifecycleState::Initializing);
        assert_eq!(
            rec.kinds_for(id),
            vec![EventKind::Created, EventKind::StateChanged]
        );
    }

    #[test]
    fn skipping_creation_phases_is_rejected_by_the_table() {
        let (k, rec) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();

        let result = k.transition(id, LifecycleState::Active);
        assert!(matches!(
            result,
            Err(S8rError::InvalidStateTransition {
                from: LifecycleState::Conception,
                to: LifecycleState::Active,
                ..
            })
        ));
        assert_eq!(k.current_state(id).unwrap(), LifecycleState::Conception);
        assert_eq!(
            rec.kinds_for(id),
            vec![EventKind::Created, EventKind::ValidationRejected]
        );
    }

    #[test]
    fn advance_to_walks_every_creation_phase() {
        let (k, rec) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();
        let path = k.advance_to(id, LifecycleState::Active).unwrap();

        assert_eq!(path.first(), Some(&LifecycleState::Initializing));
        assert_eq!(path.last(), Some(&LifecycleState::Active));
        assert_eq!(
            rec.kinds_for(id)
                .iter()
                .filter(|k| **k == EventKind::StateChanged)
                .count(),
            path.len()
        );
    }

    #[test]
    fn advance_to_refuses_termination_targets() {
        let (k, _) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();
        assert!(matches!(
            k.advance_to(id, LifecycleState::Terminated),
            Err(S8rError::IllegalOperation { .. })
        ));
        assert_eq!(k.current_state(id).unwrap(), LifecycleState::Conception);
    }

    #[test]
    fn valid_next_states_reflect_the_table() {
        let (k, _) = kernel();
        let id = k.create_root(SubjectKind::Machine, "line").unwrap();
        assert_eq!(
            k.valid_next_states(id).unwrap(),
            vec![
                LifecycleState::Ready,
                LifecycleState::Error,
                LifecycleState::Terminating
            ]
        );
    }

    #[test]
    fn memory_log_records_state_changes() {
        let (k, _) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();
        k.transition(id, LifecycleState::Initializing).unwrap();
        let log = k.memory_log(id).unwrap();
        assert!(log.iter().any(|e| e.ends_with("State changed: conception -> initializing")));
    }

    // ------------------------------------------------------------------ environment & version

    #[test]
    fn machine_version_defaults_and_updates() {
        let (k, _) = kernel();
        let machine = k.create_root(SubjectKind::Machine, "line").unwrap();
        assert_eq!(k.version(machine).unwrap().as_deref(), Some("1.0.0"));

        k.set_version(machine, "2.1.0-rc.1").unwrap();
        assert_eq!(k.version(machine).unwrap().as_deref(), Some("2.1.0-rc.1"));

        assert!(matches!(
            k.set_version(machine, "two"),
            Err(S8rError::InvalidArgument(_))
        ));
    }

    #[test]
    fn version_is_frozen_while_running() {
        let (k, _) = kernel();
        let machine = k.create_root(SubjectKind::Machine, "line").unwrap();
        k.advance_to(machine, LifecycleState::Active).unwrap();
        assert!(matches!(
            k.set_version(machine, "1.1.0"),
            Err(S8rError::Composition(CompositionError::NotModifiable { .. }))
        ));
    }

    #[test]
    fn semver_parsing() {
        assert!(is_semver("0.1.0"));
        assert!(is_semver("10.20.30+build.5"));
        assert!(!is_semver("1.0"));
        assert!(!is_semver("01.0.0"));
        assert!(!is_semver("1.0.0-"));
    }

    #[test]
    fn set_environment_is_visible() {
        let (k, _) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();
        k.set_environment(id, "region", "eu").unwrap();
        assert_eq!(
            k.environment(id).unwrap().get("region").map(String::as_str),
            Some("eu")
        );
    }

    // ------------------------------------------------------------------ snapshot / restore

    #[test]
    fn snapshot_restores_into_a_fresh_kernel() {
        let (k, _) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();
        k.advance_to(id, LifecycleState::Ready).unwrap();
        k.set_environment(id, "zone", "a").unwrap();
        let snapshot = k.snapshot(id).unwrap();

        let (fresh, _) = kernel();
        let restored = fresh.restore(&snapshot).unwrap();
        assert_eq!(restored, id);
        assert_eq!(fresh.current_state(id).unwrap(), LifecycleState::Ready);
        assert_eq!(
            fresh.environment(id).unwrap().get("zone").map(String::as_str),
            Some("a")
        );
    }

    #[test]
    fn restore_reattaches_to_live_parent() {
        let (k, _) = kernel();
        let root = k.create_root(SubjectKind::Component, "origin").unwrap();
        let child = k.derive_child(root, "worker").unwrap();
        let snapshot = k.snapshot(child).unwrap();

        let (fresh, _) = kernel();
        fresh.restore(&k.snapshot(root).unwrap()).unwrap();
        fresh.restore(&snapshot).unwrap();
        assert_eq!(fresh.children(root).unwrap(), vec![child]);
    }

    #[test]
    fn restore_drops_malformed_ancestors_with_warning_event() {
        let (k, rec) = kernel();
        let root = Identity::root("origin").unwrap();
        let mut record: IdentityRecord = root.derive_child("worker").unwrap().to_record();
        record.lineage.push("###".to_string());
        let snapshot = SubjectSnapshot {
            identity: record,
            kind: SubjectKind::Component,
            state: LifecycleState::Ready,
            environment: BTreeMap::new(),
            version: None,
        };

        let id = k.restore(&snapshot).unwrap();
        assert_eq!(k.ancestor_chain(id).unwrap(), vec![root.id()]);
        assert_eq!(
            rec.kinds_for(id),
            vec![EventKind::Created, EventKind::LineageAnomaly]
        );
    }

    #[test]
    fn restore_rejects_live_duplicate() {
        let (k, _) = kernel();
        let id = k.create_root(SubjectKind::Component, "origin").unwrap();
        let snapshot = k.snapshot(id).unwrap();
        assert!(matches!(
            k.restore(&snapshot),
            Err(S8rError::InvalidArgument(_))
        ));
    }

    #[test]
    fn restore_rejects_state_outside_kind_subset() {
        let (k, _) = kernel();
        let snapshot = SubjectSnapshot {
            identity: Identity::root("line").unwrap().to_record(),
            kind: SubjectKind::Machine,
            state: LifecycleState::Specializing,
            environment: BTreeMap::new(),
            version: Some("1.0.0".into()),
        };
        assert!(matches!(
            k.restore(&snapshot),
            Err(S8rError::InvalidArgument(_))
        ));
    }

    #[test]
    fn restore_rejects_malformed_version() {
        let (k, _) = kernel();
        let snapshot = SubjectSnapshot {
            identity: Identity::root("line").unwrap().to_record(),
            kind: SubjectKind::Machine,
            state: LifecycleState::Ready,
            environment: BTreeMap::new(),
            version: Some("one.two".into()),
        };
        assert!(matches!(
            k.restore(&snapshot),
            Err(S8rError::InvalidArgument(_))
        ));
        assert!(k.is_empty());
    }

    // ------------------------------------------------------------------ event order

    #[test]
    fn created_is_the_first_event_of_every_derived_child() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (k, rec) = kernel();
        let root = k.create_root(SubjectKind::Component, "origin").unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    k.derive_child(root, &format!("child-{i}")).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    for id in k.subject_ids() {
                        let _ = k.transition(id, LifecycleState::Initializing);
                    }
                }
            });
        });

        for child in k.children(root).unwrap() {
            assert_eq!(rec.kinds_for(child).first(), Some(&EventKind::Created));
        }
    }
}
