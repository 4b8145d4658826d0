//! Cascading termination.
//!
//! [`Kernel::terminate`] drives a subject and its owned subtree to
//! `Terminated`, deepest descendants first.  Each subject goes through the
//! same steps:
//!
//! 1. **Claim** – under the subject's write lock: a terminal subject reports
//!    [`TerminationOutcome::AlreadyTerminated`], a subject another caller is
//!    already terminating reports [`TerminationOutcome::InProgress`], anything
//!    else is marked in-progress and moved to `Terminating`.
//! 2. **Children** – every owned child is terminated recursively, without the
//!    parent's lock held.  Children still in progress elsewhere are retried up
//!    to [`KernelConfig::termination_max_attempts`][crate::KernelConfig]
//!    times; after that the parent is forced to finish and flagged with
//!    `partial_failure`.
//! 3. **Membership** – a terminating container severs all its members.
//! 4. **Hooks** – resource release, then knowledge preservation.  Each hook
//!    runs on its own thread and is bounded by the configured timeout; a
//!    failure or timeout is logged and reported but never blocks the cascade.
//! 5. **Finalize** – under the lock again: `Terminated`, followed by the
//!    `StateChanged` and `Terminated` events.
//!
//! Termination never holds more than one subject's lock, except while
//! severing a member, when container and member are locked in id order.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use s8r_types::{
    EventPayload, Identity, LifecycleState, OperationKind, S8rError, SubjectId, SubjectKind,
};
use tracing::{debug, info, instrument, warn};

use crate::kernel::Kernel;
use crate::lifecycle;
use crate::subject::Subject;

// ────────────────────────────────────────────────────────────────────────────
// Knowledge
// ────────────────────────────────────────────────────────────────────────────

/// What a subject knew at the moment it was terminated.  Handed to the
/// termination hooks and kept in the kernel's knowledge archive.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeSnapshot {
    pub identity: Identity,
    pub kind: SubjectKind,
    pub reason: String,
    pub environment: BTreeMap<String, String>,
    pub memory_log: Vec<String>,
    pub captured_at: DateTime<Utc>,
}

/// Bounded store of [`KnowledgeSnapshot`]s keyed by subject.  Once full,
/// each new snapshot evicts the oldest one.
pub(crate) struct KnowledgeArchive {
    entries: DashMap<SubjectId, (u64, KnowledgeSnapshot)>,
    sequence: AtomicU64,
    capacity: usize,
}

impl KnowledgeArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            sequence: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn insert(&self, snapshot: KnowledgeSnapshot) {
        if self.capacity == 0 {
            return;
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(snapshot.identity.id(), (seq, snapshot));
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().0)
                .map(|entry| *entry.key());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                    debug!(subject = %id, "knowledge archive full; evicted oldest snapshot");
                }
                None => break,
            }
        }
    }

    pub fn get(&self, id: SubjectId) -> Option<KnowledgeSnapshot> {
        self.entries.get(&id).map(|entry| entry.value().1.clone())
    }

    pub fn take(&self, id: SubjectId) -> Option<KnowledgeSnapshot> {
        self.entries.remove(&id).map(|(_, (_, snapshot))| snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Hooks
// ────────────────────────────────────────────────────────────────────────────

/// Releases whatever external resources a subject holds.
///
/// Any `Fn(&KnowledgeSnapshot) -> Result<(), String>` closure implements this
/// trait.
pub trait ResourceReleaseHook: Send + Sync {
    fn name(&self) -> &str {
        "resource_release"
    }

    fn release(&self, subject: &KnowledgeSnapshot) -> Result<(), String>;
}

impl<F> ResourceReleaseHook for F
where
    F: Fn(&KnowledgeSnapshot) -> Result<(), String> + Send + Sync,
{
    fn release(&self, subject: &KnowledgeSnapshot) -> Result<(), String> {
        self(subject)
    }
}

/// Persists a terminating subject's knowledge somewhere durable.
pub trait KnowledgePreservationHook: Send + Sync {
    fn name(&self) -> &str {
        "knowledge_preservation"
    }

    fn preserve(&self, knowledge: &KnowledgeSnapshot) -> Result<(), String>;
}

impl<F> KnowledgePreservationHook for F
where
    F: Fn(&KnowledgeSnapshot) -> Result<(), String> + Send + Sync,
{
    fn preserve(&self, knowledge: &KnowledgeSnapshot) -> Result<(), String> {
        self(knowledge)
    }
}

/// The pair of hooks invoked for every subject that terminates.
#[derive(Clone, Default)]
pub struct TerminationHooks {
    pub release: Option<Arc<dyn ResourceReleaseHook>>,
    pub preserve: Option<Arc<dyn KnowledgePreservationHook>>,
}

impl TerminationHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_release(mut self, hook: impl ResourceReleaseHook + 'static) -> Self {
        self.release = Some(Arc::new(hook));
        self
    }

    pub fn on_preserve(mut self, hook: impl KnowledgePreservationHook + 'static) -> Self {
        self.preserve = Some(Arc::new(hook));
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Report
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The subject and its whole subtree reached `Terminated`.
    Completed,
    /// The subject reached `Terminated`, but some descendants had not
    /// finished after the configured number of attempts.
    Forced,
    /// Nothing to do; the subject was already terminal.
    AlreadyTerminated,
    /// Another caller is terminating this subject right now.
    InProgress,
}

/// Result of a [`Kernel::terminate`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationReport {
    pub subject: SubjectId,
    pub outcome: TerminationOutcome,
    /// Subjects this call moved to `Terminated`, in the order they got there.
    pub terminated: Vec<SubjectId>,
    /// Hook failures and timeouts, which never abort termination.
    pub hook_failures: Vec<S8rError>,
}

impl TerminationReport {
    fn new(subject: SubjectId) -> Self {
        Self {
            subject,
            outcome: TerminationOutcome::Completed,
            terminated: Vec::new(),
            hook_failures: Vec::new(),
        }
    }

    pub fn partial_failure(&self) -> bool {
        self.outcome == TerminationOutcome::Forced
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Kernel operations
// ────────────────────────────────────────────────────────────────────────────

impl Kernel {
    /// Terminate `id` and everything it owns, using the kernel's hooks.
    ///
    /// Idempotent: terminating a terminal subject succeeds with
    /// [`TerminationOutcome::AlreadyTerminated`] and emits nothing.
    ///
    /// # Errors
    ///
    /// - [`S8rError::InvalidArgument`] – `reason` is empty.
    /// - [`S8rError::NotFound`] – `id` is unknown.
    pub fn terminate(&self, id: SubjectId, reason: &str) -> Result<TerminationReport, S8rError> {
        let hooks = self.hooks.clone();
        self.terminate_with_hooks(id, reason, &hooks)
    }

    /// [`Kernel::terminate`] with a one-off set of hooks.
    #[instrument(level = "debug", skip(self, hooks))]
    pub fn terminate_with_hooks(
        &self,
        id: SubjectId,
        reason: &str,
        hooks: &TerminationHooks,
    ) -> Result<TerminationReport, S8rError> {
        if reason.trim().is_empty() {
            return Err(S8rError::InvalidArgument(
                "termination reason must not be empty".into(),
            ));
        }
        let subject = self.lookup(id)?;
        let mut report = TerminationReport::new(id);
        report.outcome = self.terminate_subject(&subject, reason, hooks, &mut report)?;
        Ok(report)
    }

    /// Knowledge captured when `id` terminated.  Survives reclamation, but
    /// the archive only keeps the most recent
    /// [`KernelConfig::knowledge_capacity`][crate::KernelConfig] snapshots.
    pub fn preserved_knowledge(&self, id: SubjectId) -> Option<KnowledgeSnapshot> {
        self.knowledge.get(id)
    }

    /// Remove and return the knowledge archived for `id`.
    pub fn take_preserved_knowledge(&self, id: SubjectId) -> Option<KnowledgeSnapshot> {
        self.knowledge.take(id)
    }

    /// Number of snapshots currently archived.
    pub fn preserved_knowledge_count(&self) -> usize {
        self.knowledge.len()
    }

    fn terminate_subject(
        &self,
        subject: &Arc<Subject>,
        reason: &str,
        hooks: &TerminationHooks,
        report: &mut TerminationReport,
    ) -> Result<TerminationOutcome, S8rError> {
        let id = subject.id();

        // 1. claim
        let children = {
            let mut body = subject.body.lock();
            let state = subject.state();
            if state.is_terminal() {
                return Ok(TerminationOutcome::AlreadyTerminated);
            }
            if body.termination_in_progress {
                return Ok(TerminationOutcome::InProgress);
            }
            self.verify(subject, &mut body, OperationKind::Terminate)?;
            if state != LifecycleState::Terminating {
                if !lifecycle::is_legal(subject.kind(), state, LifecycleState::Terminating) {
                    let err = S8rError::InvalidStateTransition {
                        subject: id,
                        from: state,
                        to: LifecycleState::Terminating,
                    };
                    return Err(self.rejected(subject, &mut body, OperationKind::Terminate, err));
                }
                self.apply_transition(subject, &mut body, LifecycleState::Terminating);
            }
            body.termination_in_progress = true;
            body.remember(format!("Termination initiated: {reason}"));
            body.children.clone()
        };
        info!(subject = %id, reason, children = children.len(), "termination initiated");

        // 2. children, deepest first
        let partial_failure = self.terminate_children(id, &children, reason, hooks, report);

        // 3. membership
        if subject.kind().is_container() {
            self.sever_members(subject);
        }

        // 4. hooks
        let knowledge = {
            let body = subject.body.lock();
            Arc::new(KnowledgeSnapshot {
                identity: subject.identity().clone(),
                kind: subject.kind(),
                reason: reason.to_string(),
                environment: body.environment.clone(),
                memory_log: body.memory_log(),
                captured_at: Utc::now(),
            })
        };
        let timeout = self.config.hook_timeout;
        if let Some(hook) = &hooks.release {
            let hook = Arc::clone(hook);
            let name = hook.name().to_string();
            let k = Arc::clone(&knowledge);
            if let Err(e) = run_hook(&name, timeout, move || hook.release(&k)) {
                warn!(subject = %id, error = %e, "resource release hook did not complete");
                report.hook_failures.push(e);
            }
        }
        if let Some(hook) = &hooks.preserve {
            let hook = Arc::clone(hook);
            let name = hook.name().to_string();
            let k = Arc::clone(&knowledge);
            if let Err(e) = run_hook(&name, timeout, move || hook.preserve(&k)) {
                warn!(subject = %id, error = %e, "knowledge preservation hook did not complete");
                report.hook_failures.push(e);
            }
        }
        self.knowledge.insert((*knowledge).clone());

        // 5. finalize
        {
            let mut body = subject.body.lock();
            self.apply_transition(subject, &mut body, LifecycleState::Terminated);
            body.termination_in_progress = false;
            body.partial_failure = partial_failure;
            body.remember(format!("Terminated: {reason}"));
            self.emit(
                id,
                EventPayload::Terminated {
                    reason: reason.to_string(),
                    partial_failure,
                },
            );
        }
        report.terminated.push(id);
        info!(subject = %id, partial_failure, "subject terminated");

        Ok(if partial_failure {
            TerminationOutcome::Forced
        } else {
            TerminationOutcome::Completed
        })
    }

    /// Terminate `children`, retrying ones another caller is still working
    /// on.  Returns `true` when some child had not finished after the last
    /// attempt.
    fn terminate_children(
        &self,
        parent: SubjectId,
        children: &[Arc<Subject>],
        reason: &str,
        hooks: &TerminationHooks,
        report: &mut TerminationReport,
    ) -> bool {
        if children.is_empty() {
            return false;
        }
        let max_attempts = self.config.termination_max_attempts.max(1);
        let mut pending: Vec<&Arc<Subject>> = children.iter().collect();
        for attempt in 1..=max_attempts {
            pending.retain(|child| {
                match self.terminate_subject(child, reason, hooks, report) {
                    Ok(TerminationOutcome::InProgress) => true,
                    Ok(_) => false,
                    Err(e) => {
                        warn!(%parent, child = %child.id(), error = %e, "child termination failed");
                        true
                    }
                }
            });
            if pending.is_empty() {
                return false;
            }
            debug!(%parent, attempt, pending = pending.len(), "children still terminating");
            if attempt < max_attempts {
                thread::sleep(self.config.termination_retry_backoff);
            }
        }
        warn!(
            %parent,
            pending = pending.len(),
            attempts = max_attempts,
            "forcing termination past unfinished children"
        );
        true
    }
}

/// Run `hook` on its own thread, waiting at most `timeout` for it to finish.
///
/// A hook that overruns keeps running detached; its result is discarded.
fn run_hook<F>(name: &str, timeout: Duration, hook: F) -> Result<(), S8rError>
where
    F: FnOnce() -> Result<(), String> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("s8r-hook-{name}"))
        .spawn(move || {
            let _ = tx.send(hook());
        })
        .map_err(|e| S8rError::HookFailed {
            hook: name.to_string(),
            details: format!("could not spawn hook thread: {e}"),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(details)) => Err(S8rError::HookFailed {
            hook: name.to_string(),
            details,
        }),
        Err(RecvTimeoutError::Timeout) => Err(S8rError::HookTimeout {
            hook: name.to_string(),
            timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(S8rError::HookFailed {
            hook: name.to_string(),
            details: "hook panicked".into(),
        }),
    }
}
