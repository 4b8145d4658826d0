//! `s8r-kernel` – Lifecycle & Lineage Core
//!
//! Synchronous, in-memory authority over every subject's identity, state,
//! ownership and membership.  It never blocks on I/O: events leave through an
//! [`EventSink`][s8r_types::EventSink] and persistence happens outside.
//!
//! # Modules
//!
//! - [`lifecycle`] – per-kind transition tables, the operation-to-state table,
//!   and shortest-path search over them.
//! - [`validation`] – [`ValidationChain`]: ordered, fail-fast checks every
//!   mutating operation passes before it touches a subject.
//! - [`kernel`] – [`Kernel`]: the subject arena plus creation, transitions,
//!   queries, snapshot/restore and reclamation.
//! - [`composition`] – membership of components in composites and composites
//!   in machines, with duplicate and cycle rejection.
//! - [`termination`] – the deepest-first termination cascade, its hooks, and
//!   the knowledge archive.

pub mod composition;
pub mod kernel;
pub mod lifecycle;
mod subject;
pub mod termination;
pub mod validation;

pub use kernel::{DEFAULT_MACHINE_VERSION, Kernel, KernelConfig};
pub use termination::{
    KnowledgePreservationHook, KnowledgeSnapshot, ResourceReleaseHook, TerminationHooks,
    TerminationOutcome, TerminationReport,
};
pub use validation::{Check, OperationDescriptor, ValidationChain};
