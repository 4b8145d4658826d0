//! `s8r-types` – shared vocabulary of the lifecycle core.
//!
//! Everything other crates exchange lives here: subject identities and their
//! lineage, the single lifecycle state enumeration, the closed operation
//! enumeration, domain events, persisted snapshots, and the error taxonomy.

pub mod error;
pub mod event;
pub mod identity;
pub mod operation;
pub mod snapshot;
pub mod state;

pub use error::{CompositionError, S8rError};
pub use event::{DomainEvent, EventKind, EventPayload, EventPriority, EventSink};
pub use identity::{Identity, IdentityRecord, LineageAnomaly, SubjectId};
pub use operation::{OperationKind, SubjectKind};
pub use snapshot::SubjectSnapshot;
pub use state::{LifecycleState, Phase};
