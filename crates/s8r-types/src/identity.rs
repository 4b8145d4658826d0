//! [`Identity`] – immutable provenance for every subject.
//!
//! An identity is minted exactly once, when its subject is constructed, and
//! is never mutated afterwards.  The ancestry of a subject is recorded as an
//! ordered `lineage` of ancestor ids (root first).  The parent of a subject is
//! *computed* as `lineage.last()`; there is no separately stored parent field
//! that could drift away from the lineage.
//!
//! # Example
//!
//! ```
//! use s8r_types::Identity;
//!
//! let root = Identity::root("orchestrator").unwrap();
//! let child = root.derive_child("worker").unwrap();
//!
//! assert!(root.is_root());
//! assert_eq!(child.parent_id(), Some(root.id()));
//! assert_eq!(child.ancestor_chain(), &[root.id()]);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::S8rError;

/// Number of hex characters used for the display form of a [`SubjectId`].
const SHORT_ID_LEN: usize = 8;

// ────────────────────────────────────────────────────────────────────────────
// SubjectId
// ────────────────────────────────────────────────────────────────────────────

/// Opaque unique token identifying a component, composite, or machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(Uuid);

impl SubjectId {
    /// Mint a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Display form: the first eight hex characters of the id.
    pub fn short(&self) -> String {
        let mut simple = self.0.simple().to_string();
        simple.truncate(SHORT_ID_LEN);
        simple
    }
}

impl Default for SubjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Lineage anomalies
// ────────────────────────────────────────────────────────────────────────────

/// An ancestor entry that was dropped while reconstructing a lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageAnomaly {
    /// Position of the entry in the raw lineage that was supplied.
    pub position: usize,
    /// The raw entry as it was supplied.
    pub entry: String,
    /// Why the entry was dropped.
    pub detail: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Identity
// ────────────────────────────────────────────────────────────────────────────

/// Persisted form of an [`Identity`].  Ids are kept as raw strings because a
/// record may come back from a store that corrupted them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub lineage: Vec<String>,
}

/// Immutable identifier plus ancestry chain.
///
/// Only [`Serialize`] is derived: identities enter the system through
/// [`Identity::root`], [`Identity::derive_child`] or [`Identity::restore`],
/// never through an unchecked deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    id: SubjectId,
    reason: String,
    created_at: DateTime<Utc>,
    lineage: Vec<SubjectId>,
}

impl Identity {
    /// Create an origin identity with an empty lineage.
    ///
    /// # Errors
    ///
    /// [`S8rError::InvalidArgument`] when `reason` is empty or whitespace.
    pub fn root(reason: impl Into<String>) -> Result<Self, S8rError> {
        Ok(Self {
            id: SubjectId::new(),
            reason: validate_reason(reason.into())?,
            created_at: Utc::now(),
            lineage: Vec::new(),
        })
    }

    /// Derive a child identity whose lineage is `self.lineage + [self.id]`.
    ///
    /// # Errors
    ///
    /// [`S8rError::InvalidArgument`] when `reason` is empty or whitespace.
    pub fn derive_child(&self, reason: impl Into<String>) -> Result<Self, S8rError> {
        let mut lineage = Vec::with_capacity(self.lineage.len() + 1);
        lineage.extend_from_slice(&self.lineage);
        lineage.push(self.id);
        Ok(Self {
            id: SubjectId::new(),
            reason: validate_reason(reason.into())?,
            created_at: Utc::now(),
            lineage,
        })
    }

    /// Rebuild an identity from a persisted [`IdentityRecord`].
    ///
    /// Malformed ancestor entries (unparsable ids, self references, and
    /// repeated ancestors) are dropped and reported back as
    /// [`LineageAnomaly`] values; the identity is still constructed.
    ///
    /// # Errors
    ///
    /// [`S8rError::InvalidArgument`] when the record's own id cannot be
    /// parsed or its reason is empty.
    pub fn restore(record: &IdentityRecord) -> Result<(Self, Vec<LineageAnomaly>), S8rError> {
        let id = SubjectId::from_str(&record.id).map_err(|e| {
            S8rError::InvalidArgument(format!("malformed subject id '{}': {e}", record.id))
        })?;
        let reason = validate_reason(record.reason.clone())?;

        let mut seen = HashSet::new();
        let mut lineage = Vec::with_capacity(record.lineage.len());
        let mut anomalies = Vec::new();
        for (position, entry) in record.lineage.iter().enumerate() {
            let detail = match SubjectId::from_str(entry) {
                Err(e) => format!("not a subject id: {e}"),
                Ok(ancestor) if ancestor == id => "subject listed as its own ancestor".to_string(),
                Ok(ancestor) if !seen.insert(ancestor) => "ancestor appears twice".to_string(),
                Ok(ancestor) => {
                    lineage.push(ancestor);
                    continue;
                }
            };
            anomalies.push(LineageAnomaly {
                position,
                entry: entry.clone(),
                detail,
            });
        }

        Ok((
            Self {
                id,
                reason,
                created_at: record.created_at,
                lineage,
            },
            anomalies,
        ))
    }

    /// Persisted form of this identity.
    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            id: self.id.to_string(),
            reason: self.reason.clone(),
            created_at: self.created_at,
            lineage: self.lineage.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn id(&self) -> SubjectId {
        self.id
    }

    /// The reason supplied when this subject was created.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Ordered ancestor ids, root first.  Empty for an origin identity.
    pub fn ancestor_chain(&self) -> &[SubjectId] {
        &self.lineage
    }

    /// The owning parent, computed from the lineage.
    pub fn parent_id(&self) -> Option<SubjectId> {
        self.lineage.last().copied()
    }

    pub fn is_root(&self) -> bool {
        self.lineage.is_empty()
    }

    /// Number of ancestors above this subject.
    pub fn depth(&self) -> usize {
        self.lineage.len()
    }

    pub fn short_id(&self) -> String {
        self.id.short()
    }

    /// Dotted address from the origin down to this subject, e.g.
    /// `C<1a2b3c4d>.5e6f7a8b.9c0d1e2f`.
    pub fn hierarchical_address(&self) -> String {
        let mut chain = self.lineage.iter().chain(std::iter::once(&self.id));
        let mut address = match chain.next() {
            Some(origin) => format!("C<{}>", origin.short()),
            None => String::new(),
        };
        for id in chain {
            address.push('.');
            address.push_str(&id.short());
        }
        address
    }

    /// `true` when `ancestor` appears anywhere in this identity's lineage.
    pub fn is_descendant_of(&self, ancestor: &Identity) -> bool {
        self.lineage.contains(&ancestor.id)
    }

    pub fn is_ancestor_of(&self, descendant: &Identity) -> bool {
        descendant.is_descendant_of(self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hierarchical_address(), self.reason)
    }
}

fn validate_reason(reason: String) -> Result<String, S8rError> {
    if reason.trim().is_empty() {
        return Err(S8rError::InvalidArgument(
            "creation reason must not be empty".to_string(),
        ));
    }
    Ok(reason)
}
