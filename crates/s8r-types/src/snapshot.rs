use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::IdentityRecord;
use crate::operation::SubjectKind;
use crate::state::LifecycleState;

/// What a persistence backend stores for one subject:
/// `{identity, state, environmentSnapshot}` plus the subject kind and, for
/// machines, the version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub identity: IdentityRecord,
    pub kind: SubjectKind,
    pub state: LifecycleState,
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}
