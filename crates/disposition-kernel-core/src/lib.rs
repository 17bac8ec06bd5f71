use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod engine;
mod file_plan;
mod lifecycle;
mod period;
mod publish;
mod schedule;

pub use engine::{
    complete_event, default_tie_breakers, execute_step, refresh_lifecycle, resolve_next_action,
    undo_cut_off, undo_event, ExecuteStepRequest, StepOutcome,
};
pub use file_plan::{DispositionState, FilePlan, FilePlanNode, NodeKind, RecordLink, ScheduleSource};
pub use lifecycle::{
    AsOfState, CandidateWhy, CompletedStep, DeterminismMetadata, DispositionLifecycle,
    Eligibility, EventCompletion, EventRequirement, NextDispositionAction, ScheduleCandidate,
};
pub use period::Period;
pub use publish::{queue_publish, recompute_for_publish, PublishJob, PublishJobStatus};
pub use schedule::{
    DispositionActionDefinition, DispositionActionName, DispositionSchedule, PeriodAnchor,
    StepDefinitionPatch,
};

pub const RULESET_VERSION: &str = "disposition.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("disposition guard failed: {0}")]
    Guard(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(raw.trim())
                    .map(Self)
                    .map_err(|err| KernelError::Validation(format!("invalid ULID {raw}: {err}")))
            }
        }
    };
}

ulid_id!(NodeId);
ulid_id!(ScheduleId);
ulid_id!(StepDefinitionId);
ulid_id!(PublishJobId);

/// One accountable write against the file plan or its schedules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub node_id: Option<NodeId>,
    pub operation: String,
    pub actor: String,
    pub detail: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl AuditEvent {
    /// Build an audit entry for a write performed by `actor`.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the actor or operation is blank.
    pub fn new(
        operation: &str,
        actor: &str,
        node_id: Option<NodeId>,
        detail: serde_json::Value,
        recorded_at: OffsetDateTime,
    ) -> Result<Self, KernelError> {
        if actor.trim().is_empty() {
            return Err(KernelError::Validation(
                "actor MUST be provided for every write".to_string(),
            ));
        }
        if operation.trim().is_empty() {
            return Err(KernelError::Validation("operation MUST be provided".to_string()));
        }

        Ok(Self {
            node_id,
            operation: operation.to_string(),
            actor: actor.to_string(),
            detail,
            recorded_at,
        })
    }
}

pub(crate) fn rfc3339_label(value: OffsetDateTime) -> String {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

/// Serde adapter for `BTreeMap<String, OffsetDateTime>` properties stored as RFC3339 text.
pub mod rfc3339_map {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    /// # Errors
    /// Returns a serializer error when a timestamp cannot be formatted.
    pub fn serialize<S>(
        value: &BTreeMap<String, OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut formatted = BTreeMap::new();
        for (name, at) in value {
            formatted.insert(name.as_str(), at.format(&Rfc3339).map_err(S::Error::custom)?);
        }
        formatted.serialize(serializer)
    }

    /// # Errors
    /// Returns a deserializer error when a value is not RFC3339 text.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, OffsetDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        let mut parsed = BTreeMap::new();
        for (name, text) in raw {
            let at = OffsetDateTime::parse(&text, &Rfc3339).map_err(D::Error::custom)?;
            parsed.insert(name, at);
        }
        Ok(parsed)
    }
}
