use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::period::Period;
use crate::schedule::DispositionActionName;
use crate::{rfc3339_label, NodeId, ScheduleId, StepDefinitionId};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventCompletion {
    pub event_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub completed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CompletedStep {
    pub name: DispositionActionName,
    pub schedule_id: ScheduleId,
    pub definition_id: StepDefinitionId,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub as_of: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub completed_by: String,
    #[serde(default)]
    pub events: Vec<EventCompletion>,
    /// The cutoff closed the folder it ran on.
    #[serde(default)]
    pub closed_folder: bool,
}

/// Disposition progress of one folder or record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DispositionLifecycle {
    pub item_id: NodeId,
    #[serde(with = "time::serde::rfc3339")]
    pub initialised_at: OffsetDateTime,
    #[serde(default)]
    pub history: Vec<CompletedStep>,
    #[serde(default)]
    pub pending_events: BTreeMap<String, EventCompletion>,
    #[serde(default)]
    pub next_action: Option<NextDispositionAction>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DispositionLifecycle {
    #[must_use]
    pub fn new(item_id: NodeId, initialised_at: OffsetDateTime) -> Self {
        Self {
            item_id,
            initialised_at,
            history: Vec::new(),
            pending_events: BTreeMap::new(),
            next_action: None,
            updated_at: initialised_at,
        }
    }

    #[must_use]
    pub fn completed_names(&self) -> BTreeSet<DispositionActionName> {
        self.history.iter().map(|step| step.name).collect()
    }

    #[must_use]
    pub fn last_completed(&self) -> Option<&CompletedStep> {
        self.history.last()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AsOfState {
    /// The step has a concrete as-of date.
    Scheduled,
    /// At least one contributing anchor is not known yet.
    AwaitingAnchor,
    /// No contributing step has a time component.
    Unscheduled,
}

impl AsOfState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::AwaitingAnchor => "awaiting_anchor",
            Self::Unscheduled => "unscheduled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRequirement {
    pub event_name: String,
    pub required_by: Vec<ScheduleId>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub completed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CandidateWhy {
    pub included: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScheduleCandidate {
    pub rank: usize,
    pub schedule_id: ScheduleId,
    pub container_id: NodeId,
    pub primary: bool,
    pub definition_id: Option<StepDefinitionId>,
    pub step_name: Option<DispositionActionName>,
    pub position: Option<usize>,
    pub period: Option<Period>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub as_of: Option<OffsetDateTime>,
    pub as_of_state: Option<AsOfState>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub eligible_on_first_complete_event: bool,
    pub why: CandidateWhy,
}

impl ScheduleCandidate {
    fn events_satisfied(&self, completed: &BTreeSet<&str>) -> bool {
        if self.events.is_empty() {
            return true;
        }
        if self.eligible_on_first_complete_event {
            self.events.iter().any(|event| completed.contains(event.as_str()))
        } else {
            self.events.iter().all(|event| completed.contains(event.as_str()))
        }
    }

    fn has_trigger(&self) -> bool {
        !self.events.is_empty() || self.period.is_some_and(Period::has_time_component)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DeterminismMetadata {
    pub ruleset_version: String,
    pub tie_breakers: Vec<String>,
}

/// The step an item is waiting on and when it becomes eligible.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NextDispositionAction {
    pub item_id: NodeId,
    pub step_name: DispositionActionName,
    pub position: usize,
    pub governing_schedule_id: ScheduleId,
    pub governing_definition_id: StepDefinitionId,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub as_of: Option<OffsetDateTime>,
    pub as_of_state: AsOfState,
    #[serde(default)]
    pub events: Vec<EventRequirement>,
    pub candidates: Vec<ScheduleCandidate>,
    pub determinism: DeterminismMetadata,
    pub ordering_trace: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Eligibility {
    pub eligible: bool,
    pub reasons: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
}

impl NextDispositionAction {
    pub fn contributors(&self) -> impl Iterator<Item = &ScheduleCandidate> {
        self.candidates.iter().filter(|candidate| candidate.why.included)
    }

    #[must_use]
    pub fn requires_event(&self, event_name: &str) -> bool {
        self.events.iter().any(|event| event.event_name == event_name)
    }

    /// Evaluate time and event conditions at `now`.
    ///
    /// Every contributing schedule's event condition must hold, and the time
    /// condition follows [`AsOfState`]. A step without period or events on any
    /// contributor only runs when eligibility is not enforced.
    #[must_use]
    pub fn eligibility(&self, now: OffsetDateTime) -> Eligibility {
        let mut reasons = Vec::new();

        let time_ok = match self.as_of_state {
            AsOfState::Scheduled => match self.as_of {
                Some(as_of) if as_of <= now => true,
                Some(as_of) => {
                    reasons.push(format!("as_of {} is after {}", rfc3339_label(as_of), rfc3339_label(now)));
                    false
                }
                None => {
                    reasons.push("scheduled step is missing its as_of date".to_string());
                    false
                }
            },
            AsOfState::Unscheduled => true,
            AsOfState::AwaitingAnchor => {
                reasons.push("as_of is awaiting an anchor date".to_string());
                false
            }
        };

        let completed: BTreeSet<&str> = self
            .events
            .iter()
            .filter(|event| event.completed_at.is_some())
            .map(|event| event.event_name.as_str())
            .collect();

        let mut events_ok = true;
        for candidate in self.contributors() {
            if !candidate.events_satisfied(&completed) {
                events_ok = false;
                let mode = if candidate.eligible_on_first_complete_event { "any" } else { "all" };
                reasons.push(format!(
                    "schedule {} requires {mode} of events [{}]",
                    candidate.schedule_id,
                    candidate.events.join(", ")
                ));
            }
        }

        let triggered = self.contributors().any(ScheduleCandidate::has_trigger);
        if !triggered {
            reasons.push(format!("step {} has no period or events and runs manually", self.step_name));
        }

        Eligibility {
            eligible: time_ok && events_ok && triggered,
            reasons,
            evaluated_at: now,
        }
    }
}
