use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::period::Period;
use crate::{KernelError, NodeId, ScheduleId, StepDefinitionId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DispositionActionName {
    Cutoff,
    Retain,
    Transfer,
    Accession,
    Destroy,
}

impl DispositionActionName {
    /// Ordering used when linked schedules propose different next steps:
    /// non-destructive steps always run before destructive ones.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Cutoff => 0,
            Self::Retain => 1,
            Self::Transfer => 2,
            Self::Accession => 3,
            Self::Destroy => 4,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cutoff => "cutoff",
            Self::Retain => "retain",
            Self::Transfer => "transfer",
            Self::Accession => "accession",
            Self::Destroy => "destroy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cutoff" => Some(Self::Cutoff),
            "retain" => Some(Self::Retain),
            "transfer" => Some(Self::Transfer),
            "accession" => Some(Self::Accession),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }
}

impl Display for DispositionActionName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The date a step's period is measured from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(try_from = "String", into = "String")]
pub enum PeriodAnchor {
    Created,
    Declared,
    Closed,
    CutOff,
    #[default]
    PreviousStep,
    EventsCompleted,
    Property(String),
}

impl Display for PeriodAnchor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Declared => f.write_str("declared"),
            Self::Closed => f.write_str("closed"),
            Self::CutOff => f.write_str("cut_off"),
            Self::PreviousStep => f.write_str("previous_step"),
            Self::EventsCompleted => f.write_str("events_completed"),
            Self::Property(name) => write!(f, "property:{name}"),
        }
    }
}

impl FromStr for PeriodAnchor {
    type Err = KernelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "created" => Ok(Self::Created),
            "declared" => Ok(Self::Declared),
            "closed" => Ok(Self::Closed),
            "cut_off" => Ok(Self::CutOff),
            "previous_step" => Ok(Self::PreviousStep),
            "events_completed" => Ok(Self::EventsCompleted),
            other => match other.strip_prefix("property:") {
                Some(name) if valid_property_name(name) => Ok(Self::Property(name.to_string())),
                Some(_) => Err(KernelError::Validation(format!(
                    "anchor property name MUST be non-empty without whitespace: {raw}"
                ))),
                None => Err(KernelError::Validation(format!("unsupported period anchor: {raw}"))),
            },
        }
    }
}

impl TryFrom<String> for PeriodAnchor {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodAnchor> for String {
    fn from(value: PeriodAnchor) -> Self {
        value.to_string()
    }
}

pub(crate) fn valid_property_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DispositionActionDefinition {
    pub definition_id: StepDefinitionId,
    pub name: DispositionActionName,
    #[serde(default)]
    pub description: String,
    pub period: Period,
    #[serde(default)]
    pub anchor: PeriodAnchor,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub eligible_on_first_complete_event: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub ghost_on_destroy: bool,
}

impl DispositionActionDefinition {
    #[must_use]
    pub fn new(name: DispositionActionName, period: Period) -> Self {
        Self {
            definition_id: StepDefinitionId::new(),
            name,
            description: String::new(),
            period,
            anchor: PeriodAnchor::default(),
            events: Vec::new(),
            eligible_on_first_complete_event: false,
            location: None,
            ghost_on_destroy: false,
        }
    }

    #[must_use]
    pub fn with_anchor(mut self, anchor: PeriodAnchor) -> Self {
        self.anchor = anchor;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: &[&str]) -> Self {
        self.events = events.iter().map(|event| (*event).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    /// Validate one step definition in isolation.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for a period that cannot produce a date,
    /// blank or duplicate events, a transfer without a location, or an event anchor
    /// on a step without events.
    pub fn validate(&self) -> Result<(), KernelError> {
        // Periods must resolve from the epoch; anything longer overflows for every item.
        self.period.next_date(OffsetDateTime::UNIX_EPOCH).map_err(|err| {
            KernelError::Validation(format!(
                "period {} on step {} MUST stay within representable dates: {err}",
                self.period, self.name
            ))
        })?;

        let mut seen = BTreeSet::new();
        for event in &self.events {
            if event.trim().is_empty() {
                return Err(KernelError::Validation(format!(
                    "event names MUST be non-empty on step {}",
                    self.name
                )));
            }
            if !seen.insert(event.as_str()) {
                return Err(KernelError::Validation(format!(
                    "event {event} MUST NOT repeat on step {}",
                    self.name
                )));
            }
        }

        if self.eligible_on_first_complete_event && self.events.is_empty() {
            return Err(KernelError::Validation(format!(
                "eligible_on_first_complete_event MUST only be set when step {} has events",
                self.name
            )));
        }

        if self.anchor == PeriodAnchor::EventsCompleted && self.events.is_empty() {
            return Err(KernelError::Validation(format!(
                "events_completed anchor MUST be paired with at least one event on step {}",
                self.name
            )));
        }

        if self.name == DispositionActionName::Transfer
            && self.location.as_deref().map_or(true, |location| location.trim().is_empty())
        {
            return Err(KernelError::Validation(
                "transfer steps MUST name a location".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply a partial edit and report which fields actually changed.
    pub fn apply_patch(&mut self, patch: &StepDefinitionPatch) -> Vec<String> {
        let mut changed = Vec::new();

        if let Some(description) = &patch.description {
            if *description != self.description {
                self.description.clone_from(description);
                changed.push("description".to_string());
            }
        }
        if let Some(period) = patch.period {
            if period != self.period {
                self.period = period;
                changed.push("period".to_string());
            }
        }
        if let Some(anchor) = &patch.anchor {
            if *anchor != self.anchor {
                self.anchor = anchor.clone();
                changed.push("anchor".to_string());
            }
        }
        if let Some(events) = &patch.events {
            if *events != self.events {
                self.events.clone_from(events);
                changed.push("events".to_string());
            }
        }
        if let Some(first_event) = patch.eligible_on_first_complete_event {
            if first_event != self.eligible_on_first_complete_event {
                self.eligible_on_first_complete_event = first_event;
                changed.push("eligible_on_first_complete_event".to_string());
            }
        }
        if let Some(location) = &patch.location {
            if self.location.as_ref() != Some(location) {
                self.location = Some(location.clone());
                changed.push("location".to_string());
            }
        }
        if let Some(ghost) = patch.ghost_on_destroy {
            if ghost != self.ghost_on_destroy {
                self.ghost_on_destroy = ghost;
                changed.push("ghost_on_destroy".to_string());
            }
        }

        changed
    }
}

/// Partial edit of a step definition. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StepDefinitionPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub period: Option<Period>,
    #[serde(default)]
    pub anchor: Option<PeriodAnchor>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub eligible_on_first_complete_event: Option<bool>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub ghost_on_destroy: Option<bool>,
}

impl StepDefinitionPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DispositionSchedule {
    pub schedule_id: ScheduleId,
    pub container_id: NodeId,
    pub authority: String,
    pub instructions: String,
    pub record_level: bool,
    #[serde(default)]
    pub steps: Vec<DispositionActionDefinition>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl DispositionSchedule {
    /// Validate schedule-wide ordering rules and every step definition.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when authority or instructions are blank,
    /// step names repeat, cutoff is not first, a step follows destroy, or any
    /// individual step is invalid.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.authority.trim().is_empty() {
            return Err(KernelError::Validation(
                "schedule authority MUST be provided".to_string(),
            ));
        }
        if self.instructions.trim().is_empty() {
            return Err(KernelError::Validation(
                "schedule instructions MUST be provided".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        let mut definition_ids = BTreeSet::new();
        for (position, step) in self.steps.iter().enumerate() {
            step.validate()?;

            if !names.insert(step.name) {
                return Err(KernelError::Validation(format!(
                    "step {} MUST appear at most once per schedule",
                    step.name
                )));
            }
            if !definition_ids.insert(step.definition_id) {
                return Err(KernelError::Validation(format!(
                    "definition_id {} MUST be unique within a schedule",
                    step.definition_id
                )));
            }
            if step.name == DispositionActionName::Cutoff && position != 0 {
                return Err(KernelError::Validation(
                    "cutoff MUST be the first step of a schedule".to_string(),
                ));
            }
            if step.name == DispositionActionName::Destroy && position + 1 != self.steps.len() {
                return Err(KernelError::Validation(
                    "destroy MUST be the last step of a schedule".to_string(),
                ));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn step(&self, definition_id: StepDefinitionId) -> Option<(usize, &DispositionActionDefinition)> {
        self.steps.iter().enumerate().find(|(_, step)| step.definition_id == definition_id)
    }

    pub fn step_mut(
        &mut self,
        definition_id: StepDefinitionId,
    ) -> Option<&mut DispositionActionDefinition> {
        self.steps.iter_mut().find(|step| step.definition_id == definition_id)
    }

    /// First step whose name has not completed yet, with its position.
    #[must_use]
    pub fn first_pending(
        &self,
        completed: &BTreeSet<DispositionActionName>,
    ) -> Option<(usize, &DispositionActionDefinition)> {
        self.steps.iter().enumerate().find(|(_, step)| !completed.contains(&step.name))
    }
}
