//! Publish jobs propagate edited step definitions to items that are already
//! scheduled. Edits queue a job and leave stored next actions alone until the
//! job runs.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::engine::refresh_lifecycle;
use crate::file_plan::FilePlan;
use crate::lifecycle::DispositionLifecycle;
use crate::{KernelError, NodeId, PublishJobId, ScheduleId, StepDefinitionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishJobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl Display for PublishJobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for PublishJobStatus {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(KernelError::Validation(format!("unknown publish job status: {other}"))),
        }
    }
}

impl PublishJobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishJob {
    pub job_id: PublishJobId,
    pub schedule_id: ScheduleId,
    pub definition_id: StepDefinitionId,
    pub updated_fields: Vec<String>,
    pub status: PublishJobStatus,
    pub requested_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub processed_items: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl PublishJob {
    #[must_use]
    pub fn queued(
        schedule_id: ScheduleId,
        definition_id: StepDefinitionId,
        updated_fields: Vec<String>,
        requested_by: &str,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            job_id: PublishJobId::new(),
            schedule_id,
            definition_id,
            updated_fields,
            status: PublishJobStatus::Queued,
            requested_by: requested_by.to_string(),
            created_at,
            started_at: None,
            completed_at: None,
            processed_items: 0,
            error: None,
        }
    }

    fn merge_fields(&mut self, fields: &[String]) {
        for field in fields {
            if !self.updated_fields.contains(field) {
                self.updated_fields.push(field.clone());
            }
        }
    }

    fn transition(
        &mut self,
        from: PublishJobStatus,
        to: PublishJobStatus,
    ) -> Result<(), KernelError> {
        if self.status != from {
            return Err(KernelError::Validation(format!(
                "publish job {} MUST be {from} to become {to}, found {}",
                self.job_id, self.status
            )));
        }
        self.status = to;
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] unless the job is queued.
    pub fn start(&mut self, at: OffsetDateTime) -> Result<(), KernelError> {
        self.transition(PublishJobStatus::Queued, PublishJobStatus::Running)?;
        self.started_at = Some(at);
        Ok(())
    }

    /// Return a job left running by an interrupted worker to the queue.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] unless the job is running.
    pub fn requeue(&mut self) -> Result<(), KernelError> {
        self.transition(PublishJobStatus::Running, PublishJobStatus::Queued)?;
        self.started_at = None;
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] unless the job is running.
    pub fn succeed(&mut self, at: OffsetDateTime, processed_items: u64) -> Result<(), KernelError> {
        self.transition(PublishJobStatus::Running, PublishJobStatus::Succeeded)?;
        self.completed_at = Some(at);
        self.processed_items = processed_items;
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] unless the job is running.
    pub fn fail(&mut self, at: OffsetDateTime, error: &str) -> Result<(), KernelError> {
        self.transition(PublishJobStatus::Running, PublishJobStatus::Failed)?;
        self.completed_at = Some(at);
        self.error = Some(error.to_string());
        Ok(())
    }
}

/// Queue a publish for an edited definition, folding the edit into an already
/// queued job for the same definition when there is one.
#[must_use]
pub fn queue_publish(
    queued: &[PublishJob],
    schedule_id: ScheduleId,
    definition_id: StepDefinitionId,
    updated_fields: &[String],
    requested_by: &str,
    at: OffsetDateTime,
) -> PublishJob {
    if let Some(existing) = queued.iter().find(|job| {
        job.status == PublishJobStatus::Queued
            && job.schedule_id == schedule_id
            && job.definition_id == definition_id
    }) {
        let mut merged = existing.clone();
        merged.merge_fields(updated_fields);
        return merged;
    }
    PublishJob::queued(schedule_id, definition_id, updated_fields.to_vec(), requested_by, at)
}

/// Recompute every item drawing steps from the job's schedule, directly or
/// through links.
///
/// # Errors
/// Propagates recomputation errors from the engine.
pub fn recompute_for_publish(
    plan: &FilePlan,
    job: &PublishJob,
    existing: &BTreeMap<NodeId, DispositionLifecycle>,
    now: OffsetDateTime,
) -> Result<Vec<DispositionLifecycle>, KernelError> {
    let mut refreshed = Vec::new();
    for item_id in plan.items_governed_by(job.schedule_id) {
        if let Some(lifecycle) =
            refresh_lifecycle(plan, existing.get(&item_id).cloned(), item_id, now)?
        {
            refreshed.push(lifecycle);
        }
    }
    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PublishJob {
        PublishJob::queued(
            ScheduleId::new(),
            StepDefinitionId::new(),
            vec!["period".to_string()],
            "records-manager",
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    // Test IDs: TPUB-001
    #[test]
    fn status_text_round_trips_and_terminal_states_are_final() {
        for status in [
            PublishJobStatus::Queued,
            PublishJobStatus::Running,
            PublishJobStatus::Succeeded,
            PublishJobStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<PublishJobStatus>(), Ok(status));
        }
        assert!(PublishJobStatus::Failed.is_terminal());
        assert!(!PublishJobStatus::Running.is_terminal());

        let mut done = job();
        assert_eq!(done.start(OffsetDateTime::UNIX_EPOCH), Ok(()));
        assert_eq!(done.succeed(OffsetDateTime::UNIX_EPOCH, 3), Ok(()));
        assert!(done.start(OffsetDateTime::UNIX_EPOCH).is_err());
        assert_eq!(done.processed_items, 3);
    }

    // Test IDs: TPUB-002
    #[test]
    fn repeated_edits_coalesce_into_the_queued_job() {
        let first = job();
        let merged = queue_publish(
            std::slice::from_ref(&first),
            first.schedule_id,
            first.definition_id,
            &["period".to_string(), "events".to_string()],
            "someone-else",
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_eq!(merged.job_id, first.job_id);
        assert_eq!(merged.updated_fields, vec!["period".to_string(), "events".to_string()]);
        assert_eq!(merged.requested_by, "records-manager");

        let other_definition = queue_publish(
            std::slice::from_ref(&first),
            first.schedule_id,
            StepDefinitionId::new(),
            &["period".to_string()],
            "someone-else",
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_ne!(other_definition.job_id, first.job_id);
    }

    // Test IDs: TPUB-003
    #[test]
    fn running_jobs_do_not_absorb_new_edits() {
        let mut running = job();
        assert_eq!(running.start(OffsetDateTime::UNIX_EPOCH), Ok(()));
        let next = queue_publish(
            std::slice::from_ref(&running),
            running.schedule_id,
            running.definition_id,
            &["anchor".to_string()],
            "records-manager",
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_ne!(next.job_id, running.job_id);
        assert_eq!(next.status, PublishJobStatus::Queued);

        assert_eq!(running.fail(OffsetDateTime::UNIX_EPOCH, "disk full"), Ok(()));
        assert_eq!(running.error.as_deref(), Some("disk full"));
    }

    // Test IDs: TPUB-004
    #[test]
    fn interrupted_jobs_can_be_requeued_but_finished_ones_cannot() {
        let mut interrupted = job();
        assert!(interrupted.requeue().is_err());
        assert_eq!(interrupted.start(OffsetDateTime::UNIX_EPOCH), Ok(()));
        assert_eq!(interrupted.requeue(), Ok(()));
        assert_eq!(interrupted.status, PublishJobStatus::Queued);
        assert_eq!(interrupted.started_at, None);

        assert_eq!(interrupted.start(OffsetDateTime::UNIX_EPOCH), Ok(()));
        assert_eq!(interrupted.succeed(OffsetDateTime::UNIX_EPOCH, 0), Ok(()));
        assert!(interrupted.requeue().is_err());
    }
}
