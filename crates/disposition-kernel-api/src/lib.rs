use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use disposition_kernel_core::{
    complete_event, execute_step, queue_publish, recompute_for_publish, refresh_lifecycle,
    undo_cut_off, undo_event, AuditEvent, DispositionActionDefinition, DispositionActionName,
    DispositionLifecycle, DispositionSchedule, Eligibility, ExecuteStepRequest, FilePlan,
    FilePlanNode, KernelError, NodeId, NodeKind, Period, PeriodAnchor, PublishJob,
    PublishJobId, PublishJobStatus, RecordLink, ScheduleId, StepDefinitionId, StepDefinitionPatch,
    StepOutcome,
};
use disposition_kernel_store_sqlite::{SchemaStatus, SqliteStore, WriteBatch};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

pub mod config;
pub mod observability;

pub use config::{KernelConfig, LoggingConfig, ServiceConfig, StoreConfig};
pub use observability::{init_logging, LogFormat};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateNodeRequest {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub created_at: Option<OffsetDateTime>,
}

/// Declare a record, or close or reopen a folder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeChangeRequest {
    pub node_id: NodeId,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetPropertyRequest {
    pub node_id: NodeId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub value: OffsetDateTime,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveNodeRequest {
    pub node_id: NodeId,
    pub new_parent_id: NodeId,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkRecordRequest {
    pub record_id: NodeId,
    pub container_id: NodeId,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub at: Option<OffsetDateTime>,
}

/// A step as authored in a schedule file, before it is given a definition id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepSpec {
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

impl StepSpec {
    #[must_use]
    pub fn into_definition(self) -> DispositionActionDefinition {
        DispositionActionDefinition {
            definition_id: StepDefinitionId::new(),
            name: self.name,
            description: self.description,
            period: self.period,
            anchor: self.anchor,
            events: self.events,
            eligible_on_first_complete_event: self.eligible_on_first_complete_event,
            location: self.location,
            ghost_on_destroy: self.ghost_on_destroy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateScheduleRequest {
    pub container_id: NodeId,
    pub authority: String,
    pub instructions: String,
    pub record_level: bool,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddStepRequest {
    pub schedule_id: ScheduleId,
    pub step: StepSpec,
    /// Insert position; appends when absent.
    #[serde(default)]
    pub position: Option<usize>,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateStepRequest {
    pub schedule_id: ScheduleId,
    pub definition_id: StepDefinitionId,
    pub patch: StepDefinitionPatch,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateStepResult {
    pub schedule: DispositionSchedule,
    pub updated_fields: Vec<String>,
    pub publish_job: Option<PublishJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveStepRequest {
    pub schedule_id: ScheduleId,
    pub definition_id: StepDefinitionId,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRequest {
    pub item_id: NodeId,
    pub event_name: String,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub at: Option<OffsetDateTime>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteStepCommand {
    pub item_id: NodeId,
    pub step_name: DispositionActionName,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub executed_at: Option<OffsetDateTime>,
    #[serde(default = "default_true")]
    pub enforce_eligibility: bool,
    #[serde(default = "default_true")]
    pub check_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UndoCutOffResult {
    pub item_id: NodeId,
    pub affected_nodes: Vec<NodeId>,
    pub lifecycle: DispositionLifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispositionStatus {
    pub item: FilePlanNode,
    pub lifecycle: Option<DispositionLifecycle>,
    pub eligibility: Option<Eligibility>,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DueItem {
    pub item_id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub step_name: DispositionActionName,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub as_of: Option<OffsetDateTime>,
    pub governing_schedule_id: ScheduleId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSnapshot {
    pub nodes: Vec<FilePlanNode>,
    pub links: Vec<RecordLink>,
    pub schedules: Vec<DispositionSchedule>,
}

/// Plan, lifecycles, and pending writes for one kernel operation. Loaded and
/// applied while the store's write lock is held.
struct Session<'a> {
    store: &'a SqliteStore,
    plan: FilePlan,
    lifecycles: BTreeMap<NodeId, DispositionLifecycle>,
    batch: WriteBatch,
    now: OffsetDateTime,
}

impl<'a> Session<'a> {
    fn load(store: &'a SqliteStore, now: OffsetDateTime) -> Result<Self> {
        let plan = store.load_file_plan()?;
        let lifecycles = store
            .list_lifecycles()?
            .into_iter()
            .map(|lifecycle| (lifecycle.item_id, lifecycle))
            .collect();
        Ok(Self { store, plan, lifecycles, batch: WriteBatch::default(), now })
    }

    fn stage_node(&mut self, node_id: NodeId) -> Result<()> {
        let node = self.plan.require_node(node_id)?.clone();
        self.batch.nodes.retain(|staged| staged.node_id != node_id);
        self.batch.nodes.push(node);
        Ok(())
    }

    fn stage_schedule(&mut self, schedule_id: ScheduleId) -> Result<DispositionSchedule> {
        let schedule = self
            .plan
            .schedule(schedule_id)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("schedule {schedule_id}")))?;
        self.batch.schedules.retain(|staged| staged.schedule_id != schedule_id);
        self.batch.schedules.push(schedule.clone());
        Ok(schedule)
    }

    fn stage_lifecycle(&mut self, lifecycle: DispositionLifecycle) {
        self.batch.lifecycles.retain(|staged| staged.item_id != lifecycle.item_id);
        self.batch.lifecycles.push(lifecycle.clone());
        self.lifecycles.insert(lifecycle.item_id, lifecycle);
    }

    fn lifecycle(&self, item_id: NodeId) -> Result<DispositionLifecycle> {
        self.plan.require_node(item_id)?;
        self.lifecycles.get(&item_id).cloned().ok_or_else(|| {
            KernelError::NotFound(format!("item {item_id} has no disposition lifecycle")).into()
        })
    }

    fn schedule(&self, schedule_id: ScheduleId) -> Result<DispositionSchedule> {
        self.plan
            .schedule(schedule_id)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("schedule {schedule_id}")).into())
    }

    fn replace_schedule(&mut self, schedule: DispositionSchedule) -> Result<DispositionSchedule> {
        let schedule_id = schedule.schedule_id;
        if let Some(slot) = self.plan.schedule_mut(schedule_id) {
            *slot = schedule;
        }
        self.stage_schedule(schedule_id)
    }

    /// Recompute the next action of every listed item against the current plan.
    fn refresh(&mut self, items: impl IntoIterator<Item = NodeId>) -> Result<usize> {
        let mut refreshed = 0_usize;
        for item_id in items {
            let existing = self.lifecycles.get(&item_id).cloned();
            if let Some(lifecycle) = refresh_lifecycle(&self.plan, existing, item_id, self.now)? {
                self.stage_lifecycle(lifecycle);
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    fn audit(
        &mut self,
        operation: &str,
        actor: &str,
        node_id: Option<NodeId>,
        detail: serde_json::Value,
    ) -> Result<()> {
        self.batch.audit.push(AuditEvent::new(operation, actor, node_id, detail, self.now)?);
        Ok(())
    }
}

fn require_actor(actor: &str) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(KernelError::Validation("actor MUST be provided for every write".to_string()).into());
    }
    Ok(())
}

/// Run one publish job to completion inside the caller's locked write.
///
/// Returns `None` when another worker already finished the job.
fn run_publish_job(
    store: &mut SqliteStore,
    job_id: PublishJobId,
    now: OffsetDateTime,
) -> Result<Option<PublishJob>> {
    let Some(mut job) = store.get_publish_job(job_id)? else {
        return Ok(None);
    };
    if job.status == PublishJobStatus::Running {
        tracing::warn!(job_id = %job.job_id, "resuming interrupted publish job");
        job.requeue()?;
    }
    if job.status != PublishJobStatus::Queued {
        return Ok(None);
    }
    job.start(now)?;
    tracing::info!(job_id = %job.job_id, schedule_id = %job.schedule_id, "publish job started");

    let plan = store.load_file_plan()?;
    let existing: BTreeMap<NodeId, DispositionLifecycle> = store
        .list_lifecycles()?
        .into_iter()
        .map(|lifecycle| (lifecycle.item_id, lifecycle))
        .collect();

    let mut batch = WriteBatch::default();
    match recompute_for_publish(&plan, &job, &existing, now) {
        Ok(lifecycles) => {
            let processed = u64::try_from(lifecycles.len()).context("processed item count overflow")?;
            job.succeed(now, processed)?;
            batch.lifecycles = lifecycles;
            tracing::info!(job_id = %job.job_id, processed, "publish job succeeded");
        }
        Err(err) => {
            job.fail(now, &err.to_string())?;
            tracing::warn!(job_id = %job.job_id, error = %err, "publish job failed");
        }
    }
    batch.audit.push(AuditEvent::new(
        "publish",
        &job.requested_by,
        None,
        json!({
            "job_id": job.job_id,
            "status": job.status,
            "processed_items": job.processed_items,
            "error": job.error,
        }),
        now,
    )?);
    batch.jobs.push(job.clone());
    store.apply(&batch)?;
    Ok(Some(job))
}

#[derive(Debug, Clone)]
pub struct DispositionKernelApi {
    db_path: PathBuf,
}

impl DispositionKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Load, mutate, and persist one operation under the store's write lock.
    fn write<T, F>(
        &self,
        operation: &str,
        actor: &str,
        now: Option<OffsetDateTime>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T>,
    {
        require_actor(actor)?;
        let now = now.unwrap_or_else(OffsetDateTime::now_utc);
        let mut store = self.migrated_store()?;
        let (value, batch) = store.write_locked(|store| {
            let (value, batch) = {
                let mut session = Session::load(&*store, now)?;
                let value = work(&mut session)?;
                (value, session.batch)
            };
            store.apply(&batch).with_context(|| format!("failed to persist {operation}"))?;
            Ok((value, batch))
        })?;
        if !batch.is_empty() {
            tracing::info!(
                operation,
                nodes = batch.nodes.len(),
                lifecycles = batch.lifecycles.len(),
                jobs = batch.jobs.len(),
                "kernel mutation committed"
            );
        }
        Ok(value)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    fn create_node(
        &self,
        kind: NodeKind,
        operation: &str,
        input: CreateNodeRequest,
    ) -> Result<FilePlanNode> {
        let CreateNodeRequest { name, parent_id, actor, created_at } = input;
        self.write(operation, &actor, created_at, |session| {
            let node = FilePlanNode::new(kind, &name, parent_id, session.now);
            let node_id = node.node_id;
            session.plan.add_node(node.clone())?;
            session.stage_node(node_id)?;
            if kind != NodeKind::Category {
                session.refresh([node_id])?;
            }
            session.audit(
                operation,
                &actor,
                Some(node_id),
                json!({ "name": node.name, "parent_id": node.parent_id }),
            )?;
            Ok(node)
        })
    }

    /// Create a root or nested record category.
    ///
    /// # Errors
    /// Returns an error when placement rules reject the category or persistence fails.
    pub fn create_category(&self, input: CreateNodeRequest) -> Result<FilePlanNode> {
        self.create_node(NodeKind::Category, "create_category", input)
    }

    /// # Errors
    /// Returns an error when the parent is not a category or persistence fails.
    pub fn create_folder(&self, input: CreateNodeRequest) -> Result<FilePlanNode> {
        self.create_node(NodeKind::Folder, "create_folder", input)
    }

    /// File a new, undeclared record into an open folder.
    ///
    /// # Errors
    /// Returns an error when the parent is not an open folder or persistence fails.
    pub fn file_record(&self, input: CreateNodeRequest) -> Result<FilePlanNode> {
        self.create_node(NodeKind::Record, "file_record", input)
    }

    fn change_node<F>(&self, operation: &str, input: &NodeChangeRequest, change: F) -> Result<FilePlanNode>
    where
        F: FnOnce(&mut FilePlan, OffsetDateTime) -> Result<(), KernelError>,
    {
        self.write(operation, &input.actor, input.at, |session| {
            change(&mut session.plan, session.now)?;
            session.stage_node(input.node_id)?;
            let affected = session.plan.affected_items(input.node_id);
            session.refresh(affected)?;
            session.audit(operation, &input.actor, Some(input.node_id), json!({}))?;
            Ok(session.plan.require_node(input.node_id)?.clone())
        })
    }

    /// # Errors
    /// Returns an error when the node is not an undeclared record or persistence fails.
    pub fn declare_record(&self, input: &NodeChangeRequest) -> Result<FilePlanNode> {
        self.change_node("declare_record", input, |plan, at| plan.declare_record(input.node_id, at))
    }

    /// # Errors
    /// Returns an error when the node is not an open folder or persistence fails.
    pub fn close_folder(&self, input: &NodeChangeRequest) -> Result<FilePlanNode> {
        self.change_node("close_folder", input, |plan, at| plan.close_folder(input.node_id, at))
    }

    /// # Errors
    /// Returns an error when the folder is open or already cut off, or persistence fails.
    pub fn reopen_folder(&self, input: &NodeChangeRequest) -> Result<FilePlanNode> {
        self.change_node("reopen_folder", input, |plan, _| plan.reopen_folder(input.node_id))
    }

    /// Set a date property usable as a `property:<name>` anchor.
    ///
    /// # Errors
    /// Returns an error when the property name is invalid, the node is destroyed, or
    /// persistence fails.
    pub fn set_property(&self, input: &SetPropertyRequest) -> Result<FilePlanNode> {
        let change = NodeChangeRequest {
            node_id: input.node_id,
            actor: input.actor.clone(),
            at: input.at,
        };
        self.change_node("set_property", &change, |plan, _| {
            plan.set_property(input.node_id, &input.name, input.value)
        })
    }

    /// Move a category, folder, or record and recompute everything beneath it.
    ///
    /// # Errors
    /// Returns an error when the move is rejected by placement rules or persistence fails.
    pub fn move_node(&self, input: &MoveNodeRequest) -> Result<FilePlanNode> {
        self.write("move_node", &input.actor, input.at, |session| {
            let from = session.plan.require_node(input.node_id)?.parent_id;
            session.plan.move_node(input.node_id, input.new_parent_id)?;
            session.stage_node(input.node_id)?;
            let affected = session.plan.affected_items(input.node_id);
            let refreshed = session.refresh(affected)?;
            session.audit(
                "move_node",
                &input.actor,
                Some(input.node_id),
                json!({ "from": from, "to": input.new_parent_id, "refreshed_items": refreshed }),
            )?;
            Ok(session.plan.require_node(input.node_id)?.clone())
        })
    }

    /// # Errors
    /// Returns an error when the link is rejected or persistence fails.
    pub fn link_record(&self, input: &LinkRecordRequest) -> Result<RecordLink> {
        self.write("link_record", &input.actor, input.at, |session| {
            let link = RecordLink {
                record_id: input.record_id,
                container_id: input.container_id,
                linked_at: session.now,
                linked_by: input.actor.clone(),
            };
            session.plan.link_record(link.clone())?;
            session.batch.links_added.push(link.clone());
            session.refresh([input.record_id])?;
            session.audit(
                "link_record",
                &input.actor,
                Some(input.record_id),
                json!({ "container_id": input.container_id }),
            )?;
            Ok(link)
        })
    }

    /// # Errors
    /// Returns an error when no such link exists or persistence fails.
    pub fn unlink_record(&self, input: &LinkRecordRequest) -> Result<RecordLink> {
        self.write("unlink_record", &input.actor, input.at, |session| {
            let link = session.plan.unlink_record(input.record_id, input.container_id)?;
            session.batch.links_removed.push((input.record_id, input.container_id));
            session.refresh([input.record_id])?;
            session.audit(
                "unlink_record",
                &input.actor,
                Some(input.record_id),
                json!({ "container_id": input.container_id }),
            )?;
            Ok(link)
        })
    }

    /// Current nodes, links, and schedules.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn file_plan(&self) -> Result<PlanSnapshot> {
        let store = self.migrated_store()?;
        let plan = store.load_file_plan()?;
        Ok(PlanSnapshot {
            nodes: plan.nodes_in_hierarchy_order().into_iter().cloned().collect(),
            links: plan.links().cloned().collect(),
            schedules: plan.schedules().cloned().collect(),
        })
    }

    /// Attach a new schedule to a category and start lifecycles for items it reaches.
    ///
    /// # Errors
    /// Returns an error when the schedule is invalid, the category already has one, or
    /// persistence fails.
    pub fn create_schedule(&self, input: CreateScheduleRequest) -> Result<DispositionSchedule> {
        let CreateScheduleRequest {
            container_id,
            authority,
            instructions,
            record_level,
            steps,
            actor,
            created_at,
        } = input;
        self.write("create_schedule", &actor, created_at, |session| {
            let schedule = DispositionSchedule {
                schedule_id: ScheduleId::new(),
                container_id,
                authority,
                instructions,
                record_level,
                steps: steps.into_iter().map(StepSpec::into_definition).collect(),
                created_at: session.now,
            };
            let schedule_id = schedule.schedule_id;
            session.plan.attach_schedule(schedule)?;
            let schedule = session.stage_schedule(schedule_id)?;
            let affected = session.plan.affected_items(container_id);
            session.refresh(affected)?;
            session.audit(
                "create_schedule",
                &actor,
                Some(container_id),
                json!({ "schedule_id": schedule_id, "steps": schedule.steps.len() }),
            )?;
            Ok(schedule)
        })
    }

    /// Insert a step and recompute every item the schedule governs.
    ///
    /// # Errors
    /// Returns an error when the schedule is missing, the position is out of range, the
    /// resulting schedule is invalid, or persistence fails.
    pub fn add_step(&self, input: AddStepRequest) -> Result<DispositionSchedule> {
        let AddStepRequest { schedule_id, step, position, actor, at } = input;
        self.write("add_step", &actor, at, |session| {
            let mut schedule = session.schedule(schedule_id)?;
            let position = position.unwrap_or(schedule.steps.len());
            if position > schedule.steps.len() {
                return Err(KernelError::Validation(format!(
                    "step position {position} MUST be at most {}",
                    schedule.steps.len()
                ))
                .into());
            }
            let definition = step.into_definition();
            let definition_id = definition.definition_id;
            schedule.steps.insert(position, definition);
            schedule.validate()?;
            let schedule = session.replace_schedule(schedule)?;
            let governed = session.plan.items_governed_by(schedule_id);
            session.refresh(governed)?;
            session.audit(
                "add_step",
                &actor,
                Some(schedule.container_id),
                json!({ "schedule_id": schedule_id, "definition_id": definition_id, "position": position }),
            )?;
            Ok(schedule)
        })
    }

    /// Edit a step definition and queue a publish job. Stored next actions keep
    /// their old values until the job runs.
    ///
    /// # Errors
    /// Returns an error when the patch is empty, the step is missing, the edited
    /// schedule is invalid, or persistence fails.
    pub fn update_step(&self, input: UpdateStepRequest) -> Result<UpdateStepResult> {
        if input.patch.is_empty() {
            return Err(KernelError::Validation(
                "step patch MUST change at least one field".to_string(),
            )
            .into());
        }
        let result = self.write("update_step", &input.actor, input.at, |session| {
            let mut schedule = session.schedule(input.schedule_id)?;
            let step = schedule.step_mut(input.definition_id).ok_or_else(|| {
                KernelError::NotFound(format!(
                    "step {} in schedule {}",
                    input.definition_id, input.schedule_id
                ))
            })?;
            let updated_fields = step.apply_patch(&input.patch);
            if updated_fields.is_empty() {
                return Ok(UpdateStepResult { schedule, updated_fields, publish_job: None });
            }
            schedule.validate()?;
            let schedule = session.replace_schedule(schedule)?;

            let queued = session.store.list_publish_jobs(Some(PublishJobStatus::Queued))?;
            let job = queue_publish(
                &queued,
                input.schedule_id,
                input.definition_id,
                &updated_fields,
                &input.actor,
                session.now,
            );
            session.batch.jobs.push(job.clone());
            session.audit(
                "update_step",
                &input.actor,
                Some(schedule.container_id),
                json!({
                    "schedule_id": input.schedule_id,
                    "definition_id": input.definition_id,
                    "updated_fields": updated_fields,
                    "publish_job_id": job.job_id,
                }),
            )?;
            Ok(UpdateStepResult { schedule, updated_fields, publish_job: Some(job) })
        })?;
        if let Some(job) = &result.publish_job {
            tracing::info!(job_id = %job.job_id, schedule_id = %input.schedule_id, "publish job queued");
        }
        Ok(result)
    }

    /// Remove a step nobody is currently waiting on.
    ///
    /// # Errors
    /// Returns an error when the step is missing, a stored next action depends on it,
    /// the remaining schedule is invalid, or persistence fails.
    pub fn remove_step(&self, input: &RemoveStepRequest) -> Result<DispositionSchedule> {
        self.write("remove_step", &input.actor, input.at, |session| {
            let dependent = session.lifecycles.values().find(|lifecycle| {
                lifecycle.next_action.as_ref().is_some_and(|next| {
                    next.contributors()
                        .any(|candidate| candidate.definition_id == Some(input.definition_id))
                })
            });
            if let Some(lifecycle) = dependent {
                return Err(KernelError::Validation(format!(
                    "step {} MUST NOT be removed while item {} is waiting on it",
                    input.definition_id, lifecycle.item_id
                ))
                .into());
            }

            let mut schedule = session.schedule(input.schedule_id)?;
            let Some((position, _)) = schedule.step(input.definition_id) else {
                return Err(KernelError::NotFound(format!(
                    "step {} in schedule {}",
                    input.definition_id, input.schedule_id
                ))
                .into());
            };
            schedule.steps.remove(position);
            schedule.validate()?;
            let schedule = session.replace_schedule(schedule)?;
            let governed = session.plan.items_governed_by(input.schedule_id);
            session.refresh(governed)?;
            session.audit(
                "remove_step",
                &input.actor,
                Some(schedule.container_id),
                json!({ "schedule_id": input.schedule_id, "definition_id": input.definition_id }),
            )?;
            Ok(schedule)
        })
    }

    /// Run up to `limit` unfinished publish jobs, oldest first.
    ///
    /// Each job is started, recomputed, and finished as succeeded or failed in one
    /// locked write, so no job is ever left running. Jobs found running were
    /// interrupted mid-flight and are resumed.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or job state cannot be persisted.
    pub fn publish_pending(&self, limit: usize, now: Option<OffsetDateTime>) -> Result<Vec<PublishJob>> {
        let now = now.unwrap_or_else(OffsetDateTime::now_utc);
        let mut store = self.migrated_store()?;
        let pending: Vec<PublishJobId> = store
            .list_publish_jobs(None)?
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.job_id)
            .take(limit)
            .collect();

        let mut finished = Vec::new();
        for job_id in pending {
            if let Some(job) = store.write_locked(|store| run_publish_job(store, job_id, now))? {
                finished.push(job);
            }
        }
        Ok(finished)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_publish_jobs(&self, status: Option<PublishJobStatus>) -> Result<Vec<PublishJob>> {
        let store = self.migrated_store()?;
        store.list_publish_jobs(status)
    }

    /// Stored lifecycle of an item plus eligibility of its next step at `as_of`.
    ///
    /// # Errors
    /// Returns an error when the item does not exist or the store cannot be read.
    pub fn disposition_status(
        &self,
        item_id: NodeId,
        as_of: Option<OffsetDateTime>,
    ) -> Result<DispositionStatus> {
        let store = self.migrated_store()?;
        let plan = store.load_file_plan()?;
        let item = plan.require_node(item_id)?.clone();
        let evaluated_at = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let lifecycle = store.load_lifecycle(item_id)?;
        let eligibility = lifecycle
            .as_ref()
            .and_then(|lifecycle| lifecycle.next_action.as_ref())
            .filter(|_| !item.is_destroyed())
            .map(|next| next.eligibility(evaluated_at));
        Ok(DispositionStatus { item, lifecycle, eligibility, evaluated_at })
    }

    /// # Errors
    /// Returns an error when the pending step does not require the event, the event is
    /// already complete, or persistence fails.
    pub fn complete_event(&self, input: &EventRequest) -> Result<DispositionLifecycle> {
        self.write("complete_event", &input.actor, input.at, |session| {
            let mut lifecycle = session.lifecycle(input.item_id)?;
            complete_event(&session.plan, &mut lifecycle, &input.event_name, session.now, &input.actor)?;
            session.stage_lifecycle(lifecycle.clone());
            session.audit(
                "complete_event",
                &input.actor,
                Some(input.item_id),
                json!({ "event_name": input.event_name }),
            )?;
            Ok(lifecycle)
        })
    }

    /// # Errors
    /// Returns an error when the event was not completed or persistence fails.
    pub fn undo_event(&self, input: &EventRequest) -> Result<DispositionLifecycle> {
        self.write("undo_event", &input.actor, input.at, |session| {
            let mut lifecycle = session.lifecycle(input.item_id)?;
            undo_event(&session.plan, &mut lifecycle, &input.event_name, session.now)?;
            session.stage_lifecycle(lifecycle.clone());
            session.audit(
                "undo_event",
                &input.actor,
                Some(input.item_id),
                json!({ "event_name": input.event_name }),
            )?;
            Ok(lifecycle)
        })
    }

    /// Execute the pending step of an item.
    ///
    /// A skipped outcome writes nothing.
    ///
    /// # Errors
    /// Returns an error on guard failures when `check_errors` is set, when the item has
    /// no lifecycle, or when persistence fails.
    pub fn execute_step(&self, input: &ExecuteStepCommand) -> Result<StepOutcome> {
        self.write("execute_step", &input.actor, input.executed_at, |session| {
            let mut lifecycle = session.lifecycle(input.item_id)?;
            let request = ExecuteStepRequest {
                step_name: input.step_name,
                executed_at: session.now,
                actor: input.actor.clone(),
                enforce_eligibility: input.enforce_eligibility,
                check_errors: input.check_errors,
            };

            let outcome = execute_step(&mut session.plan, &mut lifecycle, &request).map_err(|err| {
                if let KernelError::Guard(reason) = &err {
                    tracing::warn!(item_id = %input.item_id, step = %input.step_name, reason = %reason, "disposition guard failed");
                }
                err
            })?;

            let StepOutcome::Executed { affected_nodes, .. } = &outcome else {
                if let StepOutcome::Skipped { reason, .. } = &outcome {
                    tracing::warn!(item_id = %input.item_id, step = %input.step_name, reason = %reason, "disposition step skipped");
                }
                return Ok(outcome);
            };

            for node_id in affected_nodes {
                session.stage_node(*node_id)?;
            }
            session.stage_lifecycle(lifecycle);
            session.refresh(affected_nodes.iter().copied().filter(|node_id| *node_id != input.item_id))?;
            session.audit(
                "execute_step",
                &input.actor,
                Some(input.item_id),
                json!({ "step_name": input.step_name, "affected_nodes": affected_nodes }),
            )?;
            Ok(outcome)
        })
    }

    /// Undo the last cutoff of an item. A folder closed by that cutoff is reopened.
    ///
    /// # Errors
    /// Returns an error unless the last completed step is a cutoff, or when persistence
    /// fails.
    pub fn undo_cut_off(&self, input: &NodeChangeRequest) -> Result<UndoCutOffResult> {
        self.write("undo_cut_off", &input.actor, input.at, |session| {
            let mut lifecycle = session.lifecycle(input.node_id)?;
            let affected_nodes = undo_cut_off(&mut session.plan, &mut lifecycle, session.now)?;
            for node_id in &affected_nodes {
                session.stage_node(*node_id)?;
            }
            session.stage_lifecycle(lifecycle.clone());
            session.refresh(affected_nodes.iter().copied().filter(|node_id| *node_id != input.node_id))?;
            session.audit(
                "undo_cut_off",
                &input.actor,
                Some(input.node_id),
                json!({ "affected_nodes": affected_nodes }),
            )?;
            Ok(UndoCutOffResult { item_id: input.node_id, affected_nodes, lifecycle })
        })
    }

    /// Live items whose next step is eligible at `as_of`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_due(&self, as_of: Option<OffsetDateTime>) -> Result<Vec<DueItem>> {
        let as_of = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let store = self.migrated_store()?;
        let plan = store.load_file_plan()?;
        let mut due = Vec::new();
        for lifecycle in store.list_lifecycles()? {
            let Some(next) = &lifecycle.next_action else {
                continue;
            };
            let Some(item) = plan.node(lifecycle.item_id).filter(|item| !item.is_destroyed()) else {
                continue;
            };
            if next.eligibility(as_of).eligible {
                due.push(DueItem {
                    item_id: item.node_id,
                    name: item.name.clone(),
                    kind: item.kind,
                    step_name: next.step_name,
                    as_of: next.as_of,
                    governing_schedule_id: next.governing_schedule_id,
                });
            }
        }
        due.sort_by(|left, right| left.as_of.cmp(&right.as_of).then(left.item_id.cmp(&right.item_id)));
        Ok(due)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn audit_log(&self, node_id: Option<NodeId>) -> Result<Vec<AuditEvent>> {
        let store = self.migrated_store()?;
        store.list_audit_events(node_id)
    }
}

/// Map an API error to its kernel cause, if any.
#[must_use]
pub fn kernel_error(err: &anyhow::Error) -> Option<&KernelError> {
    err.chain().find_map(|cause| cause.downcast_ref::<KernelError>())
}

/// Parse a schedule definition document, as used by `dk schedule create --file`.
///
/// # Errors
/// Returns an error when the YAML does not describe a schedule.
pub fn parse_schedule_yaml(yaml: &str) -> Result<ScheduleDocument> {
    serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid schedule document: {err}"))
}

/// Authoring form of a schedule; ids and actor are supplied at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleDocument {
    pub authority: String,
    pub instructions: String,
    pub record_level: bool,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use time::Duration;

    use super::*;

    const T0: OffsetDateTime = datetime!(2024-01-10 09:00 UTC);
    const DECLARED: OffsetDateTime = datetime!(2024-02-01 09:00 UTC);
    const CUT: OffsetDateTime = datetime!(2024-03-01 09:00 UTC);

    struct Fixture {
        api: DispositionKernelApi,
        db_path: PathBuf,
        schedule: DispositionSchedule,
        record_id: NodeId,
    }

    impl Fixture {
        fn destroy_definition(&self) -> StepDefinitionId {
            self.schedule.steps[1].definition_id
        }

        fn next_as_of(&self) -> Result<Option<OffsetDateTime>> {
            let status = self.api.disposition_status(self.record_id, Some(CUT))?;
            Ok(status.lifecycle.and_then(|lifecycle| lifecycle.next_action).and_then(|next| next.as_of))
        }

        fn cleanup(&self) {
            let _ = std::fs::remove_file(&self.db_path);
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("dispositionkernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn node(name: &str, parent_id: Option<NodeId>) -> CreateNodeRequest {
        CreateNodeRequest {
            name: name.to_string(),
            parent_id,
            actor: "records-manager".to_string(),
            created_at: Some(T0),
        }
    }

    fn steps(destroy_after: Period) -> Vec<StepSpec> {
        vec![
            StepSpec {
                name: DispositionActionName::Cutoff,
                description: "cut off on declaration".to_string(),
                period: Period::Immediately,
                anchor: PeriodAnchor::Declared,
                events: Vec::new(),
                eligible_on_first_complete_event: false,
                location: None,
                ghost_on_destroy: false,
            },
            StepSpec {
                name: DispositionActionName::Destroy,
                description: "destroy after retention".to_string(),
                period: destroy_after,
                anchor: PeriodAnchor::CutOff,
                events: Vec::new(),
                eligible_on_first_complete_event: false,
                location: None,
                ghost_on_destroy: false,
            },
        ]
    }

    fn scheduled_category(
        api: &DispositionKernelApi,
        name: &str,
        destroy_after: Period,
    ) -> Result<(NodeId, DispositionSchedule)> {
        let category = api.create_category(node(name, None))?;
        let schedule = api.create_schedule(CreateScheduleRequest {
            container_id: category.node_id,
            authority: format!("{name} retention act"),
            instructions: "cut off on declaration, then destroy".to_string(),
            record_level: true,
            steps: steps(destroy_after),
            actor: "records-manager".to_string(),
            created_at: Some(T0),
        })?;
        Ok((category.node_id, schedule))
    }

    fn declared_record() -> Result<Fixture> {
        let db_path = unique_temp_db_path();
        let api = DispositionKernelApi::new(db_path.clone());
        let (category_id, schedule) = scheduled_category(&api, "finance", Period::Years(1))?;
        let folder = api.create_folder(node("2024", Some(category_id)))?;
        let record = api.file_record(node("invoice-17", Some(folder.node_id)))?;
        api.declare_record(&NodeChangeRequest {
            node_id: record.node_id,
            actor: "clerk".to_string(),
            at: Some(DECLARED),
        })?;
        Ok(Fixture { api, db_path, schedule, record_id: record.node_id })
    }

    fn execute(
        fixture: &Fixture,
        step_name: DispositionActionName,
        check_errors: bool,
    ) -> Result<StepOutcome> {
        fixture.api.execute_step(&ExecuteStepCommand {
            item_id: fixture.record_id,
            step_name,
            actor: "records-manager".to_string(),
            executed_at: Some(CUT),
            enforce_eligibility: true,
            check_errors,
        })
    }

    fn cut_off_record() -> Result<Fixture> {
        let fixture = declared_record()?;
        execute(&fixture, DispositionActionName::Cutoff, true)?;
        Ok(fixture)
    }

    fn one_year_after_cut() -> Result<OffsetDateTime> {
        Ok(CUT.replace_year(CUT.year() + 1)?)
    }

    // Test IDs: TAPI-001
    #[test]
    fn declaration_schedules_cutoff_and_execution_advances_to_destroy() -> Result<()> {
        let fixture = declared_record()?;

        let status = fixture.api.disposition_status(fixture.record_id, Some(DECLARED))?;
        let next = status
            .lifecycle
            .and_then(|lifecycle| lifecycle.next_action)
            .ok_or_else(|| anyhow!("record should have a next action"))?;
        assert_eq!(next.step_name, DispositionActionName::Cutoff);
        assert_eq!(next.as_of, Some(DECLARED));
        assert_eq!(status.eligibility.map(|e| e.eligible), Some(true));

        let outcome = execute(&fixture, DispositionActionName::Cutoff, true)?;
        assert!(matches!(outcome, StepOutcome::Executed { .. }));
        assert_eq!(fixture.next_as_of()?, Some(one_year_after_cut()?));

        let status = fixture.api.disposition_status(fixture.record_id, Some(CUT))?;
        assert_eq!(status.item.cut_off_at, Some(CUT));
        let operations: Vec<String> = fixture
            .api
            .audit_log(Some(fixture.record_id))?
            .into_iter()
            .map(|event| event.operation)
            .collect();
        assert_eq!(operations, vec!["file_record", "declare_record", "execute_step"]);

        fixture.cleanup();
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn step_edits_wait_for_publish_and_shift_as_of_by_the_delta() -> Result<()> {
        let fixture = cut_off_record()?;
        let before = fixture.next_as_of()?;

        let update = |patch: StepDefinitionPatch| {
            fixture.api.update_step(UpdateStepRequest {
                schedule_id: fixture.schedule.schedule_id,
                definition_id: fixture.destroy_definition(),
                patch,
                actor: "records-manager".to_string(),
                at: Some(CUT),
            })
        };
        let first = update(StepDefinitionPatch { period: Some(Period::Years(2)), ..StepDefinitionPatch::default() })?;
        let second = update(StepDefinitionPatch {
            description: Some("destroy after two years".to_string()),
            ..StepDefinitionPatch::default()
        })?;
        let first_job = first.publish_job.ok_or_else(|| anyhow!("edit should queue a job"))?;
        let second_job = second.publish_job.ok_or_else(|| anyhow!("edit should queue a job"))?;
        assert_eq!(first_job.job_id, second_job.job_id);
        assert_eq!(second_job.updated_fields, vec!["period".to_string(), "description".to_string()]);

        assert_eq!(fixture.next_as_of()?, before);
        assert_eq!(fixture.api.list_publish_jobs(Some(PublishJobStatus::Queued))?.len(), 1);

        let finished = fixture.api.publish_pending(10, Some(CUT + Duration::days(1)))?;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, PublishJobStatus::Succeeded);
        assert_eq!(finished[0].processed_items, 1);

        let after = fixture.next_as_of()?.ok_or_else(|| anyhow!("as_of should be set"))?;
        let before = before.ok_or_else(|| anyhow!("as_of should be set"))?;
        assert_eq!(after, before.replace_year(before.year() + 1)?);
        assert!(fixture.api.list_publish_jobs(Some(PublishJobStatus::Queued))?.is_empty());

        fixture.cleanup();
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn linked_schedule_with_longer_retention_governs_until_unlinked() -> Result<()> {
        let fixture = cut_off_record()?;
        let (legal_id, legal_schedule) =
            scheduled_category(&fixture.api, "legal", Period::Years(5))?;
        let hold = fixture.api.create_folder(node("litigation", Some(legal_id)))?;

        let link = LinkRecordRequest {
            record_id: fixture.record_id,
            container_id: hold.node_id,
            actor: "counsel".to_string(),
            at: Some(CUT),
        };
        fixture.api.link_record(&link)?;
        let status = fixture.api.disposition_status(fixture.record_id, Some(CUT))?;
        let next = status
            .lifecycle
            .and_then(|lifecycle| lifecycle.next_action)
            .ok_or_else(|| anyhow!("record should have a next action"))?;
        assert_eq!(next.governing_schedule_id, legal_schedule.schedule_id);
        assert_eq!(next.as_of, Some(CUT.replace_year(CUT.year() + 5)?));

        fixture.api.unlink_record(&link)?;
        assert_eq!(fixture.next_as_of()?, Some(one_year_after_cut()?));

        fixture.cleanup();
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn pending_steps_cannot_be_removed() -> Result<()> {
        let fixture = cut_off_record()?;
        let result = fixture.api.remove_step(&RemoveStepRequest {
            schedule_id: fixture.schedule.schedule_id,
            definition_id: fixture.destroy_definition(),
            actor: "records-manager".to_string(),
            at: Some(CUT),
        });
        let Err(err) = result else {
            return Err(anyhow!("removing a pending step should fail"));
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::Validation(_))));

        fixture.cleanup();
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn guard_failures_leave_the_record_untouched() -> Result<()> {
        let fixture = declared_record()?;

        let Err(err) = execute(&fixture, DispositionActionName::Destroy, true) else {
            return Err(anyhow!("destroying before cutoff should fail"));
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::Guard(_))));

        let skipped = execute(&fixture, DispositionActionName::Destroy, false)?;
        assert!(matches!(skipped, StepOutcome::Skipped { .. }));

        let status = fixture.api.disposition_status(fixture.record_id, Some(CUT))?;
        assert_eq!(status.item.cut_off_at, None);
        assert!(status.lifecycle.is_some_and(|lifecycle| lifecycle.history.is_empty()));

        fixture.cleanup();
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn due_list_reflects_eligibility_at_the_requested_date() -> Result<()> {
        let fixture = declared_record()?;
        assert!(fixture.api.list_due(Some(T0))?.is_empty());

        let due = fixture.api.list_due(Some(DECLARED))?;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].item_id, fixture.record_id);
        assert_eq!(due[0].step_name, DispositionActionName::Cutoff);

        fixture.cleanup();
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn writes_require_an_actor_and_migrate_supports_dry_run() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DispositionKernelApi::new(db_path.clone());

        let dry = api.migrate(true)?;
        assert!(dry.dry_run);
        assert_eq!(dry.would_apply_versions, vec![1, 2]);

        let mut request = node("finance", None);
        request.actor = " ".to_string();
        let Err(err) = api.create_category(request) else {
            return Err(anyhow!("blank actor should be rejected"));
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::Validation(_))));
        assert!(api.file_plan()?.nodes.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn schedule_documents_parse_from_yaml() -> Result<()> {
        let document = parse_schedule_yaml(
            "authority: Records Act s.12\n\
             instructions: Cut off at year end, destroy after seven years\n\
             record_level: true\n\
             steps:\n\
             \x20 - name: cutoff\n\
             \x20   period: yearend|1\n\
             \x20   anchor: created\n\
             \x20 - name: destroy\n\
             \x20   period: year|7\n\
             \x20   anchor: cut_off\n",
        )?;
        assert_eq!(document.steps.len(), 2);
        assert_eq!(document.steps[0].period, Period::YearEnd(1));
        assert_eq!(document.steps[1].anchor, PeriodAnchor::CutOff);
        Ok(())
    }

    fn event_gated_record() -> Result<Fixture> {
        let db_path = unique_temp_db_path();
        let api = DispositionKernelApi::new(db_path.clone());
        let category = api.create_category(node("litigation", None))?;
        let mut gated = steps(Period::Years(1));
        gated[0].events = vec!["case_closed".to_string()];
        let schedule = api.create_schedule(CreateScheduleRequest {
            container_id: category.node_id,
            authority: "Litigation hold policy".to_string(),
            instructions: "cut off when the case closes, then destroy".to_string(),
            record_level: true,
            steps: gated,
            actor: "records-manager".to_string(),
            created_at: Some(T0),
        })?;
        let folder = api.create_folder(node("case-42", Some(category.node_id)))?;
        let record = api.file_record(node("deposition", Some(folder.node_id)))?;
        api.declare_record(&NodeChangeRequest {
            node_id: record.node_id,
            actor: "clerk".to_string(),
            at: Some(DECLARED),
        })?;
        Ok(Fixture { api, db_path, schedule, record_id: record.node_id })
    }

    // Test IDs: TAPI-009
    #[test]
    fn publish_running_alongside_event_writes_keeps_every_completion() -> Result<()> {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let fixture = event_gated_record()?;
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let api = fixture.api.clone();
            let stop = Arc::clone(&stop);
            let schedule_id = fixture.schedule.schedule_id;
            let definition_id = fixture.destroy_definition();
            std::thread::spawn(move || -> Result<usize> {
                let mut published = 0_usize;
                let mut pass = 0_u32;
                while !stop.load(Ordering::SeqCst) {
                    pass += 1;
                    api.update_step(UpdateStepRequest {
                        schedule_id,
                        definition_id,
                        patch: StepDefinitionPatch {
                            description: Some(format!("destroy after retention, pass {pass}")),
                            ..StepDefinitionPatch::default()
                        },
                        actor: "records-manager".to_string(),
                        at: Some(CUT),
                    })?;
                    published += api.publish_pending(10, Some(CUT))?.len();
                }
                Ok(published)
            })
        };

        let event = EventRequest {
            item_id: fixture.record_id,
            event_name: "case_closed".to_string(),
            actor: "counsel".to_string(),
            at: Some(CUT),
        };
        let mut lost = Vec::new();
        for round in 0..150 {
            fixture.api.complete_event(&event)?;
            if let Err(err) = fixture.api.undo_event(&event) {
                lost.push(format!("round {round}: {err}"));
            }
        }
        stop.store(true, Ordering::SeqCst);
        let published = worker.join().map_err(|_| anyhow!("publish worker panicked"))??;

        assert!(lost.is_empty(), "completed events were overwritten: {lost:?}");
        assert!(published > 0);
        let queued = fixture.api.list_publish_jobs(Some(PublishJobStatus::Queued))?;
        let running = fixture.api.list_publish_jobs(Some(PublishJobStatus::Running))?;
        assert!(queued.len() <= 1);
        assert!(running.is_empty());

        fixture.cleanup();
        Ok(())
    }

    // Test IDs: TAPI-010
    #[test]
    fn jobs_left_running_by_an_interrupted_worker_are_resumed() -> Result<()> {
        let fixture = cut_off_record()?;
        let before = fixture.next_as_of()?.ok_or_else(|| anyhow!("as_of should be set"))?;
        let update = fixture.api.update_step(UpdateStepRequest {
            schedule_id: fixture.schedule.schedule_id,
            definition_id: fixture.destroy_definition(),
            patch: StepDefinitionPatch { period: Some(Period::Years(3)), ..StepDefinitionPatch::default() },
            actor: "records-manager".to_string(),
            at: Some(CUT),
        })?;
        let mut job = update.publish_job.ok_or_else(|| anyhow!("edit should queue a job"))?;

        job.start(CUT)?;
        let mut store = SqliteStore::open(&fixture.db_path)?;
        store.apply(&WriteBatch { jobs: vec![job.clone()], ..WriteBatch::default() })?;
        drop(store);
        assert!(fixture.api.list_publish_jobs(Some(PublishJobStatus::Queued))?.is_empty());

        let finished = fixture.api.publish_pending(10, Some(CUT + Duration::days(1)))?;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].job_id, job.job_id);
        assert_eq!(finished[0].status, PublishJobStatus::Succeeded);
        assert_eq!(finished[0].processed_items, 1);
        assert!(fixture.api.list_publish_jobs(Some(PublishJobStatus::Running))?.is_empty());
        assert_eq!(fixture.next_as_of()?, Some(before.replace_year(before.year() + 2)?));

        assert!(fixture.api.publish_pending(10, Some(CUT + Duration::days(2)))?.is_empty());

        fixture.cleanup();
        Ok(())
    }
}
