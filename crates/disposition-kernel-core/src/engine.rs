use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::file_plan::{DispositionState, FilePlan, FilePlanNode, NodeKind, ScheduleSource};
use crate::lifecycle::{
    AsOfState, CandidateWhy, CompletedStep, DeterminismMetadata, DispositionLifecycle,
    EventCompletion, EventRequirement, NextDispositionAction, ScheduleCandidate,
};
use crate::schedule::{DispositionActionDefinition, DispositionActionName, PeriodAnchor};
use crate::{rfc3339_label, KernelError, NodeId, RULESET_VERSION};

#[must_use]
pub fn default_tie_breakers() -> Vec<String> {
    vec![
        "action_rank_asc".to_string(),
        "position_asc".to_string(),
        "as_of_latest_awaiting_anchor_first".to_string(),
        "primary_parent_first".to_string(),
        "schedule_id_asc".to_string(),
    ]
}

struct Proposal<'a> {
    source: ScheduleSource,
    position: usize,
    step: &'a DispositionActionDefinition,
    as_of_state: AsOfState,
    as_of: Option<OffsetDateTime>,
}

impl Proposal<'_> {
    fn as_of_label(&self) -> String {
        match (self.as_of_state, self.as_of) {
            (AsOfState::Scheduled, Some(as_of)) => rfc3339_label(as_of),
            (state, _) => state.as_str().to_string(),
        }
    }

    fn candidate(&self, included: bool, reasons: Vec<String>) -> ScheduleCandidate {
        ScheduleCandidate {
            rank: 0,
            schedule_id: self.source.schedule_id,
            container_id: self.source.container_id,
            primary: self.source.primary,
            definition_id: Some(self.step.definition_id),
            step_name: Some(self.step.name),
            position: Some(self.position),
            period: Some(self.step.period),
            as_of: self.as_of,
            as_of_state: Some(self.as_of_state),
            events: self.step.events.clone(),
            eligible_on_first_complete_event: self.step.eligible_on_first_complete_event,
            why: CandidateWhy { included, reasons },
        }
    }
}

fn as_of_weight(state: AsOfState) -> u8 {
    match state {
        AsOfState::Unscheduled => 0,
        AsOfState::Scheduled => 1,
        AsOfState::AwaitingAnchor => 2,
    }
}

/// Contributors sort with the governing one first: awaiting anchor, then the
/// latest date, then unscheduled; ties go to the primary parent and lower id.
fn governance_order(left: &Proposal<'_>, right: &Proposal<'_>) -> Ordering {
    as_of_weight(right.as_of_state)
        .cmp(&as_of_weight(left.as_of_state))
        .then_with(|| right.as_of.cmp(&left.as_of))
        .then_with(|| right.source.primary.cmp(&left.source.primary))
        .then_with(|| left.source.schedule_id.cmp(&right.source.schedule_id))
}

fn events_completed_at(
    step: &DispositionActionDefinition,
    lifecycle: &DispositionLifecycle,
) -> Option<OffsetDateTime> {
    let completions: Vec<OffsetDateTime> = step
        .events
        .iter()
        .filter_map(|event| lifecycle.pending_events.get(event))
        .map(|completion| completion.completed_at)
        .collect();

    if step.eligible_on_first_complete_event {
        completions.into_iter().min()
    } else if completions.len() == step.events.len() {
        completions.into_iter().max()
    } else {
        None
    }
}

fn anchor_date(
    plan: &FilePlan,
    item: &FilePlanNode,
    lifecycle: &DispositionLifecycle,
    step: &DispositionActionDefinition,
) -> Option<OffsetDateTime> {
    match &step.anchor {
        PeriodAnchor::Created => Some(item.created_at),
        PeriodAnchor::Declared => item.declared_at,
        PeriodAnchor::Closed => match item.kind {
            NodeKind::Record => item
                .parent_id
                .and_then(|parent_id| plan.node(parent_id))
                .and_then(|folder| folder.closed_at),
            NodeKind::Folder | NodeKind::Category => item.closed_at,
        },
        PeriodAnchor::CutOff => item.cut_off_at,
        PeriodAnchor::PreviousStep => Some(
            lifecycle
                .last_completed()
                .map_or(lifecycle.initialised_at, |step| step.completed_at),
        ),
        PeriodAnchor::EventsCompleted => events_completed_at(step, lifecycle),
        PeriodAnchor::Property(name) => item.properties.get(name).copied(),
    }
}

fn compute_as_of(
    plan: &FilePlan,
    item: &FilePlanNode,
    lifecycle: &DispositionLifecycle,
    step: &DispositionActionDefinition,
) -> Result<(AsOfState, Option<OffsetDateTime>), KernelError> {
    if !step.period.has_time_component() {
        return Ok((AsOfState::Unscheduled, None));
    }
    match anchor_date(plan, item, lifecycle, step) {
        Some(anchor) => Ok((AsOfState::Scheduled, step.period.next_date(anchor)?)),
        None => Ok((AsOfState::AwaitingAnchor, None)),
    }
}

/// Compute the next disposition action for `lifecycle.item_id`.
///
/// Each applicable schedule proposes its first step not yet completed. The
/// lowest-ranked step name wins, and among schedules proposing it the latest
/// as-of date governs. Returns `Ok(None)` when nothing applies or every
/// schedule is exhausted.
///
/// # Errors
/// Returns [`KernelError::NotFound`] when the item or a source schedule is missing and
/// [`KernelError::Validation`] when period arithmetic overflows.
pub fn resolve_next_action(
    plan: &FilePlan,
    lifecycle: &DispositionLifecycle,
    computed_at: OffsetDateTime,
) -> Result<Option<NextDispositionAction>, KernelError> {
    let item = plan.require_node(lifecycle.item_id)?;
    if item.is_destroyed() {
        return Ok(None);
    }

    let completed = lifecycle.completed_names();
    let sources = plan.schedule_sources(item.node_id);
    let source_count = sources.len();
    let mut proposals = Vec::new();
    let mut exhausted = Vec::new();
    for source in sources {
        let schedule = plan.schedule(source.schedule_id).ok_or_else(|| {
            KernelError::NotFound(format!("schedule {}", source.schedule_id))
        })?;
        match schedule.first_pending(&completed) {
            Some((position, step)) => {
                let (as_of_state, as_of) = compute_as_of(plan, item, lifecycle, step)?;
                proposals.push(Proposal { source, position, step, as_of_state, as_of });
            }
            None => exhausted.push(source),
        }
    }

    let Some((_, _, chosen)) = proposals
        .iter()
        .map(|proposal| (proposal.step.name.rank(), proposal.position, proposal.step.name))
        .min()
    else {
        return Ok(None);
    };

    let (mut contributors, mut deferred): (Vec<Proposal<'_>>, Vec<Proposal<'_>>) =
        proposals.into_iter().partition(|proposal| proposal.step.name == chosen);
    contributors.sort_by(governance_order);
    deferred.sort_by_key(|proposal| {
        (proposal.step.name.rank(), proposal.position, proposal.source.schedule_id)
    });
    exhausted.sort_by_key(|source| source.schedule_id);

    let Some(governing) = contributors.first() else {
        return Ok(None);
    };

    let (as_of_state, as_of) = if contributors
        .iter()
        .any(|proposal| proposal.as_of_state == AsOfState::AwaitingAnchor)
    {
        (AsOfState::AwaitingAnchor, None)
    } else if let Some(latest) = contributors.iter().filter_map(|proposal| proposal.as_of).max() {
        (AsOfState::Scheduled, Some(latest))
    } else {
        (AsOfState::Unscheduled, None)
    };

    let mut events: BTreeMap<String, EventRequirement> = BTreeMap::new();
    for proposal in &contributors {
        for event in &proposal.step.events {
            let entry = events.entry(event.clone()).or_insert_with(|| {
                let completion = lifecycle.pending_events.get(event);
                EventRequirement {
                    event_name: event.clone(),
                    required_by: Vec::new(),
                    completed_at: completion.map(|done| done.completed_at),
                    completed_by: completion.map(|done| done.completed_by.clone()),
                }
            });
            entry.required_by.push(proposal.source.schedule_id);
        }
    }
    for requirement in events.values_mut() {
        requirement.required_by.sort();
    }

    let mut candidates = Vec::with_capacity(source_count);
    for (index, proposal) in contributors.iter().enumerate() {
        let reason = if index == 0 {
            format!("governs {chosen}: as_of {} is the latest contribution", proposal.as_of_label())
        } else {
            format!(
                "contributes to {chosen}: as_of {} does not extend past {}",
                proposal.as_of_label(),
                governing.as_of_label()
            )
        };
        candidates.push(proposal.candidate(true, vec![reason]));
    }
    for proposal in &deferred {
        candidates.push(proposal.candidate(
            false,
            vec![format!("deferred: proposes {} which runs after {chosen}", proposal.step.name)],
        ));
    }
    for source in &exhausted {
        candidates.push(ScheduleCandidate {
            rank: 0,
            schedule_id: source.schedule_id,
            container_id: source.container_id,
            primary: source.primary,
            definition_id: None,
            step_name: None,
            position: None,
            period: None,
            as_of: None,
            as_of_state: None,
            events: Vec::new(),
            eligible_on_first_complete_event: false,
            why: CandidateWhy {
                included: false,
                reasons: vec!["all steps completed".to_string()],
            },
        });
    }
    for (index, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = index + 1;
    }

    let mut ordering_trace = vec![
        format!("sources={source_count} exhausted={}", exhausted.len()),
        format!("next step {chosen} chosen by action rank then position"),
    ];
    ordering_trace.extend(candidates.iter().map(|candidate| {
        format!(
            "#{} schedule={} via={} primary={} :: {}",
            candidate.rank,
            candidate.schedule_id,
            candidate.container_id,
            candidate.primary,
            candidate.why.reasons.join("; ")
        )
    }));

    Ok(Some(NextDispositionAction {
        item_id: item.node_id,
        step_name: chosen,
        position: governing.position,
        governing_schedule_id: governing.source.schedule_id,
        governing_definition_id: governing.step.definition_id,
        as_of,
        as_of_state,
        events: events.into_values().collect(),
        candidates,
        determinism: DeterminismMetadata {
            ruleset_version: RULESET_VERSION.to_string(),
            tie_breakers: default_tie_breakers(),
        },
        ordering_trace,
        computed_at,
    }))
}

/// Bring an item's lifecycle in line with the current plan.
///
/// Items that become subject to a schedule get a fresh lifecycle. Items that lose
/// every schedule keep their history with no next action. Destroyed items are
/// returned unchanged.
///
/// # Errors
/// Propagates errors from [`resolve_next_action`].
pub fn refresh_lifecycle(
    plan: &FilePlan,
    existing: Option<DispositionLifecycle>,
    item_id: NodeId,
    now: OffsetDateTime,
) -> Result<Option<DispositionLifecycle>, KernelError> {
    let item = plan.require_node(item_id)?;
    if item.is_destroyed() {
        return Ok(existing);
    }

    let mut lifecycle = match existing {
        Some(lifecycle) => lifecycle,
        None if !plan.schedule_sources(item_id).is_empty() => DispositionLifecycle::new(item_id, now),
        None => return Ok(None),
    };
    lifecycle.next_action = resolve_next_action(plan, &lifecycle, now)?;
    lifecycle.updated_at = now;
    Ok(Some(lifecycle))
}

/// Record completion of an event required by the pending step.
///
/// # Errors
/// Returns [`KernelError::Validation`] when there is no pending step, the step does not
/// require the event, or the event has already been completed.
pub fn complete_event(
    plan: &FilePlan,
    lifecycle: &mut DispositionLifecycle,
    event_name: &str,
    completed_at: OffsetDateTime,
    actor: &str,
) -> Result<(), KernelError> {
    let Some(next) = &lifecycle.next_action else {
        return Err(KernelError::Validation(format!(
            "item {} has no pending disposition step",
            lifecycle.item_id
        )));
    };
    if !next.requires_event(event_name) {
        return Err(KernelError::Validation(format!(
            "event {event_name} is not required by pending step {}",
            next.step_name
        )));
    }
    if lifecycle.pending_events.contains_key(event_name) {
        return Err(KernelError::Validation(format!(
            "event {event_name} is already completed"
        )));
    }

    lifecycle.pending_events.insert(
        event_name.to_string(),
        EventCompletion {
            event_name: event_name.to_string(),
            completed_at,
            completed_by: actor.to_string(),
        },
    );
    lifecycle.next_action = resolve_next_action(plan, lifecycle, completed_at)?;
    lifecycle.updated_at = completed_at;
    Ok(())
}

/// Withdraw a previously completed event of the pending step.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the event has not been completed.
pub fn undo_event(
    plan: &FilePlan,
    lifecycle: &mut DispositionLifecycle,
    event_name: &str,
    undone_at: OffsetDateTime,
) -> Result<(), KernelError> {
    if lifecycle.pending_events.remove(event_name).is_none() {
        return Err(KernelError::Validation(format!(
            "event {event_name} has not been completed"
        )));
    }
    lifecycle.next_action = resolve_next_action(plan, lifecycle, undone_at)?;
    lifecycle.updated_at = undone_at;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExecuteStepRequest {
    pub step_name: DispositionActionName,
    #[serde(with = "time::serde::rfc3339")]
    pub executed_at: OffsetDateTime,
    pub actor: String,
    pub enforce_eligibility: bool,
    pub check_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Executed {
        item_id: NodeId,
        step_name: DispositionActionName,
        #[serde(with = "time::serde::rfc3339")]
        completed_at: OffsetDateTime,
        affected_nodes: Vec<NodeId>,
    },
    Skipped {
        item_id: NodeId,
        step_name: DispositionActionName,
        reason: String,
    },
}

fn check_guards(
    plan: &FilePlan,
    lifecycle: &DispositionLifecycle,
    request: &ExecuteStepRequest,
) -> Result<(NextDispositionAction, DispositionActionDefinition), String> {
    let item_id = lifecycle.item_id;
    let Some(item) = plan.node(item_id) else {
        return Err(format!("item {item_id} does not exist"));
    };
    if item.is_destroyed() {
        return Err(format!("item {item_id} is destroyed"));
    }
    let Some(next) = &lifecycle.next_action else {
        return Err(format!("item {item_id} has no pending disposition step"));
    };
    if next.step_name != request.step_name {
        return Err(format!(
            "pending step is {}, not {}",
            next.step_name, request.step_name
        ));
    }
    if item.kind == NodeKind::Record && item.declared_at.is_none() {
        return Err(format!(
            "record {item_id} MUST be declared before {}",
            request.step_name
        ));
    }
    let Some((_, definition)) = plan
        .schedule(next.governing_schedule_id)
        .and_then(|schedule| schedule.step(next.governing_definition_id))
    else {
        return Err(format!(
            "governing definition {} no longer exists",
            next.governing_definition_id
        ));
    };
    if request.enforce_eligibility {
        let eligibility = next.eligibility(request.executed_at);
        if !eligibility.eligible {
            return Err(format!(
                "step {} is not eligible: {}",
                request.step_name,
                eligibility.reasons.join("; ")
            ));
        }
    }
    Ok((next.clone(), definition.clone()))
}

fn mark_destroyed(node: &mut FilePlanNode, ghost: bool) {
    node.state = DispositionState::Destroyed;
    if !ghost {
        node.properties.clear();
    }
}

fn apply_effects(
    plan: &mut FilePlan,
    item_id: NodeId,
    definition: &DispositionActionDefinition,
    at: OffsetDateTime,
) -> Result<Vec<NodeId>, KernelError> {
    let kind = plan.require_node(item_id)?.kind;
    let cascade = if kind == NodeKind::Folder { plan.records_in_folder(item_id) } else { Vec::new() };
    let mut affected = vec![item_id];

    match definition.name {
        DispositionActionName::Cutoff => {
            if let Some(item) = plan.node_mut(item_id) {
                item.cut_off_at = Some(at);
                if item.kind == NodeKind::Folder {
                    item.closed_at.get_or_insert(at);
                }
            }
            for record_id in cascade {
                if let Some(record) = plan.node_mut(record_id) {
                    if record.cut_off_at.is_none() {
                        record.cut_off_at = Some(at);
                        affected.push(record_id);
                    }
                }
            }
        }
        DispositionActionName::Retain => {}
        DispositionActionName::Transfer | DispositionActionName::Accession => {
            if let Some(item) = plan.node_mut(item_id) {
                item.state = if definition.name == DispositionActionName::Transfer {
                    DispositionState::Transferred
                } else {
                    DispositionState::Accessioned
                };
                item.location.clone_from(&definition.location);
            }
        }
        DispositionActionName::Destroy => {
            if let Some(item) = plan.node_mut(item_id) {
                mark_destroyed(item, definition.ghost_on_destroy);
            }
            for record_id in cascade {
                if let Some(record) = plan.node_mut(record_id) {
                    mark_destroyed(record, definition.ghost_on_destroy);
                    affected.push(record_id);
                }
            }
        }
    }
    Ok(affected)
}

/// Execute the pending disposition step of an item.
///
/// Guards run before anything changes. A failed guard returns
/// [`KernelError::Guard`] when `check_errors` is set and a
/// [`StepOutcome::Skipped`] otherwise; neither mutates `plan` or `lifecycle`.
///
/// # Errors
/// Returns [`KernelError::Validation`] for a blank actor and [`KernelError::Guard`]
/// for guard failures under `check_errors`.
pub fn execute_step(
    plan: &mut FilePlan,
    lifecycle: &mut DispositionLifecycle,
    request: &ExecuteStepRequest,
) -> Result<StepOutcome, KernelError> {
    if request.actor.trim().is_empty() {
        return Err(KernelError::Validation(
            "actor MUST be provided for every write".to_string(),
        ));
    }

    let (next, definition) = match check_guards(plan, lifecycle, request) {
        Ok(passed) => passed,
        Err(reason) if request.check_errors => return Err(KernelError::Guard(reason)),
        Err(reason) => {
            return Ok(StepOutcome::Skipped {
                item_id: lifecycle.item_id,
                step_name: request.step_name,
                reason,
            })
        }
    };

    let closed_folder = definition.name == DispositionActionName::Cutoff
        && plan.node(lifecycle.item_id).is_some_and(FilePlanNode::is_open_folder);
    let mut staged_plan = plan.clone();
    let mut staged = lifecycle.clone();
    let affected_nodes =
        apply_effects(&mut staged_plan, staged.item_id, &definition, request.executed_at)?;

    let events = std::mem::take(&mut staged.pending_events).into_values().collect();
    staged.history.push(CompletedStep {
        name: definition.name,
        schedule_id: next.governing_schedule_id,
        definition_id: definition.definition_id,
        as_of: next.as_of,
        completed_at: request.executed_at,
        completed_by: request.actor.clone(),
        events,
        closed_folder,
    });
    staged.next_action = resolve_next_action(&staged_plan, &staged, request.executed_at)?;
    staged.updated_at = request.executed_at;

    *plan = staged_plan;
    *lifecycle = staged;
    Ok(StepOutcome::Executed {
        item_id: lifecycle.item_id,
        step_name: definition.name,
        completed_at: request.executed_at,
        affected_nodes,
    })
}

/// Reverse the most recent cutoff of an item. A folder the cutoff closed is
/// reopened; one that was already closed stays closed.
///
/// # Errors
/// Returns [`KernelError::Validation`] unless the last completed step is a cutoff on a
/// live item.
pub fn undo_cut_off(
    plan: &mut FilePlan,
    lifecycle: &mut DispositionLifecycle,
    undone_at: OffsetDateTime,
) -> Result<Vec<NodeId>, KernelError> {
    let item = plan.require_node(lifecycle.item_id)?;
    if item.is_destroyed() {
        return Err(KernelError::Validation(format!(
            "destroyed item {} MUST NOT be modified",
            item.node_id
        )));
    }
    let Some(last) = lifecycle.last_completed() else {
        return Err(KernelError::Validation(
            "undo cut-off MUST follow a completed cutoff".to_string(),
        ));
    };
    if last.name != DispositionActionName::Cutoff {
        return Err(KernelError::Validation(format!(
            "undo cut-off MUST follow a completed cutoff; last step is {}",
            last.name
        )));
    }
    let cut_at = last.completed_at;
    let reopen = last.closed_folder;
    let cascade = if item.kind == NodeKind::Folder {
        plan.records_in_folder(item.node_id)
    } else {
        Vec::new()
    };

    let mut staged_plan = plan.clone();
    let mut staged = lifecycle.clone();
    let mut affected = vec![staged.item_id];
    if let Some(node) = staged_plan.node_mut(staged.item_id) {
        node.cut_off_at = None;
        if reopen {
            node.closed_at = None;
        }
    }
    for record_id in cascade {
        if let Some(record) = staged_plan.node_mut(record_id) {
            if record.cut_off_at == Some(cut_at) {
                record.cut_off_at = None;
                affected.push(record_id);
            }
        }
    }

    if let Some(undone) = staged.history.pop() {
        for completion in undone.events {
            staged.pending_events.insert(completion.event_name.clone(), completion);
        }
    }
    staged.next_action = resolve_next_action(&staged_plan, &staged, undone_at)?;
    staged.updated_at = undone_at;

    *plan = staged_plan;
    *lifecycle = staged;
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::datetime;
    use time::Duration;
    use ulid::Ulid;

    use super::*;
    use crate::file_plan::RecordLink;
    use crate::period::Period;
    use crate::schedule::{DispositionSchedule, StepDefinitionPatch};
    use crate::ScheduleId;

    const T0: OffsetDateTime = datetime!(2024-01-10 09:00 UTC);

    struct Fixture {
        plan: FilePlan,
    }

    impl Fixture {
        fn new() -> Self {
            Self { plan: FilePlan::new() }
        }

        fn add(&mut self, kind: NodeKind, name: &str, parent: Option<NodeId>) -> NodeId {
            let node = FilePlanNode::new(kind, name, parent, T0);
            let node_id = node.node_id;
            if let Err(err) = self.plan.add_node(node) {
                panic!("node {name} should be added: {err}");
            }
            node_id
        }

        fn schedule(
            &mut self,
            container_id: NodeId,
            record_level: bool,
            steps: Vec<DispositionActionDefinition>,
        ) -> ScheduleId {
            self.schedule_with_id(ScheduleId::new(), container_id, record_level, steps)
        }

        fn schedule_with_id(
            &mut self,
            schedule_id: ScheduleId,
            container_id: NodeId,
            record_level: bool,
            steps: Vec<DispositionActionDefinition>,
        ) -> ScheduleId {
            let schedule = DispositionSchedule {
                schedule_id,
                container_id,
                authority: "authority".to_string(),
                instructions: "instructions".to_string(),
                record_level,
                steps,
                created_at: T0,
            };
            let schedule_id = schedule.schedule_id;
            if let Err(err) = self.plan.attach_schedule(schedule) {
                panic!("schedule should attach: {err}");
            }
            schedule_id
        }

        fn record(&mut self, folder: NodeId, name: &str) -> NodeId {
            let record = self.add(NodeKind::Record, name, Some(folder));
            if let Err(err) = self.plan.declare_record(record, T0) {
                panic!("record should declare: {err}");
            }
            record
        }

        fn link(&mut self, record_id: NodeId, container_id: NodeId) {
            let link = RecordLink {
                record_id,
                container_id,
                linked_at: T0,
                linked_by: "tester".to_string(),
            };
            if let Err(err) = self.plan.link_record(link) {
                panic!("link should be accepted: {err}");
            }
        }

        fn lifecycle(&self, item_id: NodeId) -> DispositionLifecycle {
            match refresh_lifecycle(&self.plan, None, item_id, T0) {
                Ok(Some(lifecycle)) => lifecycle,
                Ok(None) => panic!("item should be subject to disposition"),
                Err(err) => panic!("lifecycle should initialise: {err}"),
            }
        }
    }

    fn refresh(plan: &FilePlan, lifecycle: DispositionLifecycle, now: OffsetDateTime) -> DispositionLifecycle {
        let item_id = lifecycle.item_id;
        match refresh_lifecycle(plan, Some(lifecycle), item_id, now) {
            Ok(Some(lifecycle)) => lifecycle,
            Ok(None) => panic!("existing lifecycle should be kept"),
            Err(err) => panic!("refresh should succeed: {err}"),
        }
    }

    fn cutoff() -> DispositionActionDefinition {
        DispositionActionDefinition::new(DispositionActionName::Cutoff, Period::Immediately)
    }

    fn destroy(period: Period) -> DispositionActionDefinition {
        DispositionActionDefinition::new(DispositionActionName::Destroy, period)
    }

    fn request(step_name: DispositionActionName, at: OffsetDateTime) -> ExecuteStepRequest {
        ExecuteStepRequest {
            step_name,
            executed_at: at,
            actor: "records-officer".to_string(),
            enforce_eligibility: true,
            check_errors: true,
        }
    }

    fn execute(fixture: &mut Fixture, lifecycle: &mut DispositionLifecycle, step: DispositionActionName, at: OffsetDateTime) {
        match execute_step(&mut fixture.plan, lifecycle, &request(step, at)) {
            Ok(StepOutcome::Executed { .. }) => {}
            other => panic!("{step} should execute, got {other:?}"),
        }
    }

    fn next(lifecycle: &DispositionLifecycle) -> &NextDispositionAction {
        match &lifecycle.next_action {
            Some(next) => next,
            None => panic!("item {} should have a next action", lifecycle.item_id),
        }
    }

    /// Two categories with record-level schedules; the record is filed in the first
    /// and linked into the second.
    fn linked_pair(
        primary_steps: Vec<DispositionActionDefinition>,
        linked_steps: Vec<DispositionActionDefinition>,
    ) -> (Fixture, NodeId, NodeId, ScheduleId, ScheduleId) {
        let mut fixture = Fixture::new();
        let cat_a = fixture.add(NodeKind::Category, "a", None);
        let cat_b = fixture.add(NodeKind::Category, "b", None);
        let schedule_a = fixture.schedule(cat_a, true, primary_steps);
        let schedule_b = fixture.schedule(cat_b, true, linked_steps);
        let folder_a = fixture.add(NodeKind::Folder, "fa", Some(cat_a));
        let folder_b = fixture.add(NodeKind::Folder, "fb", Some(cat_b));
        let record = fixture.record(folder_a, "contract");
        fixture.link(record, folder_b);
        (fixture, record, folder_b, schedule_a, schedule_b)
    }

    // Test IDs: TENG-001
    #[test]
    fn later_linked_schedule_governs_destroy_date() {
        let (mut fixture, record, _, schedule_a, schedule_b) = linked_pair(
            vec![cutoff(), destroy(Period::Months(1))],
            vec![cutoff(), destroy(Period::Years(1))],
        );
        let mut lifecycle = fixture.lifecycle(record);
        assert_eq!(next(&lifecycle).step_name, DispositionActionName::Cutoff);
        assert_eq!(next(&lifecycle).governing_schedule_id, schedule_a);

        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        let action = next(&lifecycle);
        assert_eq!(action.step_name, DispositionActionName::Destroy);
        assert_eq!(action.governing_schedule_id, schedule_b);
        assert_eq!(action.as_of, Some(datetime!(2025-01-10 09:00 UTC)));
        assert_eq!(action.as_of_state, AsOfState::Scheduled);
        assert_eq!(action.contributors().count(), 2);
    }

    // Test IDs: TENG-002
    #[test]
    fn unlinking_the_governing_schedule_restores_the_earlier_date() {
        let (mut fixture, record, folder_b, _, schedule_b) = linked_pair(
            vec![cutoff(), destroy(Period::Months(1))],
            vec![cutoff(), destroy(Period::Years(1))],
        );
        let mut lifecycle = fixture.lifecycle(record);
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        assert_eq!(next(&lifecycle).governing_schedule_id, schedule_b);

        if let Err(err) = fixture.plan.unlink_record(record, folder_b) {
            panic!("unlink should succeed: {err}");
        }
        let lifecycle = refresh(&fixture.plan, lifecycle, T0);
        assert_eq!(next(&lifecycle).as_of, Some(datetime!(2024-02-10 09:00 UTC)));
    }

    // Test IDs: TENG-003
    #[test]
    fn unlinking_revokes_destroy_when_the_remaining_schedule_has_none() {
        let (mut fixture, record, folder_b, _, _) =
            linked_pair(vec![cutoff()], vec![cutoff(), destroy(Period::Immediately)]);
        let mut lifecycle = fixture.lifecycle(record);
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);

        let action = next(&lifecycle);
        assert_eq!(action.step_name, DispositionActionName::Destroy);
        assert!(action.eligibility(T0).eligible);
        assert!(action
            .candidates
            .iter()
            .any(|candidate| candidate.why.reasons == vec!["all steps completed".to_string()]));

        if let Err(err) = fixture.plan.unlink_record(record, folder_b) {
            panic!("unlink should succeed: {err}");
        }
        let lifecycle = refresh(&fixture.plan, lifecycle, T0);
        assert!(lifecycle.next_action.is_none());
        assert_eq!(lifecycle.history.len(), 1);
    }

    // Test IDs: TENG-004
    #[test]
    fn moving_a_subcategory_under_a_longer_schedule_pushes_as_of_later() {
        let mut fixture = Fixture::new();
        let p1 = fixture.add(NodeKind::Category, "p1", None);
        let p2 = fixture.add(NodeKind::Category, "p2", None);
        fixture.schedule(
            p1,
            true,
            vec![cutoff(), destroy(Period::Months(1)).with_anchor(PeriodAnchor::CutOff)],
        );
        let long = fixture.schedule(
            p2,
            true,
            vec![cutoff(), destroy(Period::Years(1)).with_anchor(PeriodAnchor::CutOff)],
        );
        let sub = fixture.add(NodeKind::Category, "sub", Some(p1));
        let folder = fixture.add(NodeKind::Folder, "cases", Some(sub));
        let record = fixture.record(folder, "case-1");

        let mut lifecycle = fixture.lifecycle(record);
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        let before = next(&lifecycle).as_of;
        assert_eq!(before, Some(datetime!(2024-02-10 09:00 UTC)));

        if let Err(err) = fixture.plan.move_node(sub, p2) {
            panic!("move should succeed: {err}");
        }
        assert!(fixture.plan.affected_items(sub).contains(&record));
        let lifecycle = refresh(&fixture.plan, lifecycle, T0);
        let after = next(&lifecycle);
        assert_eq!(after.governing_schedule_id, long);
        assert_eq!(after.as_of, Some(datetime!(2025-01-10 09:00 UTC)));
        assert!(after.as_of > before);
    }

    // Test IDs: TENG-005
    #[test]
    fn editing_a_period_shifts_as_of_by_the_delta_once_recomputed() {
        let mut fixture = Fixture::new();
        let category = fixture.add(NodeKind::Category, "c", None);
        let destroy_step = destroy(Period::Days(30));
        let definition_id = destroy_step.definition_id;
        let schedule_id = fixture.schedule(category, true, vec![cutoff(), destroy_step]);
        let folder = fixture.add(NodeKind::Folder, "f", Some(category));
        let record = fixture.record(folder, "r");

        let mut lifecycle = fixture.lifecycle(record);
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        let stored = lifecycle.clone();
        let before = next(&stored).as_of;

        let Some(step) = fixture.plan.schedule_mut(schedule_id).and_then(|s| s.step_mut(definition_id)) else {
            panic!("destroy step should exist");
        };
        let changed = step.apply_patch(&StepDefinitionPatch {
            period: Some(Period::Days(45)),
            ..StepDefinitionPatch::default()
        });
        assert_eq!(changed, vec!["period".to_string()]);
        assert_eq!(next(&stored).as_of, before);

        let published = refresh(&fixture.plan, stored, T0 + Duration::hours(1));
        let (Some(before), Some(after)) = (before, next(&published).as_of) else {
            panic!("both as_of dates should be scheduled");
        };
        assert_eq!(after - before, Duration::days(15));
    }

    // Test IDs: TENG-006
    #[test]
    fn guard_failures_leave_the_record_untouched() {
        let mut fixture = Fixture::new();
        let category = fixture.add(NodeKind::Category, "c", None);
        fixture.schedule(category, true, vec![cutoff(), destroy(Period::Years(1))]);
        let folder = fixture.add(NodeKind::Folder, "f", Some(category));
        let record = fixture.add(NodeKind::Record, "undeclared", Some(folder));
        let mut lifecycle = fixture.lifecycle(record);
        let snapshot = lifecycle.clone();

        let result = execute_step(
            &mut fixture.plan,
            &mut lifecycle,
            &request(DispositionActionName::Cutoff, T0),
        );
        assert!(matches!(result, Err(KernelError::Guard(reason)) if reason.contains("MUST be declared")));
        assert_eq!(lifecycle, snapshot);
        assert_eq!(fixture.plan.node(record).and_then(|node| node.cut_off_at), None);

        let mut lenient = request(DispositionActionName::Cutoff, T0);
        lenient.check_errors = false;
        let outcome = execute_step(&mut fixture.plan, &mut lifecycle, &lenient);
        assert!(matches!(outcome, Ok(StepOutcome::Skipped { .. })));
        assert_eq!(lifecycle, snapshot);
        assert_eq!(fixture.plan.node(record).and_then(|node| node.cut_off_at), None);

        let wrong_step = execute_step(
            &mut fixture.plan,
            &mut lifecycle,
            &request(DispositionActionName::Destroy, T0),
        );
        assert!(matches!(wrong_step, Err(KernelError::Guard(reason)) if reason.contains("pending step is cutoff")));
    }

    // Test IDs: TENG-007
    #[test]
    fn events_union_across_contributors_gates_eligibility() {
        let (mut fixture, record, _, _, _) = linked_pair(
            vec![cutoff().with_events(&["case_closed"])],
            vec![cutoff().with_events(&["audit_complete"])],
        );
        let mut lifecycle = fixture.lifecycle(record);
        let action = next(&lifecycle);
        let names: Vec<&str> = action.events.iter().map(|event| event.event_name.as_str()).collect();
        assert_eq!(names, vec!["audit_complete", "case_closed"]);
        assert!(!action.eligibility(T0).eligible);

        assert_eq!(complete_event(&fixture.plan, &mut lifecycle, "case_closed", T0, "clerk"), Ok(()));
        assert!(!next(&lifecycle).eligibility(T0).eligible);
        assert!(matches!(
            complete_event(&fixture.plan, &mut lifecycle, "case_closed", T0, "clerk"),
            Err(KernelError::Validation(_))
        ));
        assert!(matches!(
            complete_event(&fixture.plan, &mut lifecycle, "unrelated", T0, "clerk"),
            Err(KernelError::Validation(_))
        ));

        assert_eq!(complete_event(&fixture.plan, &mut lifecycle, "audit_complete", T0, "clerk"), Ok(()));
        assert!(next(&lifecycle).eligibility(T0).eligible);

        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        assert_eq!(lifecycle.history[0].events.len(), 2);
        assert!(lifecycle.pending_events.is_empty());
    }

    // Test IDs: TENG-008
    #[test]
    fn unset_anchors_await_and_reschedule_when_known() {
        let mut fixture = Fixture::new();
        let category = fixture.add(NodeKind::Category, "c", None);
        fixture.schedule(
            category,
            true,
            vec![DispositionActionDefinition::new(DispositionActionName::Cutoff, Period::Months(6))
                .with_anchor(PeriodAnchor::Property("review_date".to_string()))],
        );
        let folder = fixture.add(NodeKind::Folder, "f", Some(category));
        let record = fixture.record(folder, "r");
        let lifecycle = fixture.lifecycle(record);
        assert_eq!(next(&lifecycle).as_of_state, AsOfState::AwaitingAnchor);
        assert_eq!(next(&lifecycle).as_of, None);

        let review = datetime!(2024-03-01 00:00 UTC);
        if let Err(err) = fixture.plan.set_property(record, "review_date", review) {
            panic!("property should set: {err}");
        }
        let lifecycle = refresh(&fixture.plan, lifecycle, T0);
        assert_eq!(next(&lifecycle).as_of, Some(datetime!(2024-09-01 00:00 UTC)));
    }

    // Test IDs: TENG-009
    #[test]
    fn folder_cutoff_and_destroy_cascade_to_records() {
        let mut fixture = Fixture::new();
        let category = fixture.add(NodeKind::Category, "c", None);
        let mut destroy_step = destroy(Period::Immediately);
        destroy_step.ghost_on_destroy = false;
        fixture.schedule(category, false, vec![cutoff(), destroy_step]);
        let folder = fixture.add(NodeKind::Folder, "f", Some(category));
        let record = fixture.record(folder, "r");
        if let Err(err) = fixture.plan.set_property(record, "review_date", T0) {
            panic!("property should set: {err}");
        }

        assert!(refresh_lifecycle(&fixture.plan, None, record, T0).ok().flatten().is_none());
        let mut lifecycle = fixture.lifecycle(folder);
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        let folder_node = fixture.plan.node(folder).cloned();
        assert_eq!(folder_node.as_ref().and_then(|node| node.closed_at), Some(T0));
        assert_eq!(fixture.plan.node(record).and_then(|node| node.cut_off_at), Some(T0));

        execute(&mut fixture, &mut lifecycle, DispositionActionName::Destroy, T0);
        let Some(record_node) = fixture.plan.node(record) else {
            panic!("record should still exist as a destroyed node");
        };
        assert!(record_node.is_destroyed());
        assert!(record_node.properties.is_empty());
        assert!(lifecycle.next_action.is_none());
    }

    // Test IDs: TENG-010
    #[test]
    fn undo_cut_off_restores_events_and_clears_stamps() {
        let mut fixture = Fixture::new();
        let category = fixture.add(NodeKind::Category, "c", None);
        fixture.schedule(
            category,
            true,
            vec![cutoff().with_events(&["case_closed"]), destroy(Period::Years(1))],
        );
        let folder = fixture.add(NodeKind::Folder, "f", Some(category));
        let record = fixture.record(folder, "r");
        let mut lifecycle = fixture.lifecycle(record);

        assert!(undo_cut_off(&mut fixture.plan, &mut lifecycle, T0).is_err());
        assert_eq!(complete_event(&fixture.plan, &mut lifecycle, "case_closed", T0, "clerk"), Ok(()));
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        assert_eq!(next(&lifecycle).step_name, DispositionActionName::Destroy);

        let affected = match undo_cut_off(&mut fixture.plan, &mut lifecycle, T0) {
            Ok(affected) => affected,
            Err(err) => panic!("undo should succeed: {err}"),
        };
        assert_eq!(affected, vec![record]);
        assert!(lifecycle.history.is_empty());
        assert!(lifecycle.pending_events.contains_key("case_closed"));
        assert_eq!(next(&lifecycle).step_name, DispositionActionName::Cutoff);
        assert_eq!(fixture.plan.node(record).and_then(|node| node.cut_off_at), None);
    }

    // Test IDs: TENG-011
    #[test]
    fn manual_steps_require_eligibility_bypass() {
        let mut fixture = Fixture::new();
        let category = fixture.add(NodeKind::Category, "c", None);
        fixture.schedule(
            category,
            true,
            vec![DispositionActionDefinition::new(DispositionActionName::Retain, Period::None)],
        );
        let folder = fixture.add(NodeKind::Folder, "f", Some(category));
        let record = fixture.record(folder, "r");
        let mut lifecycle = fixture.lifecycle(record);
        assert_eq!(next(&lifecycle).as_of_state, AsOfState::Unscheduled);

        let strict = execute_step(
            &mut fixture.plan,
            &mut lifecycle,
            &request(DispositionActionName::Retain, T0),
        );
        assert!(matches!(strict, Err(KernelError::Guard(_))));

        let mut manual = request(DispositionActionName::Retain, T0);
        manual.enforce_eligibility = false;
        let outcome = execute_step(&mut fixture.plan, &mut lifecycle, &manual);
        assert!(matches!(outcome, Ok(StepOutcome::Executed { .. })));
        assert!(lifecycle.next_action.is_none());
    }

    fn contributor_order(action: &NextDispositionAction) -> Vec<(ScheduleId, Option<AsOfState>)> {
        action
            .contributors()
            .map(|candidate| (candidate.schedule_id, candidate.as_of_state))
            .collect()
    }

    // Test IDs: TENG-013
    #[test]
    fn awaiting_contributor_withholds_as_of_until_its_anchor_is_set() {
        let mut fixture = Fixture::new();
        let cat_a = fixture.add(NodeKind::Category, "a", None);
        let cat_b = fixture.add(NodeKind::Category, "b", None);
        let scheduled = fixture.schedule(cat_a, true, vec![cutoff().with_events(&["case_closed"])]);
        let awaiting = fixture.schedule(
            cat_b,
            true,
            vec![DispositionActionDefinition::new(DispositionActionName::Cutoff, Period::Months(6))
                .with_anchor(PeriodAnchor::Property("review_date".to_string()))
                .with_events(&["audit_complete"])],
        );
        let folder_a = fixture.add(NodeKind::Folder, "fa", Some(cat_a));
        let folder_b = fixture.add(NodeKind::Folder, "fb", Some(cat_b));
        let record = fixture.record(folder_a, "contract");
        fixture.link(record, folder_b);

        let mut lifecycle = fixture.lifecycle(record);
        let action = next(&lifecycle);
        assert_eq!(action.as_of, None);
        assert_eq!(action.as_of_state, AsOfState::AwaitingAnchor);
        assert_eq!(action.governing_schedule_id, awaiting);
        assert_eq!(
            contributor_order(action),
            vec![
                (awaiting, Some(AsOfState::AwaitingAnchor)),
                (scheduled, Some(AsOfState::Scheduled)),
            ]
        );
        let events: Vec<(&str, &[ScheduleId])> = action
            .events
            .iter()
            .map(|event| (event.event_name.as_str(), event.required_by.as_slice()))
            .collect();
        assert_eq!(
            events,
            vec![("audit_complete", std::slice::from_ref(&awaiting)), ("case_closed", std::slice::from_ref(&scheduled))]
        );

        for event in ["case_closed", "audit_complete"] {
            assert_eq!(complete_event(&fixture.plan, &mut lifecycle, event, T0, "clerk"), Ok(()));
        }
        let far_future = T0 + Duration::days(3650);
        assert!(!next(&lifecycle).eligibility(far_future).eligible);

        if let Err(err) = fixture.plan.set_property(record, "review_date", datetime!(2024-03-01 00:00 UTC)) {
            panic!("property should set: {err}");
        }
        let lifecycle = refresh(&fixture.plan, lifecycle, T0);
        let action = next(&lifecycle);
        assert_eq!(action.as_of_state, AsOfState::Scheduled);
        assert_eq!(action.as_of, Some(datetime!(2024-09-01 00:00 UTC)));
        assert_eq!(action.governing_schedule_id, awaiting);
        assert!(action.events.iter().all(|event| event.completed_at.is_some()));
        assert!(action.eligibility(datetime!(2024-09-01 00:00 UTC)).eligible);
    }

    // Test IDs: TENG-014
    #[test]
    fn equal_as_of_goes_to_the_primary_parent_before_a_lower_schedule_id() {
        let mut fixture = Fixture::new();
        let cat_a = fixture.add(NodeKind::Category, "a", None);
        let cat_b = fixture.add(NodeKind::Category, "b", None);
        let primary = fixture.schedule_with_id(
            ScheduleId(Ulid(20)),
            cat_a,
            true,
            vec![cutoff(), destroy(Period::Years(1))],
        );
        let linked = fixture.schedule_with_id(
            ScheduleId(Ulid(10)),
            cat_b,
            true,
            vec![cutoff(), destroy(Period::Years(1))],
        );
        let folder_a = fixture.add(NodeKind::Folder, "fa", Some(cat_a));
        let folder_b = fixture.add(NodeKind::Folder, "fb", Some(cat_b));
        let record = fixture.record(folder_a, "contract");
        fixture.link(record, folder_b);

        let mut lifecycle = fixture.lifecycle(record);
        assert_eq!(next(&lifecycle).governing_schedule_id, primary);
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);

        let action = next(&lifecycle);
        assert_eq!(action.as_of, Some(datetime!(2025-01-10 09:00 UTC)));
        assert_eq!(action.governing_schedule_id, primary);
        assert_eq!(
            contributor_order(action),
            vec![(primary, Some(AsOfState::Scheduled)), (linked, Some(AsOfState::Scheduled))]
        );
    }

    // Test IDs: TENG-015
    #[test]
    fn equal_as_of_among_links_goes_to_the_lowest_schedule_id() {
        let mut fixture = Fixture::new();
        let unscheduled = fixture.add(NodeKind::Category, "inbox", None);
        let home = fixture.add(NodeKind::Folder, "inbox-2024", Some(unscheduled));
        let mut containers = Vec::new();
        let mut ids = Vec::new();
        for (name, raw_id) in [("x", 50_u128), ("y", 30), ("z", 40)] {
            let category = fixture.add(NodeKind::Category, name, None);
            ids.push(fixture.schedule_with_id(
                ScheduleId(Ulid(raw_id)),
                category,
                true,
                vec![cutoff(), destroy(Period::Months(18))],
            ));
            containers.push(fixture.add(NodeKind::Folder, &format!("{name}-cases"), Some(category)));
        }
        let record = fixture.record(home, "memo");
        for container in &containers {
            fixture.link(record, *container);
        }

        let mut lifecycle = fixture.lifecycle(record);
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        let action = next(&lifecycle);
        assert_eq!(action.governing_schedule_id, ids[1]);
        let order: Vec<ScheduleId> = contributor_order(action).into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
        assert!(action.contributors().all(|candidate| !candidate.primary));
    }

    // Test IDs: TENG-016
    #[test]
    fn undo_cut_off_reopens_only_folders_the_cutoff_closed() {
        let mut fixture = Fixture::new();
        let category = fixture.add(NodeKind::Category, "c", None);
        fixture.schedule(category, false, vec![cutoff(), destroy(Period::Years(1))]);
        let open = fixture.add(NodeKind::Folder, "open", Some(category));
        let closed = fixture.add(NodeKind::Folder, "closed", Some(category));
        let closed_at = datetime!(2024-01-05 12:00 UTC);
        if let Err(err) = fixture.plan.close_folder(closed, closed_at) {
            panic!("folder should close: {err}");
        }

        let mut open_lifecycle = fixture.lifecycle(open);
        execute(&mut fixture, &mut open_lifecycle, DispositionActionName::Cutoff, T0);
        assert_eq!(fixture.plan.node(open).and_then(|node| node.closed_at), Some(T0));
        assert!(open_lifecycle.history[0].closed_folder);

        let mut closed_lifecycle = fixture.lifecycle(closed);
        execute(&mut fixture, &mut closed_lifecycle, DispositionActionName::Cutoff, T0);
        assert!(!closed_lifecycle.history[0].closed_folder);

        for (folder, lifecycle) in [(open, &mut open_lifecycle), (closed, &mut closed_lifecycle)] {
            if let Err(err) = undo_cut_off(&mut fixture.plan, lifecycle, T0) {
                panic!("undo should succeed for {folder}: {err}");
            }
        }
        let open_node = fixture.plan.node(open).cloned();
        assert_eq!(open_node.as_ref().and_then(|node| node.closed_at), None);
        assert_eq!(open_node.as_ref().and_then(|node| node.cut_off_at), None);
        assert_eq!(fixture.plan.node(closed).and_then(|node| node.closed_at), Some(closed_at));
        assert_eq!(fixture.plan.node(closed).and_then(|node| node.cut_off_at), None);
    }

    /// A record filed in the first of four scheduled folders, not yet linked.
    fn unlinked_fan_out() -> (Fixture, NodeId, Vec<NodeId>) {
        let mut fixture = Fixture::new();
        let periods = [Period::Months(3), Period::Years(2), Period::Days(400), Period::Years(1)];
        let mut folders = Vec::new();
        for (index, period) in periods.iter().enumerate() {
            let category = fixture.add(NodeKind::Category, &format!("c{index}"), None);
            fixture.schedule(category, true, vec![cutoff(), destroy(*period)]);
            folders.push(fixture.add(NodeKind::Folder, &format!("f{index}"), Some(category)));
        }
        let record = fixture.record(folders[0], "r");
        (fixture, record, folders[1..].to_vec())
    }

    fn destroy_action_after_links(
        base: &Fixture,
        record: NodeId,
        link_order: &[NodeId],
    ) -> NextDispositionAction {
        let mut fixture = Fixture { plan: base.plan.clone() };
        for container in link_order {
            fixture.link(record, *container);
        }
        let mut lifecycle = fixture.lifecycle(record);
        execute(&mut fixture, &mut lifecycle, DispositionActionName::Cutoff, T0);
        next(&lifecycle).clone()
    }

    // Test IDs: TENG-012
    proptest! {
        #[test]
        fn property_selection_is_independent_of_link_order(order in Just(vec![0_usize, 1, 2]).prop_shuffle()) {
            let (base, record, secondary) = unlinked_fan_out();
            let permuted: Vec<NodeId> = order.iter().map(|index| secondary[*index]).collect();

            let reference = destroy_action_after_links(&base, record, &secondary);
            let shuffled = destroy_action_after_links(&base, record, &permuted);

            prop_assert_eq!(&shuffled, &reference);
            prop_assert_eq!(shuffled.as_of, Some(datetime!(2026-01-10 09:00 UTC)));
            prop_assert_eq!(shuffled.contributors().count(), 4);
        }
    }
}
