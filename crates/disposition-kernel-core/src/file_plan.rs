use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::schedule::{valid_property_name, DispositionSchedule};
use crate::{KernelError, NodeId, ScheduleId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Category,
    Folder,
    Record,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Folder => "folder",
            Self::Record => "record",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "category" => Some(Self::Category),
            "folder" => Some(Self::Folder),
            "record" => Some(Self::Record),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispositionState {
    #[default]
    Active,
    Transferred,
    Accessioned,
    Destroyed,
}

impl DispositionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Transferred => "transferred",
            Self::Accessioned => "accessioned",
            Self::Destroyed => "destroyed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "transferred" => Some(Self::Transferred),
            "accessioned" => Some(Self::Accessioned),
            "destroyed" => Some(Self::Destroyed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FilePlanNode {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub parent_id: Option<NodeId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub declared_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub closed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub cut_off_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub state: DispositionState,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(with = "crate::rfc3339_map", default)]
    pub properties: BTreeMap<String, OffsetDateTime>,
}

impl FilePlanNode {
    #[must_use]
    pub fn new(
        kind: NodeKind,
        name: &str,
        parent_id: Option<NodeId>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            node_id: NodeId::new(),
            kind,
            name: name.to_string(),
            parent_id,
            created_at,
            declared_at: None,
            closed_at: None,
            cut_off_at: None,
            state: DispositionState::Active,
            location: None,
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state == DispositionState::Destroyed
    }

    #[must_use]
    pub fn is_open_folder(&self) -> bool {
        self.kind == NodeKind::Folder && self.closed_at.is_none()
    }
}

/// Secondary filing of a record into another folder.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordLink {
    pub record_id: NodeId,
    pub container_id: NodeId,
    #[serde(with = "time::serde::rfc3339")]
    pub linked_at: OffsetDateTime,
    pub linked_by: String,
}

/// A schedule that applies to an item, and the parent it applies through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScheduleSource {
    pub schedule_id: ScheduleId,
    pub container_id: NodeId,
    pub primary: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FilePlan {
    nodes: BTreeMap<NodeId, FilePlanNode>,
    links: BTreeMap<(NodeId, NodeId), RecordLink>,
    schedules: BTreeMap<ScheduleId, DispositionSchedule>,
}

impl FilePlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a plan from persisted rows without re-running placement rules.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when a parent, link, or schedule references
    /// a node that is not part of the plan.
    pub fn from_parts(
        nodes: Vec<FilePlanNode>,
        links: Vec<RecordLink>,
        schedules: Vec<DispositionSchedule>,
    ) -> Result<Self, KernelError> {
        let mut plan = Self::new();
        for node in nodes {
            plan.nodes.insert(node.node_id, node);
        }
        for node in plan.nodes.values() {
            if let Some(parent_id) = node.parent_id {
                if !plan.nodes.contains_key(&parent_id) {
                    return Err(KernelError::Validation(format!(
                        "node {} references missing parent {parent_id}",
                        node.node_id
                    )));
                }
            }
        }
        for link in links {
            if !plan.nodes.contains_key(&link.record_id) || !plan.nodes.contains_key(&link.container_id)
            {
                return Err(KernelError::Validation(format!(
                    "link {} -> {} references a missing node",
                    link.record_id, link.container_id
                )));
            }
            plan.links.insert((link.record_id, link.container_id), link);
        }
        for schedule in schedules {
            if !plan.nodes.contains_key(&schedule.container_id) {
                return Err(KernelError::Validation(format!(
                    "schedule {} references missing container {}",
                    schedule.schedule_id, schedule.container_id
                )));
            }
            plan.schedules.insert(schedule.schedule_id, schedule);
        }
        Ok(plan)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FilePlanNode> {
        self.nodes.values()
    }

    pub fn links(&self) -> impl Iterator<Item = &RecordLink> {
        self.links.values()
    }

    pub fn schedules(&self) -> impl Iterator<Item = &DispositionSchedule> {
        self.schedules.values()
    }

    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&FilePlanNode> {
        self.nodes.get(&node_id)
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut FilePlanNode> {
        self.nodes.get_mut(&node_id)
    }

    /// # Errors
    /// Returns [`KernelError::NotFound`] when the node does not exist.
    pub fn require_node(&self, node_id: NodeId) -> Result<&FilePlanNode, KernelError> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| KernelError::NotFound(format!("node {node_id}")))
    }

    fn require_node_mut(&mut self, node_id: NodeId) -> Result<&mut FilePlanNode, KernelError> {
        self.nodes
            .get_mut(&node_id)
            .ok_or_else(|| KernelError::NotFound(format!("node {node_id}")))
    }

    fn require_live(&self, node_id: NodeId) -> Result<&FilePlanNode, KernelError> {
        let node = self.require_node(node_id)?;
        if node.is_destroyed() {
            return Err(KernelError::Validation(format!(
                "destroyed node {node_id} MUST NOT be modified"
            )));
        }
        Ok(node)
    }

    fn ensure_unique_sibling_name(
        &self,
        parent_id: Option<NodeId>,
        name: &str,
        except: Option<NodeId>,
    ) -> Result<(), KernelError> {
        let clash = self.nodes.values().any(|node| {
            node.parent_id == parent_id && node.name == name && Some(node.node_id) != except
        });
        if clash {
            return Err(KernelError::Validation(format!(
                "name {name} MUST be unique among siblings"
            )));
        }
        Ok(())
    }

    fn ensure_parent_accepts(
        &self,
        kind: NodeKind,
        parent_id: Option<NodeId>,
    ) -> Result<(), KernelError> {
        let parent = match parent_id {
            Some(parent_id) => Some(self.require_live(parent_id)?),
            None => None,
        };

        match (kind, parent) {
            (NodeKind::Category, None) => Ok(()),
            (NodeKind::Category, Some(parent)) if parent.kind == NodeKind::Category => Ok(()),
            (NodeKind::Folder, Some(parent)) if parent.kind == NodeKind::Category => Ok(()),
            (NodeKind::Record, Some(parent)) if parent.kind == NodeKind::Folder => {
                if parent.is_open_folder() {
                    Ok(())
                } else {
                    Err(KernelError::Validation(format!(
                        "folder {} MUST be open to accept records",
                        parent.node_id
                    )))
                }
            }
            (NodeKind::Category, Some(_)) => Err(KernelError::Validation(
                "categories MUST be nested under categories".to_string(),
            )),
            (NodeKind::Folder, _) => Err(KernelError::Validation(
                "folders MUST be filed under a category".to_string(),
            )),
            (NodeKind::Record, _) => Err(KernelError::Validation(
                "records MUST be filed under a folder".to_string(),
            )),
        }
    }

    /// Place a new node in the plan.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the name is blank or taken, the parent
    /// kind does not accept this node, or the node id already exists.
    pub fn add_node(&mut self, node: FilePlanNode) -> Result<(), KernelError> {
        if node.name.trim().is_empty() {
            return Err(KernelError::Validation("node name MUST be provided".to_string()));
        }
        if self.nodes.contains_key(&node.node_id) {
            return Err(KernelError::Validation(format!(
                "node {} already exists",
                node.node_id
            )));
        }
        self.ensure_parent_accepts(node.kind, node.parent_id)?;
        self.ensure_unique_sibling_name(node.parent_id, &node.name, None)?;
        self.nodes.insert(node.node_id, node);
        Ok(())
    }

    /// Move a node under a new parent.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for moves into the node's own subtree,
    /// into a parent that does not accept the node, or into a folder the record is
    /// already linked to.
    pub fn move_node(&mut self, node_id: NodeId, new_parent_id: NodeId) -> Result<(), KernelError> {
        let node = self.require_live(node_id)?;
        let (kind, name) = (node.kind, node.name.clone());

        if self.ancestors(new_parent_id).contains(&node_id) || new_parent_id == node_id {
            return Err(KernelError::Validation(format!(
                "node {node_id} MUST NOT move into its own subtree"
            )));
        }
        if kind == NodeKind::Record && self.links.contains_key(&(node_id, new_parent_id)) {
            return Err(KernelError::Validation(format!(
                "record {node_id} is already linked to {new_parent_id}; unlink before moving"
            )));
        }
        self.ensure_parent_accepts(kind, Some(new_parent_id))?;
        self.ensure_unique_sibling_name(Some(new_parent_id), &name, Some(node_id))?;

        self.require_node_mut(node_id)?.parent_id = Some(new_parent_id);
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when the node is not an undeclared record.
    pub fn declare_record(
        &mut self,
        record_id: NodeId,
        declared_at: OffsetDateTime,
    ) -> Result<(), KernelError> {
        let record = self.require_live(record_id)?;
        if record.kind != NodeKind::Record {
            return Err(KernelError::Validation(format!("node {record_id} is not a record")));
        }
        if record.declared_at.is_some() {
            return Err(KernelError::Validation(format!(
                "record {record_id} is already declared"
            )));
        }
        self.require_node_mut(record_id)?.declared_at = Some(declared_at);
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when the node is not an open folder.
    pub fn close_folder(
        &mut self,
        folder_id: NodeId,
        closed_at: OffsetDateTime,
    ) -> Result<(), KernelError> {
        let folder = self.require_live(folder_id)?;
        if !folder.is_open_folder() {
            return Err(KernelError::Validation(format!(
                "node {folder_id} MUST be an open folder"
            )));
        }
        self.require_node_mut(folder_id)?.closed_at = Some(closed_at);
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when the node is not a closed folder or the
    /// folder has already been cut off.
    pub fn reopen_folder(&mut self, folder_id: NodeId) -> Result<(), KernelError> {
        let folder = self.require_live(folder_id)?;
        if folder.kind != NodeKind::Folder || folder.closed_at.is_none() {
            return Err(KernelError::Validation(format!(
                "node {folder_id} MUST be a closed folder"
            )));
        }
        if folder.cut_off_at.is_some() {
            return Err(KernelError::Validation(format!(
                "folder {folder_id} is cut off and MUST NOT reopen"
            )));
        }
        self.require_node_mut(folder_id)?.closed_at = None;
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] for blank property names or destroyed nodes.
    pub fn set_property(
        &mut self,
        node_id: NodeId,
        name: &str,
        value: OffsetDateTime,
    ) -> Result<(), KernelError> {
        if !valid_property_name(name) {
            return Err(KernelError::Validation(format!(
                "property name MUST be non-empty without whitespace: {name:?}"
            )));
        }
        self.require_live(node_id)?;
        self.require_node_mut(node_id)?.properties.insert(name.to_string(), value);
        Ok(())
    }

    /// Link a record into a secondary folder.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] unless the record is live, the target is an
    /// open folder other than the primary one, and the link does not exist yet.
    pub fn link_record(&mut self, link: RecordLink) -> Result<(), KernelError> {
        let record = self.require_live(link.record_id)?;
        if record.kind != NodeKind::Record {
            return Err(KernelError::Validation(format!(
                "node {} is not a record",
                link.record_id
            )));
        }
        if record.parent_id == Some(link.container_id) {
            return Err(KernelError::Validation(
                "a record MUST NOT be linked to its primary folder".to_string(),
            ));
        }
        let container = self.require_live(link.container_id)?;
        if !container.is_open_folder() {
            return Err(KernelError::Validation(format!(
                "link target {} MUST be an open folder",
                link.container_id
            )));
        }
        if self.links.contains_key(&(link.record_id, link.container_id)) {
            return Err(KernelError::Validation(format!(
                "record {} is already linked to {}",
                link.record_id, link.container_id
            )));
        }
        self.links.insert((link.record_id, link.container_id), link);
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::NotFound`] when no such link exists and
    /// [`KernelError::Validation`] when the record is destroyed.
    pub fn unlink_record(
        &mut self,
        record_id: NodeId,
        container_id: NodeId,
    ) -> Result<RecordLink, KernelError> {
        self.require_live(record_id)?;
        self.links
            .remove(&(record_id, container_id))
            .ok_or_else(|| KernelError::NotFound(format!("link {record_id} -> {container_id}")))
    }

    /// Attach a validated schedule to a category.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the container is not a category, the
    /// category already owns a schedule, or the schedule fails validation.
    pub fn attach_schedule(&mut self, schedule: DispositionSchedule) -> Result<(), KernelError> {
        let container = self.require_live(schedule.container_id)?;
        if container.kind != NodeKind::Category {
            return Err(KernelError::Validation(
                "schedules MUST be attached to a category".to_string(),
            ));
        }
        if self.schedule_for_container(schedule.container_id).is_some() {
            return Err(KernelError::Validation(format!(
                "category {} already owns a schedule; schedules MUST NOT be replaced",
                schedule.container_id
            )));
        }
        if self.schedules.contains_key(&schedule.schedule_id) {
            return Err(KernelError::Validation(format!(
                "schedule {} already exists",
                schedule.schedule_id
            )));
        }
        schedule.validate()?;
        self.schedules.insert(schedule.schedule_id, schedule);
        Ok(())
    }

    #[must_use]
    pub fn schedule(&self, schedule_id: ScheduleId) -> Option<&DispositionSchedule> {
        self.schedules.get(&schedule_id)
    }

    pub fn schedule_mut(&mut self, schedule_id: ScheduleId) -> Option<&mut DispositionSchedule> {
        self.schedules.get_mut(&schedule_id)
    }

    #[must_use]
    pub fn schedule_for_container(&self, container_id: NodeId) -> Option<&DispositionSchedule> {
        self.schedules.values().find(|schedule| schedule.container_id == container_id)
    }

    /// Ancestors of a node, nearest first, excluding the node itself.
    #[must_use]
    pub fn ancestors(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(&node_id).and_then(|node| node.parent_id);
        while let Some(current) = cursor {
            if out.contains(&current) {
                break;
            }
            out.push(current);
            cursor = self.nodes.get(&current).and_then(|node| node.parent_id);
        }
        out
    }

    /// Schedule of the container itself or of its nearest ancestor that owns one.
    #[must_use]
    pub fn governing_schedule(&self, container_id: NodeId) -> Option<&DispositionSchedule> {
        std::iter::once(container_id)
            .chain(self.ancestors(container_id))
            .find_map(|candidate| self.schedule_for_container(candidate))
    }

    /// Records linked into `record_id` from secondary folders, ordered by container id.
    #[must_use]
    pub fn links_for_record(&self, record_id: NodeId) -> Vec<&RecordLink> {
        self.links
            .range((record_id, NodeId(ulid::Ulid::nil()))..)
            .take_while(|((record, _), _)| *record == record_id)
            .map(|(_, link)| link)
            .collect()
    }

    /// Schedules that apply to an item, primary parent first.
    ///
    /// Records only see record-level schedules and folders only folder-level ones.
    /// A schedule reachable through several parents is reported once.
    #[must_use]
    pub fn schedule_sources(&self, item_id: NodeId) -> Vec<ScheduleSource> {
        let Some(item) = self.nodes.get(&item_id) else {
            return Vec::new();
        };
        let Some(primary_parent) = item.parent_id else {
            return Vec::new();
        };

        let (parents, record_level) = match item.kind {
            NodeKind::Category => return Vec::new(),
            NodeKind::Folder => (vec![primary_parent], false),
            NodeKind::Record => {
                let mut parents = vec![primary_parent];
                parents.extend(self.links_for_record(item_id).iter().map(|link| link.container_id));
                (parents, true)
            }
        };

        let mut seen = BTreeSet::new();
        let mut sources = Vec::new();
        for (index, container_id) in parents.into_iter().enumerate() {
            let Some(schedule) = self.governing_schedule(container_id) else {
                continue;
            };
            if schedule.record_level != record_level || !seen.insert(schedule.schedule_id) {
                continue;
            }
            sources.push(ScheduleSource {
                schedule_id: schedule.schedule_id,
                container_id,
                primary: index == 0,
            });
        }
        sources
    }

    fn children_index(&self) -> BTreeMap<NodeId, Vec<NodeId>> {
        let mut children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for node in self.nodes.values() {
            if let Some(parent_id) = node.parent_id {
                children.entry(parent_id).or_default().push(node.node_id);
            }
        }
        children
    }

    /// Node ids of the subtree rooted at `root_id`, root first.
    #[must_use]
    pub fn subtree(&self, root_id: NodeId) -> Vec<NodeId> {
        if !self.nodes.contains_key(&root_id) {
            return Vec::new();
        }
        let children = self.children_index();
        let mut out = Vec::new();
        let mut stack = vec![root_id];
        while let Some(current) = stack.pop() {
            out.push(current);
            if let Some(kids) = children.get(&current) {
                stack.extend(kids.iter().rev().copied());
            }
        }
        out
    }

    /// Records filed directly in a folder.
    #[must_use]
    pub fn records_in_folder(&self, folder_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.parent_id == Some(folder_id) && node.kind == NodeKind::Record)
            .map(|node| node.node_id)
            .collect()
    }

    /// Folders and records whose schedules may change when `root_id` changes:
    /// everything beneath it plus records linked into its subtree.
    #[must_use]
    pub fn affected_items(&self, root_id: NodeId) -> Vec<NodeId> {
        let subtree = self.subtree(root_id);
        let members: BTreeSet<NodeId> = subtree.iter().copied().collect();
        let mut out = BTreeSet::new();
        for node_id in &subtree {
            if let Some(node) = self.nodes.get(node_id) {
                if node.kind != NodeKind::Category {
                    out.insert(*node_id);
                }
            }
        }
        for link in self.links.values() {
            if members.contains(&link.container_id) {
                out.insert(link.record_id);
            }
        }
        out.into_iter().collect()
    }

    /// Every folder or record that currently draws steps from `schedule_id`.
    #[must_use]
    pub fn items_governed_by(&self, schedule_id: ScheduleId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.kind != NodeKind::Category)
            .filter(|node| {
                self.schedule_sources(node.node_id)
                    .iter()
                    .any(|source| source.schedule_id == schedule_id)
            })
            .map(|node| node.node_id)
            .collect()
    }

    /// All nodes with every parent listed before its children.
    #[must_use]
    pub fn nodes_in_hierarchy_order(&self) -> Vec<&FilePlanNode> {
        let roots: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.parent_id.is_none())
            .map(|node| node.node_id)
            .collect();
        roots
            .into_iter()
            .flat_map(|root| self.subtree(root))
            .filter_map(|node_id| self.nodes.get(&node_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::Period;
    use crate::schedule::{DispositionActionDefinition, DispositionActionName};

    fn at() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    fn add(plan: &mut FilePlan, kind: NodeKind, name: &str, parent: Option<NodeId>) -> NodeId {
        let node = FilePlanNode::new(kind, name, parent, at());
        let node_id = node.node_id;
        if let Err(err) = plan.add_node(node) {
            panic!("node {name} should be added: {err}");
        }
        node_id
    }

    fn schedule(container_id: NodeId, record_level: bool) -> DispositionSchedule {
        DispositionSchedule {
            schedule_id: ScheduleId::new(),
            container_id,
            authority: "authority".to_string(),
            instructions: "instructions".to_string(),
            record_level,
            steps: vec![DispositionActionDefinition::new(
                DispositionActionName::Cutoff,
                Period::Immediately,
            )],
            created_at: at(),
        }
    }

    fn link(record_id: NodeId, container_id: NodeId) -> RecordLink {
        RecordLink { record_id, container_id, linked_at: at(), linked_by: "tester".to_string() }
    }

    // Test IDs: TFP-001
    #[test]
    fn placement_rules_follow_node_kinds() {
        let mut plan = FilePlan::new();
        let category = add(&mut plan, NodeKind::Category, "finance", None);
        let folder = add(&mut plan, NodeKind::Folder, "2024", Some(category));
        add(&mut plan, NodeKind::Record, "invoice-1", Some(folder));

        let orphan_folder = FilePlanNode::new(NodeKind::Folder, "loose", None, at());
        assert!(plan.add_node(orphan_folder).is_err());

        let record_in_category = FilePlanNode::new(NodeKind::Record, "r", Some(category), at());
        assert!(plan.add_node(record_in_category).is_err());

        let duplicate = FilePlanNode::new(NodeKind::Folder, "2024", Some(category), at());
        assert!(matches!(plan.add_node(duplicate), Err(KernelError::Validation(_))));
    }

    // Test IDs: TFP-002
    #[test]
    fn closed_folders_reject_records_and_links() {
        let mut plan = FilePlan::new();
        let category = add(&mut plan, NodeKind::Category, "hr", None);
        let open = add(&mut plan, NodeKind::Folder, "open", Some(category));
        let closed = add(&mut plan, NodeKind::Folder, "closed", Some(category));
        let record = add(&mut plan, NodeKind::Record, "cv", Some(open));
        assert_eq!(plan.close_folder(closed, at()), Ok(()));

        let late = FilePlanNode::new(NodeKind::Record, "late", Some(closed), at());
        assert!(plan.add_node(late).is_err());
        assert!(plan.link_record(link(record, closed)).is_err());

        assert_eq!(plan.reopen_folder(closed), Ok(()));
        assert_eq!(plan.link_record(link(record, closed)), Ok(()));
    }

    // Test IDs: TFP-003
    #[test]
    fn move_rejects_cycles() {
        let mut plan = FilePlan::new();
        let parent = add(&mut plan, NodeKind::Category, "parent", None);
        let child = add(&mut plan, NodeKind::Category, "child", Some(parent));
        assert!(plan.move_node(parent, child).is_err());
        assert!(plan.move_node(parent, parent).is_err());
    }

    // Test IDs: TFP-004
    #[test]
    fn schedule_sources_put_primary_first_and_filter_by_level() {
        let mut plan = FilePlan::new();
        let cat_a = add(&mut plan, NodeKind::Category, "a", None);
        let cat_b = add(&mut plan, NodeKind::Category, "b", None);
        let cat_folder_level = add(&mut plan, NodeKind::Category, "c", None);
        let folder_a = add(&mut plan, NodeKind::Folder, "fa", Some(cat_a));
        let folder_b = add(&mut plan, NodeKind::Folder, "fb", Some(cat_b));
        let folder_c = add(&mut plan, NodeKind::Folder, "fc", Some(cat_folder_level));
        let record = add(&mut plan, NodeKind::Record, "r", Some(folder_a));

        let schedule_a = schedule(cat_a, true);
        let schedule_b = schedule(cat_b, true);
        let schedule_c = schedule(cat_folder_level, false);
        let (id_a, id_b, id_c) =
            (schedule_a.schedule_id, schedule_b.schedule_id, schedule_c.schedule_id);
        for schedule in [schedule_a, schedule_b, schedule_c] {
            assert_eq!(plan.attach_schedule(schedule), Ok(()));
        }
        assert_eq!(plan.link_record(link(record, folder_b)), Ok(()));
        assert_eq!(plan.link_record(link(record, folder_c)), Ok(()));

        let sources = plan.schedule_sources(record);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].schedule_id, id_a);
        assert!(sources[0].primary);
        assert_eq!(sources[1].schedule_id, id_b);
        assert!(!sources[1].primary);

        let folder_sources = plan.schedule_sources(folder_c);
        assert_eq!(folder_sources.len(), 1);
        assert_eq!(folder_sources[0].schedule_id, id_c);
        assert!(plan.schedule_sources(folder_a).is_empty());
    }

    // Test IDs: TFP-005
    #[test]
    fn nearest_ancestor_schedule_governs_and_replacement_is_rejected() {
        let mut plan = FilePlan::new();
        let root = add(&mut plan, NodeKind::Category, "root", None);
        let sub = add(&mut plan, NodeKind::Category, "sub", Some(root));
        let folder = add(&mut plan, NodeKind::Folder, "f", Some(sub));

        let root_schedule = schedule(root, true);
        let root_id = root_schedule.schedule_id;
        assert_eq!(plan.attach_schedule(root_schedule), Ok(()));
        assert_eq!(plan.governing_schedule(folder).map(|s| s.schedule_id), Some(root_id));

        let sub_schedule = schedule(sub, true);
        let sub_id = sub_schedule.schedule_id;
        assert_eq!(plan.attach_schedule(sub_schedule), Ok(()));
        assert_eq!(plan.governing_schedule(folder).map(|s| s.schedule_id), Some(sub_id));

        assert!(plan.attach_schedule(schedule(sub, false)).is_err());
        assert!(plan.attach_schedule(schedule(folder, true)).is_err());
    }

    // Test IDs: TFP-006
    #[test]
    fn affected_items_include_records_linked_into_the_subtree() {
        let mut plan = FilePlan::new();
        let moved = add(&mut plan, NodeKind::Category, "moved", None);
        let other = add(&mut plan, NodeKind::Category, "other", None);
        let inside = add(&mut plan, NodeKind::Folder, "inside", Some(moved));
        let outside = add(&mut plan, NodeKind::Folder, "outside", Some(other));
        let local = add(&mut plan, NodeKind::Record, "local", Some(inside));
        let linked = add(&mut plan, NodeKind::Record, "linked", Some(outside));
        assert_eq!(plan.link_record(link(linked, inside)), Ok(()));

        let affected: BTreeSet<NodeId> = plan.affected_items(moved).into_iter().collect();
        assert_eq!(affected, BTreeSet::from([inside, local, linked]));
    }

    // Test IDs: TFP-007
    #[test]
    fn hierarchy_order_lists_parents_first() {
        let mut plan = FilePlan::new();
        let category = add(&mut plan, NodeKind::Category, "c", None);
        let folder = add(&mut plan, NodeKind::Folder, "f", Some(category));
        add(&mut plan, NodeKind::Record, "r", Some(folder));

        let order: Vec<NodeId> =
            plan.nodes_in_hierarchy_order().iter().map(|node| node.node_id).collect();
        assert_eq!(order.len(), 3);
        for node in plan.nodes() {
            if let Some(parent) = node.parent_id {
                let parent_pos = order.iter().position(|id| *id == parent);
                let child_pos = order.iter().position(|id| *id == node.node_id);
                assert!(parent_pos < child_pos);
            }
        }
    }

    // Test IDs: TFP-008
    #[test]
    fn destroyed_nodes_reject_structural_mutation() {
        let mut plan = FilePlan::new();
        let category = add(&mut plan, NodeKind::Category, "c", None);
        let folder = add(&mut plan, NodeKind::Folder, "f", Some(category));
        let other = add(&mut plan, NodeKind::Folder, "g", Some(category));
        let record = add(&mut plan, NodeKind::Record, "r", Some(folder));
        if let Some(node) = plan.node_mut(record) {
            node.state = DispositionState::Destroyed;
        }

        assert!(plan.move_node(record, other).is_err());
        assert!(plan.link_record(link(record, other)).is_err());
        assert!(plan.set_property(record, "review", at()).is_err());
    }
}
