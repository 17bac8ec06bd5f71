use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use disposition_kernel_core::{
    AuditEvent, DispositionActionDefinition, DispositionActionName, DispositionLifecycle,
    DispositionSchedule, DispositionState, FilePlan, FilePlanNode, NodeId, NodeKind, PublishJob,
    PublishJobId, PublishJobStatus, RecordLink,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS file_plan_nodes (
  node_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('category','folder','record')),
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  parent_id TEXT NULL,
  created_at TEXT NOT NULL,
  declared_at TEXT NULL,
  closed_at TEXT NULL,
  cut_off_at TEXT NULL,
  state TEXT NOT NULL CHECK (state IN ('active','transferred','accessioned','destroyed')),
  location TEXT NULL,
  properties_json TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (parent_id) REFERENCES file_plan_nodes(node_id) DEFERRABLE INITIALLY DEFERRED
);

CREATE TABLE IF NOT EXISTS record_links (
  record_id TEXT NOT NULL,
  container_id TEXT NOT NULL,
  linked_at TEXT NOT NULL,
  linked_by TEXT NOT NULL,
  PRIMARY KEY (record_id, container_id),
  FOREIGN KEY (record_id) REFERENCES file_plan_nodes(node_id),
  FOREIGN KEY (container_id) REFERENCES file_plan_nodes(node_id)
);

CREATE TABLE IF NOT EXISTS disposition_schedules (
  schedule_id TEXT PRIMARY KEY,
  container_id TEXT NOT NULL UNIQUE,
  authority TEXT NOT NULL,
  instructions TEXT NOT NULL,
  record_level INTEGER NOT NULL CHECK (record_level IN (0,1)),
  created_at TEXT NOT NULL,
  FOREIGN KEY (container_id) REFERENCES file_plan_nodes(node_id)
);

CREATE TABLE IF NOT EXISTS disposition_steps (
  definition_id TEXT PRIMARY KEY,
  schedule_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  name TEXT NOT NULL CHECK (name IN ('cutoff','retain','transfer','accession','destroy')),
  description TEXT NOT NULL,
  period TEXT NOT NULL,
  anchor TEXT NOT NULL,
  events_json TEXT NOT NULL DEFAULT '[]',
  eligible_on_first_complete_event INTEGER NOT NULL CHECK (eligible_on_first_complete_event IN (0,1)),
  location TEXT NULL,
  ghost_on_destroy INTEGER NOT NULL CHECK (ghost_on_destroy IN (0,1)),
  UNIQUE(schedule_id, position),
  UNIQUE(schedule_id, name),
  FOREIGN KEY (schedule_id) REFERENCES disposition_schedules(schedule_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS disposition_lifecycles (
  item_id TEXT PRIMARY KEY,
  initialised_at TEXT NOT NULL,
  history_json TEXT NOT NULL,
  pending_events_json TEXT NOT NULL,
  next_action_json TEXT NULL,
  next_step_name TEXT NULL CHECK (next_step_name IS NULL OR next_step_name IN ('cutoff','retain','transfer','accession','destroy')),
  next_as_of TEXT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (item_id) REFERENCES file_plan_nodes(node_id)
);

CREATE TABLE IF NOT EXISTS audit_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  node_id TEXT NULL,
  operation TEXT NOT NULL,
  actor TEXT NOT NULL CHECK (length(trim(actor)) > 0),
  detail_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_plan_nodes_parent ON file_plan_nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_record_links_container ON record_links(container_id);
CREATE INDEX IF NOT EXISTS idx_disposition_lifecycles_next ON disposition_lifecycles(next_as_of);
CREATE INDEX IF NOT EXISTS idx_audit_events_node ON audit_events(node_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS publish_jobs (
  job_id TEXT PRIMARY KEY,
  schedule_id TEXT NOT NULL,
  definition_id TEXT NOT NULL,
  updated_fields_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('queued','running','succeeded','failed')),
  requested_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  started_at TEXT NULL,
  completed_at TEXT NULL,
  processed_items INTEGER NOT NULL DEFAULT 0 CHECK (processed_items >= 0),
  error TEXT NULL,
  FOREIGN KEY (schedule_id) REFERENCES disposition_schedules(schedule_id)
);

CREATE INDEX IF NOT EXISTS idx_publish_jobs_status ON publish_jobs(status, created_at);
";

const NODES_FILE: &str = "file_plan_nodes.ndjson";
const LINKS_FILE: &str = "record_links.ndjson";
const SCHEDULES_FILE: &str = "disposition_schedules.ndjson";
const LIFECYCLES_FILE: &str = "disposition_lifecycles.ndjson";
const JOBS_FILE: &str = "publish_jobs.ndjson";
const AUDIT_FILE: &str = "audit_events.ndjson";
const SNAPSHOT_FILES: [&str; 6] =
    [NODES_FILE, LINKS_FILE, SCHEDULES_FILE, LIFECYCLES_FILE, JOBS_FILE, AUDIT_FILE];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: BTreeMap<String, usize>,
    pub skipped_existing: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Every row change produced by one kernel operation.
///
/// Applied atomically by [`SqliteStore::apply`]. Nodes are written in order, so
/// callers list parents before children.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub nodes: Vec<FilePlanNode>,
    pub links_added: Vec<RecordLink>,
    pub links_removed: Vec<(NodeId, NodeId)>,
    pub schedules: Vec<DispositionSchedule>,
    pub lifecycles: Vec<DispositionLifecycle>,
    pub jobs: Vec<PublishJob>,
    pub audit: Vec<AuditEvent>,
}

impl WriteBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.links_added.is_empty()
            && self.links_removed.is_empty()
            && self.schedules.is_empty()
            && self.lifecycles.is_empty()
            && self.jobs.is_empty()
            && self.audit.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PropertiesColumn(
    #[serde(with = "disposition_kernel_core::rfc3339_map")] BTreeMap<String, OffsetDateTime>,
);

#[derive(Debug)]
struct NodeRow {
    node_id: String,
    kind: String,
    name: String,
    parent_id: Option<String>,
    created_at: String,
    declared_at: Option<String>,
    closed_at: Option<String>,
    cut_off_at: Option<String>,
    state: String,
    location: Option<String>,
    properties_json: String,
}

#[derive(Debug)]
struct StepRow {
    definition_id: String,
    name: String,
    description: String,
    period: String,
    anchor: String,
    events_json: String,
    eligible_on_first_complete_event: bool,
    location: Option<String>,
    ghost_on_destroy: bool,
}

#[derive(Debug)]
struct JobRow {
    job_id: String,
    schedule_id: String,
    definition_id: String,
    updated_fields_json: String,
    status: String,
    requested_by: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    processed_items: i64,
    error: Option<String>,
}

#[derive(Debug)]
struct LifecycleRow {
    item_id: String,
    initialised_at: String,
    history_json: String,
    pending_events_json: String,
    next_action_json: Option<String>,
    updated_at: String,
}

impl SqliteStore {
    /// Open a SQLite-backed disposition store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if !table_exists(&self.conn, "file_plan_nodes")? {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "disposition_lifecycles", "next_action_json")? {
            return Err(anyhow!(
                "database schema is invalid: file_plan_nodes exists without disposition_lifecycles"
            ));
        }

        // Tables predate migration bookkeeping; record what is already there.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "publish_jobs")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "applied schema migration");
        Ok(())
    }

    /// Run `work` while holding the database write lock. Reads made inside `work`
    /// stay current until it returns; its writes commit together or not at all.
    ///
    /// # Errors
    /// Returns an error when the lock cannot be acquired within the busy timeout,
    /// when `work` fails, or when the commit fails.
    pub fn write_locked<T, F>(&mut self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("failed to acquire sqlite write lock")?;
        let outcome = work(self).and_then(|value| {
            self.conn.execute_batch("COMMIT").context("failed to commit locked write")?;
            Ok(value)
        });
        if outcome.is_err() && !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %err, "failed to roll back locked write");
            }
        }
        outcome
    }

    /// Apply every change in `batch` atomically. Inside [`Self::write_locked`] the
    /// batch joins the enclosing transaction.
    ///
    /// # Errors
    /// Returns an error when serialization or any write fails; nothing is persisted then.
    pub fn apply(&mut self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let tx = self.conn.savepoint().context("failed to start savepoint")?;
        for node in &batch.nodes {
            upsert_node(&tx, node)?;
        }
        for schedule in &batch.schedules {
            upsert_schedule(&tx, schedule)?;
        }
        for (record_id, container_id) in &batch.links_removed {
            tx.execute(
                "DELETE FROM record_links WHERE record_id = ?1 AND container_id = ?2",
                params![record_id.to_string(), container_id.to_string()],
            )
            .context("failed to delete record link")?;
        }
        for link in &batch.links_added {
            tx.execute(
                "INSERT INTO record_links(record_id, container_id, linked_at, linked_by)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    link.record_id.to_string(),
                    link.container_id.to_string(),
                    rfc3339(link.linked_at)?,
                    link.linked_by,
                ],
            )
            .context("failed to insert record link")?;
        }
        for lifecycle in &batch.lifecycles {
            upsert_lifecycle(&tx, lifecycle)?;
        }
        for job in &batch.jobs {
            upsert_job(&tx, job)?;
        }
        for event in &batch.audit {
            insert_audit_event(&tx, event)?;
        }
        tx.commit().context("failed to commit write batch")?;

        tracing::debug!(
            nodes = batch.nodes.len(),
            links_added = batch.links_added.len(),
            links_removed = batch.links_removed.len(),
            schedules = batch.schedules.len(),
            lifecycles = batch.lifecycles.len(),
            jobs = batch.jobs.len(),
            audit = batch.audit.len(),
            "applied write batch"
        );
        Ok(())
    }

    /// Load every node, link, and schedule into an in-memory plan.
    ///
    /// # Errors
    /// Returns an error when a row cannot be read or decoded.
    pub fn load_file_plan(&self) -> Result<FilePlan> {
        let nodes = self.list_nodes()?;
        let links = self.list_links()?;
        let schedules = self.list_schedules()?;
        FilePlan::from_parts(nodes, links, schedules).context("stored file plan is inconsistent")
    }

    fn list_nodes(&self) -> Result<Vec<FilePlanNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, kind, name, parent_id, created_at, declared_at, closed_at,
                    cut_off_at, state, location, properties_json
             FROM file_plan_nodes
             ORDER BY node_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(NodeRow {
                node_id: row.get(0)?,
                kind: row.get(1)?,
                name: row.get(2)?,
                parent_id: row.get(3)?,
                created_at: row.get(4)?,
                declared_at: row.get(5)?,
                closed_at: row.get(6)?,
                cut_off_at: row.get(7)?,
                state: row.get(8)?,
                location: row.get(9)?,
                properties_json: row.get(10)?,
            })
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(node_from_row(row?)?);
        }
        Ok(nodes)
    }

    fn list_links(&self) -> Result<Vec<RecordLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, container_id, linked_at, linked_by
             FROM record_links
             ORDER BY record_id ASC, container_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut links = Vec::new();
        for row in rows {
            let (record_id, container_id, linked_at, linked_by) = row?;
            links.push(RecordLink {
                record_id: parse_id(&record_id)?,
                container_id: parse_id(&container_id)?,
                linked_at: parse_rfc3339(&linked_at)?,
                linked_by,
            });
        }
        Ok(links)
    }

    fn list_schedules(&self) -> Result<Vec<DispositionSchedule>> {
        let mut stmt = self.conn.prepare(
            "SELECT schedule_id, container_id, authority, instructions, record_level, created_at
             FROM disposition_schedules
             ORDER BY schedule_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut schedules = Vec::new();
        for row in rows {
            let (schedule_id, container_id, authority, instructions, record_level, created_at) = row?;
            let steps = self.load_steps(&schedule_id)?;
            schedules.push(DispositionSchedule {
                schedule_id: parse_id(&schedule_id)?,
                container_id: parse_id(&container_id)?,
                authority,
                instructions,
                record_level,
                steps,
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(schedules)
    }

    fn load_steps(&self, schedule_id: &str) -> Result<Vec<DispositionActionDefinition>> {
        let mut stmt = self.conn.prepare(
            "SELECT definition_id, name, description, period, anchor, events_json,
                    eligible_on_first_complete_event, location, ghost_on_destroy
             FROM disposition_steps
             WHERE schedule_id = ?1
             ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![schedule_id], |row| {
            Ok(StepRow {
                definition_id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                period: row.get(3)?,
                anchor: row.get(4)?,
                events_json: row.get(5)?,
                eligible_on_first_complete_event: row.get(6)?,
                location: row.get(7)?,
                ghost_on_destroy: row.get(8)?,
            })
        })?;

        let mut steps = Vec::new();
        for row in rows {
            let row = row?;
            let name = DispositionActionName::parse(&row.name)
                .ok_or_else(|| anyhow!("invalid step name in storage: {}", row.name))?;
            steps.push(DispositionActionDefinition {
                definition_id: parse_id(&row.definition_id)?,
                name,
                description: row.description,
                period: row.period.parse().context("invalid stored period")?,
                anchor: row.anchor.parse().context("invalid stored anchor")?,
                events: serde_json::from_str(&row.events_json)
                    .context("failed to decode step events")?,
                eligible_on_first_complete_event: row.eligible_on_first_complete_event,
                location: row.location,
                ghost_on_destroy: row.ghost_on_destroy,
            });
        }
        Ok(steps)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn load_lifecycle(&self, item_id: NodeId) -> Result<Option<DispositionLifecycle>> {
        let row = self
            .conn
            .query_row(
                "SELECT item_id, initialised_at, history_json, pending_events_json,
                        next_action_json, updated_at
                 FROM disposition_lifecycles
                 WHERE item_id = ?1",
                params![item_id.to_string()],
                lifecycle_row,
            )
            .optional()
            .with_context(|| format!("failed to load lifecycle for {item_id}"))?;
        row.map(lifecycle_from_row).transpose()
    }

    /// # Errors
    /// Returns an error when a row cannot be read or decoded.
    pub fn list_lifecycles(&self) -> Result<Vec<DispositionLifecycle>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, initialised_at, history_json, pending_events_json,
                    next_action_json, updated_at
             FROM disposition_lifecycles
             ORDER BY item_id ASC",
        )?;
        let rows = stmt.query_map([], lifecycle_row)?;
        let mut lifecycles = Vec::new();
        for row in rows {
            lifecycles.push(lifecycle_from_row(row?)?);
        }
        Ok(lifecycles)
    }

    /// List publish jobs oldest first, optionally filtered by status.
    ///
    /// # Errors
    /// Returns an error when a row cannot be read or decoded.
    pub fn list_publish_jobs(&self, status: Option<PublishJobStatus>) -> Result<Vec<PublishJob>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, schedule_id, definition_id, updated_fields_json, status, requested_by,
                    created_at, started_at, completed_at, processed_items, error
             FROM publish_jobs
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at ASC, job_id ASC",
        )?;
        let rows = stmt.query_map(params![status.map(|status| status.to_string())], job_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(job_from_row(row?)?);
        }
        Ok(jobs)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_publish_job(&self, job_id: PublishJobId) -> Result<Option<PublishJob>> {
        let row = self
            .conn
            .query_row(
                "SELECT job_id, schedule_id, definition_id, updated_fields_json, status, requested_by,
                        created_at, started_at, completed_at, processed_items, error
                 FROM publish_jobs
                 WHERE job_id = ?1",
                params![job_id.to_string()],
                job_row,
            )
            .optional()
            .with_context(|| format!("failed to load publish job {job_id}"))?;
        row.map(job_from_row).transpose()
    }

    /// Audit events in write order, optionally limited to one node.
    ///
    /// # Errors
    /// Returns an error when a row cannot be read or decoded.
    pub fn list_audit_events(&self, node_id: Option<NodeId>) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, operation, actor, detail_json, recorded_at
             FROM audit_events
             WHERE ?1 IS NULL OR node_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![node_id.map(|id| id.to_string())], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (node_id, operation, actor, detail_json, recorded_at) = row?;
            events.push(AuditEvent {
                node_id: node_id.as_deref().map(parse_id).transpose()?,
                operation,
                actor,
                detail: serde_json::from_str(&detail_json)
                    .context("failed to decode audit detail")?,
                recorded_at: parse_rfc3339(&recorded_at)?,
            });
        }
        Ok(events)
    }

    /// Export all tables to NDJSON files plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let plan = self.load_file_plan()?;
        let nodes: Vec<&FilePlanNode> = plan.nodes_in_hierarchy_order();
        let links: Vec<&RecordLink> = plan.links().collect();
        let schedules: Vec<&DispositionSchedule> = plan.schedules().collect();
        let lifecycles = self.list_lifecycles()?;
        let jobs = self.list_publish_jobs(None)?;
        let audit = self.list_audit_events(None)?;

        let digests = [
            (NODES_FILE, write_ndjson_file(&out_dir.join(NODES_FILE), &nodes)?),
            (LINKS_FILE, write_ndjson_file(&out_dir.join(LINKS_FILE), &links)?),
            (SCHEDULES_FILE, write_ndjson_file(&out_dir.join(SCHEDULES_FILE), &schedules)?),
            (LIFECYCLES_FILE, write_ndjson_file(&out_dir.join(LIFECYCLES_FILE), &lifecycles)?),
            (JOBS_FILE, write_ndjson_file(&out_dir.join(JOBS_FILE), &jobs)?),
            (AUDIT_FILE, write_ndjson_file(&out_dir.join(AUDIT_FILE), &audit)?),
        ];

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: digests
                .into_iter()
                .map(|(path, (sha256, records))| ExportFileDigest {
                    path: path.to_string(),
                    sha256,
                    records,
                })
                .collect(),
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        tracing::info!(dir = %out_dir.display(), "exported snapshot");
        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, duplicate handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();
        let mut batch = WriteBatch::default();

        for node in read_ndjson_file::<FilePlanNode>(&in_dir.join(NODES_FILE))? {
            let exists = self.row_exists("file_plan_nodes", "node_id", &node.node_id.to_string())?;
            if admit(exists, skip_existing, NODES_FILE, &node.node_id.to_string(), &mut summary)? {
                batch.nodes.push(node);
            }
        }
        for schedule in read_ndjson_file::<DispositionSchedule>(&in_dir.join(SCHEDULES_FILE))? {
            let key = schedule.schedule_id.to_string();
            let exists = self.row_exists("disposition_schedules", "schedule_id", &key)?;
            if admit(exists, skip_existing, SCHEDULES_FILE, &key, &mut summary)? {
                batch.schedules.push(schedule);
            }
        }
        for link in read_ndjson_file::<RecordLink>(&in_dir.join(LINKS_FILE))? {
            let exists = self.link_exists(link.record_id, link.container_id)?;
            let key = format!("{} -> {}", link.record_id, link.container_id);
            if admit(exists, skip_existing, LINKS_FILE, &key, &mut summary)? {
                batch.links_added.push(link);
            }
        }
        for lifecycle in read_ndjson_file::<DispositionLifecycle>(&in_dir.join(LIFECYCLES_FILE))? {
            let key = lifecycle.item_id.to_string();
            let exists = self.row_exists("disposition_lifecycles", "item_id", &key)?;
            if admit(exists, skip_existing, LIFECYCLES_FILE, &key, &mut summary)? {
                batch.lifecycles.push(lifecycle);
            }
        }
        for job in read_ndjson_file::<PublishJob>(&in_dir.join(JOBS_FILE))? {
            let key = job.job_id.to_string();
            let exists = self.row_exists("publish_jobs", "job_id", &key)?;
            if admit(exists, skip_existing, JOBS_FILE, &key, &mut summary)? {
                batch.jobs.push(job);
            }
        }
        for event in read_ndjson_file::<AuditEvent>(&in_dir.join(AUDIT_FILE))? {
            let exists = self.audit_event_exists(&event)?;
            let key = format!("{} at {}", event.operation, rfc3339(event.recorded_at)?);
            if admit(exists, skip_existing, AUDIT_FILE, &key, &mut summary)? {
                batch.audit.push(event);
            }
        }

        self.apply(&batch)?;
        tracing::info!(dir = %in_dir.display(), "imported snapshot");
        Ok(summary)
    }

    fn row_exists(&self, table: &str, column: &str, key: &str) -> Result<bool> {
        let query = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {column} = ?1)");
        let exists = self
            .conn
            .query_row(&query, params![key], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to check existing row in {table}"))?;
        Ok(exists == 1)
    }

    fn link_exists(&self, record_id: NodeId, container_id: NodeId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM record_links WHERE record_id = ?1 AND container_id = ?2)",
            params![record_id.to_string(), container_id.to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    fn audit_event_exists(&self, event: &AuditEvent) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM audit_events
                WHERE node_id IS ?1 AND operation = ?2 AND actor = ?3 AND recorded_at = ?4
             )",
            params![
                event.node_id.map(|id| id.to_string()),
                event.operation,
                event.actor,
                rfc3339(event.recorded_at)?,
            ],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn admit(
    exists: bool,
    skip_existing: bool,
    file: &str,
    key: &str,
    summary: &mut ImportSummary,
) -> Result<bool> {
    if !exists {
        *summary.imported.entry(file.to_string()).or_default() += 1;
        return Ok(true);
    }
    if skip_existing {
        *summary.skipped_existing.entry(file.to_string()).or_default() += 1;
        return Ok(false);
    }
    Err(anyhow!("{file} row already exists: {key}"))
}

fn upsert_node(tx: &Connection, node: &FilePlanNode) -> Result<()> {
    let properties = serde_json::to_string(&PropertiesColumn(node.properties.clone()))
        .context("failed to encode node properties")?;
    tx.execute(
        "INSERT INTO file_plan_nodes(
            node_id, kind, name, parent_id, created_at, declared_at, closed_at,
            cut_off_at, state, location, properties_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(node_id) DO UPDATE SET
            name = excluded.name,
            parent_id = excluded.parent_id,
            declared_at = excluded.declared_at,
            closed_at = excluded.closed_at,
            cut_off_at = excluded.cut_off_at,
            state = excluded.state,
            location = excluded.location,
            properties_json = excluded.properties_json",
        params![
            node.node_id.to_string(),
            node.kind.as_str(),
            node.name,
            node.parent_id.map(|id| id.to_string()),
            rfc3339(node.created_at)?,
            node.declared_at.map(rfc3339).transpose()?,
            node.closed_at.map(rfc3339).transpose()?,
            node.cut_off_at.map(rfc3339).transpose()?,
            node.state.as_str(),
            node.location,
            properties,
        ],
    )
    .with_context(|| format!("failed to upsert node {}", node.node_id))?;
    Ok(())
}

fn upsert_schedule(tx: &Connection, schedule: &DispositionSchedule) -> Result<()> {
    let schedule_id = schedule.schedule_id.to_string();
    tx.execute(
        "INSERT INTO disposition_schedules(
            schedule_id, container_id, authority, instructions, record_level, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(schedule_id) DO UPDATE SET
            authority = excluded.authority,
            instructions = excluded.instructions",
        params![
            schedule_id,
            schedule.container_id.to_string(),
            schedule.authority,
            schedule.instructions,
            schedule.record_level,
            rfc3339(schedule.created_at)?,
        ],
    )
    .with_context(|| format!("failed to upsert schedule {schedule_id}"))?;

    tx.execute("DELETE FROM disposition_steps WHERE schedule_id = ?1", params![schedule_id])
        .context("failed to clear schedule steps")?;
    for (position, step) in schedule.steps.iter().enumerate() {
        let position = i64::try_from(position).context("step position overflow")?;
        tx.execute(
            "INSERT INTO disposition_steps(
                definition_id, schedule_id, position, name, description, period, anchor,
                events_json, eligible_on_first_complete_event, location, ghost_on_destroy
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                step.definition_id.to_string(),
                schedule_id,
                position,
                step.name.as_str(),
                step.description,
                step.period.to_string(),
                step.anchor.to_string(),
                serde_json::to_string(&step.events).context("failed to encode step events")?,
                step.eligible_on_first_complete_event,
                step.location,
                step.ghost_on_destroy,
            ],
        )
        .with_context(|| format!("failed to insert step {}", step.definition_id))?;
    }
    Ok(())
}

fn upsert_lifecycle(tx: &Connection, lifecycle: &DispositionLifecycle) -> Result<()> {
    let next_action_json = lifecycle
        .next_action
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to encode next action")?;
    let next_step_name = lifecycle.next_action.as_ref().map(|next| next.step_name.as_str());
    let next_as_of = lifecycle
        .next_action
        .as_ref()
        .and_then(|next| next.as_of)
        .map(rfc3339)
        .transpose()?;

    tx.execute(
        "INSERT INTO disposition_lifecycles(
            item_id, initialised_at, history_json, pending_events_json,
            next_action_json, next_step_name, next_as_of, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(item_id) DO UPDATE SET
            history_json = excluded.history_json,
            pending_events_json = excluded.pending_events_json,
            next_action_json = excluded.next_action_json,
            next_step_name = excluded.next_step_name,
            next_as_of = excluded.next_as_of,
            updated_at = excluded.updated_at",
        params![
            lifecycle.item_id.to_string(),
            rfc3339(lifecycle.initialised_at)?,
            serde_json::to_string(&lifecycle.history).context("failed to encode history")?,
            serde_json::to_string(&lifecycle.pending_events)
                .context("failed to encode pending events")?,
            next_action_json,
            next_step_name,
            next_as_of,
            rfc3339(lifecycle.updated_at)?,
        ],
    )
    .with_context(|| format!("failed to upsert lifecycle {}", lifecycle.item_id))?;
    Ok(())
}

fn upsert_job(tx: &Connection, job: &PublishJob) -> Result<()> {
    tx.execute(
        "INSERT INTO publish_jobs(
            job_id, schedule_id, definition_id, updated_fields_json, status, requested_by,
            created_at, started_at, completed_at, processed_items, error
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(job_id) DO UPDATE SET
            updated_fields_json = excluded.updated_fields_json,
            status = excluded.status,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            processed_items = excluded.processed_items,
            error = excluded.error",
        params![
            job.job_id.to_string(),
            job.schedule_id.to_string(),
            job.definition_id.to_string(),
            serde_json::to_string(&job.updated_fields).context("failed to encode job fields")?,
            job.status.to_string(),
            job.requested_by,
            rfc3339(job.created_at)?,
            job.started_at.map(rfc3339).transpose()?,
            job.completed_at.map(rfc3339).transpose()?,
            i64::try_from(job.processed_items).context("processed item count overflow")?,
            job.error,
        ],
    )
    .with_context(|| format!("failed to upsert publish job {}", job.job_id))?;
    Ok(())
}

fn insert_audit_event(tx: &Connection, event: &AuditEvent) -> Result<()> {
    tx.execute(
        "INSERT INTO audit_events(node_id, operation, actor, detail_json, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.node_id.map(|id| id.to_string()),
            event.operation,
            event.actor,
            serde_json::to_string(&event.detail).context("failed to encode audit detail")?,
            rfc3339(event.recorded_at)?,
        ],
    )
    .context("failed to insert audit event")?;
    Ok(())
}

fn node_from_row(row: NodeRow) -> Result<FilePlanNode> {
    let kind = NodeKind::parse(&row.kind)
        .ok_or_else(|| anyhow!("invalid node kind in storage: {}", row.kind))?;
    let state = DispositionState::parse(&row.state)
        .ok_or_else(|| anyhow!("invalid disposition state in storage: {}", row.state))?;
    let properties: PropertiesColumn = serde_json::from_str(&row.properties_json)
        .with_context(|| format!("failed to decode properties of node {}", row.node_id))?;

    Ok(FilePlanNode {
        node_id: parse_id(&row.node_id)?,
        kind,
        name: row.name,
        parent_id: row.parent_id.as_deref().map(parse_id).transpose()?,
        created_at: parse_rfc3339(&row.created_at)?,
        declared_at: row.declared_at.as_deref().map(parse_rfc3339).transpose()?,
        closed_at: row.closed_at.as_deref().map(parse_rfc3339).transpose()?,
        cut_off_at: row.cut_off_at.as_deref().map(parse_rfc3339).transpose()?,
        state,
        location: row.location,
        properties: properties.0,
    })
}

fn lifecycle_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LifecycleRow> {
    Ok(LifecycleRow {
        item_id: row.get(0)?,
        initialised_at: row.get(1)?,
        history_json: row.get(2)?,
        pending_events_json: row.get(3)?,
        next_action_json: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn lifecycle_from_row(row: LifecycleRow) -> Result<DispositionLifecycle> {
    Ok(DispositionLifecycle {
        item_id: parse_id(&row.item_id)?,
        initialised_at: parse_rfc3339(&row.initialised_at)?,
        history: serde_json::from_str(&row.history_json)
            .with_context(|| format!("failed to decode history of {}", row.item_id))?,
        pending_events: serde_json::from_str(&row.pending_events_json)
            .with_context(|| format!("failed to decode pending events of {}", row.item_id))?,
        next_action: row
            .next_action_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("failed to decode next action of {}", row.item_id))?,
        updated_at: parse_rfc3339(&row.updated_at)?,
    })
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get(0)?,
        schedule_id: row.get(1)?,
        definition_id: row.get(2)?,
        updated_fields_json: row.get(3)?,
        status: row.get(4)?,
        requested_by: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        processed_items: row.get(9)?,
        error: row.get(10)?,
    })
}

fn job_from_row(row: JobRow) -> Result<PublishJob> {
    Ok(PublishJob {
        job_id: parse_id(&row.job_id)?,
        schedule_id: parse_id(&row.schedule_id)?,
        definition_id: parse_id(&row.definition_id)?,
        updated_fields: serde_json::from_str(&row.updated_fields_json)
            .context("failed to decode publish job fields")?,
        status: row.status.parse().context("invalid stored publish job status")?,
        requested_by: row.requested_by,
        created_at: parse_rfc3339(&row.created_at)?,
        started_at: row.started_at.as_deref().map(parse_rfc3339).transpose()?,
        completed_at: row.completed_at.as_deref().map(parse_rfc3339).transpose()?,
        processed_items: u64::try_from(row.processed_items)
            .context("negative processed item count in storage")?,
        error: row.error,
    })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "file_plan_nodes")? {
        return Ok((0, false));
    }

    if table_exists(conn, "publish_jobs")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "disposition_lifecycles", "next_action_json")? {
        return Ok((1, true));
    }

    Err(anyhow!(
        "database schema is invalid: file_plan_nodes exists without disposition_lifecycles"
    ))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_id<T>(raw: &str) -> Result<T>
where
    T: std::str::FromStr<Err = disposition_kernel_core::KernelError>,
{
    raw.parse::<T>().with_context(|| format!("invalid identifier in storage: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

/// Read and parse `manifest.json` from a snapshot directory.
///
/// # Errors
/// Returns an error when the file is missing or not a valid manifest.
pub fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    let known: BTreeSet<&str> = SNAPSHOT_FILES.into_iter().collect();
    if let Some(unknown) = by_path.keys().find(|path| !known.contains(*path)) {
        return Err(anyhow!("manifest references unknown file {unknown}"));
    }

    for required in SNAPSHOT_FILES {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
