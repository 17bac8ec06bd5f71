use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use disposition_kernel_api::{
    init_logging, parse_schedule_yaml, AddStepRequest, CreateNodeRequest, CreateScheduleRequest,
    DispositionKernelApi, EventRequest, ExecuteStepCommand, KernelConfig, LinkRecordRequest,
    MoveNodeRequest, NodeChangeRequest, RemoveStepRequest, SetPropertyRequest, StepSpec,
    UpdateStepRequest,
};
use disposition_kernel_core::{
    DispositionActionName, NodeId, Period, PeriodAnchor, PublishJobStatus, ScheduleId,
    StepDefinitionId, StepDefinitionPatch,
};
use disposition_kernel_store_sqlite::{read_export_manifest, SqliteStore};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_SIG_FILE: &str = "manifest.sig";
const MANIFEST_SECURITY_FILE: &str = "manifest.security.json";
const SIGNATURE_ALGORITHM: &str = "hmac-sha256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Parser)]
#[command(name = "dk")]
#[command(about = "Disposition Kernel CLI")]
struct Cli {
    /// Database path; overrides `store.db_path` from the configuration file.
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Plan {
        #[command(subcommand)]
        command: Box<PlanCommand>,
    },
    Schedule {
        #[command(subcommand)]
        command: Box<ScheduleCommand>,
    },
    Disposition {
        #[command(subcommand)]
        command: Box<DispositionCommand>,
    },
    Audit(AuditArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    signing_key_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
    #[arg(long)]
    verify_key_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    allow_unsigned: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PlanCommand {
    Show,
    Category {
        #[command(subcommand)]
        command: Box<CategoryCommand>,
    },
    Folder {
        #[command(subcommand)]
        command: Box<FolderCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    SetProperty(SetPropertyArgs),
    Move(MoveArgs),
    Link(LinkArgs),
    Unlink(LinkArgs),
}

#[derive(Debug, Subcommand)]
enum CategoryCommand {
    Add(CategoryAddArgs),
}

#[derive(Debug, Subcommand)]
enum FolderCommand {
    Add(ChildAddArgs),
    Close(NodeArgs),
    Reopen(NodeArgs),
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    File(ChildAddArgs),
    Declare(NodeArgs),
}

#[derive(Debug, Args)]
struct WriteArgs {
    #[arg(long)]
    actor: String,
    /// Effective time of the write; defaults to now.
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct CategoryAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    parent_id: Option<String>,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct ChildAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    parent_id: String,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct NodeArgs {
    #[arg(long)]
    node_id: String,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct SetPropertyArgs {
    #[arg(long)]
    node_id: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    value: String,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct MoveArgs {
    #[arg(long)]
    node_id: String,
    #[arg(long)]
    new_parent_id: String,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct LinkArgs {
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    container_id: String,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    Create(ScheduleCreateArgs),
    Step {
        #[command(subcommand)]
        command: Box<StepCommand>,
    },
    Publish(PublishArgs),
    Jobs(JobsArgs),
}

#[derive(Debug, Args)]
struct ScheduleCreateArgs {
    #[arg(long)]
    container_id: String,
    /// YAML schedule document with authority, instructions, `record_level` and steps.
    #[arg(long)]
    file: PathBuf,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Subcommand)]
enum StepCommand {
    Add(StepAddArgs),
    Update(StepUpdateArgs),
    Remove(StepRemoveArgs),
}

#[derive(Debug, Args)]
struct StepAddArgs {
    #[arg(long)]
    schedule_id: String,
    #[arg(long, value_enum)]
    name: ActionArg,
    #[arg(long)]
    period: String,
    #[arg(long)]
    anchor: Option<String>,
    #[arg(long = "event")]
    events: Vec<String>,
    #[arg(long, default_value_t = false)]
    eligible_on_first_complete_event: bool,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long, default_value_t = false)]
    ghost_on_destroy: bool,
    #[arg(long)]
    position: Option<usize>,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct StepUpdateArgs {
    #[arg(long)]
    schedule_id: String,
    #[arg(long)]
    definition_id: String,
    #[arg(long)]
    period: Option<String>,
    #[arg(long)]
    anchor: Option<String>,
    /// Replaces the event list; pass with no value to clear it.
    #[arg(long = "event", num_args = 0..)]
    events: Option<Vec<String>>,
    #[arg(long)]
    eligible_on_first_complete_event: Option<bool>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    ghost_on_destroy: Option<bool>,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct StepRemoveArgs {
    #[arg(long)]
    schedule_id: String,
    #[arg(long)]
    definition_id: String,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[arg(long, default_value_t = 25)]
    limit: usize,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
struct JobsArgs {
    #[arg(long, value_enum)]
    status: Option<JobStatusArg>,
}

#[derive(Debug, Subcommand)]
enum DispositionCommand {
    Status(StatusArgs),
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Execute(ExecuteArgs),
    UndoCutOff(NodeArgs),
    Due(DueArgs),
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long)]
    item_id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum EventCommand {
    Complete(EventArgs),
    Undo(EventArgs),
}

#[derive(Debug, Args)]
struct EventArgs {
    #[arg(long)]
    item_id: String,
    #[arg(long)]
    event: String,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    #[arg(long)]
    item_id: String,
    #[arg(long, value_enum)]
    step: ActionArg,
    /// Run the step even when its period has not elapsed or its events are open.
    #[arg(long, default_value_t = false)]
    ignore_eligibility: bool,
    /// Report guard failures as a skipped outcome instead of an error.
    #[arg(long, default_value_t = false)]
    skip_on_error: bool,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct DueArgs {
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long)]
    node_id: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ActionArg {
    Cutoff,
    Retain,
    Transfer,
    Accession,
    Destroy,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JobStatusArg {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SnapshotSecurityMetadata {
    signature_file: Option<String>,
    signature_algorithm: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T, what: &str) -> Result<()> {
    emit_json(serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = KernelConfig::load(cli.config.as_deref())?;
    init_logging(config.logging.format, config.logging.filter.as_deref(), "warn");
    let db = cli.db.unwrap_or(config.store.db_path);
    tracing::debug!(db = %db.display(), "resolved database path");

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&db)?;
            run_db(*command, &mut store, &DispositionKernelApi::new(db))
        }
        Command::Plan { command } => run_plan(*command, &DispositionKernelApi::new(db)),
        Command::Schedule { command } => run_schedule(*command, &DispositionKernelApi::new(db)),
        Command::Disposition { command } => {
            run_disposition(*command, &DispositionKernelApi::new(db))
        }
        Command::Audit(args) => {
            let node_id = args.node_id.as_deref().map(parse_node_id).transpose()?;
            let events = DispositionKernelApi::new(db).audit_log(node_id)?;
            emit_json(serde_json::json!({ "events": events }))
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore, api: &DispositionKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?, "migration result"),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => emit(&store.integrity_check()?, "integrity report"),
    }
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;

    if let Some(key_path) = args.signing_key_file.as_ref() {
        let signing_key = read_hex_key_file(key_path)?;
        let manifest_path = args.out.join(MANIFEST_FILE);
        let manifest_bytes = fs::read(&manifest_path)
            .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
        write_manifest_signature(&args.out, &manifest_bytes, &signing_key)?;
        write_security_metadata(
            &args.out,
            &SnapshotSecurityMetadata {
                signature_file: Some(MANIFEST_SIG_FILE.to_string()),
                signature_algorithm: Some(SIGNATURE_ALGORITHM.to_string()),
            },
        )?;
    } else {
        remove_if_exists(&args.out.join(MANIFEST_SIG_FILE))?;
        remove_if_exists(&args.out.join(MANIFEST_SECURITY_FILE))?;
    }

    emit_json(serde_json::json!({
        "out_dir": args.out,
        "signed": args.signing_key_file.is_some(),
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let verify_key =
        args.verify_key_file.as_ref().map(|path| read_hex_key_file(path)).transpose()?;
    let signed = verify_snapshot_input(&args.input, verify_key.as_ref(), args.allow_unsigned)?;
    let manifest = read_export_manifest(&args.input.join(MANIFEST_FILE))?;
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "signed": signed,
        "schema_version": manifest.schema_version,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_plan(command: PlanCommand, api: &DispositionKernelApi) -> Result<()> {
    match command {
        PlanCommand::Show => emit(&api.file_plan()?, "file plan"),
        PlanCommand::Category { command } => match *command {
            CategoryCommand::Add(args) => {
                let parent_id = args.parent_id.as_deref().map(parse_node_id).transpose()?;
                let node = api.create_category(create_node_request(args.name, parent_id, args.write)?)?;
                emit(&node, "category")
            }
        },
        PlanCommand::Folder { command } => match *command {
            FolderCommand::Add(args) => {
                let parent_id = parse_node_id(&args.parent_id)?;
                let node =
                    api.create_folder(create_node_request(args.name, Some(parent_id), args.write)?)?;
                emit(&node, "folder")
            }
            FolderCommand::Close(args) => emit(&api.close_folder(&node_change(&args)?)?, "folder"),
            FolderCommand::Reopen(args) => {
                emit(&api.reopen_folder(&node_change(&args)?)?, "folder")
            }
        },
        PlanCommand::Record { command } => match *command {
            RecordCommand::File(args) => {
                let parent_id = parse_node_id(&args.parent_id)?;
                let node =
                    api.file_record(create_node_request(args.name, Some(parent_id), args.write)?)?;
                emit(&node, "record")
            }
            RecordCommand::Declare(args) => {
                emit(&api.declare_record(&node_change(&args)?)?, "record")
            }
        },
        PlanCommand::SetProperty(args) => {
            let node = api.set_property(&SetPropertyRequest {
                node_id: parse_node_id(&args.node_id)?,
                name: args.name,
                value: parse_rfc3339(&args.value)?,
                actor: args.write.actor,
                at: parse_optional_rfc3339(args.write.at.as_deref())?,
            })?;
            emit(&node, "node")
        }
        PlanCommand::Move(args) => {
            let node = api.move_node(&MoveNodeRequest {
                node_id: parse_node_id(&args.node_id)?,
                new_parent_id: parse_node_id(&args.new_parent_id)?,
                actor: args.write.actor,
                at: parse_optional_rfc3339(args.write.at.as_deref())?,
            })?;
            emit(&node, "node")
        }
        PlanCommand::Link(args) => emit(&api.link_record(&link_request(args)?)?, "record link"),
        PlanCommand::Unlink(args) => {
            emit(&api.unlink_record(&link_request(args)?)?, "record link")
        }
    }
}

fn run_schedule(command: ScheduleCommand, api: &DispositionKernelApi) -> Result<()> {
    match command {
        ScheduleCommand::Create(args) => {
            let body = fs::read_to_string(&args.file).with_context(|| {
                format!("failed to read schedule file {}", args.file.display())
            })?;
            let document = parse_schedule_yaml(&body)
                .with_context(|| format!("invalid schedule file {}", args.file.display()))?;
            let schedule = api.create_schedule(CreateScheduleRequest {
                container_id: parse_node_id(&args.container_id)?,
                authority: document.authority,
                instructions: document.instructions,
                record_level: document.record_level,
                steps: document.steps,
                actor: args.write.actor,
                created_at: parse_optional_rfc3339(args.write.at.as_deref())?,
            })?;
            emit(&schedule, "schedule")
        }
        ScheduleCommand::Step { command } => run_step(*command, api),
        ScheduleCommand::Publish(args) => {
            let now = parse_optional_rfc3339(args.now.as_deref())?;
            let jobs = api.publish_pending(args.limit, now)?;
            emit_json(serde_json::json!({ "jobs": jobs }))
        }
        ScheduleCommand::Jobs(args) => {
            let jobs = api.list_publish_jobs(args.status.map(JobStatusArg::into_status))?;
            emit_json(serde_json::json!({ "jobs": jobs }))
        }
    }
}

fn run_step(command: StepCommand, api: &DispositionKernelApi) -> Result<()> {
    match command {
        StepCommand::Add(args) => {
            let step = StepSpec {
                name: args.name.into_action_name(),
                description: args.description.unwrap_or_default(),
                period: parse_period(&args.period)?,
                anchor: args.anchor.as_deref().map(parse_anchor).transpose()?.unwrap_or_default(),
                events: args.events,
                eligible_on_first_complete_event: args.eligible_on_first_complete_event,
                location: args.location,
                ghost_on_destroy: args.ghost_on_destroy,
            };
            let schedule = api.add_step(AddStepRequest {
                schedule_id: parse_schedule_id(&args.schedule_id)?,
                step,
                position: args.position,
                actor: args.write.actor,
                at: parse_optional_rfc3339(args.write.at.as_deref())?,
            })?;
            emit(&schedule, "schedule")
        }
        StepCommand::Update(args) => {
            let patch = StepDefinitionPatch {
                description: args.description,
                period: args.period.as_deref().map(parse_period).transpose()?,
                anchor: args.anchor.as_deref().map(parse_anchor).transpose()?,
                events: args.events,
                eligible_on_first_complete_event: args.eligible_on_first_complete_event,
                location: args.location,
                ghost_on_destroy: args.ghost_on_destroy,
            };
            let result = api.update_step(UpdateStepRequest {
                schedule_id: parse_schedule_id(&args.schedule_id)?,
                definition_id: parse_definition_id(&args.definition_id)?,
                patch,
                actor: args.write.actor,
                at: parse_optional_rfc3339(args.write.at.as_deref())?,
            })?;
            emit(&result, "step update")
        }
        StepCommand::Remove(args) => {
            let schedule = api.remove_step(&RemoveStepRequest {
                schedule_id: parse_schedule_id(&args.schedule_id)?,
                definition_id: parse_definition_id(&args.definition_id)?,
                actor: args.write.actor,
                at: parse_optional_rfc3339(args.write.at.as_deref())?,
            })?;
            emit(&schedule, "schedule")
        }
    }
}

fn run_disposition(command: DispositionCommand, api: &DispositionKernelApi) -> Result<()> {
    match command {
        DispositionCommand::Status(args) => {
            let item_id = parse_node_id(&args.item_id)?;
            let as_of = parse_optional_rfc3339(args.as_of.as_deref())?;
            emit(&api.disposition_status(item_id, as_of)?, "disposition status")
        }
        DispositionCommand::Event { command } => match *command {
            EventCommand::Complete(args) => {
                emit(&api.complete_event(&event_request(args)?)?, "lifecycle")
            }
            EventCommand::Undo(args) => emit(&api.undo_event(&event_request(args)?)?, "lifecycle"),
        },
        DispositionCommand::Execute(args) => {
            let outcome = api.execute_step(&ExecuteStepCommand {
                item_id: parse_node_id(&args.item_id)?,
                step_name: args.step.into_action_name(),
                actor: args.write.actor,
                executed_at: parse_optional_rfc3339(args.write.at.as_deref())?,
                enforce_eligibility: !args.ignore_eligibility,
                check_errors: !args.skip_on_error,
            })?;
            emit(&outcome, "step outcome")
        }
        DispositionCommand::UndoCutOff(args) => {
            emit(&api.undo_cut_off(&node_change(&args)?)?, "undo cut off result")
        }
        DispositionCommand::Due(args) => {
            let as_of = parse_optional_rfc3339(args.as_of.as_deref())?;
            let due = api.list_due(as_of)?;
            emit_json(serde_json::json!({ "due": due }))
        }
    }
}

fn create_node_request(
    name: String,
    parent_id: Option<NodeId>,
    write: WriteArgs,
) -> Result<CreateNodeRequest> {
    Ok(CreateNodeRequest {
        name,
        parent_id,
        actor: write.actor,
        created_at: parse_optional_rfc3339(write.at.as_deref())?,
    })
}

fn node_change(args: &NodeArgs) -> Result<NodeChangeRequest> {
    Ok(NodeChangeRequest {
        node_id: parse_node_id(&args.node_id)?,
        actor: args.write.actor.clone(),
        at: parse_optional_rfc3339(args.write.at.as_deref())?,
    })
}

fn link_request(args: LinkArgs) -> Result<LinkRecordRequest> {
    Ok(LinkRecordRequest {
        record_id: parse_node_id(&args.record_id)?,
        container_id: parse_node_id(&args.container_id)?,
        actor: args.write.actor,
        at: parse_optional_rfc3339(args.write.at.as_deref())?,
    })
}

fn event_request(args: EventArgs) -> Result<EventRequest> {
    Ok(EventRequest {
        item_id: parse_node_id(&args.item_id)?,
        event_name: args.event,
        actor: args.write.actor,
        at: parse_optional_rfc3339(args.write.at.as_deref())?,
    })
}

fn read_hex_key_file(path: &Path) -> Result<[u8; 32]> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let bytes = hex::decode(body.trim())
        .with_context(|| format!("key file must contain hex bytes: {}", path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "key file {} must decode to exactly 32 bytes (got {})",
            path.display(),
            bytes.len()
        ));
    }

    let mut key = [0_u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn write_manifest_signature(out_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature key: {err}"))?;
    mac.update(manifest_bytes);
    let signature_hex = hex::encode(mac.finalize().into_bytes());
    let signature_path = out_dir.join(MANIFEST_SIG_FILE);
    fs::write(&signature_path, signature_hex)
        .with_context(|| format!("failed to write manifest signature {}", signature_path.display()))
}

fn verify_manifest_signature(in_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let signature_path = in_dir.join(MANIFEST_SIG_FILE);
    let signature_body = fs::read_to_string(&signature_path).with_context(|| {
        format!("failed to read manifest signature file {}", signature_path.display())
    })?;
    let signature = hex::decode(signature_body.trim()).with_context(|| {
        format!("manifest signature file is not valid hex: {}", signature_path.display())
    })?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature verification key: {err}"))?;
    mac.update(manifest_bytes);
    mac.verify_slice(&signature).map_err(|_| {
        anyhow!("manifest signature verification failed for {}", signature_path.display())
    })
}

fn write_security_metadata(out_dir: &Path, metadata: &SnapshotSecurityMetadata) -> Result<()> {
    let path = out_dir.join(MANIFEST_SECURITY_FILE);
    let body =
        serde_json::to_vec_pretty(metadata).context("failed to serialize security metadata")?;
    fs::write(&path, body)
        .with_context(|| format!("failed to write security metadata {}", path.display()))
}

fn read_security_metadata(in_dir: &Path) -> Result<Option<SnapshotSecurityMetadata>> {
    let path = in_dir.join(MANIFEST_SECURITY_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let body = fs::read_to_string(&path)
        .with_context(|| format!("failed to read security metadata {}", path.display()))?;
    let metadata = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse security metadata {}", path.display()))?;
    Ok(Some(metadata))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove file {}", path.display()))?;
    }
    Ok(())
}

/// Check the manifest signature of a snapshot directory. Returns whether it was signed.
fn verify_snapshot_input(
    input_dir: &Path,
    verify_key: Option<&[u8; 32]>,
    allow_unsigned: bool,
) -> Result<bool> {
    let manifest_path = input_dir.join(MANIFEST_FILE);
    let manifest_bytes = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;

    if let Some(security) = read_security_metadata(input_dir)? {
        if security.signature_algorithm.as_deref().is_some_and(|alg| alg != SIGNATURE_ALGORITHM) {
            return Err(anyhow!(
                "unsupported signature algorithm in security metadata for {}",
                input_dir.display()
            ));
        }
    }

    let signature_path = input_dir.join(MANIFEST_SIG_FILE);
    if signature_path.exists() {
        let key = verify_key.ok_or_else(|| {
            anyhow!(
                "snapshot is signed; provide --verify-key-file to verify {}",
                signature_path.display()
            )
        })?;
        verify_manifest_signature(input_dir, &manifest_bytes, key)?;
        return Ok(true);
    }
    if !allow_unsigned {
        return Err(anyhow!(
            "snapshot is unsigned; rerun with --allow-unsigned for explicit override"
        ));
    }
    tracing::warn!(dir = %input_dir.display(), "importing unsigned snapshot");
    Ok(false)
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    value.map(parse_rfc3339).transpose()
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn parse_node_id(value: &str) -> Result<NodeId> {
    Ok(value.parse::<NodeId>()?)
}

fn parse_schedule_id(value: &str) -> Result<ScheduleId> {
    Ok(value.parse::<ScheduleId>()?)
}

fn parse_definition_id(value: &str) -> Result<StepDefinitionId> {
    Ok(value.parse::<StepDefinitionId>()?)
}

fn parse_period(value: &str) -> Result<Period> {
    value.parse::<Period>().with_context(|| format!("invalid period: {value}"))
}

fn parse_anchor(value: &str) -> Result<PeriodAnchor> {
    value.parse::<PeriodAnchor>().with_context(|| format!("invalid anchor: {value}"))
}

impl ActionArg {
    fn into_action_name(self) -> DispositionActionName {
        match self {
            Self::Cutoff => DispositionActionName::Cutoff,
            Self::Retain => DispositionActionName::Retain,
            Self::Transfer => DispositionActionName::Transfer,
            Self::Accession => DispositionActionName::Accession,
            Self::Destroy => DispositionActionName::Destroy,
        }
    }
}

impl JobStatusArg {
    fn into_status(self) -> PublishJobStatus {
        match self {
            Self::Queued => PublishJobStatus::Queued,
            Self::Running => PublishJobStatus::Running,
            Self::Succeeded => PublishJobStatus::Succeeded,
            Self::Failed => PublishJobStatus::Failed,
        }
    }
}
