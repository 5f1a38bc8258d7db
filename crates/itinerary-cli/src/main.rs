use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use itinerary_api::{
    ItineraryPlannerApi, MergeTripRequest, PlanExportFormat, SaveTripRequest, UpdateItemRequest,
};
use itinerary_core::{ItemId, ItemPatch, ItemType, ItineraryId, TripSuggestion};
use itinerary_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "trip")]
#[command(about = "Trip itinerary CLI")]
struct Cli {
    #[arg(long, default_value = "./itineraries.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Trip {
        #[command(subcommand)]
        command: Box<TripCommand>,
    },
    Item {
        #[command(subcommand)]
        command: Box<ItemCommand>,
    },
    Plan {
        #[command(subcommand)]
        command: Box<PlanCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
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
enum TripCommand {
    Save(TripSaveArgs),
    Merge(TripMergeArgs),
    List(OwnerArgs),
    Show(TripRefArgs),
    Rename(TripRenameArgs),
    Delete(TripRefArgs),
}

#[derive(Debug, Args)]
struct OwnerArgs {
    #[arg(long)]
    owner: String,
}

#[derive(Debug, Args)]
struct TripSaveArgs {
    #[arg(long)]
    owner: String,
    /// Path to a trip suggestion JSON document.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct TripMergeArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    itinerary_id: String,
    /// Path to a trip suggestion JSON document.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct TripRefArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    itinerary_id: String,
}

#[derive(Debug, Args)]
struct TripRenameArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    itinerary_id: String,
    #[arg(long)]
    title: String,
}

#[derive(Debug, Subcommand)]
enum ItemCommand {
    Update(ItemUpdateArgs),
    Delete(ItemRefArgs),
}

#[derive(Debug, Args)]
struct ItemRefArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    item_id: String,
}

#[derive(Debug, Args)]
struct ItemUpdateArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    item_id: String,
    #[arg(long)]
    day_index: Option<u32>,
    #[arg(long)]
    position: Option<u32>,
    #[arg(long, value_enum)]
    item_type: Option<ItemTypeArg>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    ref_table: Option<String>,
    #[arg(long)]
    ref_id: Option<String>,
    /// RFC3339 timestamp, e.g. 2026-05-01T09:00:00Z.
    #[arg(long)]
    start_time: Option<String>,
    /// RFC3339 timestamp, e.g. 2026-05-01T11:30:00Z.
    #[arg(long)]
    end_time: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PlanCommand {
    Resequence(PlanRefArgs),
    Refresh(PlanRefArgs),
    Export(PlanExportArgs),
}

#[derive(Debug, Args)]
struct PlanRefArgs {
    #[arg(long)]
    itinerary_id: String,
}

#[derive(Debug, Args)]
struct PlanExportArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    itinerary_id: String,
    #[arg(long, value_enum, default_value = "json")]
    format: FormatArg,
    /// Write the rendered body here instead of inlining it in the output.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ItemTypeArg {
    Attraction,
    Restaurant,
    Accommodation,
    Transport,
    Other,
}

impl From<ItemTypeArg> for ItemType {
    fn from(value: ItemTypeArg) -> Self {
        match value {
            ItemTypeArg::Attraction => Self::Attraction,
            ItemTypeArg::Restaurant => Self::Restaurant,
            ItemTypeArg::Accommodation => Self::Accommodation,
            ItemTypeArg::Transport => Self::Transport,
            ItemTypeArg::Other => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
}

impl From<FormatArg> for PlanExportFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Json => Self::Json,
            FormatArg::Csv => Self::Csv,
        }
    }
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

fn parse_itinerary_id(raw: &str) -> Result<ItineraryId> {
    ItineraryId::parse(raw).ok_or_else(|| anyhow!("invalid itinerary id: {raw}"))
}

fn parse_item_id(raw: &str) -> Result<ItemId> {
    ItemId::parse(raw).ok_or_else(|| anyhow!("invalid item id: {raw}"))
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {raw}"))
}

fn read_suggestion(path: &PathBuf) -> Result<TripSuggestion> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read suggestion file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse suggestion file {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = ItineraryPlannerApi::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => run_db(*command, &api, &cli.db),
        Command::Trip { command } => run_trip(*command, &api),
        Command::Item { command } => run_item(*command, &api),
        Command::Plan { command } => run_plan(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &ItineraryPlannerApi, db_path: &PathBuf) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Backup(args) => {
            let mut store = SqliteStore::open(db_path)?;
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            let mut store = SqliteStore::open(db_path)?;
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_trip(command: TripCommand, api: &ItineraryPlannerApi) -> Result<()> {
    match command {
        TripCommand::Save(args) => {
            let suggestion = read_suggestion(&args.file)?;
            let trip = api.save_trip(SaveTripRequest { owner_id: args.owner, suggestion })?;
            emit_json(serde_json::to_value(&trip).context("failed to serialize saved trip")?)
        }
        TripCommand::Merge(args) => {
            let suggestion = read_suggestion(&args.file)?;
            let itinerary_id = parse_itinerary_id(&args.itinerary_id)?;
            let trip =
                api.merge_trip(MergeTripRequest { owner_id: args.owner, itinerary_id, suggestion })?;
            emit_json(serde_json::to_value(&trip).context("failed to serialize merged trip")?)
        }
        TripCommand::List(args) => {
            let trips = api.list_trips(&args.owner)?;
            emit_json(serde_json::json!({
                "count": trips.len(),
                "trips": trips
            }))
        }
        TripCommand::Show(args) => {
            let itinerary_id = parse_itinerary_id(&args.itinerary_id)?;
            let trip = api.get_trip(&args.owner, itinerary_id)?;
            emit_json(serde_json::to_value(&trip).context("failed to serialize trip")?)
        }
        TripCommand::Rename(args) => {
            let itinerary_id = parse_itinerary_id(&args.itinerary_id)?;
            let itinerary = api.rename_trip(&args.owner, itinerary_id, &args.title)?;
            emit_json(serde_json::to_value(&itinerary).context("failed to serialize itinerary")?)
        }
        TripCommand::Delete(args) => {
            let itinerary_id = parse_itinerary_id(&args.itinerary_id)?;
            api.delete_trip(&args.owner, itinerary_id)?;
            emit_json(serde_json::json!({
                "itinerary_id": itinerary_id,
                "deleted": true
            }))
        }
    }
}

fn run_item(command: ItemCommand, api: &ItineraryPlannerApi) -> Result<()> {
    match command {
        ItemCommand::Update(args) => {
            let item_id = parse_item_id(&args.item_id)?;
            let patch = ItemPatch {
                day_index: args.day_index,
                position: args.position,
                item_type: args.item_type.map(ItemType::from),
                title: args.title,
                ref_table: args.ref_table,
                ref_id: args.ref_id,
                notes: args.notes,
                start_time: args.start_time.as_deref().map(parse_timestamp).transpose()?,
                end_time: args.end_time.as_deref().map(parse_timestamp).transpose()?,
            };
            let item = api.update_item(UpdateItemRequest { owner_id: args.owner, item_id, patch })?;
            emit_json(serde_json::to_value(&item).context("failed to serialize item")?)
        }
        ItemCommand::Delete(args) => {
            let item_id = parse_item_id(&args.item_id)?;
            let itinerary_id = api.delete_item(&args.owner, item_id)?;
            emit_json(serde_json::json!({
                "item_id": item_id,
                "itinerary_id": itinerary_id,
                "deleted": true
            }))
        }
    }
}

fn run_plan(command: PlanCommand, api: &ItineraryPlannerApi) -> Result<()> {
    match command {
        PlanCommand::Resequence(args) => {
            let itinerary_id = parse_itinerary_id(&args.itinerary_id)?;
            let rewritten_rows = api.resequence(itinerary_id)?;
            emit_json(serde_json::json!({
                "itinerary_id": itinerary_id,
                "rewritten_rows": rewritten_rows
            }))
        }
        PlanCommand::Refresh(args) => {
            let itinerary_id = parse_itinerary_id(&args.itinerary_id)?;
            api.refresh_plan(itinerary_id)?;
            emit_json(serde_json::json!({
                "itinerary_id": itinerary_id,
                "refreshed": true
            }))
        }
        PlanCommand::Export(args) => {
            let itinerary_id = parse_itinerary_id(&args.itinerary_id)?;
            let export = api.export_plan(&args.owner, itinerary_id, args.format.into())?;

            if let Some(out) = args.out {
                fs::write(&out, &export.body)
                    .with_context(|| format!("failed to write export file {}", out.display()))?;
                emit_json(serde_json::json!({
                    "itinerary_id": export.itinerary_id,
                    "title": export.title,
                    "format": export.format,
                    "digest": export.digest,
                    "out_path": out
                }))
            } else {
                emit_json(serde_json::to_value(&export).context("failed to serialize export")?)
            }
        }
    }
}
