use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ats_verify_api::{AtsVerifyApi, SetRiskProfileRequest};
use ats_verify_core::{
    ListUnitsQuery, MarketplaceDirectory, Normalizer, NormalizerConfig, ReaderOptions, RiskLevel,
    RiskProfileId, UploadContext, UsageFilter, UserId,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ats")]
#[command(about = "Parcel verification and risk analytics CLI")]
struct Cli {
    #[arg(long, default_value = "./ats_verify.sqlite3")]
    db: PathBuf,

    /// JSON object mapping uploader prefixes to marketplace names.
    #[arg(long)]
    marketplaces: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Parcels {
        #[command(subcommand)]
        command: ParcelsCommand,
    },
    Risk {
        #[command(subcommand)]
        command: Box<RiskCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ParcelsCommand {
    Ingest(ParcelsIngestArgs),
    Lookup(ParcelsLookupArgs),
    MarkUsed(ParcelsMarkUsedArgs),
    List(ParcelsListArgs),
}

#[derive(Debug, Args)]
struct ReaderArgs {
    /// Field delimiter; sniffed from the header when omitted.
    #[arg(long)]
    delimiter: Option<char>,
}

#[derive(Debug, Args)]
struct ParcelsIngestArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    uploader: String,
    #[arg(long)]
    marketplace_prefix: Option<String>,
    #[command(flatten)]
    reader: ReaderArgs,
}

#[derive(Debug, Args)]
struct ParcelsLookupArgs {
    #[arg(long = "track", required = true)]
    tracks: Vec<String>,
}

#[derive(Debug, Args)]
struct ParcelsMarkUsedArgs {
    #[arg(long)]
    track: String,
}

#[derive(Debug, Args)]
struct ParcelsListArgs {
    #[arg(long, value_enum, default_value_t = StatusArg::All)]
    status: StatusArg,
    #[arg(long, default_value = "")]
    search: String,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = ats_verify_core::DEFAULT_PAGE_LIMIT)]
    limit: u32,
}

#[derive(Debug, Subcommand)]
enum RiskCommand {
    Load(RiskLoadArgs),
    Analytics,
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
}

#[derive(Debug, Args)]
struct RiskLoadArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    chunk_rows: Option<usize>,
    #[command(flatten)]
    reader: ReaderArgs,
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    Set(ProfileSetArgs),
    List,
    Delete(ProfileDeleteArgs),
}

#[derive(Debug, Args)]
struct ProfileSetArgs {
    #[arg(long)]
    identity_key: String,
    #[arg(long, value_enum)]
    level: RiskLevelArg,
    #[arg(long)]
    flagged_by: String,
    #[arg(long, default_value = "")]
    reason: String,
}

#[derive(Debug, Args)]
struct ProfileDeleteArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    All,
    Used,
    Unused,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RiskLevelArg {
    Green,
    Yellow,
    Red,
}

impl From<StatusArg> for UsageFilter {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::All => Self::All,
            StatusArg::Used => Self::Used,
            StatusArg::Unused => Self::Unused,
        }
    }
}

impl From<RiskLevelArg> for RiskLevel {
    fn from(value: RiskLevelArg) -> Self {
        match value {
            RiskLevelArg::Green => Self::Green,
            RiskLevelArg::Yellow => Self::Yellow,
            RiskLevelArg::Red => Self::Red,
        }
    }
}

impl ReaderArgs {
    fn options(&self) -> Result<ReaderOptions> {
        let delimiter = self
            .delimiter
            .map(|ch| {
                u8::try_from(ch)
                    .ok()
                    .filter(u8::is_ascii)
                    .ok_or_else(|| anyhow!("delimiter `{ch}` must be a single ASCII character"))
            })
            .transpose()?;
        Ok(ReaderOptions { delimiter, ..ReaderOptions::default() })
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

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn load_directory(path: Option<&Path>) -> Result<MarketplaceDirectory> {
    let Some(path) = path else {
        return Ok(MarketplaceDirectory::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read marketplace directory {}", path.display()))?;
    MarketplaceDirectory::from_json_str(&raw)
        .with_context(|| format!("failed to parse marketplace directory {}", path.display()))
}

fn open_input(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let directory = load_directory(cli.marketplaces.as_deref())?;
    let api = AtsVerifyApi::new(cli.db, Normalizer::new(NormalizerConfig::default(), directory));
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Parcels { command } => run_parcels(command, api),
        Command::Risk { command } => run_risk(*command, api),
    }
}

fn run_db(command: DbCommand, api: &AtsVerifyApi) -> Result<()> {
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
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_parcels(command: ParcelsCommand, api: AtsVerifyApi) -> Result<()> {
    match command {
        ParcelsCommand::Ingest(args) => {
            let context = UploadContext {
                uploader_id: UserId::parse(&args.uploader)?,
                marketplace_prefix: args.marketplace_prefix,
            };
            let api = api.with_reader_options(args.reader.options()?);
            let result = api.ingest_parcels(open_input(&args.file)?, &context)?;
            emit(&result)
        }
        ParcelsCommand::Lookup(args) => emit(&api.lookup_tracks(&args.tracks)?),
        ParcelsCommand::MarkUsed(args) => {
            let outcome = api.mark_used(&args.track)?;
            emit_json(serde_json::json!({
                "track_number": args.track.trim(),
                "outcome": outcome
            }))
        }
        ParcelsCommand::List(args) => {
            let query = ListUnitsQuery {
                status: args.status.into(),
                search: args.search,
                page: args.page,
                limit: args.limit,
            };
            emit(&api.list_units(&query)?)
        }
    }
}

fn run_risk(command: RiskCommand, api: AtsVerifyApi) -> Result<()> {
    match command {
        RiskCommand::Load(args) => {
            let mut api = api.with_reader_options(args.reader.options()?);
            if let Some(chunk_rows) = args.chunk_rows {
                api = api.with_ledger_chunk_rows(chunk_rows);
            }
            emit(&api.ingest_risk_ledger(open_input(&args.file)?)?)
        }
        RiskCommand::Analytics => emit(&api.analytics_reports()?),
        RiskCommand::Profile { command } => match command {
            ProfileCommand::Set(args) => {
                let profile = api.set_risk_profile(SetRiskProfileRequest {
                    identity_key: args.identity_key,
                    risk_level: args.level.into(),
                    flagged_by: UserId::parse(&args.flagged_by)?,
                    reason: args.reason,
                })?;
                emit(&profile)
            }
            ProfileCommand::List => {
                emit_json(serde_json::json!({ "profiles": api.list_risk_profiles()? }))
            }
            ProfileCommand::Delete(args) => {
                let id = RiskProfileId::parse(&args.id)?;
                api.delete_risk_profile(id)?;
                emit_json(serde_json::json!({ "id": id, "deleted": true }))
            }
        },
    }
}
