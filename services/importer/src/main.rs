use anyhow::Context;
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::Instrument;
use uuid::Uuid;

use importer::config::Settings;
use importer::diagnostics::TracingDiagnostics;
use importer::grid::load_grid;
use importer::store::memory::MemoryStore;
use importer::store::mysql::MySqlStore;
use importer::telemetry::{init_tracing, DEFAULT_FILTER};
use importer::{import_grid, ImportError, ImportOptions, ImportReport, Stage};

#[derive(Parser, Debug)]
#[command(
    name = "importer",
    version,
    about = "Imports ERP service voucher exports into MySQL"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one exported spreadsheet (.xls, .xlsx, .ods or .csv)
    Import(ImportArgs),
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Path to the exported file
    path: PathBuf,

    /// Worksheet name (defaults to the first sheet)
    #[arg(long)]
    sheet: Option<String>,

    /// Rows per transaction (overrides IMPORT_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Tries per batch on lock contention (overrides IMPORT_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Fail when no header row is detected instead of assuming row 1
    #[arg(long, default_value = "false")]
    strict_header: bool,

    /// Dry run - import into an in-memory store, nothing is written
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Print the final report as JSON on stdout
    #[arg(long, default_value = "false")]
    json: bool,
}

const EXIT_USAGE: u8 = 1;
const EXIT_FILE_MISSING: u8 = 2;
const EXIT_READ_OR_MAPPING: u8 = 3;
const EXIT_DATABASE: u8 = 4;

/// Why a run stopped, with the process exit code that goes with it.
enum Failure {
    Usage(anyhow::Error),
    Import(ImportError),
    Database(anyhow::Error),
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            Failure::Usage(_) => EXIT_USAGE,
            Failure::Import(err) => match err.stage() {
                Stage::Read | Stage::Mapping => EXIT_READ_OR_MAPPING,
                Stage::Schema | Stage::BatchCommit => EXIT_DATABASE,
            },
            Failure::Database(_) => EXIT_DATABASE,
        }
    }

    fn report(&self) {
        match self {
            Failure::Usage(err) => eprintln!("Error: {:#}", err),
            Failure::Database(err) => eprintln!("Database error: {:#}", err),
            Failure::Import(err) => {
                eprintln!("Import failed at stage '{}': {}", err.stage(), err);
                if matches!(err.stage(), Stage::BatchCommit) {
                    eprintln!(
                        "Rows committed before the failure: {} (re-running the import is safe)",
                        err.committed()
                    );
                }
            }
        }
    }
}

impl From<ImportError> for Failure {
    fn from(err: ImportError) -> Self {
        Failure::Import(err)
    }
}

/// Help and version requests are not failures.
fn parse_exit_code(err: &clap::Error) -> u8 {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => EXIT_USAGE,
    }
}

fn check_input(path: &Path) -> Result<(), u8> {
    if path.is_file() {
        Ok(())
    } else {
        Err(EXIT_FILE_MISSING)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(parse_exit_code(&err));
        }
    };

    if let Err(e) = init_tracing(DEFAULT_FILTER) {
        eprintln!("{e}");
    }

    let Command::Import(args) = cli.command;
    if let Err(code) = check_input(&args.path) {
        eprintln!("File does not exist: {}", args.path.display());
        return ExitCode::from(code);
    }

    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("import", %run_id);
    let json = args.json;
    match run(args, run_id).instrument(span).await {
        Ok(report) => {
            print_report(&report, json);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            failure.report();
            ExitCode::from(failure.exit_code())
        }
    }
}

async fn run(args: ImportArgs, run_id: Uuid) -> Result<ImportReport, Failure> {
    let settings = Settings::from_env().map_err(Failure::Usage)?;

    let mut options = ImportOptions {
        header_scan_rows: settings.header_scan_rows,
        strict_header: settings.strict_header || args.strict_header,
        seed_cache: settings.seed_cache,
        batch: settings.batch(),
    };
    if let Some(size) = args.batch_size {
        options.batch.batch_size = size;
    }
    if let Some(attempts) = args.max_attempts {
        options.batch.max_attempts = attempts;
    }
    if options.batch.batch_size == 0 || options.batch.max_attempts == 0 {
        return Err(Failure::Usage(anyhow::anyhow!(
            "--batch-size and --max-attempts must be at least 1"
        )));
    }

    if !args.json {
        println!("=== Service Voucher Importer ===");
        println!("Run ID: {}", run_id);
        println!("File: {}", args.path.display());
        println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });
        println!(
            "Batch size: {}, max attempts: {}",
            options.batch.batch_size, options.batch.max_attempts
        );
    }

    let grid = load_grid(&args.path, args.sheet.as_deref())?;
    tracing::info!(rows = grid.len(), "spreadsheet loaded");

    let diag = TracingDiagnostics::default();
    let report = if args.dry_run {
        let store = MemoryStore::new();
        import_grid(&store, &grid, &options, &diag, run_id).await?
    } else {
        let connect = settings.db.connect_options().map_err(Failure::Usage)?;
        if !args.json {
            println!("Database: {}", settings.db.describe());
        }
        let store = MySqlStore::connect(
            connect,
            settings.db.max_connections,
            settings.db.lock_wait_timeout_secs,
        )
        .await
        .context("Failed to connect to database")
        .map_err(Failure::Database)?;
        import_grid(&store, &grid, &options, &diag, run_id).await?
    };

    Ok(report)
}

fn print_report(report: &ImportReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(body) => println!("{body}"),
            Err(e) => eprintln!("Failed to serialize report: {e}"),
        }
        return;
    }

    println!("\n=== Import Summary ===");
    if report.header_detected {
        println!("Header row: {}", report.header_row);
    } else {
        println!("Header row: not detected, assumed row {}", report.header_row);
    }
    if !report.tables_created.is_empty() {
        println!("Tables created: {}", report.tables_created.join(", "));
    }
    println!("Rows read: {}", report.rows_read);
    println!("Rows upserted: {} in {} batches", report.upserted, report.batches);
    println!("Rows skipped (incomplete key): {}", report.skipped);
    println!(
        "Providers created: {}, categories created: {}",
        report.providers_created, report.categories_created
    );
    if report.retries > 0 {
        println!("Lock retries: {}", report.retries);
    }
    if report.coercions > 0 {
        println!("Coerced values: {} (see warnings above)", report.coercions);
    }
}
