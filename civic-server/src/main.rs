use civic_core::audit::{AuditOptions, AuditReport, RepairPlan};
use civic_core::config::Config;
use civic_core::data_dir::DataDir;
use civic_core::db::Database;
use civic_core::export::ExportService;
use civic_core::import::import_week_with_retry;
use civic_core::routes::{create_router, AppState};
use civic_core::storage::RequestContext;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// civic server: week asset storage with range streaming.
#[derive(Parser)]
#[command(name = "civic-server")]
struct Args {
    /// Data directory (holds civic.db and config.yaml).
    #[arg(long, default_value = "./data", env = "CIVIC_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API
    Serve {
        /// Address to bind the server to.
        #[arg(long, default_value = "0.0.0.0", env = "CIVIC_BIND")]
        bind: String,

        /// Port for the REST API.
        #[arg(long, default_value = "8080", env = "CIVIC_PORT")]
        port: u16,
    },
    /// Check weeks, file records and chunks against each other
    Audit {
        /// Re-read every file and compare its MD5
        #[arg(long)]
        verify_checksums: bool,
        /// Remove references to missing files from weeks
        #[arg(long)]
        strip_dangling: bool,
        /// Delete files and chunk sets nothing references
        #[arg(long)]
        delete_orphans: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a week from the images and report in a folder
    Import {
        #[arg(long)]
        week: u32,
        #[arg(long)]
        summary: String,
        folder: PathBuf,
    },
    /// Write weeks and their files to a directory with a manifest
    Export {
        /// Defaults to the data directory's exports folder
        out_dir: Option<PathBuf>,
        /// Only this week
        #[arg(long)]
        week: Option<u32>,
    },
}

fn configure_logging() {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    configure_logging();
    let args = Args::parse();

    let config = Config::load(DataDir::new(args.data_dir)).unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    let db_path = config.data_dir.db_path();
    let database = Database::open(&db_path, config.db_max_connections)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to open database at {}: {e}", db_path.display());
            std::process::exit(1);
        });

    let state = Arc::new(AppState::new(database, config));

    match args.command {
        Command::Serve { bind, port } => serve(state, &bind, port).await,
        Command::Audit {
            verify_checksums,
            strip_dangling,
            delete_orphans,
            json,
        } => {
            let options = AuditOptions {
                verify_checksums,
                orphan_grace: state.config.orphan_grace,
            };
            let result = if strip_dangling || delete_orphans {
                let plan = RepairPlan {
                    strip_dangling,
                    delete_orphans,
                };
                state.auditor.repair(&options, plan).await
            } else {
                state.auditor.audit(&options).await
            };
            let report = result.unwrap_or_else(|e| {
                error!("Audit failed: {e}");
                std::process::exit(1);
            });
            print_audit(&report, json);
            if !report.is_clean() && report.repairs.is_none() {
                std::process::exit(2);
            }
        }
        Command::Import {
            week,
            summary,
            folder,
        } => {
            let ctx = RequestContext::new(Some("cli-import".to_string()));
            match import_week_with_retry(&state.linker, week, &summary, &folder, &ctx).await {
                Ok(week) => println!(
                    "Imported week {} ({} photos, {} report)",
                    week.week_number,
                    week.photo_file_ids.len(),
                    if week.report_file_id.is_some() { "with" } else { "no" }
                ),
                Err(e) => {
                    error!("Import of week {week} from {} failed: {e}", folder.display());
                    std::process::exit(1);
                }
            }
        }
        Command::Export { out_dir, week } => {
            let out_dir = out_dir.unwrap_or_else(|| state.config.data_dir.exports_dir());
            let export = ExportService::new(state.linker.clone());
            let result = match week {
                Some(week) => export.export_week(week, &out_dir).await,
                None => export.export_all(&out_dir).await,
            };
            match result {
                Ok(manifest) => println!(
                    "Exported {} weeks to {}",
                    manifest.weeks.len(),
                    out_dir.display()
                ),
                Err(e) => {
                    error!("Export to {} failed: {e}", out_dir.display());
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn serve(state: Arc<AppState>, bind: &str, port: u16) {
    let app = create_router(state).layer(CorsLayer::permissive());
    let addr = format!("{}:{}", bind, port);

    info!("Binding to {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        });

    info!("civic-server listening on http://{addr}");
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}

fn print_audit(report: &AuditReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(out) => println!("{out}"),
            Err(e) => error!("Failed to serialize report: {e}"),
        }
        return;
    }

    println!(
        "{} files, {} valid",
        report.total_files, report.valid_files
    );
    for id in &report.incomplete_files {
        println!("incomplete: {id}");
    }
    for dangling in &report.dangling_references {
        for id in &dangling.file_ids {
            println!("dangling: week {} -> {id}", dangling.week_number);
        }
    }
    for id in &report.orphaned_files {
        println!("orphaned file: {id}");
    }
    for id in &report.orphaned_chunk_sets {
        println!("orphaned chunks: {id}");
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if let Some(repairs) = &report.repairs {
        println!(
            "repaired: {} references stripped, {} files deleted, {} chunk sets deleted, {} failures",
            repairs.stripped_references,
            repairs.deleted_orphans,
            repairs.deleted_chunk_sets,
            repairs.failures.len()
        );
    }
}
