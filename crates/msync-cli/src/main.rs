use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use msync_core::ScopeType;
use msync_storage::PgStore;
use msync_sync::EngineSettings;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "msync")]
#[command(about = "Marketing metrics sheet sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Restore jobs, start the scheduler and serve the JSON API.
    Serve,
    /// Run one project's sync now and print the result.
    Sync {
        #[arg(long)]
        project: Uuid,
        #[arg(long, default_value = "single", value_parser = parse_scope)]
        scope: ScopeType,
    },
    /// Apply database migrations.
    Migrate,
    /// List the tabs of a spreadsheet.
    Sheets {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        spreadsheet: String,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Serve => "serve",
            Commands::Sync { .. } => "sync",
            Commands::Migrate => "migrate",
            Commands::Sheets { .. } => "sheets",
        }
    }
}

fn parse_scope(raw: &str) -> Result<ScopeType, String> {
    ScopeType::parse(raw).ok_or_else(|| format!("unknown scope {raw:?}; use single or multi"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve);
    info!(command = command.name(), version = env!("CARGO_PKG_VERSION"), "msync starting");

    match command {
        Commands::Serve => msync_web::serve_from_env().await?,
        Commands::Sync { project, scope } => {
            let settings = EngineSettings::from_env();
            let service = msync_sync::build_service(&settings).await?;
            let result = service.trigger_manual_sync(project, scope).await?;
            info!(
                %project,
                %scope,
                sheets = result.per_sheet_results.len(),
                inserted = result.total_inserted,
                updated = result.total_updated,
                skipped = result.total_skipped,
                success = result.success,
                "sync finished"
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("serializing sync result")?
            );
            if !result.success {
                bail!(
                    "sync failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Migrate => {
            let settings = EngineSettings::from_env();
            let Some(url) = settings.database_url else {
                bail!("DATABASE_URL is not set");
            };
            let store = PgStore::connect(&url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
            println!("migrations applied");
        }
        Commands::Sheets {
            project,
            spreadsheet,
        } => {
            let settings = EngineSettings::from_env();
            let service = msync_sync::build_service(&settings).await?;
            let sheets = service.discover_sheets(project, &spreadsheet).await?;
            info!(%project, %spreadsheet, count = sheets.len(), "listed sheets");
            for sheet in sheets {
                match sheet.sheet_id {
                    Some(id) => println!("{id}\t{}", sheet.title),
                    None => println!("-\t{}", sheet.title),
                }
            }
        }
    }

    Ok(())
}
