use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wtw_storage::{load_opinions_csv, OpinionStore};
use wtw_web::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "wtw")]
#[command(about = "What to Watch: movie opinions server and tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web server.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Import opinions from a CSV file.
    LoadOpinions {
        #[arg(long, default_value = "opinions.csv")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => wtw_web::serve(config).await?,
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied");
        }
        Commands::LoadOpinions { path } => {
            let store = open_store(&config).await?;
            match load_opinions_csv(&store, &path).await {
                Ok(loaded) => println!("Loaded opinions: {loaded}"),
                Err(err) => {
                    println!("Loaded opinions: {}", err.loaded());
                    return Err(err).with_context(|| format!("importing {}", path.display()));
                }
            }
        }
    }

    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<OpinionStore> {
    let store = OpinionStore::connect(&config.database_uri)
        .await
        .with_context(|| format!("opening {}", config.database_uri))?;
    store.migrate().await?;
    Ok(store)
}
