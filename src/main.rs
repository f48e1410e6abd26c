//! Canopy CLI - Main entry point.

use canopy::cli::{Cli, Commands};
use canopy::config::{CanopyConfig, JournalKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => CanopyConfig::from_file(path)?,
        None => CanopyConfig::development(),
    };
    config.observability.log_level = cli.log_level;

    match cli.command {
        Commands::Server {
            root_ufs,
            journal,
            json_logs,
        } => {
            if let Some(uri) = root_ufs {
                config.master.root_ufs_uri = uri;
            }
            if let Some(path) = journal {
                config.journal.kind = JournalKind::File;
                config.journal.path = path;
            }
            config.observability.json_logs |= json_logs;
            config.validate()?;

            canopy::run(config).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Version => {
            println!("Canopy v{}", env!("CARGO_PKG_VERSION"));
            println!("Namespace metadata master with asynchronous persistence to under storage");
        }
    }

    Ok(())
}
