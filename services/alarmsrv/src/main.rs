use alarmsrv::config::Config;
use alarmsrv::{app, logging, SERVICE_NAME, SERVICE_VERSION};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Voltage EMS alarm rule executor", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the alarm rule executor
    Run,
    /// Validate configuration and the rules file, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _log = logging::init(&config.log, &config.service.name)?;
            info!("{} v{}", SERVICE_NAME, SERVICE_VERSION);
            app::run(config).await
        },
        Commands::Check => {
            let summary = app::check(&config)?;
            println!(
                "Configuration OK: topic {} with {} partitions, {} workers",
                config.queue.topic, config.queue.partitions, config.queue.worker_threads
            );
            println!(
                "Rules file {}: {} rules ({} enabled, {} invalid) for {} tenants, {} devices, {} assets",
                config.catalog.rules_file.display(),
                summary.rules,
                summary.enabled,
                summary.invalid.len(),
                summary.tenants,
                summary.devices,
                summary.assets
            );
            for (rule_id, reason) in &summary.invalid {
                println!("  invalid rule {}: {}", rule_id, reason);
            }
            Ok(())
        },
    }
}
