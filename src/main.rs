use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpbind::{BindingServer, Config, FileLeaseStore, LeaseStore, Result};

#[derive(Parser)]
#[command(name = "dhcpbind")]
#[command(author, version, long_about = None)]
#[command(about = "DHCP lease binding and address allocation engine")]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the pools, run the reaper until Ctrl-C, then flush leases
    Run,
    ShowConfig,
    ListLeases,
    /// Run one reaper pass and save the result
    CleanupLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting binding engine with config: {:?}", cli.config);
            let store = Arc::new(FileLeaseStore::open(&config.leases_file).await?);
            let mut server = BindingServer::new(config, store).await?;
            server.start_reaper();

            for (ia_type, usage) in server.stats() {
                info!(
                    "{} pool {} on link {}: {} of {} in use",
                    ia_type, usage.range, usage.link, usage.stats.used, usage.stats.capacity
                );
            }

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping...");
            server.stop().await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let store = FileLeaseStore::open(&config.leases_file).await?;
            let leases = store.list_leases().await?;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<30} {:<6} {:<10} {:<28} {:<11} {:<10}",
                    "Client DUID", "IA", "IAID", "Address", "State", "Remaining"
                );
                println!("{}", "-".repeat(100));

                for lease in leases {
                    let remaining = lease.remaining_seconds();
                    let remaining_str = if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "-".to_string()
                    };

                    println!(
                        "{:<30} {:<6} {:<10} {:<28} {:<11} {:<10}",
                        lease.duid.to_string(),
                        lease.ia_type.to_string(),
                        lease.iaid,
                        format!("{}/{}", lease.address, lease.prefix_len),
                        lease.state.to_string(),
                        remaining_str
                    );
                }
            }

            Ok(())
        }
        Commands::CleanupLeases => {
            let store = Arc::new(FileLeaseStore::open(&config.leases_file).await?);
            let server = BindingServer::new(config, store).await?;
            let count = server.reap_now().await;
            server.stop().await?;
            println!("Expired {} lease(s).", count);
            Ok(())
        }
    }
}
