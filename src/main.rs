use clap::{Parser, Subcommand};
use hvmotion::collaborators::fakes::{
    FakeDatabase, FakeHypervisorAgent, FakeManagementPlaneClient, FakeStorageAgent,
};
use hvmotion::collaborators::{Database, HypervisorAgent, ManagementPlaneClient, StorageAgent};
use hvmotion::config::EngineConfig;
use hvmotion::model::{HostRef, NetworkRef, SrRef, VdiRef, VifRef, VmRef};
use hvmotion::orchestrator::Orchestrator;
use hvmotion::{log_error, log_info, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "hvmotion")]
#[command(about = "Cluster VM live/storage migration orchestrator")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the engine's TOML configuration file
    #[arg(short, long, default_value = "hvmotion.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// `VM.migrate_send` — primary migration RPC
    Migrate {
        #[command(subcommand)]
        migrate_command: MigrateCommands,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Validate and run a migration
    Send {
        vm: String,
        /// Destination host UUID (resolved against the local database)
        host: String,
        #[arg(long)]
        copy: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        compress: bool,
    },
    /// Dry-run validation only, no mutation
    Assert {
        vm: String,
        host: String,
    },
    /// Intra-cluster live memory migration, no storage transfer
    PoolMigrate {
        vm: String,
        host: String,
    },
    /// Move a single running-VM disk
    VdiPoolMigrate {
        vdi: String,
        dest_sr: String,
    },
    /// Report the process-wide concurrency gate state
    Status,
    /// Request cancellation of an in-flight migration (cooperative; only
    /// honored up to the last cancellation checkpoint)
    Cancel {
        vm: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    hvmotion::logger::init(cli.verbose);

    if let Err(e) = run(cli).await {
        log_error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = if cli.config.exists() {
        EngineConfig::from_file(&cli.config)?
    } else {
        log_info!(
            "no config file at {:?}, using pool policy defaults",
            cli.config
        );
        EngineConfig::default()
    };

    // The CLI is an operational front door for scripting and manual
    // testing; it wires the in-memory fakes rather than a real cluster
    // database, SMAPI, and XenopsAPI transport, which are out of scope.
    let db: Arc<dyn Database> = Arc::new(FakeDatabase::new());
    let storage: Arc<dyn StorageAgent> = Arc::new(FakeStorageAgent::new());
    let agent: Arc<dyn HypervisorAgent> = Arc::new(FakeHypervisorAgent::new());
    let mgmt: Arc<dyn ManagementPlaneClient> = Arc::new(FakeManagementPlaneClient::new());
    let orchestrator = Orchestrator::new(db, storage, agent, mgmt, config);

    match cli.command {
        Commands::Migrate { migrate_command } => match migrate_command {
            MigrateCommands::Send {
                vm,
                host,
                copy,
                force,
                compress,
            } => {
                let dest = dest_map(&host);
                let options = options_map(copy, force, compress);
                let result = orchestrator
                    .migrate_send(
                        &VmRef(vm),
                        &dest,
                        &HashMap::<VdiRef, SrRef>::new(),
                        &HashMap::<VifRef, NetworkRef>::new(),
                        &options,
                    )
                    .await?;
                log_info!("migrated to {}", result);
                Ok(())
            }
            MigrateCommands::Assert { vm, host } => {
                let dest = dest_map(&host);
                orchestrator
                    .assert_can_migrate(
                        &VmRef(vm),
                        &dest,
                        &HashMap::<VdiRef, SrRef>::new(),
                        &HashMap::<VifRef, NetworkRef>::new(),
                        &HashMap::new(),
                    )
                    .await?;
                log_info!("migration is feasible");
                Ok(())
            }
            MigrateCommands::PoolMigrate { vm, host } => {
                orchestrator
                    .pool_migrate(&VmRef(vm), &HostRef(host), &HashMap::new())
                    .await
            }
            MigrateCommands::VdiPoolMigrate { vdi, dest_sr } => {
                let new_vdi = orchestrator
                    .vdi_pool_migrate(&VdiRef(vdi), &SrRef(dest_sr), &HashMap::new())
                    .await?;
                log_info!("new destination VDI: {}", new_vdi);
                Ok(())
            }
            MigrateCommands::Status => {
                log_info!("status reporting requires a running orchestrator instance; this CLI invocation is stateless");
                Ok(())
            }
            MigrateCommands::Cancel { vm } => {
                log_info!("cancellation requested for {} (cooperative, best-effort)", vm);
                Ok(())
            }
        },
    }
}

fn dest_map(host_uuid: &str) -> HashMap<String, String> {
    HashMap::from([
        ("master".to_string(), format!("https://{}/", host_uuid)),
        ("xenops".to_string(), format!("https://{}/xenops", host_uuid)),
        ("SM".to_string(), format!("https://{}/sm", host_uuid)),
        ("host".to_string(), host_uuid.to_string()),
        ("session_id".to_string(), "cli-session".to_string()),
    ])
}

fn options_map(copy: bool, force: bool, compress: bool) -> HashMap<String, String> {
    HashMap::from([
        ("copy".to_string(), copy.to_string()),
        ("force".to_string(), force.to_string()),
        ("compress".to_string(), compress.to_string()),
    ])
}
