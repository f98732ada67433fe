use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use virt_types::{User, Vm};

use virt_agent::{Config, Engine};

/// Host-side provisioning of container VMs
#[derive(Parser)]
#[command(name = "virt-agent")]
#[command(version)]
#[command(about = "Prepare, tear down and snapshot container VMs on this host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the VM's root filesystem and network isolation
    Prepare {
        /// VM record (JSON file)
        #[arg(long)]
        vm: PathBuf,

        /// Users referenced by the VM, primary first (JSON file)
        #[arg(long)]
        users: PathBuf,

        /// Discard everything in the writable layer except home directories
        #[arg(long)]
        reinitialize: bool,
    },
    /// Stop the container and undo everything prepare did
    Unprepare {
        /// VM record (JSON file)
        #[arg(long)]
        vm: PathBuf,
    },
    /// Snapshot the VM's image with its filesystem frozen
    Snapshot {
        /// VM record (JSON file)
        #[arg(long)]
        vm: PathBuf,

        /// Snapshot name; defaults to the current UTC time
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the container state
    State {
        /// VM record (JSON file)
        #[arg(long)]
        vm: PathBuf,
    },
    /// Print the identifiers derived from the VM record
    Derive {
        /// VM record (JSON file)
        #[arg(long)]
        vm: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Prepare {
            vm,
            users,
            reinitialize,
        } => {
            let vm: Vm = read_json(&vm)?;
            let users: Vec<User> = read_json(&users)?;
            Engine::load(config)?.prepare(&vm, &users, reinitialize)?;
        }
        Commands::Unprepare { vm } => {
            let vm: Vm = read_json(&vm)?;
            Engine::load(config)?.unprepare(&vm)?;
        }
        Commands::Snapshot { vm, name } => {
            let vm: Vm = read_json(&vm)?;
            let name =
                name.unwrap_or_else(|| chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
            Engine::load(config)?.create_consistent_snapshot(&vm, &name)?;
            info!(snapshot = %name, "done");
        }
        Commands::State { vm } => {
            let vm: Vm = read_json(&vm)?;
            let state = Engine::load(config)?.container_state(&vm)?;
            println!("{state}");
        }
        Commands::Derive { vm } => {
            let vm: Vm = read_json(&vm)?;
            let layout = virt_agent::layout::Layout::new(&config, &vm);
            let derived = json!({
                "container": layout.name(),
                "hostname": vm.hostname(&config.domain),
                "mac": vm.mac().map(|mac| mac.to_string()),
                "veth": vm.veth(),
                "device": layout.device(),
                "dir": layout.dir(),
            });
            println!("{}", serde_json::to_string_pretty(&derived)?);
        }
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
