//! edgevpn-provision - EdgeVPN service setup for managed nodes
//!
//! Resolves the EdgeVPN daemon options from the node's cloud-config, writes
//! the env file, unit, and optional DNS redirection config, then hands the
//! service to systemd or OpenRC.

mod config;
mod error;
mod options;
mod provision;
mod system;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{NodeConfig, Settings};
use provision::Provisioner;
use system::{CommandExecutor, InitSystemFactory, NoopExecutor};

#[derive(Parser)]
#[command(name = "edgevpn-provision")]
#[command(version, about = "Set up the EdgeVPN overlay service on this node")]
struct Cli {
    /// Provisioner settings (JSON); defaults to ~/.config/edgevpn-provision/settings.json
    #[arg(long, env = "EDGEVPN_PROVISION_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Write the EdgeVPN artifacts and optionally start the service.
    Setup {
        #[arg(long, default_value = "kairos")]
        instance: String,
        /// Daemon API listen address; a URL scheme is stripped.
        #[arg(long, default_value = "127.0.0.1:8080")]
        api_address: String,
        #[arg(long, default_value = "/")]
        root: PathBuf,
        /// Start and enable the service after writing it.
        #[arg(long)]
        start: bool,
        /// Node cloud-config (YAML).
        #[arg(long)]
        config: PathBuf,
        /// Skip applying the DNS config to the current boot.
        #[arg(long)]
        no_inline: bool,
    },
    /// Print the env file and DNS config that `setup` would write.
    Render {
        #[arg(long, default_value = "127.0.0.1:8080")]
        api_address: String,
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.settings.as_deref());

    match cli.cmd {
        Cmd::Setup {
            instance,
            api_address,
            root,
            start,
            config,
            no_inline,
        } => {
            if root == Path::new("/") && !is_root() {
                tracing::warn!(
                    "Provisioning the host root without root privileges; writes will likely fail"
                );
            }

            let node = NodeConfig::load(&config)?;
            let factory = InitSystemFactory::new(settings.init_system);

            let result = if no_inline {
                Provisioner::new(factory, NoopExecutor, settings)
                    .provision(&instance, &api_address, &root, start, Some(&node))
                    .await
            } else {
                let executor = CommandExecutor::new(settings.inline_command.clone());
                Provisioner::new(factory, executor, settings)
                    .provision(&instance, &api_address, &root, start, Some(&node))
                    .await
            };

            result.with_context(|| format!("Failed to set up EdgeVPN instance {}", instance))?;
        }
        Cmd::Render {
            api_address,
            config,
        } => {
            let node = NodeConfig::load(&config)?;
            let resolved = options::resolve(Some(&node), &api_address)?;

            print!("{}", system::env_file::render(&resolved.options));
            if let Some(document) = resolved.dns {
                println!("---");
                print!("{}", document.to_yaml()?);
            }
        }
    }

    Ok(())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
