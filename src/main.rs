//! nas-remote CLI
//!
//! ## Usage
//!
//! ```bash
//! # Uses ~/.config/nas-remote/config.toml, overridable per flag or env var
//! nas-remote status
//! nas-remote vm list
//! nas-remote vm restart win11
//! nas-remote vm stop 3 --force
//! nas-remote app start plex
//!
//! # No config file
//! NAS_HOST=nas.local NAS_SECURE=true NAS_API_KEY=1-abc nas-remote app list
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use nas_remote::config::default_config_path;
use nas_remote::{Client, Config};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nas-remote")]
#[command(about = "Control VMs and apps on a storage appliance")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Appliance hostname or address
    #[arg(long, env = "NAS_HOST")]
    host: Option<String>,

    /// Port override
    #[arg(long, env = "NAS_PORT")]
    port: Option<u16>,

    /// Use wss:// (true) or ws:// (false)
    #[arg(long, env = "NAS_SECURE")]
    secure: Option<bool>,

    /// API key
    #[arg(long, env = "NAS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Write the merged configuration back to the config file
    #[arg(long)]
    save_config: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, log in and report the session
    Status,
    /// Virtual machine operations
    Vm {
        #[command(subcommand)]
        action: VmAction,
    },
    /// Application operations
    App {
        #[command(subcommand)]
        action: AppAction,
    },
}

#[derive(Subcommand, Debug)]
enum VmAction {
    List,
    Get { vm: String },
    Start { vm: String },
    Stop {
        vm: String,
        /// Power off instead of a clean shutdown
        #[arg(long)]
        force: bool,
    },
    Restart { vm: String },
}

#[derive(Subcommand, Debug)]
enum AppAction {
    List,
    Get { name: String },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("nas_remote=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = if config_path.exists() {
        Config::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else {
        debug!(path = %config_path.display(), "No config file, using flags and environment");
        Config::default()
    };

    // Apply CLI overrides
    if args.host.is_some() {
        config.host = args.host.clone();
    }
    if args.port.is_some() {
        config.port = args.port;
    }
    if args.secure.is_some() {
        config.secure = args.secure;
    }
    if args.api_key.is_some() {
        config.api_key = args.api_key.clone();
    }

    let client_config = config.resolve()?;
    if args.save_config {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Saved config");
    }

    let client = Client::new(client_config);
    let outcome = run(&client, args.command).await;
    client.disconnect().await;
    outcome
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            client.connect().await?;
            let session = client.ensure_ready().await?;
            print_json(&serde_json::json!({
                "url": session.url(),
                "connected": client.is_connected().await,
                "auth": format!("{:?}", session.auth_method()),
                "peer_session": session.peer_session().await,
            }))
        }
        Command::Vm { action } => {
            let vms = client.vms();
            match action {
                VmAction::List => print_json(&vms.list().await?),
                VmAction::Get { vm } => print_json(&vms.get(&vm).await?),
                VmAction::Start { vm } => {
                    let id = vms.get(&vm).await?.id;
                    print_json(&vms.start(id).await?)
                }
                VmAction::Stop { vm, force } => {
                    let id = vms.get(&vm).await?.id;
                    print_json(&vms.stop(id, force).await?)
                }
                VmAction::Restart { vm } => {
                    let id = vms.get(&vm).await?.id;
                    print_json(&vms.restart(id).await?)
                }
            }
        }
        Command::App { action } => {
            let apps = client.apps();
            match action {
                AppAction::List => print_json(&apps.list().await?),
                AppAction::Get { name } => print_json(&apps.get(&name).await?),
                AppAction::Start { name } => print_json(&apps.start(&name).await?),
                AppAction::Stop { name } => print_json(&apps.stop(&name).await?),
                AppAction::Restart { name } => print_json(&apps.restart(&name).await?),
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
