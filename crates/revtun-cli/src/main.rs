//! revtun - supervise reverse SSH tunnels

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use revtun_cli::config::{ConfigManager, DaemonConfig};
use revtun_cli::daemon::Daemon;
use revtun_cli::ipc::{
    print_connection_details, print_connections_table, IpcClient, IpcRequest, IpcResponse,
};
use revtun_core::connection::{DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_SSH_PORT};
use revtun_core::{ConnectionSpec, ConnectionUpdate};

/// revtun - keep reverse SSH tunnels alive
#[derive(Parser, Debug)]
#[command(name = "revtun")]
#[command(about = "Supervise named reverse SSH tunnels", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config, connection store and daemon socket
    #[arg(long, global = true, env = "REVTUN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor daemon in the foreground
    Daemon,
    /// Register a new tunnel
    Add {
        /// Connection name
        name: String,
        /// Local port exposed on the remote host
        #[arg(short, long)]
        local_port: u16,
        /// Port bound on the remote host
        #[arg(short, long)]
        remote_port: u16,
        /// Remote host (hostname or IP)
        #[arg(long)]
        remote_host: String,
        /// Remote login user
        #[arg(short, long)]
        user: Option<String>,
        /// Private key file
        #[arg(short, long)]
        key: PathBuf,
        /// SSH port on the remote host
        #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
        ssh_port: u16,
        /// ServerAliveInterval in seconds
        #[arg(long, default_value_t = DEFAULT_KEEPALIVE_INTERVAL)]
        keepalive: u32,
        /// Keep the tunnel up even if the remote forward cannot be bound
        #[arg(long)]
        no_exit_on_forward_failure: bool,
        /// Start the tunnel right away
        #[arg(long)]
        start: bool,
    },
    /// Change fields of a tunnel; a running tunnel is restarted
    Update {
        /// Connection name
        name: String,
        /// New connection name
        #[arg(long)]
        rename: Option<String>,
        #[arg(short, long)]
        local_port: Option<u16>,
        #[arg(short, long)]
        remote_port: Option<u16>,
        #[arg(long)]
        remote_host: Option<String>,
        /// Remote login user (empty string clears it)
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        key: Option<PathBuf>,
        #[arg(long)]
        ssh_port: Option<u16>,
        #[arg(long)]
        keepalive: Option<u32>,
        #[arg(long)]
        exit_on_forward_failure: Option<bool>,
    },
    /// Stop and delete a tunnel
    Remove {
        /// Connection name
        name: String,
    },
    /// Start a tunnel
    Start {
        /// Connection name
        name: String,
    },
    /// Stop a tunnel
    Stop {
        /// Connection name
        name: String,
    },
    /// List tunnels with live status
    List,
    /// Show tunnel details
    Show {
        /// Connection name
        name: String,
    },
    /// Print status changes as they happen
    Watch,
    /// Daemon configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigCommands {
    /// Show the current configuration
    Show,
    /// Command used to launch ssh, e.g. `set-ssh -- sshpass -e ssh`
    SetSsh {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Seconds between reconciliation passes
    SetInterval { seconds: u64 },
    /// Seconds a tunnel gets to exit before it is killed
    SetGrace { seconds: u64 },
    /// Start all tunnels when the daemon boots
    SetAutostart {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Consecutive automatic restarts before giving up (0 = unlimited)
    SetMaxRestarts { attempts: u32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let manager = ConfigManager::new(cli.data_dir)?;

    match cli.command {
        Commands::Daemon => run_daemon(&manager).await,
        Commands::Add {
            name,
            local_port,
            remote_port,
            remote_host,
            user,
            key,
            ssh_port,
            keepalive,
            no_exit_on_forward_failure,
            start,
        } => {
            let key = absolute_path(key)?;
            let mut spec = ConnectionSpec::new(name, local_port, remote_port, remote_host, key);
            spec.remote_user = user.filter(|u| !u.is_empty());
            spec.ssh_port = ssh_port;
            spec.keepalive_interval_seconds = keepalive;
            spec.exit_on_forward_failure = !no_exit_on_forward_failure;
            handle_add(&manager, spec, start).await
        }
        Commands::Update {
            name,
            rename,
            local_port,
            remote_port,
            remote_host,
            user,
            key,
            ssh_port,
            keepalive,
            exit_on_forward_failure,
        } => {
            let changes = ConnectionUpdate {
                name: rename,
                local_port,
                remote_port,
                remote_host,
                remote_user: user,
                credential_path: key.map(absolute_path).transpose()?,
                ssh_port,
                keepalive_interval_seconds: keepalive,
                exit_on_forward_failure,
            };
            if changes.is_empty() {
                anyhow::bail!("Nothing to update; pass at least one field");
            }
            let response = send_request(&manager, IpcRequest::Update { name, changes }).await?;
            print_connection_response(response, "Updated")
        }
        Commands::Remove { name } => {
            let response = send_request(&manager, IpcRequest::Remove { name }).await?;
            print_connection_response(response, "Removed")
        }
        Commands::Start { name } => {
            let response = send_request(&manager, IpcRequest::Start { name }).await?;
            print_connection_response(response, "Started")
        }
        Commands::Stop { name } => {
            let response = send_request(&manager, IpcRequest::Stop { name }).await?;
            print_connection_response(response, "Stopped")
        }
        Commands::List => match send_request(&manager, IpcRequest::List).await? {
            IpcResponse::Connections { connections } => {
                print_connections_table(&connections);
                Ok(())
            }
            other => unexpected(other),
        },
        Commands::Show { name } => match send_request(&manager, IpcRequest::Get { name }).await? {
            IpcResponse::Connection { connection } => {
                print_connection_details(&connection);
                Ok(())
            }
            other => unexpected(other),
        },
        Commands::Watch => handle_watch(&manager).await,
        Commands::Config { command } => handle_config_command(&manager, command),
    }
}

async fn run_daemon(manager: &ConfigManager) -> Result<()> {
    let config = manager.load()?;
    info!("Starting daemon (data dir {:?})...", manager.data_dir());

    let daemon = Daemon::new(manager, config)?;
    daemon.run(shutdown_signal()).await
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

async fn send_request(manager: &ConfigManager, request: IpcRequest) -> Result<IpcResponse> {
    let mut client = IpcClient::connect_to(&manager.socket_path()).await?;
    let response = client.request(&request).await?;

    if let IpcResponse::Error { kind, message } = response {
        anyhow::bail!("{} ({})", message, kind);
    }
    Ok(response)
}

async fn handle_add(manager: &ConfigManager, spec: ConnectionSpec, start: bool) -> Result<()> {
    let name = spec.name.clone();
    let response = send_request(manager, IpcRequest::Add { connection: spec }).await?;
    print_connection_response(response, "Added")?;

    if start {
        let response = send_request(manager, IpcRequest::Start { name }).await?;
        print_connection_response(response, "Started")?;
    }
    Ok(())
}

async fn handle_watch(manager: &ConfigManager) -> Result<()> {
    let mut client = IpcClient::connect_to(&manager.socket_path()).await?;
    let mut response = Some(client.request(&IpcRequest::Watch).await?);

    while let Some(current) = response {
        match current {
            IpcResponse::Connections { connections } => {
                println!();
                print_connections_table(&connections);
            }
            IpcResponse::Error { kind, message } => anyhow::bail!("{} ({})", message, kind),
            other => return unexpected(other),
        }
        response = client.next_response().await?;
    }

    println!("Daemon closed the connection");
    Ok(())
}

/// Resolve a relative key path against the caller's working directory
fn absolute_path(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(path))
}

fn print_connection_response(response: IpcResponse, verb: &str) -> Result<()> {
    match response {
        IpcResponse::Connection { connection } => {
            let state = if connection.active {
                "running"
            } else {
                "stopped"
            };
            println!("✅ {} '{}' ({})", verb, connection.spec.name, state);
            Ok(())
        }
        IpcResponse::Ok { message } => {
            println!("✅ {}", message.unwrap_or_else(|| verb.to_string()));
            Ok(())
        }
        other => unexpected(other),
    }
}

fn unexpected(response: IpcResponse) -> Result<()> {
    anyhow::bail!("Unexpected response from daemon: {:?}", response)
}

fn handle_config_command(manager: &ConfigManager, command: ConfigCommands) -> Result<()> {
    let config = match command {
        ConfigCommands::Show => manager.load()?,
        ConfigCommands::SetSsh { command } => manager.update(|c| c.ssh_command = command)?,
        ConfigCommands::SetInterval { seconds } => {
            anyhow::ensure!(seconds > 0, "Interval must be at least one second");
            manager.update(|c| c.tick_interval_secs = seconds)?
        }
        ConfigCommands::SetGrace { seconds } => manager.update(|c| c.stop_grace_secs = seconds)?,
        ConfigCommands::SetAutostart { enabled } => manager.update(|c| c.autostart = enabled)?,
        ConfigCommands::SetMaxRestarts { attempts } => {
            manager.update(|c| c.max_restart_attempts = (attempts > 0).then_some(attempts))?
        }
    };

    print_config(manager, &config)
}

fn print_config(manager: &ConfigManager, config: &DaemonConfig) -> Result<()> {
    println!("Config file: {}", manager.config_path().display());
    println!("Store:       {}", manager.store_path(config).display());
    println!("Socket:      {}", manager.socket_path().display());
    println!(
        "{}",
        serde_json::to_string_pretty(config).context("Failed to serialize config")?
    );
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
