use async_trait::async_trait;
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chanipc::channels::{LAUNCH_CHANNEL, LaunchChannel, LaunchChannelClient, LaunchService};
use chanipc::ipc::{IpcClient, IpcServer};
use chanipc::transport::{SocketListener, SocketOptions, UnixProtocol};

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging(config: &Config) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(env!("CARGO_PKG_NAME"))
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join(format!("{}.log", env!("CARGO_PKG_NAME")));

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let level = config.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Launch service of the serving process: reports each forwarded launch.
struct ConsoleLaunch;

#[async_trait]
impl LaunchService for ConsoleLaunch {
    async fn start(&self, args: Vec<String>, user_env: HashMap<String, String>) -> chanipc::Result<()> {
        info!("Launch requested with {} arg(s), {} env var(s)", args.len(), user_env.len());
        println!("{} {}", "Launch:".green(), args.join(" "));
        Ok(())
    }

    async fn main_process_id(&self) -> chanipc::Result<u32> {
        Ok(std::process::id())
    }
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let mut socket = config.socket.options();
    if let Some(path) = &cli.socket {
        socket = socket.with_socket_path(path);
    }

    match &cli.command {
        Commands::Serve => handle_serve(socket).await,
        Commands::Launch { id, args } => {
            let client_id = id.clone().unwrap_or_else(|| config.client.resolved_id());
            handle_launch(&socket, client_id, args.clone()).await
        }
        Commands::Pid { id } => {
            let client_id = id.clone().unwrap_or_else(|| config.client.resolved_id());
            handle_pid(&socket, client_id).await
        }
    }
}

async fn handle_serve(socket: SocketOptions) -> Result<()> {
    let listener = SocketListener::bind(socket).context("Failed to bind socket")?;
    let server = IpcServer::new(listener.on_connection());
    server.register_channel(LAUNCH_CHANNEL, Arc::new(LaunchChannel::new(Arc::new(ConsoleLaunch))));

    println!("{} {}", "Serving on".cyan(), listener.socket_path().display());
    listener
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down with {} client(s) connected", server.client_ids().len());
    server.dispose();
    Ok(())
}

async fn connect(socket: &SocketOptions, client_id: String) -> Result<(Arc<UnixProtocol>, IpcClient)> {
    let protocol = UnixProtocol::connect(&socket.socket_path, socket.max_frame_bytes)
        .await
        .context("Is the server running?")?;
    let peer = IpcClient::new(protocol.clone(), client_id);
    Ok((protocol, peer))
}

async fn handle_launch(socket: &SocketOptions, client_id: String, args: Vec<String>) -> Result<()> {
    info!("Forwarding launch as '{}': {:?}", client_id, args);
    let (protocol, peer) = connect(socket, client_id).await?;
    let launch = LaunchChannelClient::new(peer.get_channel(LAUNCH_CHANNEL));

    let user_env: HashMap<String, String> = std::env::vars().collect();
    launch.start(args, user_env).await.context("Launch failed")?;
    println!("{}", "Launch forwarded".green());

    peer.dispose();
    protocol.close();
    Ok(())
}

async fn handle_pid(socket: &SocketOptions, client_id: String) -> Result<()> {
    let (protocol, peer) = connect(socket, client_id).await?;
    let launch = LaunchChannelClient::new(peer.get_channel(LAUNCH_CHANNEL));

    let pid = launch.main_process_id().await.context("Failed to get process id")?;
    println!("{} {}", "Server pid:".green(), pid);

    peer.dispose();
    protocol.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(&config).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
