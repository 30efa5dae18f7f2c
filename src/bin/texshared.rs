//! texshare daemon - shared GPU image broker
//!
//! This binary owns the command segment and the registry of shared images.
//! Client processes create, join, rename and fetch images through it.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! texshared start
//!
//! # Start the daemon (background/daemonized) with a config file
//! texshared start -d --config /etc/texshare.toml
//!
//! # Stop the daemon
//! texshared stop
//!
//! # Check daemon status
//! texshared status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use texshare_core::{ProcessId, ProcessProbe, ProcfsProbe};
use texshared::{spawn_dispatcher, DaemonConfig, HostMemoryBackend, ShmChannel};

/// texshare daemon - cross-process shared image broker
#[derive(Parser, Debug)]
#[command(name = "texshared", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Command segment path (overrides config and TEXSHARE_CHANNEL)
        #[arg(long)]
        channel: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        /// TOML configuration file, used to locate the command segment
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("texshare")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("texshared.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("texshared.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    ProcessId::new(pid)
        .map(|pid| ProcfsProbe.start_time(pid).is_some())
        .unwrap_or(false)
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
    // SAFETY: sending a signal has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>, channel: Option<PathBuf>) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(path.as_deref()).context("Failed to load configuration")?;
    if let Some(channel) = channel {
        config.channel_path = channel;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
        channel: None,
    });

    match command {
        Command::Start {
            daemon,
            config,
            channel,
        } => start(daemon, config, channel),
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");

                let config = load_config(config, None)?;
                if config.channel_path.exists() {
                    println!("Channel: {}", config.channel_path.display());
                }

                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn start(daemon: bool, config: Option<PathBuf>, channel: Option<PathBuf>) -> Result<()> {
    if let Some(pid) = is_daemon_running() {
        eprintln!("Daemon is already running (PID {pid})");
        eprintln!("Use 'texshared stop' to stop it first.");
        process::exit(1);
    }

    let config = load_config(config, channel)?;

    if daemon {
        daemonize()?;
    }

    write_pid()?;
    let result = run_daemon(config);
    remove_pid_file();
    result
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to duplicate log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("texshared=info".parse()?)
                .add_directive("texshare_core=info".parse()?)
                .add_directive("texshare_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "texshare daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let channel = ShmChannel::create(&config.channel_path).with_context(|| {
        format!(
            "Failed to create command segment at {}",
            config.channel_path.display()
        )
    })?;
    info!(
        channel = %config.channel_path.display(),
        max_images = config.max_images,
        max_processes = config.max_processes,
        "Command segment ready"
    );

    let dispatcher = spawn_dispatcher(
        channel,
        HostMemoryBackend::new(),
        ProcfsProbe,
        &config,
        cancel_token,
    );

    if dispatcher.join().await.is_none() {
        bail!("Dispatcher terminated abnormally");
    }

    info!("texshare daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
