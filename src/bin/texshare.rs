//! texshare - command-line client for the texshare daemon
//!
//! Issues single commands over the daemon's command segment. Useful for
//! checking a running daemon by hand.
//!
//! # Usage
//!
//! ```text
//! texshare register                          # register this process
//! texshare init camera 1920 1080 rgba8       # create or join an image
//! texshare rename camera camera-left         # rename an image we hold
//! texshare request camera-left --force       # fetch handles as JSON
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use texshare_client::{ClientConfig, ImageFormat, ImageName, ProcessId, TextureShareClient};

// ============================================================================
// CLI Arguments
// ============================================================================

/// texshare - talk to the shared image daemon
#[derive(Parser, Debug)]
#[command(name = "texshare", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Command segment path (defaults to TEXSHARE_CHANNEL or /dev/shm/texshare.cmd)
    #[arg(long, global = true)]
    channel: Option<PathBuf>,

    /// Per-command timeout in milliseconds
    #[arg(long, global = true, default_value_t = 1000)]
    timeout_ms: u64,

    /// Act on behalf of this pid instead of the current process
    #[arg(long, global = true)]
    pid: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register the process with the daemon
    Register,
    /// Create an image, or join it if it already exists
    Init {
        name: String,
        width: u32,
        height: u32,
        /// One of rgba8, bgra8, rgb8, bgr8, rgba32f
        #[arg(default_value = "rgba8")]
        format: String,
    },
    /// Rename an image held by the process
    Rename { old_name: String, new_name: String },
    /// Fetch the handles of an image
    Request {
        name: String,
        /// Ask the daemon to refresh its view first
        #[arg(short, long)]
        force: bool,
    },
}

fn image_name(raw: &str) -> Result<ImageName> {
    ImageName::new(raw).with_context(|| format!("Invalid image name {raw:?}"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("texshare_client=warn".parse()?),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let mut config = ClientConfig::default();
    if let Some(channel) = args.channel {
        config.channel_path = channel;
    }
    let channel_path = config.channel_path.clone();
    let client = TextureShareClient::connect(config).with_context(|| {
        format!(
            "Failed to open command segment at {} (is texshared running?)",
            channel_path.display()
        )
    })?;

    let pid = match args.pid {
        Some(raw) => ProcessId::new(raw).with_context(|| format!("Invalid pid {raw}"))?,
        None => ProcessId::current(),
    };
    let timeout = Duration::from_millis(args.timeout_ms);

    match args.command {
        Command::Register => {
            client.register_process(pid, timeout).await?;
            println!("Registered process {pid}");
        }
        Command::Init {
            name,
            width,
            height,
            format,
        } => {
            let name = image_name(&name)?;
            let format = ImageFormat::parse(&format)
                .ok_or_else(|| anyhow!("Unknown image format {format:?}"))?;
            let id = client
                .init_image(&name, pid, width, height, format, timeout)
                .await?;
            println!("{name}: image {id} ({width}x{height} {format})");
        }
        Command::Rename { old_name, new_name } => {
            let old_name = image_name(&old_name)?;
            let new_name = image_name(&new_name)?;
            let id = client
                .rename_image(&old_name, &new_name, pid, timeout)
                .await?;
            println!("{old_name} -> {new_name}: image {id}");
        }
        Command::Request { name, force } => {
            let name = image_name(&name)?;
            let reply = client.request_handles(&name, pid, force, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }

    Ok(())
}
