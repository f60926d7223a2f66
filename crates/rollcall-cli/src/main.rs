use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::LabelMap;
use rollcall_hw::{Camera, FrameSource};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn start_session(&self) -> zbus::Result<String>;
    async fn stop_session(&self) -> zbus::Result<String>;
    async fn last_report(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    /// Talk to rollcalld on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance capture session
    Start,
    /// Stop the running session and print the attendance report
    Stop,
    /// Show daemon status
    Status,
    /// Print the report of the last stopped session
    Report,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of frames to read
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
        /// Save the last non-dark frame as an image
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Convert a legacy label map to the canonical {id, name} shape
    MigrateLabels {
        /// Legacy labels.json
        input: PathBuf,
        /// Where to write the canonical map
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let proxy = connect(cli.session_bus).await?;
            let id = proxy.start_session().await?;
            println!("session started: {id}");
        }
        Commands::Stop => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.stop_session().await?)?;
        }
        Commands::Status => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Report => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.last_report().await?)?;
        }
        Commands::Test {
            device,
            frames,
            save,
        } => {
            tokio::task::spawn_blocking(move || camera_test(&device, frames, save.as_deref()))
                .await??;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no V4L2 capture devices found");
            }
            for d in devices {
                println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::MigrateLabels { input, output } => {
            let count = migrate_labels(&input, &output)?;
            println!("wrote {count} labels to {}", output.display());
        }
    }

    Ok(())
}

async fn connect(session_bus: bool) -> Result<RollcallProxy<'static>> {
    tracing::debug!(session_bus, "connecting to rollcalld");
    let conn = if session_bus {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable on D-Bus — is the daemon running?")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn camera_test(device: &str, frames: usize, save: Option<&Path>) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let camera = Camera::open(device)?;
    println!(
        "  format: {:?} {}x{}",
        camera.fourcc, camera.width, camera.height
    );

    let mut stream = camera.into_stream(Duration::from_secs(2))?;
    let mut dark = 0;
    let mut last_lit = None;
    for _ in 0..frames {
        let frame = stream.read_frame()?;
        println!(
            "  frame {:>4}: brightness {:6.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
        if frame.is_dark {
            dark += 1;
        } else {
            last_lit = Some(frame);
        }
    }
    println!("  {dark}/{frames} dark frames");

    if let Some(path) = save {
        let Some(frame) = last_lit else {
            bail!("every frame was dark; nothing to save");
        };
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image.save(path)?;
        println!("  saved {}", path.display());
    }
    Ok(())
}

fn migrate_labels(input: &Path, output: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let map = LabelMap::migrate_legacy(&raw, &input.display().to_string())?;
    std::fs::write(output, map.to_json())
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(map.len())
}
