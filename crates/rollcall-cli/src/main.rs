use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::Camera;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[zbus::proxy(
    interface = "io.rollcall.Attendance1",
    default_service = "io.rollcall.Attendance1",
    default_path = "/io/rollcall/Attendance1",
    gen_blocking = false
)]
trait Attendance {
    async fn enroll(&self, identity_id: &str, name: &str, image: &[u8]) -> zbus::Result<String>;
    async fn start_scanner(&self, camera_id: &str) -> zbus::Result<String>;
    async fn stop_scanner(&self, camera_id: &str) -> zbus::Result<String>;
    async fn scanner_frame(&self, camera_id: &str) -> zbus::Result<(Vec<u8>, String)>;
    async fn scanner_status(&self, camera_id: &str) -> zbus::Result<String>;
    async fn attendance_summary(&self, date: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn remove_identity(&self, identity_id: &str) -> zbus::Result<String>;
    async fn health(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus (also ROLLCALL_SESSION_BUS=1)
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll or re-enroll an identity from a photo
    Enroll {
        identity_id: String,
        /// Display name shown in attendance reports
        name: String,
        /// Image file containing exactly one face
        image: PathBuf,
    },
    /// Remove an enrolled identity
    Remove { identity_id: String },
    /// List enrolled identities
    List,
    /// Start scanning on a camera (daemon default when omitted)
    Start {
        #[arg(default_value = "")]
        camera: String,
    },
    /// Stop scanning on a camera
    Stop {
        #[arg(default_value = "")]
        camera: String,
    },
    /// Show scanner state and latest detection
    Status {
        #[arg(default_value = "")]
        camera: String,
    },
    /// Save the latest scanned frame as JPEG
    Frame {
        #[arg(default_value = "")]
        camera: String,
        #[arg(short, long, default_value = "frame.jpg")]
        out: PathBuf,
    },
    /// Attendance report for a day
    Summary {
        /// YYYY-MM-DD; today when omitted
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show daemon health
    Health,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
        /// Save the last captured frame to this path
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let session = cli.session || env_flag("ROLLCALL_SESSION_BUS");

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Test {
            device,
            frames,
            save,
        } => camera_test(&device, frames, save),
        command => run_remote(command, session).await,
    }
}

async fn run_remote(command: Commands, session: bool) -> Result<()> {
    let builder = if session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(30))
        .build()
        .await
        .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    let reply = match command {
        Commands::Enroll {
            identity_id,
            name,
            image,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            proxy.enroll(&identity_id, &name, &bytes).await?
        }
        Commands::Remove { identity_id } => proxy.remove_identity(&identity_id).await?,
        Commands::List => proxy.list_identities().await?,
        Commands::Start { camera } => proxy.start_scanner(&camera).await?,
        Commands::Stop { camera } => proxy.stop_scanner(&camera).await?,
        Commands::Status { camera } => proxy.scanner_status(&camera).await?,
        Commands::Frame { camera, out } => {
            let (jpeg, detection) = proxy.scanner_frame(&camera).await?;
            if jpeg.is_empty() {
                println!("no frame published yet");
            } else {
                std::fs::write(&out, &jpeg)
                    .with_context(|| format!("writing {}", out.display()))?;
                println!("wrote {} ({} bytes)", out.display(), jpeg.len());
            }
            detection
        }
        Commands::Summary { date } => {
            proxy
                .attendance_summary(date.as_deref().unwrap_or(""))
                .await?
        }
        Commands::Health => proxy.health().await?,
        Commands::Devices | Commands::Test { .. } => bail!("this command runs without the daemon"),
    };

    println!("{}", pretty(&reply));
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("no V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn camera_test(device: &str, frames: usize, save: Option<PathBuf>) -> Result<()> {
    if frames == 0 {
        bail!("--frames must be at least 1");
    }
    let mut camera = Camera::open(device, 640, 480)?;
    println!(
        "{}: {}x{} {:?}",
        camera.device_path, camera.width, camera.height, camera.fourcc
    );

    let started = Instant::now();
    let mut last = None;
    for _ in 0..frames {
        let frame = camera.capture_frame()?;
        println!(
            "frame {:>4}  brightness {:>6.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
        last = Some(frame);
    }
    let elapsed = started.elapsed().as_secs_f32();
    println!("{frames} frames in {elapsed:.2}s ({:.1} fps)", frames as f32 / elapsed.max(1e-3));

    if let (Some(path), Some(frame)) = (save, last) {
        frame
            .image
            .save(&path)
            .with_context(|| format!("saving {}", path.display()))?;
        println!("saved {}", path.display());
    }
    Ok(())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

/// Re-indent a JSON reply; non-JSON text is returned unchanged.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}
