use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_ledger::{AttendanceMark, ContextStats};
use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a capture session for a context
    Start {
        /// Context (class, subject) to mark attendance for
        #[arg(short, long)]
        context: i64,
    },
    /// Stop a running session
    Stop {
        /// Session ID returned by `start`
        id: String,
    },
    /// Show attendance percentages for a context
    Stats {
        #[arg(short, long)]
        context: i64,
    },
    /// List marks for a context, newest first
    Records {
        #[arg(short, long)]
        context: i64,
    },
    /// List contexts that have marks
    Contexts,
    /// Save the latest annotated frame of a session
    Snapshot {
        id: String,
        /// Output JPEG path
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
    },
    /// Delete one mark
    Remove {
        #[arg(short, long)]
        context: i64,
        #[arg(short, long)]
        identity: String,
        /// Day in YYYY-MM-DD
        #[arg(short, long)]
        day: String,
    },
    /// Show daemon status
    Status,
    /// Reload trained models in the daemon
    Reload,
    /// List local V4L2 capture devices (no daemon needed)
    Devices,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn start_session(&self, context_id: i64) -> zbus::Result<String>;
    async fn stop_session(&self, session_id: &str) -> zbus::Result<bool>;
    async fn stats(&self, context_id: i64) -> zbus::Result<String>;
    async fn records(&self, context_id: i64) -> zbus::Result<String>;
    async fn contexts(&self) -> zbus::Result<String>;
    async fn remove_mark(&self, context_id: i64, identity: &str, day: &str) -> zbus::Result<bool>;
    async fn snapshot(&self, session_id: &str) -> zbus::Result<Vec<u8>>;
    async fn status(&self) -> zbus::Result<String>;
    async fn reload_models(&self) -> zbus::Result<String>;
}

async fn connect() -> Result<AttendanceProxy<'static>> {
    let conn = if std::env::var("ROLLCALL_SESSION_BUS").is_ok_and(|v| v == "1") {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn format_stats(stats: &ContextStats) -> String {
    let mut out = format!(
        "context {}: {} day(s) held\n",
        stats.context_id, stats.total_days
    );
    let width = stats
        .people
        .iter()
        .map(|p| p.identity.len())
        .max()
        .unwrap_or(0)
        .max(8);
    for person in &stats.people {
        let _ = writeln!(
            out,
            "  {:<width$}  {:>3}/{:<3}  {:>5.1}%",
            person.identity, person.attended, person.total, person.percentage
        );
    }
    out
}

fn format_records(marks: &[AttendanceMark]) -> String {
    if marks.is_empty() {
        return "no marks\n".to_string();
    }
    let mut out = String::new();
    for mark in marks {
        let _ = writeln!(out, "  {}  {}  {}", mark.day, mark.time, mark.identity);
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { context } => {
            let id = connect().await?.start_session(context).await?;
            println!("{id}");
        }
        Commands::Stop { id } => {
            if connect().await?.stop_session(&id).await? {
                println!("stopped {id}");
            } else {
                println!("no session {id}");
            }
        }
        Commands::Stats { context } => {
            let json = connect().await?.stats(context).await?;
            let stats: ContextStats = serde_json::from_str(&json)?;
            print!("{}", format_stats(&stats));
        }
        Commands::Records { context } => {
            let json = connect().await?.records(context).await?;
            let marks: Vec<AttendanceMark> = serde_json::from_str(&json)?;
            print!("{}", format_records(&marks));
        }
        Commands::Contexts => {
            let json = connect().await?.contexts().await?;
            let ids: Vec<i64> = serde_json::from_str(&json)?;
            for id in ids {
                println!("{id}");
            }
        }
        Commands::Snapshot { id, output } => {
            let jpeg = connect().await?.snapshot(&id).await?;
            if jpeg.is_empty() {
                println!("no frame captured yet");
            } else {
                std::fs::write(&output, &jpeg)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                println!("wrote {} ({} bytes)", output.display(), jpeg.len());
            }
        }
        Commands::Remove {
            context,
            identity,
            day,
        } => {
            if connect().await?.remove_mark(context, &identity, &day).await? {
                println!("removed {identity} on {day}");
            } else {
                println!("no mark for {identity} on {day}");
            }
        }
        Commands::Status => {
            let json = connect().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Reload => {
            let summary = connect().await?.reload_models().await?;
            println!("{summary}");
        }
        Commands::Devices => {
            let devices = rollcall_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("no V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}
