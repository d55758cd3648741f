use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use rollcall_core::{AttendanceRecord, Member};
use std::path::PathBuf;

mod diagnostics;
mod proxy;

use proxy::AttendanceProxy;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the recognition session
    Start,
    /// Stop the recognition session and release the camera
    Stop,
    /// Show daemon status
    Status,
    /// List registered members
    Members,
    /// Register the face currently in front of the camera
    Register {
        /// Member name (at least 2 characters)
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: Option<String>,
    },
    /// Replace a member's face signature with the current face
    Recapture {
        /// Member ID
        id: String,
    },
    /// Show recent check-ins
    Recent {
        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    },
    /// Show all check-ins of one member
    History {
        /// Member ID
        id: String,
    },
    /// Show today's check-in count
    Today,
    /// Show roster and attendance metrics
    Metrics,
    /// Print check-ins and misses as they happen
    Watch,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Frames to capture
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
        #[arg(long, default_value_t = 4)]
        warmup: usize,
        /// Run face detection with this SCRFD model
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, default_value_t = rollcall_core::detector::DEFAULT_MIN_CONFIDENCE)]
        min_confidence: f32,
        /// Write the last frame as a PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test {
        device,
        width,
        height,
        frames,
        warmup,
        model,
        min_confidence,
        output,
    } = cli.command
    {
        let opts = diagnostics::DiagnosticOptions {
            device,
            width,
            height,
            frames,
            warmup,
            model,
            min_confidence,
            output,
        };
        return tokio::task::spawn_blocking(move || diagnostics::run(&opts)).await?;
    }

    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Start => {
            proxy.start().await?;
            println!("Recognition started");
        }
        Commands::Stop => {
            proxy.stop().await?;
            println!("Recognition stopped");
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Members => {
            let members: Vec<Member> = serde_json::from_str(&proxy.list_members().await?)?;
            if members.is_empty() {
                println!("No members registered");
            }
            for m in &members {
                println!("{}", member_line(m));
            }
        }
        Commands::Register { name, email } => {
            let member: Member = serde_json::from_str(
                &proxy
                    .register(&name, email.as_deref().unwrap_or(""))
                    .await?,
            )?;
            println!("Registered {}", member_line(&member));
        }
        Commands::Recapture { id } => {
            let member: Member = serde_json::from_str(&proxy.recapture(&id).await?)?;
            println!("Updated {}", member_line(&member));
        }
        Commands::Recent { limit } => {
            let records: Vec<AttendanceRecord> =
                serde_json::from_str(&proxy.recent_attendance(limit).await?)?;
            print_records(&records);
        }
        Commands::History { id } => {
            let records: Vec<AttendanceRecord> =
                serde_json::from_str(&proxy.member_attendance(&id).await?)?;
            print_records(&records);
        }
        Commands::Today => println!("{} check-in(s) today", proxy.daily_count().await?),
        Commands::Metrics => print_json(&proxy.metrics().await?)?,
        Commands::Watch => watch(&proxy).await?,
        Commands::Test { .. } => unreachable!("handled above"),
    }

    Ok(())
}

async fn watch(proxy: &AttendanceProxy<'_>) -> Result<()> {
    let mut checked_in = proxy.receive_checked_in().await?;
    let mut no_match = proxy.receive_no_match().await?;
    println!("Watching for check-ins (Ctrl-C to quit)");

    loop {
        tokio::select! {
            Some(signal) = checked_in.next() => {
                let args = signal.args()?;
                println!(
                    "{}  checked in  {} ({}) score {:.3}",
                    local_time_str(args.check_in_time()),
                    args.name(),
                    args.member_id(),
                    args.score()
                );
            }
            Some(signal) = no_match.next() => {
                let args = signal.args()?;
                println!("no match (best score {:.3})", args.best_score());
            }
            _ = tokio::signal::ctrl_c() => break,
            else => break,
        }
    }
    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_records(records: &[AttendanceRecord]) {
    if records.is_empty() {
        println!("No check-ins");
    }
    for r in records {
        println!("{}", record_line(r));
    }
}

fn member_line(m: &Member) -> String {
    format!(
        "{}  {:<24} {:<28} {}",
        m.id,
        m.name,
        m.email.as_deref().unwrap_or("-"),
        if m.face_signature.is_some() { "face registered" } else { "no face" }
    )
}

fn record_line(r: &AttendanceRecord) -> String {
    format!(
        "{}  {}",
        local_time(&r.check_in_time),
        r.member_name.as_deref().unwrap_or(&r.member_id)
    )
}

fn local_time(t: &DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format an RFC 3339 timestamp in local time, or echo it unchanged.
fn local_time_str(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| local_time(&t.with_timezone(&Utc)))
        .unwrap_or_else(|_| raw.to_string())
}
