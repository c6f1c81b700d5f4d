use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn enroll(&self, name: &str, roll: &str, images: Vec<String>) -> zbus::Result<String>;
    fn recognize(&self, image: &str) -> zbus::Result<String>;
    fn mark_attendance(&self, name: &str, roll: &str) -> zbus::Result<String>;
    fn attendance_status(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from one or more photos
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        roll: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify the face in a photo
    Recognize { image: PathBuf },
    /// Record attendance for a person
    Mark {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        roll: String,
    },
    /// Show today's attended / not attended lists
    Roster,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")?;

    let reply = match cli.command {
        Commands::Enroll { name, roll, images } => {
            let images = images.iter().map(|p| encode_file(p)).collect::<Result<Vec<_>>>()?;
            tracing::debug!(count = images.len(), "sending enrollment images");
            proxy.enroll(&name, &roll, images).await?
        }
        Commands::Recognize { image } => proxy.recognize(&encode_file(&image)?).await?,
        Commands::Mark { name, roll } => proxy.mark_attendance(&name, &roll).await?,
        Commands::Roster => proxy.attendance_status().await?,
        Commands::Status => proxy.status().await?,
    };

    let ok = print_reply(&reply)?;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn encode_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}

/// Pretty-print the daemon's JSON reply. Returns false for `"status": "error"`.
fn print_reply(reply: &str) -> Result<bool> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(value.get("status").and_then(|s| s.as_str()) != Some("error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from(["rollcall", "enroll", "-n", "Asha", "-r", "7", "a.png", "b.png"]).unwrap();
        assert!(!cli.system);
        match cli.command {
            Commands::Enroll { name, roll, images } => {
                assert_eq!((name.as_str(), roll.as_str()), ("Asha", "7"));
                assert_eq!(images.len(), 2);
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_enroll_requires_images() {
        assert!(Cli::try_parse_from(["rollcall", "enroll", "-n", "Asha", "-r", "7"]).is_err());
    }

    #[test]
    fn test_system_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["rollcall", "roster", "--system"]).unwrap();
        assert!(cli.system);
    }

    #[test]
    fn test_encode_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("face.png");
        std::fs::write(&path, b"\x89PNG").unwrap();
        assert_eq!(encode_file(&path).unwrap(), "iVBORw==");
        assert!(encode_file(&dir.path().join("missing.png")).is_err());
    }

    #[test]
    fn test_print_reply_status() {
        assert!(print_reply(r#"{"status":"ok","message":"Registered"}"#).unwrap());
        assert!(!print_reply(r#"{"status":"error","message":"Name & roll required"}"#).unwrap());
        assert!(print_reply("not json").is_err());
    }
}
