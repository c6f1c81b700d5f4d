use anyhow::{bail, Context, Result};
use rollcall_core::recognize::DEFAULT_TOLERANCE;
use rollcall_core::{CorruptStorePolicy, DuplicatePolicy, MatchMode, Settings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const SYSTEM_CONFIG_PATH: &str = "/etc/rollcall/rollcalld.toml";

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    #[default]
    Session,
    System,
}

impl FromStr for Bus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus {other:?} (expected session or system)")),
        }
    }
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    store_path: Option<PathBuf>,
    ledger_path: Option<PathBuf>,
    tolerance: Option<f32>,
    match_mode: Option<MatchMode>,
    on_duplicate: Option<DuplicatePolicy>,
    on_corrupt_store: Option<CorruptStorePolicy>,
    bus: Option<Bus>,
}

/// Daemon configuration: TOML file, then `ROLLCALL_*` overrides, then defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory holding det_10g.onnx and w600k_r50.onnx.
    pub model_dir: PathBuf,
    pub store_path: PathBuf,
    pub ledger_path: PathBuf,
    pub tolerance: f32,
    pub match_mode: MatchMode,
    pub on_duplicate: DuplicatePolicy,
    pub on_corrupt_store: CorruptStorePolicy,
    pub bus: Bus,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::var("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(SYSTEM_CONFIG_PATH));
        let file = read_file(&path)?;
        Self::resolve(file, |key| std::env::var(key).ok(), default_data_dir())
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>, data_dir: PathBuf) -> Result<Self> {
        let env_path = |key: &str| env(key).map(PathBuf::from);

        let tolerance = env_parse(&env, "ROLLCALL_TOLERANCE")?
            .or(file.tolerance)
            .unwrap_or(DEFAULT_TOLERANCE);
        if !tolerance.is_finite() || tolerance < 0.0 {
            bail!("tolerance must be a finite, non-negative number (got {tolerance})");
        }

        Ok(Self {
            model_dir: env_path("ROLLCALL_MODEL_DIR")
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            store_path: env_path("ROLLCALL_STORE_PATH")
                .or(file.store_path)
                .unwrap_or_else(|| data_dir.join("templates.json")),
            ledger_path: env_path("ROLLCALL_LEDGER_PATH")
                .or(file.ledger_path)
                .unwrap_or_else(|| data_dir.join("attendance.csv")),
            tolerance,
            match_mode: env_parse(&env, "ROLLCALL_MATCH_MODE")?
                .or(file.match_mode)
                .unwrap_or_default(),
            on_duplicate: env_parse(&env, "ROLLCALL_ON_DUPLICATE")?
                .or(file.on_duplicate)
                .unwrap_or_default(),
            on_corrupt_store: env_parse(&env, "ROLLCALL_ON_CORRUPT_STORE")?
                .or(file.on_corrupt_store)
                .unwrap_or_default(),
            bus: env_parse(&env, "ROLLCALL_BUS")?.or(file.bus).unwrap_or_default(),
        })
    }

    pub fn settings(&self) -> Settings {
        Settings {
            tolerance: self.tolerance,
            match_mode: self.match_mode,
            on_duplicate: self.on_duplicate,
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T>(env: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
    }
}
