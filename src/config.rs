use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::Context;
use codec_bus::SessionConfig;
use serde::Deserialize;

/// Env var naming the config file.
pub const CONFIG_ENV: &str = "MEDIA_PIPE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "media-pipe.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// File path or URL; the first command-line argument wins over it.
    pub input: String,
    /// Demuxer name, when it cannot be guessed from the input.
    pub input_format: Option<String>,
    /// Where `out.h264` / `out.aac` are written.
    pub out_dir: PathBuf,
    pub log_level: String,
    pub session: SessionConfig,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            input_format: None,
            out_dir: PathBuf::from("."),
            log_level: "info".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl PipeConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("invalid config json")
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("load config {}", path.display()))
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

pub fn config() -> &'static PipeConfig {
    static CONFIG: LazyLock<PipeConfig> = LazyLock::new(|| {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        PipeConfig::load(Path::new(&path)).unwrap_or_else(|e| {
            eprintln!("Error loading config: {:#}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}
