//! Cross-platform application paths

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use neurofit::FitConfig;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("could not determine data directory")]
    NoDataDir,

    #[error("failed to create data directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to read {path}: {source}")]
    ReadConfig { path: PathBuf, source: io::Error },

    #[error("invalid config {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, PathError> {
        let base = dirs::data_dir().ok_or(PathError::NoDataDir)?;
        Self::at(base.join("neurofit"))
    }

    /// Use an explicit data directory, creating it if needed.
    pub fn at(data_dir: PathBuf) -> Result<Self, PathError> {
        fs::create_dir_all(&data_dir).map_err(|source| PathError::CreateDir {
            path: data_dir.clone(),
            source,
        })?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn model_file(&self) -> PathBuf {
        self.data_dir.join("model.nfm")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// `config.json` when present, defaults otherwise.
    pub fn load_config(&self) -> Result<FitConfig, PathError> {
        let path = self.config_file();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FitConfig::default()),
            Err(source) => return Err(PathError::ReadConfig { path, source }),
        };
        let cfg: FitConfig = serde_json::from_str(&text)
            .map_err(|source| PathError::ParseConfig {
                path: path.clone(),
                source,
            })?;
        cfg.validate()
            .map_err(|reason| PathError::InvalidConfig { path, reason })?;
        Ok(cfg)
    }
}
