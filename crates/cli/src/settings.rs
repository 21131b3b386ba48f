//! Configuration loading.
//!
//! Sources are layered, later ones winning:
//! 1. Built-in defaults (`BackupConfig::default`)
//! 2. Config file (`--config`, else `<config_dir>/bitvault/config.toml`)
//! 3. `BITVAULT__SECTION__KEY` environment variables
//! 4. Command-line flags

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use bitvault_core::config::BackupConfig;

/// Values given on the command line
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub workspace: Option<String>,
    pub storage_root: Option<PathBuf>,
    pub workers: Option<usize>,
}

impl Overrides {
    fn apply(&self, config: &mut BackupConfig) {
        if let Some(workspace) = &self.workspace {
            config.workspace = workspace.clone();
        }
        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        if let Some(workers) = self.workers {
            config.workers.git_workers = workers;
        }
    }
}

/// `<config_dir>/bitvault/config.toml` for the current platform
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "bitvault").map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> Result<BackupConfig> {
    load_with_env(config_path, overrides, Environment::with_prefix("BITVAULT"))
}

fn load_with_env(
    config_path: Option<&Path>,
    overrides: &Overrides,
    environment: Environment,
) -> Result<BackupConfig> {
    let mut builder = Config::builder();

    match config_path {
        Some(path) => {
            let path = expand(path);
            tracing::debug!(path = %path.display(), "Loading config file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        None => {
            if let Some(path) = default_config_path().filter(|p| p.exists()) {
                tracing::debug!(path = %path.display(), "Loading config file");
                builder =
                    builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
            }
        }
    }

    builder = builder.add_source(
        environment
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("backup.include")
            .with_list_parse_key("backup.exclude"),
    );

    let mut config: BackupConfig = builder
        .build()
        .context("failed to read configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    overrides.apply(&mut config);
    config.storage_root = expand(&config.storage_root);
    config.validate()?;
    Ok(config)
}

/// Expand `~` and `$VAR` in a path, leaving it untouched when expansion fails
fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => path.to_path_buf(),
    }
}
