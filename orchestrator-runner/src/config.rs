// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for test-orchestrator.
//!
//! Configuration is layered: the embedded [default config](OrchestratorConfig::DEFAULT_CONFIG),
//! then `.config/orchestrator.toml` (or an explicitly passed file), then command-line
//! overrides applied by the caller.

use crate::{
    engine::EngineCommand,
    errors::{ConfigParseError, StorageConfigError},
    storage::StorageOptions,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{collections::BTreeSet, fmt, str::FromStr, time::Duration};
use tracing::{debug, warn};

/// Overall configuration for test-orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    history_window: usize,
    history_ttl: Duration,
    engine: EngineConfig,
    storage: StorageConfig,
}

impl OrchestratorConfig {
    /// The default location of the config within a directory.
    pub const CONFIG_PATH: &'static str = ".config/orchestrator.toml";

    /// Contains the default config as a TOML file.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the config from `config_file`, or if not specified from `.config/orchestrator.toml`
    /// under `dir` if that exists.
    pub fn from_sources(
        dir: &Utf8Path,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = dir.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };
        debug!(%config_file, "reading config");

        let builder = Self::make_default_config().add_source(source);
        Self::build_and_deserialize(builder)
            .map_err(|err| ConfigParseError::new(Some(config_file), err))
    }

    /// Returns the default config, with no file layered on top.
    pub fn default_config() -> Result<Self, ConfigParseError> {
        Self::build_and_deserialize(Self::make_default_config())
            .map_err(|err| ConfigParseError::new(None, err))
    }

    /// Returns the history window.
    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Returns the history retention period. Zero means history is kept forever.
    pub fn history_ttl(&self) -> Duration {
        self.history_ttl
    }

    /// Returns the engine configuration.
    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Returns the storage configuration.
    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Applies command-line overrides.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(history_window) = overrides.history_window {
            self.history_window = history_window.max(1);
        }
        if let Some(program) = overrides.engine_program {
            self.engine.program = program;
        }
        let storage = overrides.storage;
        if storage.kind.is_some() {
            self.storage.kind = storage.kind;
        }
        if storage.path.is_some() {
            self.storage.path = storage.path;
        }
        if storage.directory.is_some() {
            self.storage.directory = storage.directory;
        }
        if let Some(table_prefix) = storage.table_prefix {
            self.storage.table_prefix = table_prefix;
        }
        if let Some(lock_timeout) = storage.lock_timeout {
            self.storage.lock_timeout = lock_timeout;
        }
    }

    fn make_default_config() -> config::ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize(
        builder: config::ConfigBuilder<DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config = builder.build()?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config = OrchestratorConfigDeserialize::deserialize(ignored_de)?;
        for key in &ignored {
            warn!(%key, "ignoring unknown configuration key");
        }

        if config.history_window == 0 {
            return Err(ConfigError::Message(
                "`history-window` must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            history_window: config.history_window,
            history_ttl: config.history_ttl,
            engine: config.engine,
            storage: config.storage,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct OrchestratorConfigDeserialize {
    history_window: usize,
    #[serde(with = "humantime_serde")]
    history_ttl: Duration,
    engine: EngineConfig,
    storage: StorageConfig,
}

/// How to invoke the test engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

impl EngineConfig {
    /// Returns the engine program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the command used to invoke the engine.
    pub fn command(&self) -> EngineCommand {
        EngineCommand::new(self.program.clone(), self.args.clone())
    }
}

/// The storage backend kinds selectable from configuration.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    /// [`SqliteStorage`](crate::storage::SqliteStorage).
    Sqlite,
    /// [`FileStorage`](crate::storage::FileStorage).
    File,
}

impl StorageKind {
    /// All kinds.
    pub const ALL: [Self; 2] = [Self::Sqlite, Self::File];

    /// Returns the name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::File => "file",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown storage kind `{s}`"))
    }
}

/// Storage settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    #[serde(default)]
    kind: Option<StorageKind>,
    #[serde(default)]
    path: Option<Utf8PathBuf>,
    #[serde(default)]
    directory: Option<Utf8PathBuf>,
    table_prefix: String,
    #[serde(with = "humantime_serde")]
    lock_timeout: Duration,
}

impl StorageConfig {
    /// Resolves the settings into options for opening a backend.
    pub fn to_options(&self) -> Result<StorageOptions, StorageConfigError> {
        match self.kind {
            None => Err(StorageConfigError::MissingKind),
            Some(kind @ StorageKind::Sqlite) => {
                let path = self
                    .path
                    .clone()
                    .ok_or(StorageConfigError::MissingKey { kind, key: "path" })?;
                Ok(StorageOptions::Sqlite {
                    path,
                    table_prefix: self.table_prefix.clone(),
                })
            }
            Some(kind @ StorageKind::File) => {
                let directory = self.directory.clone().ok_or(StorageConfigError::MissingKey {
                    kind,
                    key: "directory",
                })?;
                Ok(StorageOptions::File {
                    directory,
                    lock_timeout: self.lock_timeout,
                })
            }
        }
    }
}

/// Overrides for configuration values, typically from the command line.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Overrides `history-window`.
    pub history_window: Option<usize>,
    /// Overrides `engine.program`.
    pub engine_program: Option<String>,
    /// Overrides the `storage` table.
    pub storage: StorageOverrides,
}

/// Overrides for the `storage` table.
#[derive(Clone, Debug, Default)]
pub struct StorageOverrides {
    /// Overrides `storage.kind`.
    pub kind: Option<StorageKind>,
    /// Overrides `storage.path`.
    pub path: Option<Utf8PathBuf>,
    /// Overrides `storage.directory`.
    pub directory: Option<Utf8PathBuf>,
    /// Overrides `storage.table-prefix`.
    pub table_prefix: Option<String>,
    /// Overrides `storage.lock-timeout`.
    pub lock_timeout: Option<Duration>,
}
