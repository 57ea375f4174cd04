use crate::error::{FlagrelayError, Result};
use crate::models::FlagOrder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_VAR: &str = "FLAGRELAY_CONFIG";
pub const EXECUTABLE_VAR: &str = "FLAGRELAY_EXECUTABLE";
pub const TIMEOUT_VAR: &str = "FLAGRELAY_TIMEOUT_SECS";
pub const FLAG_ORDER_VAR: &str = "FLAGRELAY_FLAG_ORDER";
pub const WORKING_DIRECTORY_VAR: &str = "FLAGRELAY_WORKING_DIRECTORY";
pub const MAX_OUTPUT_VAR: &str = "FLAGRELAY_MAX_OUTPUT_BYTES";

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// How the handler builds and launches the subprocess.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerConfig {
    pub executable: PathBuf,
    /// Placed before the generated flags, e.g. an interpreter and its script.
    pub leading_args: Vec<String>,
    pub json_flag: String,
    pub flag_order: FlagOrder,
    pub timeout_secs: u64,
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Stdout buffered while waiting for a complete JSON value.
    pub max_output_bytes: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./aqua"),
            leading_args: Vec::new(),
            json_flag: "--json=true".to_string(),
            flag_order: FlagOrder::Reversed,
            timeout_secs: 30,
            working_directory: None,
            env: BTreeMap::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl HandlerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HandlerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Resolve configuration the way the binaries do: the TOML file named by
    /// `FLAGRELAY_CONFIG` (if any), then environment overrides.
    pub fn load() -> Result<Self> {
        let base = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        base.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `FLAGRELAY_*` overrides looked up through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(executable) = lookup(EXECUTABLE_VAR) {
            self.executable = PathBuf::from(executable);
        }
        if let Some(timeout) = lookup(TIMEOUT_VAR) {
            self.timeout_secs = timeout.trim().parse().map_err(|_| {
                FlagrelayError::InvalidConfiguration(format!(
                    "{} must be a whole number of seconds, got '{}'",
                    TIMEOUT_VAR, timeout
                ))
            })?;
        }
        if let Some(order) = lookup(FLAG_ORDER_VAR) {
            self.flag_order = order.parse()?;
        }
        if let Some(dir) = lookup(WORKING_DIRECTORY_VAR) {
            self.working_directory = Some(PathBuf::from(dir));
        }
        if let Some(limit) = lookup(MAX_OUTPUT_VAR) {
            self.max_output_bytes = limit.trim().parse().map_err(|_| {
                FlagrelayError::InvalidConfiguration(format!(
                    "{} must be a byte count, got '{}'",
                    MAX_OUTPUT_VAR, limit
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(FlagrelayError::InvalidConfiguration(
                "executable must not be empty".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(FlagrelayError::InvalidConfiguration(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(FlagrelayError::InvalidConfiguration(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn with_executable<P: Into<PathBuf>>(mut self, executable: P) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flag_order(mut self, order: FlagOrder) -> Self {
        self.flag_order = order;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}
