use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlagrelayError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailure { program: String, reason: String },

    #[error("Failed to parse subprocess output as JSON: {0}")]
    OutputParseFailure(String),

    /// Raw stderr content, passed through untouched.
    #[error("{0}")]
    SubprocessReported(String),

    #[error("Subprocess {}", describe_exit(.code))]
    SubprocessFailed { code: Option<i32> },

    #[error("No results")]
    NoResults,

    #[error("Subprocess timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Invocation ended without an outcome")]
    Abandoned,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl FlagrelayError {
    /// Stable name used as `errorType` when the failure leaves the process.
    pub fn kind(&self) -> &'static str {
        match self {
            FlagrelayError::MalformedInput(_) => "MalformedInput",
            FlagrelayError::SpawnFailure { .. } => "SubprocessSpawnFailure",
            FlagrelayError::OutputParseFailure(_) => "OutputParseFailure",
            FlagrelayError::SubprocessReported(_) => "SubprocessReportedError",
            FlagrelayError::SubprocessFailed { .. } => "SubprocessFailure",
            FlagrelayError::NoResults => "SubprocessExited",
            FlagrelayError::TimedOut(_) => "Timeout",
            FlagrelayError::Abandoned => "Abandoned",
            FlagrelayError::InvalidConfiguration(_) => "InvalidConfiguration",
            FlagrelayError::IoError(_) => "IoError",
            FlagrelayError::TomlError(_) => "InvalidConfiguration",
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, FlagrelayError>;
