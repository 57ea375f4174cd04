use crate::error::FlagrelayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The payload handed to the function by its host.
///
/// The gateway in front of the function wraps a form-encoded request body as
/// `{"body": "<raw body>"}`, so the body arrives here still `&`-delimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub body: String,
}

impl Event {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// One `&`-delimited unit of the event body: a bare flag name or `key=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub key: String,
    pub value: Option<String>,
}

impl Token {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// The token as a command-line flag, e.g. `--key=value` or `--key`.
    pub fn to_flag(&self) -> String {
        format!("--{}", self)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => f.write_str(&self.key),
        }
    }
}

/// Order in which body tokens are emitted as flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlagOrder {
    /// Last token first; the argv the executable has always been called with.
    #[default]
    Reversed,
    Forward,
}

impl std::str::FromStr for FlagOrder {
    type Err = FlagrelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reversed" | "reverse" => Ok(FlagOrder::Reversed),
            "forward" => Ok(FlagOrder::Forward),
            other => Err(FlagrelayError::InvalidConfiguration(format!(
                "unknown flag order '{}', expected 'reversed' or 'forward'",
                other
            ))),
        }
    }
}

/// Ordered argv handed to the subprocess (program name excluded).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArgumentList(Vec<String>);

impl ArgumentList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.0.push(arg.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for ArgumentList {
    fn from(args: Vec<String>) -> Self {
        Self(args)
    }
}

impl fmt::Display for ArgumentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// The single result delivered to the host for one invocation.
#[derive(Debug)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(FlagrelayError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            Outcome::Success(_) => Resolution::Success,
            Outcome::Failure(_) => Resolution::Failure,
        }
    }

    pub fn into_result(self) -> crate::Result<serde_json::Value> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(err) => Err(err),
        }
    }
}

/// Which way an invocation was resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Resolution {
    Success,
    Failure,
}

/// Record of one invocation, produced once the subprocess has been reaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationReport {
    pub id: Uuid,
    pub arguments: ArgumentList,
    /// `None` only if the relay never resolved, which should not happen.
    pub resolution: Option<Resolution>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}
