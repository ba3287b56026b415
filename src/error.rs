use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnydevError {
    #[error("{0}")]
    Validation(String),
    #[error("could not parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("{message}")]
    Composition {
        message: String,
        status_code: i32,
        details: ProcessErrorDetails,
    },
    #[error("{message}")]
    ToolUnavailable {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("failed to save configuration to {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to install interrupt handler: {0}")]
    Interrupt(#[from] ctrlc::Error),
}

impl AnydevError {
    /// Exit status for the process when a command fails with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Composition { status_code, .. } if *status_code != 0 => *status_code,
            _ => 1,
        }
    }

    pub fn process_details(&self) -> Option<&ProcessErrorDetails> {
        match self {
            Self::Composition { details, .. } | Self::ToolUnavailable { details, .. } => {
                Some(details)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

pub type Result<T> = std::result::Result<T, AnydevError>;
