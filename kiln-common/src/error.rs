use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::model::option::OptionValue;

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("TOML Parsing Error: {0}")]
    Toml(#[from] Arc<toml::de::Error>),

    #[error("Semantic Versioning Error: {0}")]
    SemVer(#[from] Arc<semver::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("No formula named '{0}' was found")]
    FormulaNotFound(String),

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error(
        "Unsatisfiable options for '{formula}': '{requester_a}' requires {option}={value_a} but '{requester_b}' requires {option}={value_b}"
    )]
    UnsatisfiableOptions {
        formula: String,
        option: String,
        requester_a: String,
        value_a: OptionValue,
        requester_b: String,
        value_b: OptionValue,
    },

    #[error("Unknown option '{flag}' for formula '{formula}'")]
    UnknownOption { formula: String, flag: String },

    #[error("Invalid value '{value}' for option '{option}' of formula '{formula}'")]
    InvalidOptionValue {
        formula: String,
        option: String,
        value: String,
    },

    #[error("Invalid option combination for '{formula}': {message}")]
    InvalidOptionCombination { formula: String, message: String },

    #[error("{formula}: step '{step}' failed ({}):\n{output}", .exit_code.map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}")))]
    ExternalStepFailed {
        formula: String,
        step: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Link conflict: {} already points to {} (wanted {})", .link.display(), .existing.display(), .requested.display())]
    LinkConflict {
        link: PathBuf,
        existing: PathBuf,
        requested: PathBuf,
    },

    #[error("'{formula}' was not built because its dependency '{dependency}' failed")]
    DependencyFailed { formula: String, dependency: String },

    #[error("{formula}: cancelled during '{step}'")]
    Cancelled { formula: String, step: String },

    #[error("Version probe failed for '{0}': {1}")]
    VersionProbe(String, String),

    #[error("Parsing Error in {0}: {1}")]
    ParseError(String, String),

    #[error("DownloadError: Failed to download '{0}' from '{1}': {2}")]
    DownloadError(String, String, String),

    #[error("Checksum Error: {0}")]
    ChecksumError(String),

    #[error("Git Error: {0}")]
    Git(String),

    #[error("Installation Error: {0}")]
    InstallError(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json(Arc::new(err))
    }
}

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        KilnError::Toml(Arc::new(err))
    }
}

impl From<semver::Error> for KilnError {
    fn from(err: semver::Error) -> Self {
        KilnError::SemVer(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
