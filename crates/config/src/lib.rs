//! Configuration management for the voice pipeline
//!
//! Supports loading configuration from:
//! - TOML/YAML files
//! - Environment variables (COMPANION__ prefix)
//!
//! All configuration is loaded once at startup, validated, and treated
//! as immutable for the process lifetime. Validation failures are
//! fatal: the pipeline refuses to construct with an invalid persona
//! table or out-of-range thresholds.

pub mod constants;
pub mod personas;
pub mod settings;

pub use personas::{PersonaDescriptor, PersonaRegistry, VALID_VOICES};
pub use settings::{
    load_settings, AudioSettings, PersonaSettings, RecoverySettings, SegmenterSettings,
    Settings, TimeoutSettings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Persona '{persona}' uses unknown synthesis voice '{voice}'")]
    UnknownVoice { persona: String, voice: String },

    #[error("Persona '{persona}' prompt path escapes the trusted prompt directory: {path}")]
    UnsafePromptPath { persona: String, path: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<ConfigError> for companion_core::Error {
    fn from(err: ConfigError) -> Self {
        companion_core::Error::Config(err.to_string())
    }
}
