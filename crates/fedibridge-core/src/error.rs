//! Error types shared across the core.
//!
//! The propagation policy is narrow on purpose: only store faults bubble up
//! as `Result`s. Transport faults are converted at the call site into a
//! localized reply fragment plus a `warn!`, and admission rejections are
//! plain reply text, so neither appears here as an error variant.

use thiserror::Error;

/// Unexpected database failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("state file error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure talking to one of the two universes.
///
/// Carried by the [`crate::port`] traits; the core turns these into log
/// entries and localized "send failed" fragments, never into hard errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("xmpp transport error: {0}")]
    Xmpp(String),

    #[error("fediverse API error: {0}")]
    Fedi(String),

    #[error("operation not supported by this session kind")]
    Unsupported,
}

/// Fatal configuration problem at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("translation catalog error: {0}")]
    Translations(String),
}
