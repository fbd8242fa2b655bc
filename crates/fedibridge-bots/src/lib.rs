//! Shared startup code for the two listener binaries.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use fedibridge_core::config::BridgeConfig;
use fedibridge_core::i18n::Messages;
use fedibridge_mastodon::MastodonClient;

/// Seconds to wait before reconnecting a dropped listener.
pub const RECONNECT_DELAY_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Path to the bridge configuration file.
    #[arg(long, env = "FEDIBRIDGE_CONFIG", default_value = "/etc/fedibridge/bridge.toml")]
    pub config: PathBuf,
}

/// Parse the command line, load config and catalog, set up tracing.
///
/// The returned guard must be held for the process lifetime when logging
/// goes to a file.
pub fn startup() -> Result<(BridgeConfig, Messages, Option<tracing_appender::non_blocking::WorkerGuard>)>
{
    let cli = Cli::parse();
    let (config, messages) =
        BridgeConfig::load(&cli.config).context("loading bridge configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let guard = match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path.file_name().map(PathBuf::from).unwrap_or_else(|| "bridge.log".into());
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    Ok((config, messages, guard))
}

/// Pull the bridge account's lock flag and the instance character limit.
/// Failures leave the configured defaults in place.
pub async fn apply_instance_settings(config: &mut BridgeConfig, mastodon: &MastodonClient) {
    let locked = match mastodon.verify_credentials().await {
        Ok(credentials) => Some(credentials.locked),
        Err(e) => {
            warn!(error = %e, "cannot verify bridge credentials");
            None
        }
    };
    let char_limit = match mastodon.instance().await {
        Ok(instance) => instance.max_characters(),
        Err(e) => {
            warn!(error = %e, "cannot fetch instance configuration");
            None
        }
    };
    config.apply_instance_settings(locked, char_limit);
}
