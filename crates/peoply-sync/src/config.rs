//! CLI surface and secrets-file loading for the host program. The engine
//! itself treats organization name, store path, and channel id as opaque
//! construction parameters; this module is what resolves them.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Mirrors `rostra-bot`'s `Opts`: CLI flags with defaults, an optional
/// secrets file carrying the credential the CLI should never take directly.
#[derive(Debug, Parser)]
#[command(version, about = "Mirrors a peoply.app organization's event calendar into a Discord channel.", long_about = None)]
pub struct Opts {
    /// Path to the JSON secrets file (organization_name, channel_id,
    /// discord_api_key).
    #[arg(long)]
    pub secret_file: PathBuf,

    /// Directory the durable event store is kept in.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// peoply.app organization name, overriding the secrets file's
    /// `organization_name` when set.
    #[arg(long)]
    pub organization_name: Option<String>,

    /// Discord channel id, overriding the secrets file's `channel_id` when
    /// set.
    #[arg(long)]
    pub channel_id: Option<u64>,
}

/// The `secrets.json` shape the host program expects on disk.
#[derive(Debug, Deserialize)]
pub struct Secrets {
    pub organization_name: String,
    pub channel_id: SecretsChannelId,
    pub discord_api_key: String,
}

/// Some secrets files store `channel_id` as a string and rely on the reader
/// to convert it; accept either JSON shape so a hand-edited secrets file
/// isn't rejected for using a bare number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SecretsChannelId {
    Number(u64),
    String(String),
}

impl SecretsChannelId {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read secrets file {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse secrets file {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("secrets file's channel_id ({raw}) is not a valid integer"))]
    InvalidChannelId { raw: String },
    #[snafu(display(
        "organization name not set via --organization-name or the secrets file"
    ))]
    MissingOrganizationName,
    #[snafu(display("channel id not set via --channel-id or the secrets file"))]
    MissingChannelId,
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// The resolved configuration the engine and the presentation collaborator
/// both need, after merging CLI overrides onto the secrets file.
pub struct ResolvedConfig {
    pub organization_name: String,
    pub channel_id: u64,
    pub discord_api_key: String,
    pub data_dir: PathBuf,
}

pub async fn load_secrets(path: &PathBuf) -> ConfigResult<Secrets> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .context(ReadSnafu { path: path.clone() })?;
    serde_json::from_str(&raw).context(ParseSnafu { path: path.clone() })
}

pub fn resolve(opts: &Opts, secrets: Secrets) -> ConfigResult<ResolvedConfig> {
    let organization_name = opts
        .organization_name
        .clone()
        .unwrap_or(secrets.organization_name);
    if organization_name.trim().is_empty() {
        return MissingOrganizationNameSnafu.fail();
    }

    let channel_id = match opts.channel_id {
        Some(id) => id,
        None => secrets.channel_id.as_u64().ok_or_else(|| {
            let raw = match &secrets.channel_id {
                SecretsChannelId::Number(n) => n.to_string(),
                SecretsChannelId::String(s) => s.clone(),
            };
            ConfigError::InvalidChannelId { raw }
        })?,
    };

    Ok(ResolvedConfig {
        organization_name,
        channel_id,
        discord_api_key: secrets.discord_api_key,
        data_dir: opts.data_dir.clone(),
    })
}
