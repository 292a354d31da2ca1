use std::io;

use clap::Parser;
use peoply_sync::config::{self, ConfigError, Opts};
use peoply_sync::engine::{Engine, EngineConfig, EngineError};
use peoply_sync::presentation::{LoggingPresentation, Presentation};
use snafu::{ResultExt, Snafu};
use tokio::signal;
use tokio::time::{Duration, interval};
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_TARGET: &str = "sync::main";

/// The presentation collaborator's own 60-second cadence, independent of the
/// engine's internal tick cadence.
const PRESENTATION_PERIOD: Duration = Duration::from_secs(60);

const PEOPLY_BASE_URL: &str = "https://peoply.app";
const PEOPLY_API_BASE_URL: &str = "https://api.peoply.app";

#[derive(Debug, Snafu)]
pub enum HostError {
    #[snafu(display("configuration error: {source}"))]
    Config { source: ConfigError },
    #[snafu(display("engine error: {source}"))]
    Engine { source: EngineError },
    #[snafu(display("logging initialization failed"))]
    Logging,
}

pub type HostResult<T> = std::result::Result<T, HostError>;

#[snafu::report]
#[tokio::main]
async fn main() -> HostResult<()> {
    init_logging()?;

    let opts = Opts::parse();
    let secrets = config::load_secrets(&opts.secret_file)
        .await
        .context(ConfigSnafu)?;
    let resolved = config::resolve(&opts, secrets).context(ConfigSnafu)?;

    info!(
        target: LOG_TARGET,
        organization = %resolved.organization_name,
        channel_id = resolved.channel_id,
        data_dir = %resolved.data_dir.display(),
        "starting peoply-sync"
    );

    let engine = Engine::new(EngineConfig {
        organization_name: resolved.organization_name,
        store_path: resolved.data_dir.join("peoply-sync.redb"),
        org_base_url: PEOPLY_BASE_URL.to_string(),
        api_base_url: PEOPLY_API_BASE_URL.to_string(),
    })
    .context(EngineSnafu)?;

    engine.start().await.context(EngineSnafu)?;
    info!(target: LOG_TARGET, "engine started, entering presentation loop");

    let presentation = LoggingPresentation;
    run_presentation_loop(&engine, &presentation).await;

    engine.stop().await.context(EngineSnafu)?;
    info!(target: LOG_TARGET, "shut down cleanly");
    Ok(())
}

/// The host program's own `tokio::time::interval` loop, never sharing a
/// scheduler with the engine's tick loop. Drains the engine and hands each
/// entry to the presentation collaborator, exiting on SIGINT.
async fn run_presentation_loop(engine: &Engine, presentation: &dyn Presentation) {
    let mut ticker = interval(PRESENTATION_PERIOD);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.drain_outbound().await {
                    Ok(entries) => {
                        if !entries.is_empty() {
                            info!(target: LOG_TARGET, count = entries.len(), "draining outbound queue");
                        }
                        for (record, change) in entries {
                            if let Err(error) = presentation.publish(&record, change).await {
                                error!(target: LOG_TARGET, event_id = %record.id, %error, "failed to publish announcement");
                            }
                        }
                    }
                    Err(error) => {
                        warn!(target: LOG_TARGET, %error, "failed to drain outbound queue");
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!(target: LOG_TARGET, "received Ctrl+C, shutting down");
                break;
            }
        }
    }
}

fn init_logging() -> HostResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| HostError::Logging)?;

    Ok(())
}
