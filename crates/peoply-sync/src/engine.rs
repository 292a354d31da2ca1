//! The Scheduler: drives the reconciler on a fixed 60-second cadence under a
//! single-flight guard, and owns the engine's lifecycle.

use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::model::{ChangeKind, EventRecord};
use crate::reconciler::{ReconcileError, Reconciler};
use crate::store::{EventStore, StoreError};
use crate::upstream::{HttpUpstreamClient, UpstreamClient, UpstreamError};

const LOG_TARGET: &str = "sync::scheduler";

/// The tick cadence the scheduler drives the reconciler on.
pub const TICK_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum EngineError {
    #[snafu(display("failed to construct the HTTP client: {source}"))]
    ClientInit { source: UpstreamError },
    #[snafu(display("organization resolution failed: {source}"))]
    OrganizationResolution { source: UpstreamError },
    #[snafu(display("store open/recall failed: {source}"))]
    Store { source: StoreError },
    #[snafu(display("engine was already started"))]
    AlreadyStarted,
    #[snafu(display("engine has not been started"))]
    NotStarted,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Opaque construction parameters the core accepts without interpreting: the
/// host program resolves these from CLI flags / secrets file before
/// constructing the engine.
pub struct EngineConfig {
    pub organization_name: String,
    pub store_path: std::path::PathBuf,
    pub org_base_url: String,
    pub api_base_url: String,
}

enum Lifecycle {
    Stopped,
    Running {
        reconciler: Arc<Reconciler<SystemClock>>,
        tick_task: JoinHandle<()>,
    },
}

/// The event synchronization engine: the only type the host program and the
/// presentation collaborator touch.
///
/// `cancel` is created once, at construction, and shared by the upstream
/// HTTP client and the tick loop for the engine's entire process lifetime —
/// `stop()` trips it once, so an `Engine` supports exactly one start/stop
/// cycle, matching organization resolution running exactly once per process
/// lifetime.
pub struct Engine {
    config: EngineConfig,
    upstream: Arc<dyn UpstreamClient>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let cancel = CancellationToken::new();
        let upstream = Arc::new(
            HttpUpstreamClient::with_base_urls(
                cancel.clone(),
                config.org_base_url.clone(),
                config.api_base_url.clone(),
            )
            .context(ClientInitSnafu)?,
        );
        Ok(Self::with_upstream_and_cancel(config, upstream, cancel))
    }

    /// Constructs with an injected upstream client, letting tests swap in a
    /// [`crate::upstream::fake::FakeUpstreamClient`] without touching the
    /// network.
    pub fn with_upstream(config: EngineConfig, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self::with_upstream_and_cancel(config, upstream, CancellationToken::new())
    }

    fn with_upstream_and_cancel(
        config: EngineConfig,
        upstream: Arc<dyn UpstreamClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            upstream,
            cancel,
            lifecycle: Mutex::new(Lifecycle::Stopped),
        }
    }

    /// Resolves the organization id (fatal on failure), recalls the store,
    /// and begins ticking.
    pub async fn start(&self) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Stopped) {
            return AlreadyStartedSnafu.fail();
        }

        let org_id = self
            .upstream
            .resolve_organization_id(&self.config.organization_name)
            .await
            .context(OrganizationResolutionSnafu)?;
        info!(target: LOG_TARGET, organization = %self.config.organization_name, %org_id, "organization resolved");

        let store = Arc::new(
            EventStore::open(&self.config.store_path)
                .await
                .context(StoreSnafu)?,
        );
        let now = SystemClock.now();
        let (known, last_updated, watermark) = store.recall(now).await.context(StoreSnafu)?;
        info!(target: LOG_TARGET, known = known.len(), "store recalled");

        let reconciler = Arc::new(Reconciler::new(
            store,
            self.upstream.clone(),
            Arc::new(SystemClock),
            org_id,
            self.config.org_base_url.clone(),
            known,
            last_updated,
            watermark,
        ));

        let tick_task = tokio::spawn(tick_loop(reconciler.clone(), self.cancel.clone()));

        *lifecycle = Lifecycle::Running {
            reconciler,
            tick_task,
        };
        info!(target: LOG_TARGET, "engine started");
        Ok(())
    }

    /// Atomically drains the outbound queue for the presentation
    /// collaborator. Safe to call whether or not a tick is currently in
    /// flight.
    pub async fn drain_outbound(&self) -> EngineResult<Vec<(EventRecord, ChangeKind)>> {
        let lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Running { reconciler, .. } => Ok(reconciler.drain_outbound().await),
            Lifecycle::Stopped => NotStartedSnafu.fail(),
        }
    }

    /// Cancels any in-flight HTTP request, waits for the tick task to
    /// observe cancellation, and releases the store handle. The `redb`
    /// handle and HTTP client close on drop once this returns, since
    /// `lifecycle` is the last owner of the `Arc`s.
    pub async fn stop(&self) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Running { tick_task, .. } =
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        else {
            return NotStartedSnafu.fail();
        };

        self.cancel.cancel();
        if let Err(error) = tick_task.await {
            warn!(target: LOG_TARGET, %error, "tick task ended abnormally during stop");
        }
        info!(target: LOG_TARGET, "engine stopped");
        Ok(())
    }
}

/// The background task a running [`Engine`] owns: one `tokio::time::interval`
/// loop with a single-flight `try_lock` guard, independent of the
/// presentation collaborator's own timer-driven loop.
async fn tick_loop(reconciler: Arc<Reconciler<SystemClock>>, cancel: CancellationToken) {
    let single_flight = Arc::new(Mutex::new(()));
    let mut ticker = interval(TICK_PERIOD);
    // The first tick fires immediately; skip it so `start()` (which already
    // ran `recall`) doesn't race a tick before callers can observe the
    // engine as started.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(target: LOG_TARGET, "tick loop observed cancellation, exiting");
                break;
            }
            _ = ticker.tick() => {
                let Ok(_guard) = single_flight.clone().try_lock_owned() else {
                    warn!(target: LOG_TARGET, "previous tick still in flight, dropping this cadence firing");
                    continue;
                };

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(target: LOG_TARGET, "tick loop observed cancellation mid-tick, exiting");
                        break;
                    }
                    result = reconciler.tick() => {
                        match result {
                            Ok(outcome) => {
                                if outcome.fetched {
                                    info!(
                                        target: LOG_TARGET,
                                        new = outcome.new_count,
                                        updated = outcome.updated_count,
                                        expired = outcome.expired_count,
                                        "tick cycle complete"
                                    );
                                }
                            }
                            Err(ReconcileError::Store { source }) => {
                                warn!(target: LOG_TARGET, error = %source, "durable write failed, aborting tick");
                            }
                            Err(ReconcileError::Upstream { source }) => {
                                warn!(target: LOG_TARGET, error = %source, "tick failed");
                            }
                        }
                    }
                }
            }
        }
    }
}
