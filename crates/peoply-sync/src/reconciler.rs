//! The decision kernel: validate/classify/apply per payload, plus the
//! expiration sweep.

use std::collections::HashMap;
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, Instant, Relation, compare};
use crate::model::{ChangeKind, EventRecord, RawEventPayload, build_record};
use crate::outbound::OutboundQueue;
use crate::store::{EventStore, StoreError};
use crate::upstream::{UpstreamClient, UpstreamError};

const LOG_TARGET: &str = "sync::reconciler";

#[derive(Debug, Snafu)]
pub enum ReconcileError {
    #[snafu(display("upstream fetch failed: {source}"))]
    Upstream { source: UpstreamError },
    #[snafu(display("durable write failed: {source}"))]
    Store { source: StoreError },
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

/// Aggregate counts logged after each tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub new_count: usize,
    pub updated_count: usize,
    pub skipped_count: usize,
    pub expired_count: usize,
    /// `false` when step 2's fetch failed and the tick returned early.
    pub fetched: bool,
}

/// Owns the in-memory `known`/`lastUpdated` maps, the watermark, and the
/// outbound queue; drives one tick at a time.
///
/// The single-flight guard lives one layer up, in the scheduler: this type
/// has no opinion about concurrency beyond "one tick borrows `&mut self`
/// worth of map access at a time", which `tokio::sync::Mutex` enforces for
/// the maps the scheduler's `drainOutbound()` must also reach.
pub struct Reconciler<C: Clock> {
    store: Arc<EventStore>,
    upstream: Arc<dyn UpstreamClient>,
    clock: Arc<C>,
    org_id: String,
    base_url: String,
    state: Mutex<State>,
    outbound: Mutex<OutboundQueue>,
}

struct State {
    known: HashMap<String, EventRecord>,
    last_updated: HashMap<String, Instant>,
    watermark: Instant,
}

impl<C: Clock> Reconciler<C> {
    pub fn new(
        store: Arc<EventStore>,
        upstream: Arc<dyn UpstreamClient>,
        clock: Arc<C>,
        org_id: String,
        base_url: String,
        known: HashMap<String, EventRecord>,
        last_updated: HashMap<String, Instant>,
        watermark: Instant,
    ) -> Self {
        Self {
            store,
            upstream,
            clock,
            org_id,
            base_url,
            state: Mutex::new(State {
                known,
                last_updated,
                watermark,
            }),
            outbound: Mutex::new(OutboundQueue::default()),
        }
    }

    /// Atomically removes and returns the outbound queue contents. Safe to
    /// call concurrently with a tick in progress: the queue is guarded by
    /// its own mutex, independent of the tick's map mutex.
    pub async fn drain_outbound(&self) -> Vec<(EventRecord, ChangeKind)> {
        self.outbound.lock().await.drain()
    }

    #[cfg(test)]
    pub async fn known_count(&self) -> usize {
        self.state.lock().await.known.len()
    }

    #[cfg(test)]
    pub async fn watermark(&self) -> Instant {
        self.state.lock().await.watermark
    }

    /// Runs one tick: expiration sweep, fetch, classify/apply per payload,
    /// watermark advance, all committed as a single durable write batch.
    pub async fn tick(&self) -> ReconcileResult<TickOutcome> {
        let now = self.clock.now();
        let mut outcome = TickOutcome::default();

        let expired_ids = self.sweep_candidates(now).await;
        outcome.expired_count = expired_ids.len();

        let watermark_before = { self.state.lock().await.watermark };
        let raw = match self
            .upstream
            .fetch_events_since(&self.org_id, watermark_before)
            .await
        {
            Ok(raw) => raw,
            Err(error) => {
                warn!(target: LOG_TARGET, %error, "fetch failed, watermark unchanged");
                self.store
                    .commit_tick(&expired_ids, &[], None)
                    .await
                    .context(StoreSnafu)?;
                self.apply_committed(&expired_ids, &[], None).await;
                return Ok(outcome);
            }
        };
        outcome.fetched = true;

        let upserts = self.classify(raw, &expired_ids, &mut outcome).await;
        let db_upserts: Vec<(EventRecord, Instant)> = upserts
            .iter()
            .map(|(record, _, updated_at)| (record.clone(), *updated_at))
            .collect();

        self.store
            .commit_tick(&expired_ids, &db_upserts, Some(now))
            .await
            .context(StoreSnafu)?;
        self.apply_committed(&expired_ids, &upserts, Some(now)).await;

        for (record, change, _) in upserts {
            self.outbound.lock().await.push(record.id.clone(), record, change);
        }

        info!(
            target: LOG_TARGET,
            new = outcome.new_count,
            updated = outcome.updated_count,
            skipped = outcome.skipped_count,
            expired = outcome.expired_count,
            "tick complete"
        );

        Ok(outcome)
    }

    /// Computes which known ids have non-strictly passed their `startAt`,
    /// without mutating anything. The caller commits the removal and applies
    /// it to in-memory state as part of the same tick's single write batch.
    async fn sweep_candidates(&self, now: Instant) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .known
            .iter()
            .filter(|(_, record)| {
                let start_at = record.start_at_instant().unwrap_or(crate::clock::SENTINEL);
                !matches!(compare(now, start_at), Relation::Future)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Validate/Classify each raw payload against a view of `last_updated`
    /// with this tick's expired ids already removed, without writing
    /// anything durable yet. Returns the `(record, change, updatedAt)`
    /// triples to upsert; later payloads for the same id in one fetch see
    /// earlier ones' classification.
    async fn classify(
        &self,
        raw: Vec<RawEventPayload>,
        expired_ids: &[String],
        outcome: &mut TickOutcome,
    ) -> Vec<(EventRecord, ChangeKind, Instant)> {
        let mut working_last_updated = { self.state.lock().await.last_updated.clone() };
        for id in expired_ids {
            working_last_updated.remove(id);
        }

        let mut pending: HashMap<String, (EventRecord, ChangeKind, Instant)> = HashMap::new();
        for payload in raw {
            let Some(id) = payload.url_id.clone() else {
                warn!(target: LOG_TARGET, "integrity violation: payload missing urlId, skipping");
                outcome.skipped_count += 1;
                continue;
            };
            let Some(raw_updated_at) = payload.updated_at.clone() else {
                warn!(target: LOG_TARGET, %id, "integrity violation: payload missing updatedAt, skipping");
                outcome.skipped_count += 1;
                continue;
            };
            // Upstream sometimes sends the literal string "null" (or other
            // unparseable garbage) for a present-but-unknown updatedAt;
            // substitute the sentinel instant rather than rejecting,
            // matching build_record's fallback for an unparseable startDate.
            let upstream_updated_at = Instant::parse(&raw_updated_at).unwrap_or_else(|error| {
                debug!(target: LOG_TARGET, %id, raw = %raw_updated_at, %error, "updatedAt unparseable, substituting sentinel");
                crate::clock::SENTINEL
            });

            let classification = match working_last_updated.get(&id) {
                None => Some(ChangeKind::New),
                Some(&stored) => match compare(stored, upstream_updated_at) {
                    Relation::Future => Some(ChangeKind::Updated),
                    Relation::Equal => None,
                    Relation::Past => {
                        warn!(
                            target: LOG_TARGET,
                            %id,
                            stored = %stored.format(),
                            upstream = %upstream_updated_at.format(),
                            "clock-skew/integrity warning: stored updatedAt is newer than upstream"
                        );
                        None
                    }
                },
            };

            let Some(change) = classification else {
                outcome.skipped_count += 1;
                continue;
            };

            let record = build_record(&payload, &self.base_url, id.clone());
            working_last_updated.insert(id.clone(), upstream_updated_at);

            match change {
                ChangeKind::New => outcome.new_count += 1,
                ChangeKind::Updated => outcome.updated_count += 1,
            }
            // A second payload for the same id within one fetch overwrites
            // the first, same as the outbound queue's re-push semantics.
            pending.insert(id, (record, change, upstream_updated_at));
        }

        pending.into_values().collect()
    }

    /// Applies a committed batch to in-memory state: removes expired ids,
    /// applies upserts, and advances the watermark if the fetch succeeded.
    async fn apply_committed(
        &self,
        expired_ids: &[String],
        upserts: &[(EventRecord, ChangeKind, Instant)],
        watermark: Option<Instant>,
    ) {
        let mut state = self.state.lock().await;
        for id in expired_ids {
            state.known.remove(id);
            state.last_updated.remove(id);
        }
        for (record, _, updated_at) in upserts {
            state.known.insert(record.id.clone(), record.clone());
            state.last_updated.insert(record.id.clone(), *updated_at);
        }
        if let Some(watermark) = watermark {
            state.watermark = watermark;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::store::EventStore;
    use crate::upstream::fake::FakeUpstreamClient;

    fn payload(id: &str, updated_at: &str, start_at: &str, title: &str) -> RawEventPayload {
        RawEventPayload {
            url_id: Some(id.to_string()),
            title: Some(title.to_string()),
            description: Some("D".to_string()),
            start_date: Some(start_at.to_string()),
            updated_at: Some(updated_at.to_string()),
            location_name: Some("L".to_string()),
        }
    }

    async fn new_reconciler(now: Instant) -> (Reconciler<FakeClock>, Arc<FakeUpstreamClient>) {
        let store = Arc::new(EventStore::open_in_memory().await.unwrap());
        let upstream = Arc::new(FakeUpstreamClient::new("org-1"));
        let clock = Arc::new(FakeClock::new(now));
        let reconciler = Reconciler::new(
            store,
            upstream.clone(),
            clock,
            "org-1".to_string(),
            "https://peoply.app".to_string(),
            HashMap::new(),
            HashMap::new(),
            crate::clock::SENTINEL,
        );
        (reconciler, upstream)
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn first_run_one_event_emits_new() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        upstream.push_fetch_ok(vec![payload(
            "e1",
            "2025-01-01T00:00:00.000Z",
            "2099-01-01T12:00:00.000Z",
            "T",
        )]);

        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.new_count, 1);
        assert_eq!(outcome.updated_count, 0);

        let drained = reconciler.drain_outbound().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0.id, "e1");
        assert_eq!(drained[0].1, ChangeKind::New);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn unchanged_refetch_emits_nothing() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        let p = payload("e1", "2025-01-01T00:00:00.000Z", "2099-01-01T12:00:00.000Z", "T");
        upstream.push_fetch_ok(vec![p.clone()]);
        reconciler.tick().await.unwrap();
        reconciler.drain_outbound().await;

        upstream.push_fetch_ok(vec![p]);
        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.new_count, 0);
        assert_eq!(outcome.updated_count, 0);
        assert!(reconciler.drain_outbound().await.is_empty());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn metadata_edit_emits_updated_with_new_title() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        upstream.push_fetch_ok(vec![payload(
            "e1",
            "2025-01-01T00:00:00.000Z",
            "2099-01-01T12:00:00.000Z",
            "Original",
        )]);
        reconciler.tick().await.unwrap();
        reconciler.drain_outbound().await;

        upstream.push_fetch_ok(vec![payload(
            "e1",
            "2025-01-01T00:00:01.000Z",
            "2099-01-01T12:00:00.000Z",
            "Edited",
        )]);
        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.updated_count, 1);

        let drained = reconciler.drain_outbound().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0.title, "Edited");
        assert_eq!(drained[0].1, ChangeKind::Updated);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn stale_upstream_is_ignored_and_title_unchanged() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        upstream.push_fetch_ok(vec![payload(
            "e1",
            "2025-01-01T00:00:01.000Z",
            "2099-01-01T12:00:00.000Z",
            "Original",
        )]);
        reconciler.tick().await.unwrap();
        reconciler.drain_outbound().await;

        upstream.push_fetch_ok(vec![payload(
            "e1",
            "2025-01-01T00:00:00.000Z",
            "2099-01-01T12:00:00.000Z",
            "Rewound",
        )]);
        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.new_count, 0);
        assert_eq!(outcome.updated_count, 0);
        assert!(reconciler.drain_outbound().await.is_empty());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn expiration_sweep_removes_and_emits_nothing() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        upstream.push_fetch_ok(vec![payload(
            "e1",
            "2025-01-01T00:00:00.000Z",
            "2025-06-02T00:00:00.000Z",
            "T",
        )]);
        reconciler.tick().await.unwrap();
        reconciler.drain_outbound().await;
        assert_eq!(reconciler.known_count().await, 1);

        // clock advances past startAt; simulate via a fresh tick with a
        // reconciler whose clock is shared and can be set forward. Build
        // one here to exercise the sweep directly.
        let store = Arc::new(EventStore::open_in_memory().await.unwrap());
        let later = Instant::parse("2025-06-03T00:00:00.000Z").unwrap();
        let mut known = HashMap::new();
        known.insert(
            "e1".to_string(),
            EventRecord {
                id: "e1".to_string(),
                title: "T".to_string(),
                description: "D".to_string(),
                start_at: "2025-06-02T00:00:00.000Z".to_string(),
                updated_at: "2025-01-01T00:00:00.000Z".to_string(),
                place: "L".to_string(),
                link: "https://peoply.app/events/e1".to_string(),
            },
        );
        let mut last_updated = HashMap::new();
        last_updated.insert("e1".to_string(), Instant::parse("2025-01-01T00:00:00.000Z").unwrap());
        let clock = Arc::new(FakeClock::new(later));
        let upstream2 = Arc::new(FakeUpstreamClient::new("org-1"));
        upstream2.push_fetch_ok(vec![]);
        let reconciler2 = Reconciler::new(
            store,
            upstream2,
            clock,
            "org-1".to_string(),
            "https://peoply.app".to_string(),
            known,
            last_updated,
            crate::clock::SENTINEL,
        );
        let outcome = reconciler2.tick().await.unwrap();
        assert_eq!(outcome.expired_count, 1);
        assert_eq!(reconciler2.known_count().await, 0);
        assert!(reconciler2.drain_outbound().await.is_empty());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn transport_failure_then_recovery_emits_every_event_on_retry() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        upstream.push_fetch_err(UpstreamError::Http { status: 503 });
        let watermark_before = reconciler.watermark().await;
        let outcome = reconciler.tick().await.unwrap();
        assert!(!outcome.fetched);
        assert_eq!(reconciler.watermark().await, watermark_before);
        assert!(reconciler.drain_outbound().await.is_empty());

        upstream.push_fetch_ok(vec![payload(
            "e1",
            "2025-01-01T00:00:00.000Z",
            "2099-01-01T12:00:00.000Z",
            "T",
        )]);
        let outcome = reconciler.tick().await.unwrap();
        assert!(outcome.fetched);
        assert_eq!(outcome.new_count, 1);
        assert_eq!(reconciler.drain_outbound().await.len(), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn bare_object_response_yields_one_classification() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        upstream.push_fetch_ok(vec![payload(
            "e1",
            "2025-01-01T00:00:00.000Z",
            "2099-01-01T12:00:00.000Z",
            "T",
        )]);
        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.new_count + outcome.updated_count, 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn missing_url_id_is_skipped_without_state_change() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        let mut p = payload("e1", "2025-01-01T00:00:00.000Z", "2099-01-01T12:00:00.000Z", "T");
        p.url_id = None;
        upstream.push_fetch_ok(vec![p]);

        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.skipped_count, 1);
        assert_eq!(reconciler.known_count().await, 0);
        assert!(reconciler.drain_outbound().await.is_empty());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn missing_start_date_gets_sentinel_and_expires_next_sweep() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        let mut p = payload("e1", "2025-01-01T00:00:00.000Z", "2099-01-01T12:00:00.000Z", "T");
        p.start_date = None;
        upstream.push_fetch_ok(vec![p]);
        reconciler.tick().await.unwrap();
        reconciler.drain_outbound().await;

        upstream.push_fetch_ok(vec![]);
        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.expired_count, 1);
        assert_eq!(reconciler.known_count().await, 0);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn literal_null_updated_at_substitutes_sentinel_instead_of_rejecting() {
        let now = Instant::parse("2025-06-01T00:00:00.000Z").unwrap();
        let (reconciler, upstream) = new_reconciler(now).await;
        upstream.push_fetch_ok(vec![payload(
            "e1",
            "null",
            "2099-01-01T12:00:00.000Z",
            "T",
        )]);

        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.new_count, 1);
        assert_eq!(outcome.skipped_count, 0);
        assert_eq!(reconciler.known_count().await, 1);

        let drained = reconciler.drain_outbound().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0.updated_at, crate::clock::SENTINEL.format());
        assert_eq!(drained[0].1, ChangeKind::New);
    }
}
