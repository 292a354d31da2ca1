//! The event store: `known`/`lastUpdated` in-memory maps backed by a `redb`
//! table, plus the watermark checkpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use snafu::{Location, ResultExt, Snafu};
use tracing::{debug, info};

use crate::clock::Instant;
use crate::model::EventRecord;
use crate::tables::{events, last_updated, watermark};

const LOG_TARGET: &str = "sync::store";

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("failed to create data directory for {}: {source}", path.display()))]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to open database at {}: {source}", path.display()))]
    Open {
        source: redb::DatabaseError,
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("stored timestamp for {id} could not be parsed: {source}"))]
    StoredTimestamp {
        id: String,
        source: crate::clock::ClockError,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The durable, transactional backing for the reconciler's two logical
/// mappings. Owned exclusively by the engine; never shared outside a
/// `Reconciler`/`Scheduler` pair.
pub struct EventStore {
    db: redb_bincode::Database,
}

impl EventStore {
    /// Opens (creating if absent) the `events`/`last_updated`/`watermark`
    /// tables at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(CreateDirSnafu { path: path.clone() })?;
        }
        let raw = {
            let open_path = path.clone();
            tokio::task::spawn_blocking(move || redb::Database::create(&open_path))
                .await
                .expect("spawn_blocking does not panic")
                .context(OpenSnafu { path: path.clone() })?
        };
        let db = redb_bincode::Database::from(raw);

        Self::write_with_inner(&db, |tx| {
            tx.open_table(&events::TABLE)?;
            tx.open_table(&last_updated::TABLE)?;
            tx.open_table(&watermark::TABLE)?;
            Ok(())
        })
        .await?;

        Ok(Self { db })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> StoreResult<Self> {
        let raw = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|source| StoreError::Open {
                source,
                path: PathBuf::from(":memory:"),
                location: snafu::location!(),
            })?;
        let db = redb_bincode::Database::from(raw);
        Self::write_with_inner(&db, |tx| {
            tx.open_table(&events::TABLE)?;
            tx.open_table(&last_updated::TABLE)?;
            tx.open_table(&watermark::TABLE)?;
            Ok(())
        })
        .await?;
        Ok(Self { db })
    }

    async fn write_with_inner<T>(
        db: &redb_bincode::Database,
        f: impl FnOnce(&redb_bincode::WriteTransaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        tokio::task::block_in_place(|| {
            let tx = db.begin_write().context(TransactionSnafu)?;
            let result = f(&tx)?;
            tx.commit().context(CommitSnafu)?;
            Ok(result)
        })
    }

    async fn write_with<T>(
        &self,
        f: impl FnOnce(&redb_bincode::WriteTransaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        Self::write_with_inner(&self.db, f).await
    }

    async fn read_with<T>(
        &self,
        f: impl FnOnce(&redb_bincode::ReadTransaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        tokio::task::block_in_place(|| {
            let tx = self.db.begin_read().context(TransactionSnafu)?;
            f(&tx)
        })
    }

    /// Loads the durable `events`/`last_updated` tables into in-memory maps
    /// and the watermark, then runs an immediate expiration sweep.
    pub async fn recall(
        &self,
        now: Instant,
    ) -> StoreResult<(HashMap<String, EventRecord>, HashMap<String, Instant>, Instant)> {
        let (known, stored_last_updated, wm) = self
            .read_with(|tx| {
                let events_table = tx.open_table(&events::TABLE)?;
                let mut known = HashMap::new();
                for row in events_table.range::<String>(..)? {
                    let (key, value) = row?;
                    known.insert(key.value(), value.value());
                }

                let last_updated_table = tx.open_table(&last_updated::TABLE)?;
                let mut stored_last_updated = HashMap::new();
                for row in last_updated_table.range::<String>(..)? {
                    let (key, value) = row?;
                    stored_last_updated.insert(key.value(), value.value());
                }

                let watermark_table = tx.open_table(&watermark::TABLE)?;
                let wm = watermark_table.get(&())?.map(|v| v.value());

                Ok((known, stored_last_updated, wm))
            })
            .await?;

        let mut last_updated_map = HashMap::with_capacity(stored_last_updated.len());
        for (id, raw) in stored_last_updated {
            let instant = Instant::parse(&raw).context(StoredTimestampSnafu { id: id.clone() })?;
            last_updated_map.insert(id, instant);
        }

        let watermark = match wm {
            Some(raw) => Instant::parse(&raw).unwrap_or(crate::clock::SENTINEL),
            None => crate::clock::SENTINEL,
        };

        info!(
            target: LOG_TARGET,
            known = known.len(),
            watermark = %watermark.format(),
            "recalled store from disk"
        );

        let mut known = known;
        let mut last_updated_map = last_updated_map;
        let expired: Vec<String> = known
            .iter()
            .filter(|(_, record)| {
                let start_at = record.start_at_instant().unwrap_or(crate::clock::SENTINEL);
                !matches!(crate::clock::compare(now, start_at), crate::clock::Relation::Future)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            known.remove(id);
            last_updated_map.remove(id);
        }
        if !expired.is_empty() {
            info!(target: LOG_TARGET, count = expired.len(), "recall swept expired events");
            self.write_with(move |tx| {
                let mut events_table = tx.open_table(&events::TABLE)?;
                let mut last_updated_table = tx.open_table(&last_updated::TABLE)?;
                for id in &expired {
                    events_table.remove(id)?;
                    last_updated_table.remove(id)?;
                }
                Ok(())
            })
            .await?;
        }

        Ok((known, last_updated_map, watermark))
    }

    /// Commits every durable mutation a tick produces — sweep removals,
    /// per-event upserts, and the watermark advance — in a single write
    /// transaction, so a tick touching N events issues exactly one commit
    /// rather than up to N+1. `watermark` is `None` when the tick's fetch
    /// failed and the watermark must stay unchanged.
    pub async fn commit_tick(
        &self,
        removed: &[String],
        upserts: &[(EventRecord, Instant)],
        watermark: Option<Instant>,
    ) -> StoreResult<()> {
        if removed.is_empty() && upserts.is_empty() && watermark.is_none() {
            return Ok(());
        }
        let removed = removed.to_vec();
        let upserts = upserts.to_vec();
        let watermark_str = watermark.map(Instant::format);
        let removed_count = removed.len();
        let upserted_count = upserts.len();
        self.write_with(move |tx| {
            let mut events_table = tx.open_table(&events::TABLE)?;
            let mut last_updated_table = tx.open_table(&last_updated::TABLE)?;
            for id in &removed {
                events_table.remove(id)?;
                last_updated_table.remove(id)?;
            }
            for (record, updated_at) in &upserts {
                events_table.insert(&record.id, record)?;
                last_updated_table.insert(&record.id, &updated_at.format())?;
            }
            if let Some(raw) = &watermark_str {
                let mut watermark_table = tx.open_table(&watermark::TABLE)?;
                watermark_table.insert(&(), raw)?;
            }
            Ok(())
        })
        .await?;
        debug!(
            target: LOG_TARGET,
            removed = removed_count,
            upserted = upserted_count,
            watermark_advanced = watermark_str.is_some(),
            "committed tick batch"
        );
        Ok(())
    }

    /// Writes the row and the last-observed `updatedAt` in one commit. Used
    /// directly by tests; `Reconciler::tick` goes through [`Self::commit_tick`]
    /// instead so a tick's writes land in one transaction.
    pub async fn upsert(&self, record: &EventRecord, updated_at: Instant) -> StoreResult<()> {
        let record = record.clone();
        let updated_at_str = updated_at.format();
        let id = record.id.clone();
        self.write_with(move |tx| {
            let mut events_table = tx.open_table(&events::TABLE)?;
            events_table.insert(&id, &record)?;
            let mut last_updated_table = tx.open_table(&last_updated::TABLE)?;
            last_updated_table.insert(&id, &updated_at_str)?;
            Ok(())
        })
        .await?;
        debug!(target: LOG_TARGET, %id, "upserted event");
        Ok(())
    }

    /// Deletes the row and both logical entries. Used directly by tests;
    /// `Reconciler::tick` goes through [`Self::commit_tick`] instead.
    pub async fn remove(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.write_with(move |tx| {
            let mut events_table = tx.open_table(&events::TABLE)?;
            events_table.remove(&id)?;
            let mut last_updated_table = tx.open_table(&last_updated::TABLE)?;
            last_updated_table.remove(&id)?;
            Ok(())
        })
        .await?;
        debug!(target: LOG_TARGET, %id, "removed expired event");
        Ok(())
    }

    /// Persists the watermark advanced at the end of a successful tick.
    pub async fn store_watermark(&self, watermark: Instant) -> StoreResult<()> {
        let raw = watermark.format();
        self.write_with(move |tx| {
            let mut table = tx.open_table(&watermark::TABLE)?;
            table.insert(&(), &raw)?;
            Ok(())
        })
        .await
    }

    /// Current row count, for diagnostics only.
    pub async fn snapshot(&self) -> StoreResult<usize> {
        self.read_with(|tx| {
            let events_table = tx.open_table(&events::TABLE)?;
            Ok(events_table.range::<String>(..)?.count())
        })
        .await
    }
}
