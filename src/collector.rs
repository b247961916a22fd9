//! Change detection over the appointment store.
//!
//! The collector owns the watermark. A fetch reads every change strictly after
//! it and moves it to the last change read, all under one lock, so a change is
//! reported once and a failed read is retried in full on the next tick.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, ChangeRow, Pool};
use crate::model::{AppointmentChange, ChangeBatch, ChangeKind, Watermark};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("database connection lost: {0}")]
    ConnectionLost(#[source] sqlx::Error),
    #[error("change query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),
    #[error("could not map change row: {0}")]
    MappingFailed(String),
}

impl From<sqlx::Error> for CollectorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => CollectorError::ConnectionLost(err),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => CollectorError::MappingFailed(err.to_string()),
            other => CollectorError::QueryFailed(other),
        }
    }
}

/// Read side of the change log.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Changes strictly after `after`, ordered by `(changed_at, id)`.
    async fn changes_after(
        &self,
        after: &Watermark,
        limit: Option<u32>,
    ) -> Result<Vec<AppointmentChange>, CollectorError>;
}

/// `ChangeStore` over the SQL `appointment_changes` table.
#[derive(Debug, Clone)]
pub struct SqlChangeStore {
    pool: Pool,
}

impl SqlChangeStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeStore for SqlChangeStore {
    async fn changes_after(
        &self,
        after: &Watermark,
        limit: Option<u32>,
    ) -> Result<Vec<AppointmentChange>, CollectorError> {
        let rows = db::changes_after(&self.pool, after, limit).await?;
        rows.into_iter().map(map_row).collect()
    }
}

fn map_row(row: ChangeRow) -> Result<AppointmentChange, CollectorError> {
    let kind = ChangeKind::parse_kind(&row.kind).ok_or_else(|| {
        CollectorError::MappingFailed(format!("row {}: unknown kind '{}'", row.id, row.kind))
    })?;
    Ok(AppointmentChange {
        id: row.id,
        appointment_id: row.appointment_id,
        kind,
        changed_at: row.changed_at,
        patient: row.patient,
        slot_start: row.slot_start,
    })
}

pub struct Collector {
    store: Arc<dyn ChangeStore>,
    watermark: Mutex<Watermark>,
    max_batch: Option<u32>,
    watermark_file: Option<PathBuf>,
}

impl Collector {
    /// `start` is truncated to whole milliseconds so that it orders the same
    /// way in memory as it does in the store.
    pub fn new(store: Arc<dyn ChangeStore>, start: Watermark) -> Self {
        Self {
            store,
            watermark: Mutex::new(start.truncated_to_millis()),
            max_batch: None,
            watermark_file: None,
        }
    }

    pub fn with_max_batch(mut self, max_batch: Option<u32>) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Save every advance to `path`.
    pub fn with_watermark_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.watermark_file = Some(path.into());
        self
    }

    pub async fn watermark(&self) -> Watermark {
        *self.watermark.lock().await
    }

    /// Changes since the watermark. The watermark moves to the last returned
    /// change once the whole batch has been read; on error it stays put.
    #[instrument(skip_all)]
    pub async fn fetch_changes(&self) -> Result<ChangeBatch, CollectorError> {
        let mut watermark = self.watermark.lock().await;
        let batch = self.read_batch(&watermark).await?;
        if let Some(next) = batch.high_watermark() {
            self.advance(&mut watermark, next).await;
        }
        Ok(batch)
    }

    /// Like `fetch_changes` but leaves the watermark alone; pair with `acknowledge`.
    #[instrument(skip_all)]
    pub async fn pending_changes(&self) -> Result<ChangeBatch, CollectorError> {
        let watermark = self.watermark.lock().await;
        self.read_batch(&watermark).await
    }

    /// Move the watermark past `batch`. Never moves it backwards.
    pub async fn acknowledge(&self, batch: &ChangeBatch) {
        if let Some(next) = batch.high_watermark() {
            let mut watermark = self.watermark.lock().await;
            self.advance(&mut watermark, next).await;
        }
    }

    async fn read_batch(&self, after: &Watermark) -> Result<ChangeBatch, CollectorError> {
        let changes = self.store.changes_after(after, self.max_batch).await?;
        debug!(count = changes.len(), after = %after.changed_at, after_id = after.id, "read changes");
        Ok(ChangeBatch::new(changes))
    }

    async fn advance(&self, current: &mut Watermark, next: Watermark) {
        if next <= *current {
            return;
        }
        *current = next;
        info!(changed_at = %next.changed_at, id = next.id, "watermark advanced");
        if let Some(path) = &self.watermark_file {
            if let Err(err) = save_watermark(path, &next).await {
                warn!(?err, path = %path.display(), "failed to persist watermark");
            }
        }
    }
}

/// Read a watermark saved by `save_watermark`. A missing file is `Ok(None)`.
pub async fn load_watermark(path: &Path) -> io::Result<Option<Watermark>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let watermark = serde_json::from_slice(&content)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(watermark))
}

/// Write to a sibling temp file then rename, so a crash never leaves a torn file.
pub async fn save_watermark(path: &Path, watermark: &Watermark) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(watermark)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn change(id: i64, secs: i64) -> AppointmentChange {
        AppointmentChange {
            id,
            appointment_id: 100 + id,
            kind: ChangeKind::Booked,
            changed_at: at(secs),
            patient: format!("p{id}"),
            slot_start: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        }
    }

    /// Serves scripted responses and records the cursor of every call.
    #[derive(Default)]
    struct ScriptedStore {
        responses: StdMutex<VecDeque<Result<Vec<AppointmentChange>, CollectorError>>>,
        calls: StdMutex<Vec<Watermark>>,
    }

    impl ScriptedStore {
        fn new(responses: Vec<Result<Vec<AppointmentChange>, CollectorError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                calls: StdMutex::default(),
            })
        }
    }

    #[async_trait]
    impl ChangeStore for ScriptedStore {
        async fn changes_after(
            &self,
            after: &Watermark,
            _limit: Option<u32>,
        ) -> Result<Vec<AppointmentChange>, CollectorError> {
            self.calls.lock().unwrap().push(*after);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[tokio::test]
    async fn failed_fetch_keeps_watermark() {
        let start = Watermark::starting_at(at(0));
        let store = ScriptedStore::new(vec![
            Err(CollectorError::MappingFailed("row 2: unknown kind 'x'".into())),
            Ok(vec![change(1, 1), change(2, 2)]),
        ]);
        let collector = Collector::new(store.clone(), start);

        let err = collector.fetch_changes().await.unwrap_err();
        assert!(matches!(err, CollectorError::MappingFailed(_)));
        assert_eq!(collector.watermark().await, start);

        let batch = collector.fetch_changes().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(collector.watermark().await, change(2, 2).cursor());

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![start, start]);
    }

    #[tokio::test]
    async fn pending_then_acknowledge() {
        let start = Watermark::starting_at(at(0));
        let store = ScriptedStore::new(vec![
            Ok(vec![change(1, 5)]),
            Ok(vec![change(1, 5)]),
        ]);
        let collector = Collector::new(store, start);

        let first = collector.pending_changes().await.unwrap();
        assert_eq!(collector.watermark().await, start);
        let again = collector.pending_changes().await.unwrap();
        assert_eq!(first, again);

        collector.acknowledge(&again).await;
        assert_eq!(collector.watermark().await, change(1, 5).cursor());

        // an older batch never rewinds the cursor
        collector.acknowledge(&ChangeBatch::new(vec![change(0, 1)])).await;
        assert_eq!(collector.watermark().await, change(1, 5).cursor());
    }

    #[test]
    fn unknown_kind_is_a_mapping_failure() {
        let row = ChangeRow {
            id: 9,
            appointment_id: 1,
            kind: "rescheduled".into(),
            changed_at: at(0),
            patient: "x".into(),
            slot_start: change(1, 0).slot_start,
        };
        match map_row(row).unwrap_err() {
            CollectorError::MappingFailed(msg) => assert!(msg.contains("rescheduled")),
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn sqlx_errors_are_classified() {
        assert!(matches!(
            CollectorError::from(sqlx::Error::PoolTimedOut),
            CollectorError::ConnectionLost(_)
        ));
        assert!(matches!(
            CollectorError::from(sqlx::Error::ColumnNotFound("kind".into())),
            CollectorError::MappingFailed(_)
        ));
        assert!(matches!(
            CollectorError::from(sqlx::Error::RowNotFound),
            CollectorError::QueryFailed(_)
        ));
    }

    #[tokio::test]
    async fn watermark_file_round_trip() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("watermark.json");
        assert!(load_watermark(&path).await.unwrap().is_none());

        let store = ScriptedStore::new(vec![Ok(vec![change(3, 30)])]);
        let collector =
            Collector::new(store, Watermark::starting_at(at(0))).with_watermark_file(&path);
        collector.fetch_changes().await.unwrap();

        let saved = load_watermark(&path).await.unwrap();
        assert_eq!(saved, Some(change(3, 30).cursor()));
    }

    #[tokio::test]
    async fn corrupt_watermark_file_is_invalid_data() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("watermark.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = load_watermark(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
