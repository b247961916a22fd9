use super::model::{ChangeRow, NewChange};
use crate::model::Watermark;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Open the appointment store and make sure it answers.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<Pool, sqlx::Error> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&normalized)
        .await?;
    ping(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs. Leaves in-memory URLs and
/// other schemes untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

/// Create the `appointment_changes` schema. Used for local stores and tests;
/// production stores are owned by the booking system.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub async fn ping(pool: &Pool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Rows strictly after `after`, ordered by change time then id.
///
/// Timestamps are compared through `julianday` so that rows written as
/// `YYYY-MM-DD HH:MM:SS` and RFC 3339 text sort together. SQLite date math
/// works in whole milliseconds, so `changed_at` is returned at that resolution
/// too; a cursor built from a returned row then orders exactly as SQL does.
#[instrument(skip_all)]
pub async fn changes_after(
    pool: &Pool,
    after: &Watermark,
    limit: Option<u32>,
) -> Result<Vec<ChangeRow>, sqlx::Error> {
    let limit = limit.map(i64::from).unwrap_or(-1);
    sqlx::query_as::<_, ChangeRow>(
        "SELECT c.id, c.appointment_id, c.kind,
                strftime('%Y-%m-%dT%H:%M:%fZ', c.changed_at) AS changed_at,
                c.patient, c.slot_start
         FROM appointment_changes c
         WHERE julianday(c.changed_at) > julianday(?1)
            OR (julianday(c.changed_at) = julianday(?1) AND c.id > ?2)
         ORDER BY julianday(c.changed_at) ASC, c.id ASC
         LIMIT ?3",
    )
    .bind(after.changed_at)
    .bind(after.id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

#[instrument(skip_all)]
pub async fn insert_change(pool: &Pool, change: &NewChange<'_>) -> Result<i64, sqlx::Error> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO appointment_changes (appointment_id, kind, changed_at, patient, slot_start)
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(change.appointment_id)
    .bind(change.kind)
    .bind(change.changed_at)
    .bind(change.patient)
    .bind(change.slot_start)
    .fetch_one(pool)
    .await?;
    Ok(id)
}
