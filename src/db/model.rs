//! Row models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Interpretation
//! (kind parsing, watermark handling) lives in the collector.

use chrono::{DateTime, NaiveDateTime, Utc};

/// One row of `appointment_changes`. `kind` is kept raw so that an unknown
/// value surfaces as a mapping failure in the collector instead of a decode error.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChangeRow {
    pub id: i64,
    pub appointment_id: i64,
    pub kind: String,
    pub changed_at: DateTime<Utc>,
    pub patient: String,
    pub slot_start: NaiveDateTime,
}

/// Insert payload for seeding the change log.
#[derive(Debug, Clone)]
pub struct NewChange<'a> {
    pub appointment_id: i64,
    pub kind: &'a str,
    pub changed_at: DateTime<Utc>,
    pub patient: &'a str,
    pub slot_start: NaiveDateTime,
}
