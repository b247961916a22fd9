use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Booked,
    Cancelled,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Booked => "booked",
            ChangeKind::Cancelled => "cancelled",
        }
    }

    /// Parse the `kind` column. Accepts either casing and the US spelling.
    pub fn parse_kind(s: &str) -> Option<ChangeKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "booked" => Some(ChangeKind::Booked),
            "cancelled" | "canceled" => Some(ChangeKind::Cancelled),
            _ => None,
        }
    }
}

/// Cursor into the change stream: the `(changed_at, id)` of the last reported
/// change. Rows strictly after it are new.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub changed_at: DateTime<Utc>,
    pub id: i64,
}

impl Watermark {
    /// A watermark that reports every change at or after `at`.
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Self { changed_at: at, id: 0 }
    }

    pub fn epoch() -> Self {
        Self::starting_at(DateTime::<Utc>::default())
    }

    /// Drop sub-millisecond precision, the resolution the store compares at.
    pub fn truncated_to_millis(self) -> Self {
        let nanos = self.changed_at.nanosecond() / 1_000_000 * 1_000_000;
        Self {
            changed_at: self.changed_at.with_nanosecond(nanos).unwrap_or(self.changed_at),
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentChange {
    pub id: i64,
    pub appointment_id: i64,
    pub kind: ChangeKind,
    pub changed_at: DateTime<Utc>,
    pub patient: String,
    pub slot_start: NaiveDateTime,
}

impl AppointmentChange {
    pub fn cursor(&self) -> Watermark {
        Watermark {
            changed_at: self.changed_at,
            id: self.id,
        }
    }
}

/// Changes detected by one collection pass, ordered by `(changed_at, id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    changes: Vec<AppointmentChange>,
}

impl ChangeBatch {
    pub fn new(changes: Vec<AppointmentChange>) -> Self {
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changes(&self) -> &[AppointmentChange] {
        &self.changes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AppointmentChange> {
        self.changes.iter()
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    /// Cursor of the last change in the batch, i.e. where the watermark moves to.
    pub fn high_watermark(&self) -> Option<Watermark> {
        self.changes.last().map(AppointmentChange::cursor)
    }
}

impl<'a> IntoIterator for &'a ChangeBatch {
    type Item = &'a AppointmentChange;
    type IntoIter = std::slice::Iter<'a, AppointmentChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// The mailer's unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}
