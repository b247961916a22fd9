//! The per-tick job: collect changes, render one notification, queue it.
//!
//! A tick never fails loudly. Collector and mailer errors are logged and the
//! tick ends; the next tick starts from whatever the watermark says.

use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::collector::Collector;
use crate::config::{AckPolicy, Mail};
use crate::mailer::Mailer;
use crate::model::{ChangeBatch, ChangeKind, NotificationMessage};

/// Envelope used for every notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
}

impl MessageTemplate {
    pub fn from_config(mail: &Mail) -> Self {
        Self {
            from: mail.from.clone(),
            to: mail.to.clone(),
            subject: mail.subject.clone(),
        }
    }

    pub fn render(&self, batch: &ChangeBatch) -> NotificationMessage {
        NotificationMessage {
            from: self.from.clone(),
            to: self.to.clone(),
            subject: self.render_subject(batch),
            body: render_body(batch),
        }
    }

    fn render_subject(&self, batch: &ChangeBatch) -> String {
        self.subject
            .replace("{count}", &batch.len().to_string())
            .replace("{booked}", &batch.count(ChangeKind::Booked).to_string())
            .replace("{cancelled}", &batch.count(ChangeKind::Cancelled).to_string())
    }
}

fn render_body(batch: &ChangeBatch) -> String {
    let mut body = format!(
        "{} appointment change(s): {} booked, {} cancelled.\n\n",
        batch.len(),
        batch.count(ChangeKind::Booked),
        batch.count(ChangeKind::Cancelled)
    );
    for change in batch {
        let label = match change.kind {
            ChangeKind::Booked => "BOOKED",
            ChangeKind::Cancelled => "CANCELLED",
        };
        body.push_str(&format!(
            "{:<9}  {}  {}  (appointment #{}, changed {})\n",
            label,
            change.slot_start.format("%Y-%m-%d %H:%M"),
            change.patient,
            change.appointment_id,
            change.changed_at.format("%Y-%m-%d %H:%M:%S UTC"),
        ));
    }
    body
}

/// What one tick did. Only used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Queued { changes: usize },
    CollectFailed,
    EnqueueFailed { changes: usize },
}

pub struct NotifyJob {
    collector: Arc<Collector>,
    mailer: Mailer,
    template: MessageTemplate,
    ack: AckPolicy,
}

impl NotifyJob {
    pub fn new(
        collector: Arc<Collector>,
        mailer: Mailer,
        template: MessageTemplate,
        ack: AckPolicy,
    ) -> Self {
        Self {
            collector,
            mailer,
            template,
            ack,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self) -> TickOutcome {
        let fetched = match self.ack {
            AckPolicy::OnFetch => self.collector.fetch_changes().await,
            AckPolicy::OnEnqueue => self.collector.pending_changes().await,
        };
        let batch = match fetched {
            Ok(batch) => batch,
            Err(err) => {
                error!(%err, "collecting appointment changes failed");
                return TickOutcome::CollectFailed;
            }
        };
        if batch.is_empty() {
            return TickOutcome::Idle;
        }

        let changes = batch.len();
        let message = self.template.render(&batch);
        if let Err(err) = self.mailer.enqueue(message) {
            error!(%err, changes, ack = ?self.ack, "queueing notification failed");
            return TickOutcome::EnqueueFailed { changes };
        }
        if self.ack == AckPolicy::OnEnqueue {
            self.collector.acknowledge(&batch).await;
        }
        info!(changes, "notification queued");
        TickOutcome::Queued { changes }
    }
}
