use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use emed_mailer::collector::{Collector, SqlChangeStore};
use emed_mailer::config::{self, AckPolicy, Config};
use emed_mailer::db::{self, NewChange};
use emed_mailer::job::{MessageTemplate, NotifyJob, TickOutcome};
use emed_mailer::mailer::{Mailer, MailerError, Transport};
use emed_mailer::model::{NotificationMessage, Watermark};
use emed_mailer::service::{Parts, Service};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 7, 30, 0).unwrap()
}

async fn insert(pool: &sqlx::SqlitePool, kind: &str, secs: i64, patient: &str) -> i64 {
    db::insert_change(
        pool,
        &NewChange {
            appointment_id: 900 + secs,
            kind,
            changed_at: t0() + ChronoDuration::seconds(secs),
            patient,
            slot_start: NaiveDate::from_ymd_opt(2024, 9, 5)
                .unwrap()
                .and_hms_opt(16, 0, 0)
                .unwrap(),
        },
    )
    .await
    .unwrap()
}

#[derive(Clone, Default)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<NotificationMessage>>>,
}

impl RecordingTransport {
    async fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &NotificationMessage) -> Result<(), MailerError> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

fn template() -> MessageTemplate {
    MessageTemplate {
        from: "mailer@example.com".into(),
        to: vec!["desk@example.com".into()],
        subject: "{count} appointment changes".into(),
    }
}

struct Harness {
    pool: sqlx::SqlitePool,
    collector: Arc<Collector>,
    mailer: Mailer,
    transport: RecordingTransport,
    stop: watch::Sender<bool>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl Harness {
    async fn new(running: bool) -> Self {
        let pool = setup_pool().await;
        let collector = Arc::new(Collector::new(
            Arc::new(SqlChangeStore::new(pool.clone())),
            Watermark::starting_at(t0()),
        ));
        let transport = RecordingTransport::default();
        let mailer = Mailer::new(Arc::new(transport.clone()), Duration::from_secs(5));
        let (stop, stop_rx) = watch::channel(false);
        let worker = if running {
            Some(mailer.run(stop_rx).unwrap())
        } else {
            None
        };
        Self {
            pool,
            collector,
            mailer,
            transport,
            stop,
            worker,
        }
    }

    fn job(&self, ack: AckPolicy) -> NotifyJob {
        NotifyJob::new(self.collector.clone(), self.mailer.clone(), template(), ack)
    }

    async fn shutdown(mut self) -> Vec<NotificationMessage> {
        self.stop.send_replace(true);
        if let Some(worker) = self.worker.take() {
            worker.await.unwrap();
        }
        self.transport.sent().await
    }
}

#[tokio::test]
async fn one_notification_then_idle() {
    let h = Harness::new(true).await;
    insert(&h.pool, "booked", 60, "Barbara Liskov").await;
    insert(&h.pool, "cancelled", 120, "Donald Knuth").await;
    let job = h.job(AckPolicy::OnFetch);

    assert_eq!(job.run().await, TickOutcome::Queued { changes: 2 });
    assert_eq!(h.collector.watermark().await.changed_at, t0() + ChronoDuration::seconds(120));
    assert_eq!(job.run().await, TickOutcome::Idle);

    let sent = h.shutdown().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "2 appointment changes");
    let liskov = sent[0].body.find("Barbara Liskov").unwrap();
    let knuth = sent[0].body.find("Donald Knuth").unwrap();
    assert!(liskov < knuth);
}

#[tokio::test]
async fn each_tick_reports_only_new_changes() {
    let h = Harness::new(true).await;
    let job = h.job(AckPolicy::OnFetch);

    insert(&h.pool, "booked", 1, "first").await;
    assert_eq!(job.run().await, TickOutcome::Queued { changes: 1 });
    insert(&h.pool, "booked", 2, "second").await;
    insert(&h.pool, "cancelled", 3, "third").await;
    assert_eq!(job.run().await, TickOutcome::Queued { changes: 2 });
    assert_eq!(job.run().await, TickOutcome::Idle);

    let sent = h.shutdown().await;
    assert_eq!(sent.len(), 2);
    assert!(sent[0].body.contains("first"));
    assert!(!sent[1].body.contains("first"));
    assert!(sent[1].body.contains("second") && sent[1].body.contains("third"));
}

#[tokio::test]
async fn collect_failure_skips_mailer_and_retries_next_tick() {
    let h = Harness::new(true).await;
    let job = h.job(AckPolicy::OnFetch);
    insert(&h.pool, "booked", 1, "ok").await;
    let bad = insert(&h.pool, "moved", 2, "broken").await;

    assert_eq!(job.run().await, TickOutcome::CollectFailed);
    assert_eq!(h.collector.watermark().await, Watermark::starting_at(t0()));

    sqlx::query("UPDATE appointment_changes SET kind = 'booked' WHERE id = ?")
        .bind(bad)
        .execute(&h.pool)
        .await
        .unwrap();
    assert_eq!(job.run().await, TickOutcome::Queued { changes: 2 });

    let sent = h.shutdown().await;
    assert_eq!(sent.len(), 1);
}

#[tokio::test]
async fn refused_enqueue_loses_batch_when_acked_on_fetch() {
    let h = Harness::new(false).await;
    let job = h.job(AckPolicy::OnFetch);
    insert(&h.pool, "booked", 1, "lost").await;

    assert_eq!(job.run().await, TickOutcome::EnqueueFailed { changes: 1 });
    assert_eq!(job.run().await, TickOutcome::Idle);
    assert!(h.shutdown().await.is_empty());
}

#[tokio::test]
async fn refused_enqueue_is_retried_when_acked_on_enqueue() {
    let h = Harness::new(false).await;
    let job = h.job(AckPolicy::OnEnqueue);
    insert(&h.pool, "booked", 1, "kept").await;

    assert_eq!(job.run().await, TickOutcome::EnqueueFailed { changes: 1 });
    assert_eq!(h.collector.watermark().await, Watermark::starting_at(t0()));

    let (stop, stop_rx) = watch::channel(false);
    let worker = h.mailer.run(stop_rx).unwrap();
    assert_eq!(job.run().await, TickOutcome::Queued { changes: 1 });
    assert_eq!(job.run().await, TickOutcome::Idle);
    assert_eq!(h.collector.watermark().await.changed_at, t0() + ChronoDuration::seconds(1));

    stop.send_replace(true);
    worker.await.unwrap();
    let sent = h.transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains("kept"));
}

fn service_config(schedule: &str) -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.general.schedule = schedule.into();
    cfg.mail.shutdown_grace_seconds = 2;
    cfg.mail.subject = "{booked} booked / {cancelled} cancelled".into();
    cfg
}

async fn launch(schedule: &str) -> (Service, sqlx::SqlitePool, RecordingTransport, Config) {
    let pool = setup_pool().await;
    let transport = RecordingTransport::default();
    let cfg = service_config(schedule);
    let collector = Arc::new(Collector::new(
        Arc::new(SqlChangeStore::new(pool.clone())),
        Watermark::starting_at(t0()),
    ));
    let service = Service::launch(Parts {
        pool: pool.clone(),
        collector,
        transport: Arc::new(transport.clone()),
        config: cfg.clone(),
    })
    .unwrap();
    (service, pool, transport, cfg)
}

#[tokio::test]
async fn service_single_pass_and_ordered_stop() {
    let (service, pool, transport, _cfg) = launch("0 0 0 1 1 *").await;
    insert(&pool, "booked", 5, "a").await;
    insert(&pool, "cancelled", 6, "b").await;
    insert(&pool, "cancelled", 7, "c").await;

    assert_eq!(service.run_once().await, TickOutcome::Queued { changes: 3 });
    let mailer = service.mailer().clone();
    service.stop().await;

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "1 booked / 2 cancelled");
    assert!(matches!(
        mailer.enqueue(sent[0].clone()),
        Err(MailerError::NotRunning)
    ));
    assert!(pool.is_closed());
}

#[tokio::test]
async fn service_scheduler_drives_job() {
    let (mut service, pool, transport, cfg) = launch("* * * * * *").await;
    insert(&pool, "booked", 5, "scheduled").await;
    service.start_scheduler(&cfg).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while transport.sent().await.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    service.stop().await;

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains("scheduled"));
}
