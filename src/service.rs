//! Process lifecycle: wire the collector, mailer and job together, start the
//! mailer worker and the scheduler, and tear everything down in order.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collector::{self, Collector, SqlChangeStore};
use crate::config::Config;
use crate::db::{self, Pool};
use crate::job::{MessageTemplate, NotifyJob, TickOutcome};
use crate::mailer::{Mailer, SmtpTransport, Transport};
use crate::model::Watermark;
use crate::scheduler;

/// Everything `Service::launch` needs, already constructed.
pub struct Parts {
    pub pool: Pool,
    pub collector: Arc<Collector>,
    pub transport: Arc<dyn Transport>,
    pub config: Config,
}

pub struct Service {
    pool: Pool,
    job: Arc<NotifyJob>,
    mailer: Mailer,
    mailer_stop: watch::Sender<bool>,
    mailer_worker: JoinHandle<()>,
    scheduler_stop: watch::Sender<bool>,
    scheduler: Option<JoinHandle<()>>,
}

impl Service {
    /// Connect to the store and the SMTP server and start the mailer worker.
    /// Any failure here is fatal: without both dependencies there is nothing to do.
    /// The scheduler is started separately with `start_scheduler`.
    pub async fn start(config: &Config) -> Result<Self> {
        let parts = build_parts(config).await?;
        if config.mail.verify_on_startup {
            parts
                .transport
                .verify()
                .await
                .context("SMTP server is not reachable")?;
        }
        Self::launch(parts)
    }

    /// Start the mailer worker without the scheduler.
    pub fn launch(parts: Parts) -> Result<Self> {
        let Parts {
            pool,
            collector,
            transport,
            config,
        } = parts;

        let grace = Duration::from_secs(config.mail.shutdown_grace_seconds);
        let mailer = Mailer::new(transport, grace);
        let (mailer_stop, mailer_stop_rx) = watch::channel(false);
        let mailer_worker = mailer.run(mailer_stop_rx)?;

        let job = Arc::new(NotifyJob::new(
            collector,
            mailer.clone(),
            MessageTemplate::from_config(&config.mail),
            config.collector.ack,
        ));
        let (scheduler_stop, _) = watch::channel(false);

        Ok(Self {
            pool,
            job,
            mailer,
            mailer_stop,
            mailer_worker,
            scheduler_stop,
            scheduler: None,
        })
    }

    /// Begin invoking the job on `general.schedule`. A second call is a no-op.
    pub fn start_scheduler(&mut self, config: &Config) -> Result<()> {
        if self.scheduler.is_some() {
            return Ok(());
        }
        let schedule = config.schedule()?;
        let job = Arc::clone(&self.job);
        self.scheduler = Some(tokio::spawn(scheduler::run(
            schedule,
            self.scheduler_stop.subscribe(),
            move || {
                let job = Arc::clone(&job);
                async move {
                    job.run().await;
                }
            },
        )));
        Ok(())
    }

    /// Run one tick directly, outside the schedule.
    pub async fn run_once(&self) -> TickOutcome {
        self.job.run().await
    }

    pub fn mailer(&self) -> &Mailer {
        &self.mailer
    }

    /// Stop the scheduler (waiting for a tick in progress), then stop and drain
    /// the mailer, then close the database pool.
    pub async fn stop(mut self) {
        info!("stopping");
        self.scheduler_stop.send_replace(true);
        if let Some(handle) = self.scheduler.take() {
            if let Err(err) = handle.await {
                warn!(?err, "scheduler task ended abnormally");
            }
        }

        self.mailer_stop.send_replace(true);
        if let Err(err) = self.mailer_worker.await {
            warn!(?err, "mailer worker ended abnormally");
        }

        self.pool.close().await;
        info!("stopped");
    }
}

async fn build_parts(config: &Config) -> Result<Parts> {
    let pool = db::init_pool(&config.database.url, config.database.max_connections)
        .await
        .context("could not connect to the appointment database")?;

    let start = match config.watermark_path() {
        Some(path) => collector::load_watermark(&path)
            .await
            .with_context(|| format!("could not read watermark file {}", path.display()))?,
        None => None,
    };
    let start = start.unwrap_or_else(|| Watermark::starting_at(Utc::now()));
    info!(changed_at = %start.changed_at, id = start.id, "collector starting");

    let mut collector = Collector::new(Arc::new(SqlChangeStore::new(pool.clone())), start)
        .with_max_batch(config.collector.max_batch);
    if let Some(path) = config.watermark_path() {
        collector = collector.with_watermark_file(path);
    }

    let transport = SmtpTransport::from_config(&config.mail).context("invalid mail settings")?;

    Ok(Parts {
        pool,
        collector: Arc::new(collector),
        transport: Arc::new(transport),
        config: config.clone(),
    })
}
