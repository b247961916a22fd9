//! Asynchronous notification delivery.
//!
//! [`Mailer`] is a cheap, clonable handle around an unbounded FIFO queue. A
//! single worker task started by [`Mailer::run`] sends one message at a time
//! through a [`Transport`]. Delivery is at-most-once: a failed send is logged
//! and dropped.
//!
//! Shutdown is driven by a `watch` channel. Once it flips to `true` the worker
//! finishes the message in flight, stops accepting new messages, drains what is
//! queued for at most the grace period, then exits.
//!
//! ```ignore
//! let mailer = Mailer::new(Arc::new(SmtpTransport::from_config(&cfg.mail)?), grace);
//! let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! let worker = mailer.run(stop_rx)?;
//! mailer.enqueue(message)?;
//! let _ = stop_tx.send(true);
//! worker.await?;
//! ```

mod smtp;

pub use smtp::SmtpTransport;

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::model::NotificationMessage;

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("mailer is not running")]
    NotRunning,
    #[error("mailer worker already started")]
    AlreadyStarted,
    #[error("SMTP authentication failed: {0}")]
    AuthFailed(String),
    #[error("could not connect to SMTP server: {0}")]
    ConnectFailed(String),
    #[error("sending mail failed: {0}")]
    SendFailed(String),
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailerState {
    Stopped,
    Running,
    Draining,
}

/// Sends one message. Implement this to plug in another backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, message: &NotificationMessage) -> Result<(), MailerError>;

    /// Check that the backend is reachable. Called once at startup.
    async fn verify(&self) -> Result<(), MailerError> {
        Ok(())
    }
}

struct Gate {
    state: MailerState,
    tx: Option<mpsc::UnboundedSender<NotificationMessage>>,
    rx: Option<mpsc::UnboundedReceiver<NotificationMessage>>,
}

struct Inner {
    gate: Mutex<Gate>,
    transport: Arc<dyn Transport>,
    grace: Duration,
}

impl Inner {
    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct Mailer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer")
            .field("state", &self.state())
            .field("grace", &self.inner.grace)
            .finish_non_exhaustive()
    }
}

impl Mailer {
    /// `grace` bounds how long queued messages are still sent after the stop signal.
    pub fn new(transport: Arc<dyn Transport>, grace: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(Gate {
                    state: MailerState::Stopped,
                    tx: Some(tx),
                    rx: Some(rx),
                }),
                transport,
                grace,
            }),
        }
    }

    pub fn state(&self) -> MailerState {
        self.inner.gate().state
    }

    /// Spawn the background worker. A mailer runs at most once.
    pub fn run(&self, stop: watch::Receiver<bool>) -> Result<JoinHandle<()>, MailerError> {
        let rx = {
            let mut gate = self.inner.gate();
            let rx = gate.rx.take().ok_or(MailerError::AlreadyStarted)?;
            gate.state = MailerState::Running;
            rx
        };
        let worker = Worker {
            inner: Arc::clone(&self.inner),
            rx,
            in_flight: false,
            delivered: 0,
            failed: 0,
        };
        Ok(tokio::spawn(worker.run(stop)))
    }

    /// Queue a message for delivery. Never waits on the network.
    pub fn enqueue(&self, message: NotificationMessage) -> Result<(), MailerError> {
        let gate = self.inner.gate();
        if gate.state != MailerState::Running {
            return Err(MailerError::NotRunning);
        }
        let tx = gate.tx.as_ref().ok_or(MailerError::NotRunning)?;
        tx.send(message).map_err(|_| MailerError::NotRunning)
    }
}

struct Worker {
    inner: Arc<Inner>,
    rx: mpsc::UnboundedReceiver<NotificationMessage>,
    in_flight: bool,
    delivered: usize,
    failed: usize,
}

impl Worker {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!("mailer worker started");
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.deliver(message).await,
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.begin_drain();
        let grace = self.inner.grace;
        let drained = tokio::time::timeout(grace, self.drain()).await;
        let undelivered = match drained {
            Ok(()) => 0,
            Err(_) => self.abandon(),
        };
        if undelivered > 0 {
            warn!(
                undelivered,
                grace_secs = grace.as_secs_f64(),
                "grace period expired; dropping undelivered notifications"
            );
        }

        self.inner.gate().state = MailerState::Stopped;
        info!(
            delivered = self.delivered,
            failed = self.failed,
            "mailer worker stopped"
        );
    }

    /// Reject new messages and close the queue so `recv` ends once it is empty.
    fn begin_drain(&self) {
        let mut gate = self.inner.gate();
        gate.state = MailerState::Draining;
        gate.tx = None;
    }

    async fn drain(&mut self) {
        while let Some(message) = self.rx.recv().await {
            self.deliver(message).await;
        }
    }

    /// Count and discard whatever the drain did not reach.
    fn abandon(&mut self) -> usize {
        let mut dropped = usize::from(self.in_flight);
        self.rx.close();
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    async fn deliver(&mut self, message: NotificationMessage) {
        self.in_flight = true;
        match self.inner.transport.send(&message).await {
            Ok(()) => {
                self.delivered += 1;
                info!(subject = %message.subject, recipients = message.to.len(), "notification sent");
            }
            Err(err) => {
                self.failed += 1;
                error!(%err, subject = %message.subject, "notification dropped");
            }
        }
        self.in_flight = false;
    }
}
