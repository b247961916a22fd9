//! Watches an appointment store for bookings and cancellations and emails a
//! summary of what changed since the last check.
//!
//! - [`collector`] finds changes past an in-memory watermark.
//! - [`mailer`] queues notifications and delivers them on a background task.
//! - [`job`] ties the two together once per scheduler tick.
//! - [`service`] owns the process lifecycle.

pub mod collector;
pub mod config;
pub mod db;
pub mod job;
pub mod mailer;
pub mod model;
pub mod scheduler;
pub mod service;
