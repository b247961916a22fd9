//! Database module: row models and SQL repositories for the appointment store.
//!
//! This module is split into two submodules:
//! - `model`: rows as they come out of the `appointment_changes` table.
//! - `repo`: SQL-only functions; no watermark or batching logic lives here.
//!
//! The collector is the only production caller; tests also use the insert
//! helpers to seed an in-memory store.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ChangeRow, NewChange};
