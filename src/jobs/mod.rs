//! Durable review-job records and registered projects.
//!
//! Every status change is a guarded SQLite `UPDATE`, so the state machine in
//! [`wfc_common::JobStatus::can_transition_to`] holds even with several
//! writers racing on one job.

pub mod db;
pub mod models;

pub use db::{JobDb, JobStore};
pub use models::{NewJob, ProjectRecord, ReviewJob};
