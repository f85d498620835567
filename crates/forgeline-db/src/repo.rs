//! PostgreSQL repositories.

pub mod jobs;

pub use jobs::{CHANGES_CHANNEL, JobRecord, PgJobQueue};
