//! Crate-wide result alias.
//!
//! Module seams that need callers to match on failure kinds define their own
//! `thiserror` enums ([`crate::cron::ScheduleError`],
//! [`crate::store::StoreError`]); everything else propagates through
//! `anyhow`.

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
