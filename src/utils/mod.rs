//! Shared helpers: tracing bootstrap, backoff builders, log de-duplication.

pub mod bootstrap;
pub mod log_dedup;
pub mod retry;
