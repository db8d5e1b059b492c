//! Usage: OAuth onboarding through an external authentication worker.
//!
//! `orchestrator` drives attempts; `worker_script`, `supervisor` and `protocol` are the
//! leaves it composes; `browser` hands URLs to the desktop.

pub mod browser;
pub mod orchestrator;
pub mod protocol;
pub mod supervisor;
pub mod worker_script;
