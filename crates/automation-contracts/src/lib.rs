//! Shared domain types for the automation orchestrator.
//!
//! This crate has no I/O: it defines the ids, enums, and payload schemas that
//! cross every boundary in the system (event bus, repository, HTTP). Keeping
//! it dependency-free of `sqlx`/`reqwest`/etc. lets `automation-workers` and
//! `automation-orchestrator` share one vocabulary without pulling in each
//! other's transport concerns.

pub mod error;
pub mod events;
pub mod fiche;
pub mod ids;
pub mod run;
pub mod schedule;

pub use error::AutomationError;
pub use events::*;
pub use fiche::*;
pub use ids::*;
pub use run::*;
pub use schedule::*;
