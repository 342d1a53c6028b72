//! Fiche-Worker and Day-Worker: per-fiche and per-day pipeline execution,
//! plus the external-collaborator contracts they invoke through the
//! Durable-Step Runtime.

pub mod clients;
pub mod day_worker;
pub mod fiche_worker;

pub use clients::{
    AuditEngine, CrmClient, FicheDetails, HttpAuditEngine, HttpCrmClient, HttpTranscriptionEngine,
    RecordingSummary, SalesListEntry, TranscriptionEngine,
};
pub use day_worker::{DayWorker, DayWorkerInput, DayWorkerOutput};
pub use fiche_worker::{
    dispatch_pending_transcriptions, run_audit_stage, FicheOutcomeStatus, FicheWorker,
    FicheWorkerInput, FicheWorkerOutput,
};
