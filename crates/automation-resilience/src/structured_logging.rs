//! Sanitized, structured run logging.
//!
//! Every log line is sanitized (no credentials, no raw PII) and stored in
//! RunLog, plus optionally appended to a per-run text file when the debug
//! flag is set. This module builds the [`automation_contracts::RunLog`] row
//! *and* emits the matching `tracing` event in one call, so the durable
//! record and the ephemeral log line never drift apart.

use automation_contracts::{LogLevel, RunId, RunLog};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Field names that must never appear verbatim in log metadata. The CRM
/// authorization token (`cle`) and any field literally named like a secret
/// are redacted before the value is attached to a `RunLog` row or emitted.
const SENSITIVE_KEYS: &[&str] = &["cle", "password", "token", "authorization", "api_key"];

pub fn sanitize_metadata(mut metadata: Value) -> Value {
    if let Value::Object(map) = &mut metadata {
        for key in SENSITIVE_KEYS {
            if map.contains_key(*key) {
                map.insert((*key).to_string(), Value::String("[redacted]".to_string()));
            }
        }
    }
    metadata
}

/// Build a `RunLog` row and emit the matching `tracing` event.
pub fn log_run_event(
    run_id: RunId,
    level: LogLevel,
    message: impl Into<String>,
    metadata: Value,
) -> RunLog {
    let message = message.into();
    let metadata = sanitize_metadata(metadata);

    match level {
        LogLevel::Debug => debug!(run_id = %run_id, %metadata, "{message}"),
        LogLevel::Info => info!(run_id = %run_id, %metadata, "{message}"),
        LogLevel::Warning => warn!(run_id = %run_id, %metadata, "{message}"),
        LogLevel::Error => error!(run_id = %run_id, %metadata, "{message}"),
    }

    RunLog {
        run_id,
        level,
        message,
        metadata,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automation_contracts::BigId;
    use serde_json::json;

    #[test]
    fn redacts_cle_and_other_sensitive_keys() {
        let metadata = json!({"cle": "secret-token", "fiche_id": "F1"});
        let sanitized = sanitize_metadata(metadata);
        assert_eq!(sanitized["cle"], json!("[redacted]"));
        assert_eq!(sanitized["fiche_id"], json!("F1"));
    }

    #[test]
    fn log_run_event_returns_a_row_ready_for_persistence() {
        let row = log_run_event(
            BigId(1),
            LogLevel::Info,
            "details cached",
            json!({"fiche_id": "F1"}),
        );
        assert_eq!(row.run_id, BigId(1));
        assert_eq!(row.message, "details cached");
    }
}
