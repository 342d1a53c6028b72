//! Webhook and email notifications.

use async_trait::async_trait;
use automation_contracts::{AutomationError, NotificationSettings, RunStatus, WebhookPayload};

/// POSTs the JSON webhook payload. Fire-and-log: a webhook
/// delivery failure does not fail the Run, it is only logged (the Run's
/// outcome is already finalized by the time notifications are sent).
pub async fn send_webhook(
    client: &reqwest::Client,
    url: &str,
    payload: &WebhookPayload,
) -> Result<(), AutomationError> {
    let response = client
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| AutomationError::TransientExternal {
            service: "webhook".to_string(),
            message: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(AutomationError::TransientExternal {
            service: "webhook".to_string(),
            message: format!("unexpected status {}", response.status()),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Partial => "PARTIAL",
        RunStatus::Failed => "FAILED",
    }
}

/// Subject: `Automation <name> - <STATUS>`. Body: fixed template with
/// counts and the failure list.
pub fn render_email(schedule_name: &str, payload: &WebhookPayload, to: Vec<String>) -> EmailMessage {
    let subject = format!("Automation {schedule_name} - {}", status_label(payload.status));

    let mut body = format!(
        "Run {run_id} for schedule \"{schedule_name}\" finished with status {status}.\n\n\
         Duration: {duration:.1}s\n\
         Fiches: {total} total, {successful} successful, {failed} failed, {ignored} ignored\n\
         Transcriptions run: {transcriptions}\n\
         Audits run: {audits}\n",
        run_id = payload.run_id,
        status = status_label(payload.status),
        duration = payload.duration_seconds,
        total = payload.total_fiches,
        successful = payload.successful_fiches,
        failed = payload.failed_fiches,
        ignored = payload.ignored_fiches,
        transcriptions = payload.transcriptions_run,
        audits = payload.audits_run,
    );

    if !payload.failures.is_empty() {
        body.push_str("\nFailures:\n");
        for failure in &payload.failures {
            let reason = failure.reason.as_deref().unwrap_or("no reason recorded");
            body.push_str(&format!("- {}: {}\n", failure.fiche_id, reason));
        }
    }

    EmailMessage {
        to,
        subject,
        body,
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), AutomationError>;
}

/// Logs the message instead of delivering it. An actual outbound email
/// transport is an operational integration (SMTP relay, provider API key)
/// this workspace does not have credentials for; callers inject a real
/// [`EmailSender`] in production.
pub struct LoggingEmailSender;

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<(), AutomationError> {
        tracing::info!(to = ?message.to, subject = %message.subject, "email notification (not delivered, no sender configured)");
        Ok(())
    }
}

/// Resolves whether a notification is due at all, given a schedule's
/// `notifyOnComplete`/`notifyOnError` settings and the Run's terminal
/// status.
pub fn should_notify(settings: &NotificationSettings, status: RunStatus) -> bool {
    match status {
        RunStatus::Completed => settings.notify_on_complete,
        RunStatus::Partial | RunStatus::Failed => settings.notify_on_error,
        RunStatus::Running => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automation_contracts::{BigId, FicheOutcome, ScheduleId};

    fn sample_payload() -> WebhookPayload {
        WebhookPayload {
            schedule_id: ScheduleId::from("s1"),
            schedule_name: "Nightly QA".to_string(),
            run_id: BigId(42),
            status: RunStatus::Partial,
            duration_seconds: 12.5,
            total_fiches: 2,
            successful_fiches: 1,
            failed_fiches: 1,
            ignored_fiches: 0,
            transcriptions_run: 1,
            audits_run: 1,
            failures: vec![FicheOutcome {
                fiche_id: "B".to_string(),
                reason: Some("boom".to_string()),
            }],
        }
    }

    #[test]
    fn email_subject_includes_schedule_name_and_status() {
        let email = render_email("Nightly QA", &sample_payload(), vec!["ops@example.com".to_string()]);
        assert_eq!(email.subject, "Automation Nightly QA - PARTIAL");
        assert!(email.body.contains("boom"));
    }

    #[test]
    fn notify_on_error_covers_partial_and_failed() {
        let settings = NotificationSettings {
            notify_on_complete: false,
            notify_on_error: true,
            webhook_url: None,
            notify_emails: vec![],
        };
        assert!(should_notify(&settings, RunStatus::Partial));
        assert!(should_notify(&settings, RunStatus::Failed));
        assert!(!should_notify(&settings, RunStatus::Completed));
    }
}
