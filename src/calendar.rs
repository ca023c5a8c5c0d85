use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::CalendarError;
use crate::models::{Incident, Status};

pub const DETENTION_TITLE: &str = "Lunchtime detention";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetentionEvent {
    pub student_email: String,
    pub summary: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarChange {
    Delete { student_email: String, date: NaiveDate },
    Upsert(DetentionEvent),
}

/// Student calendar service. Calls are best-effort.
#[async_trait]
pub trait CalendarSync: Send + Sync {
    async fn upsert_detention_event(&self, event: &DetentionEvent) -> Result<(), CalendarError>;

    async fn delete_detention_event(&self, student_email: &str, date: NaiveDate) -> Result<(), CalendarError>;
}

/// Changes owed after a run: old events removed for rescheduled and
/// cancelled detentions, new events for freshly allocated ones.
///
/// The previous detention date stays in the ledger after a reschedule, so its
/// event is only removed in the run that allocates the replacement.
pub fn plan_changes<'a>(incidents: impl IntoIterator<Item = &'a Incident>, config: &Config) -> Vec<CalendarChange> {
    let mut changes = Vec::new();
    for incident in incidents {
        let reallocated = incident.is_changed && incident.email_required;
        if let Some(previous) = incident.previous_detention_date.filter(|_| reallocated) {
            changes.push(CalendarChange::Delete {
                student_email: incident.student_email.clone(),
                date: previous,
            });
        }
        match (incident.status, incident.detention_date) {
            (Status::Cancel, Some(date)) => changes.push(CalendarChange::Delete {
                student_email: incident.student_email.clone(),
                date,
            }),
            (Status::Cancel, None) => {}
            (_, Some(date)) if incident.email_required => {
                changes.push(CalendarChange::Upsert(DetentionEvent {
                    student_email: incident.student_email.clone(),
                    summary: DETENTION_TITLE.to_string(),
                    start: date.and_time(config.detention_start),
                    end: date.and_time(config.detention_end),
                    description: format!(
                        "Reason: {}\nIncident date: {} {}\nSubject: {}\nStaff: {}",
                        incident.incident,
                        incident.date.format("%-d/%-m/%Y"),
                        incident.period,
                        incident.subject,
                        incident.staff
                    ),
                }))
            }
            _ => {}
        }
    }
    changes
}

/// Applies changes one by one; failures are logged and skipped.
pub async fn apply(calendar: &dyn CalendarSync, changes: &[CalendarChange]) -> usize {
    let mut applied = 0;
    for change in changes {
        let result = match change {
            CalendarChange::Delete { student_email, date } => {
                calendar.delete_detention_event(student_email, *date).await
            }
            CalendarChange::Upsert(event) => calendar.upsert_detention_event(event).await,
        };
        match result {
            Ok(()) => applied += 1,
            Err(err) => warn!(error = %err, ?change, "calendar update failed"),
        }
    }
    applied
}

/// Records calendar changes in the log for an external sync job to replay.
pub struct LogCalendar;

#[async_trait]
impl CalendarSync for LogCalendar {
    async fn upsert_detention_event(&self, event: &DetentionEvent) -> Result<(), CalendarError> {
        info!(student = %event.student_email, start = %event.start, end = %event.end, "calendar: add detention");
        Ok(())
    }

    async fn delete_detention_event(&self, student_email: &str, date: NaiveDate) -> Result<(), CalendarError> {
        info!(student = %student_email, %date, "calendar: remove detention");
        Ok(())
    }
}
