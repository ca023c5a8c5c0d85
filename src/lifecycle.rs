//! Incident status state machine.
//!
//! ```text
//! Pending --(detention date reached)--> Overdue
//! Overdue --(staff action)--> Resolved | Reschedule | Cancel | Escalate
//! Reschedule --> Pending
//! Escalate --> Resolved (detention unset or past) | Pending (detention still ahead)
//! ```
//!
//! The rules run once per run in a fixed order; each later rule sees the
//! statuses written by the earlier ones.

use chrono::NaiveDate;
use tracing::debug;

use crate::models::{Incident, Status};

/// Outcome of one classification pass over the unresolved tail.
#[derive(Debug, Default)]
pub struct Classification {
    /// Incidents still tracked after this run (`Pending` or `Overdue`).
    pub active: Vec<Incident>,
    /// Incidents leaving the active set as `Resolved`.
    pub resolved: Vec<Incident>,
    /// Incidents leaving the active set to be deleted from the ledger.
    pub cancelled: Vec<Incident>,
    /// Escalations finalized this run; each spawns a derived incident.
    pub escalated: Vec<Incident>,
}

pub fn mark_overdue(incidents: &mut [Incident], today: NaiveDate) {
    for incident in incidents.iter_mut() {
        if incident.status == Status::Pending
            && incident.detention_date.is_some_and(|date| date <= today)
        {
            debug!(row = ?incident.spreadsheet_row, "pending detention is overdue");
            incident.status = Status::Overdue;
            incident.is_changed = true;
        }
    }
}

/// A reschedule always returns to `Pending`; the old date is only carried
/// into `previous_detention_date` once it has expired.
pub fn normalize_reschedules(incidents: &mut [Incident], today: NaiveDate) {
    for incident in incidents.iter_mut() {
        if incident.status != Status::Reschedule {
            continue;
        }
        if let Some(date) = incident.detention_date.filter(|date| *date <= today) {
            incident.previous_detention_date = Some(date);
            incident.detention_date = None;
        }
        debug!(row = ?incident.spreadsheet_row, "reschedule returned to pending");
        incident.status = Status::Pending;
        incident.is_changed = true;
    }
}

/// Finalizes escalations and returns copies of those that became `Resolved`.
pub fn finalize_escalations(incidents: &mut [Incident], today: NaiveDate) -> Vec<Incident> {
    let mut finalized = Vec::new();
    for incident in incidents.iter_mut() {
        if incident.status != Status::Escalate {
            continue;
        }
        let detention_pending = incident.detention_date.is_some_and(|date| date > today);
        incident.status = if detention_pending {
            Status::Pending
        } else {
            Status::Resolved
        };
        incident.is_changed = true;
        debug!(row = ?incident.spreadsheet_row, status = %incident.status, "escalation finalized");
        if incident.status == Status::Resolved {
            finalized.push(incident.clone());
        }
    }
    finalized
}

/// Runs every rule in order and partitions the result.
pub fn classify(mut incidents: Vec<Incident>, today: NaiveDate) -> Classification {
    mark_overdue(&mut incidents, today);
    normalize_reschedules(&mut incidents, today);
    let escalated = finalize_escalations(&mut incidents, today);

    let mut classification = Classification {
        escalated,
        ..Classification::default()
    };
    for incident in incidents {
        match incident.status {
            Status::Resolved => classification.resolved.push(incident),
            Status::Cancel => classification.cancelled.push(incident),
            _ => classification.active.push(incident),
        }
    }
    classification
}
