use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::models::{DetentionDayPool, Incident, Status};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub assigned: usize,
    /// Incidents left without a date because the pool ran dry.
    pub unassigned: usize,
}

/// Gives every unscheduled `Pending` incident the earliest pool day its
/// student is not already booked on.
///
/// Incidents are processed in slice order. An exhausted pool is not an error:
/// the incident keeps no date and is retried on the next run.
pub fn allocate(incidents: &mut [Incident], pool: &DetentionDayPool, today: NaiveDate) -> Allocation {
    let mut booked: HashMap<String, BTreeSet<NaiveDate>> = HashMap::new();
    for incident in incidents.iter().filter(|i| i.status == Status::Pending) {
        if let Some(date) = incident.detention_date {
            booked.entry(incident.student_key()).or_default().insert(date);
        }
    }

    let mut allocation = Allocation::default();
    for incident in incidents
        .iter_mut()
        .filter(|i| i.status == Status::Pending && i.detention_date.is_none())
    {
        let used = booked.entry(incident.student_key()).or_default();
        match pool.first_available(today, used) {
            Some(date) => {
                debug!(student = %incident.student_email, %date, "detention allocated");
                incident.detention_date = Some(date);
                incident.is_changed = true;
                incident.email_required = true;
                used.insert(date);
                allocation.assigned += 1;
            }
            None => {
                warn!(student = %incident.student_email, "no detention day available");
                allocation.unassigned += 1;
            }
        }
    }
    allocation
}
