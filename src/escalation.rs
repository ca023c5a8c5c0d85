use chrono::NaiveDate;

use crate::models::{Incident, Status};

pub const MISSED_DETENTION: &str = "Failure to attend detention";
const AUDIT_DATE: &str = "%a %-d %b";

/// Derives one new incident per finalized escalation, dated `today`.
///
/// Derived incidents carry the student's identity and demographics and record
/// the original incident in their comment; they start as unpersisted
/// `Pending` incidents so they can be scheduled in the same run.
pub fn synthesize(escalated: &[Incident], today: NaiveDate) -> Vec<Incident> {
    escalated
        .iter()
        .map(|original| Incident {
            date: today,
            forename: original.forename.clone(),
            surname: original.surname.clone(),
            reg: original.reg.clone(),
            year: original.year.clone(),
            incident: MISSED_DETENTION.to_string(),
            comments: audit_comment(original),
            gender: original.gender.clone(),
            pp: original.pp.clone(),
            sen: original.sen.clone(),
            student_email: original.student_email.clone(),
            parent_email: original.parent_email.clone(),
            parent_salutation: original.parent_salutation.clone(),
            status: Status::Pending,
            ..Incident::default()
        })
        .collect()
}

fn audit_comment(original: &Incident) -> String {
    let missed = match original.detention_date {
        Some(date) => format!("Did not attend detention on {}", date.format(AUDIT_DATE)),
        None => "Did not attend detention".to_string(),
    };
    format!(
        "{missed}, for {} [{}, {}, {},{}]",
        original.incident,
        original.date.format(AUDIT_DATE),
        original.period,
        original.class,
        original.staff
    )
}
