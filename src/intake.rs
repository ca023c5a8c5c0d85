use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::models::{Incident, EQUIPMENT_INCIDENT, EXPECTATION_PREFIX};

/// A newly reported incident as exported by the school's MIS.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReportedIncident {
    pub date: NaiveDate,
    pub forename: String,
    pub surname: String,
    pub reg: String,
    pub incident: String,
    pub period: String,
    pub class: String,
    pub subject: String,
    pub time: String,
    pub location: String,
    pub comments: String,
    pub staff: String,
    pub gender: String,
    #[serde(rename = "PP")]
    pub pp: String,
    #[serde(rename = "SEN")]
    pub sen: String,
    pub student_email: String,
    pub parent_email: String,
    pub parent_salutation: String,
}

impl From<ReportedIncident> for Incident {
    fn from(reported: ReportedIncident) -> Self {
        let mut incident = Incident {
            date: reported.date,
            forename: reported.forename,
            surname: reported.surname,
            reg: reported.reg,
            incident: reported.incident,
            period: reported.period,
            class: reported.class,
            subject: reported.subject,
            time: reported.time,
            location: reported.location,
            comments: reported.comments,
            staff: reported.staff,
            gender: reported.gender,
            pp: reported.pp,
            sen: reported.sen,
            student_email: reported.student_email,
            parent_email: reported.parent_email,
            parent_salutation: reported.parent_salutation,
            ..Incident::default()
        };
        incident.normalize();
        incident
    }
}

/// Loads a batch from a `.csv` file (header row required) or a JSON array.
pub fn read_batch(path: &Path) -> anyhow::Result<Vec<ReportedIncident>> {
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut batch = Vec::new();
        for record in reader.deserialize::<ReportedIncident>() {
            batch.push(record.with_context(|| format!("invalid incident in {}", path.display()))?);
        }
        Ok(batch)
    } else {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid incident batch in {}", path.display()))
    }
}

/// A batch split by destination.
#[derive(Debug, Default)]
pub struct Intake {
    /// Tracked in the active ledger, prefix stripped.
    pub expectations: Vec<Incident>,
    /// Logged only.
    pub behaviour: Vec<Incident>,
}

/// Keeps only each student's first missing-equipment incident of the day,
/// then splits expectation incidents from behaviour incidents.
pub fn prepare(batch: Vec<ReportedIncident>) -> Intake {
    let mut first_equipment: HashMap<String, usize> = HashMap::new();
    for (index, reported) in batch.iter().enumerate() {
        if reported.incident != EQUIPMENT_INCIDENT {
            continue;
        }
        first_equipment
            .entry(reported.student_email.clone())
            .and_modify(|kept| {
                if reported.period < batch[*kept].period {
                    *kept = index;
                }
            })
            .or_insert(index);
    }

    let mut intake = Intake::default();
    for (index, reported) in batch.into_iter().enumerate() {
        if reported.incident == EQUIPMENT_INCIDENT
            && first_equipment.get(&reported.student_email) != Some(&index)
        {
            continue;
        }
        let mut incident = Incident::from(reported);
        if let Some(kind) = incident.incident.strip_prefix(EXPECTATION_PREFIX) {
            incident.incident = kind.to_string();
            intake.expectations.push(incident);
        } else {
            intake.behaviour.push(incident);
        }
    }
    intake
}
