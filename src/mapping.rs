//! Column binding between ledger rows and [`Incident`] records.
//!
//! A sheet declares its layout through its header row; each header cell names
//! a [`Field`]. Headers that name no field are holes and are skipped on read
//! and left blank on write, so sheets can grow extra columns freely.

use chrono::NaiveDate;

use crate::error::EngineError;
use crate::models::{Incident, Status, UnknownStatus};

const SHORT_DATE: &str = "%-d-%b-%y";
const SHORT_DATE_PARSE: &str = "%d-%b-%y";
const LONG_DATE: &str = "%A %-d %B %Y";
const ISO_DATE: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Date,
    Forename,
    Surname,
    Reg,
    Year,
    Incident,
    Period,
    Class,
    Subject,
    Time,
    Location,
    Comments,
    Staff,
    Gender,
    Pp,
    Sen,
    StudentEmail,
    ParentEmail,
    ParentSalutation,
    DetentionDate,
    PreviousDetentionDate,
    Status,
}

impl Field {
    pub const ALL: [Field; 22] = [
        Field::Date,
        Field::Forename,
        Field::Surname,
        Field::Reg,
        Field::Year,
        Field::Incident,
        Field::Period,
        Field::Class,
        Field::Subject,
        Field::Time,
        Field::Location,
        Field::Comments,
        Field::Staff,
        Field::Gender,
        Field::Pp,
        Field::Sen,
        Field::StudentEmail,
        Field::ParentEmail,
        Field::ParentSalutation,
        Field::DetentionDate,
        Field::PreviousDetentionDate,
        Field::Status,
    ];

    /// Header text naming this field in a sheet.
    pub fn header(self) -> &'static str {
        match self {
            Field::Date => "Date",
            Field::Forename => "Forename",
            Field::Surname => "Surname",
            Field::Reg => "Reg",
            Field::Year => "Year",
            Field::Incident => "Incident",
            Field::Period => "Period",
            Field::Class => "Class",
            Field::Subject => "Subject",
            Field::Time => "Time",
            Field::Location => "Location",
            Field::Comments => "Comments",
            Field::Staff => "Staff",
            Field::Gender => "Gender",
            Field::Pp => "PP",
            Field::Sen => "SEN",
            Field::StudentEmail => "StudentEmail",
            Field::ParentEmail => "ParentEmail",
            Field::ParentSalutation => "ParentSalutation",
            Field::DetentionDate => "DetentionDate",
            Field::PreviousDetentionDate => "PreviousDetentionDate",
            Field::Status => "Status",
        }
    }

    pub fn from_header(header: &str) -> Option<Field> {
        let header = header.trim();
        Field::ALL.into_iter().find(|field| field.header() == header)
    }

    /// Cell text for `incident`; long dates are used in email bodies.
    pub fn display(self, incident: &Incident, long_dates: bool) -> String {
        let format = if long_dates { LONG_DATE } else { SHORT_DATE };
        let date = |value: Option<NaiveDate>| {
            value
                .map(|d| d.format(format).to_string())
                .unwrap_or_default()
        };
        match self {
            Field::Date => date(Some(incident.date)),
            Field::Forename => incident.forename.clone(),
            Field::Surname => incident.surname.clone(),
            Field::Reg => incident.reg.clone(),
            Field::Year => incident.year(),
            Field::Incident => incident.incident.clone(),
            Field::Period => incident.period.clone(),
            Field::Class => incident.class.clone(),
            Field::Subject => incident.subject.clone(),
            Field::Time => incident.time.clone(),
            Field::Location => incident.location.clone(),
            Field::Comments => incident.comments.clone(),
            Field::Staff => incident.staff.clone(),
            Field::Gender => incident.gender.clone(),
            Field::Pp => incident.pp.clone(),
            Field::Sen => incident.sen.clone(),
            Field::StudentEmail => incident.student_email.clone(),
            Field::ParentEmail => incident.parent_email.clone(),
            Field::ParentSalutation => incident.salutation().to_string(),
            Field::DetentionDate => date(incident.detention_date),
            Field::PreviousDetentionDate => date(incident.previous_detention_date),
            Field::Status => incident.status.cell().to_string(),
        }
    }

    fn assign(self, incident: &mut Incident, cell: &str) -> Result<(), UnknownStatus> {
        let text = cell.to_string();
        match self {
            Field::Date => incident.date = parse_date(cell).unwrap_or_default(),
            Field::Forename => incident.forename = text,
            Field::Surname => incident.surname = text,
            Field::Reg => incident.reg = text,
            Field::Year => incident.year = text,
            Field::Incident => incident.incident = text,
            Field::Period => incident.period = text,
            Field::Class => incident.class = text,
            Field::Subject => incident.subject = text,
            Field::Time => incident.time = text,
            Field::Location => incident.location = text,
            Field::Comments => incident.comments = text,
            Field::Staff => incident.staff = text,
            Field::Gender => incident.gender = text,
            Field::Pp => incident.pp = text,
            Field::Sen => incident.sen = text,
            Field::StudentEmail => incident.student_email = text,
            Field::ParentEmail => incident.parent_email = text,
            Field::ParentSalutation => incident.parent_salutation = text,
            Field::DetentionDate => incident.detention_date = parse_date(cell),
            Field::PreviousDetentionDate => incident.previous_detention_date = parse_date(cell),
            Field::Status => incident.status = cell.parse()?,
        }
        Ok(())
    }
}

/// Parses a ledger date cell: `3-Feb-26`, falling back to ISO `2026-02-03`.
pub fn parse_date(cell: &str) -> Option<NaiveDate> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(cell, SHORT_DATE_PARSE)
        .or_else(|_| NaiveDate::parse_from_str(cell, ISO_DATE))
        .ok()
}

pub fn format_short_date(date: NaiveDate) -> String {
    date.format(SHORT_DATE).to_string()
}

/// Ordered field binding for one sheet, built from its header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    columns: Vec<Option<Field>>,
}

impl ColumnMapping {
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Self {
        Self {
            columns: headers
                .iter()
                .map(|header| Field::from_header(header.as_ref()))
                .collect(),
        }
    }

    /// Fails fast when the sheet lacks a column the engine relies on.
    pub fn require(&self, sheet: &str, fields: &[Field]) -> Result<(), EngineError> {
        let missing: Vec<&str> = fields
            .iter()
            .filter(|field| self.position(**field).is_none())
            .map(|field| field.header())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::validation(format!(
                "sheet '{sheet}' is missing required columns: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn position(&self, field: Field) -> Option<usize> {
        self.columns.iter().position(|column| *column == Some(field))
    }

    /// Builds an incident from a raw row. Cells past the mapping and holes are
    /// ignored; missing cells keep the field's zero value.
    pub fn interpret<S: AsRef<str>>(&self, row: &[S]) -> Result<Incident, UnknownStatus> {
        let mut incident = Incident::default();
        for (cell, column) in row.iter().zip(self.columns.iter()) {
            if let Some(field) = column {
                field.assign(&mut incident, cell.as_ref())?;
            }
        }
        incident.normalize();
        Ok(incident)
    }

    /// Renders an incident as a full row; holes become blank cells.
    pub fn render(&self, incident: &Incident) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| {
                column
                    .map(|field| field.display(incident, false))
                    .unwrap_or_default()
            })
            .collect()
    }
}
