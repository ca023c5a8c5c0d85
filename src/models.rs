use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::mapping::ColumnMapping;

pub const EXPECTATION_PREFIX: &str = "Expectation - ";
pub const EQUIPMENT_INCIDENT: &str = "Expectation - Equipment not present";
const DEVICE_KEYWORD: &str = "Chromebook";
const DEVICE_STAFF: &str = "IT Support";
const DEFAULT_SALUTATION: &str = "Parent/Carer";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Pending,
    Resolved,
    Escalate,
    Reschedule,
    Cancel,
    Overdue,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Resolved => "Resolved",
            Status::Escalate => "Escalate",
            Status::Reschedule => "Reschedule",
            Status::Cancel => "Cancel",
            Status::Overdue => "Overdue",
        }
    }

    /// Cell text for the ledger. Pending is the blank cell.
    pub fn cell(self) -> &'static str {
        match self {
            Status::Pending => "",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for Status {
    type Err = UnknownStatus;

    /// Case-sensitive; the empty string is `Pending`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "" | "Pending" => Ok(Status::Pending),
            "Resolved" => Ok(Status::Resolved),
            "Escalate" => Ok(Status::Escalate),
            "Reschedule" => Ok(Status::Reschedule),
            "Cancel" => Ok(Status::Cancel),
            "Overdue" => Ok(Status::Overdue),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One reported behaviour or expectation incident.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Incident {
    pub date: NaiveDate,
    pub forename: String,
    pub surname: String,
    pub reg: String,
    pub year: String,
    pub incident: String,
    pub period: String,
    pub class: String,
    pub subject: String,
    pub time: String,
    pub location: String,
    pub comments: String,
    pub staff: String,
    pub gender: String,
    pub pp: String,
    pub sen: String,
    pub student_email: String,
    pub parent_email: String,
    pub parent_salutation: String,
    pub detention_date: Option<NaiveDate>,
    pub previous_detention_date: Option<NaiveDate>,
    pub status: Status,
    /// Ledger row, `None` until the incident has been appended.
    pub spreadsheet_row: Option<usize>,
    pub is_changed: bool,
    pub email_required: bool,
}

impl Incident {
    /// Applies the field normalization rules shared by intake and ledger reads.
    pub fn normalize(&mut self) {
        self.surname = self.surname.to_uppercase();
        if self.pp != "T" {
            self.pp.clear();
        }
        if self.staff.is_empty() && self.incident.contains(DEVICE_KEYWORD) {
            self.staff = DEVICE_STAFF.to_string();
        }
        self.parent_salutation = if self.parent_salutation.trim().is_empty() {
            DEFAULT_SALUTATION.to_string()
        } else {
            title_case(&self.parent_salutation)
        };
    }

    /// Year group: an explicit value wins, otherwise the leading digits of the
    /// registration group (`10/Ab` -> `10/`, `7X` -> `7`).
    pub fn year(&self) -> String {
        if !self.year.is_empty() {
            return self.year.clone();
        }
        self.reg
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '/')
            .collect()
    }

    /// Salutation is suppressed entirely when there is nobody to address.
    pub fn salutation(&self) -> &str {
        if self.parent_email.is_empty() {
            ""
        } else {
            &self.parent_salutation
        }
    }

    /// Grouping key for per-student scheduling.
    pub fn student_key(&self) -> String {
        let email = self.student_email.trim();
        if email.is_empty() {
            format!("{}|{}|{}", self.surname, self.forename, self.reg)
        } else {
            email.to_lowercase()
        }
    }
}

fn title_case(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut word_start = true;
    for ch in value.trim().chars() {
        if ch.is_alphanumeric() {
            if word_start {
                output.extend(ch.to_uppercase());
            } else {
                output.extend(ch.to_lowercase());
            }
            word_start = false;
        } else {
            output.push(ch);
            word_start = ch != '\'';
        }
    }
    output
}

/// Cursor persisted between runs.
#[derive(Debug, Clone)]
pub struct Tracker {
    pub last_exported: NaiveDate,
    /// First ledger row still needing active tracking. Row 1 is the header.
    pub start_row: usize,
    pub ledger_columns: ColumnMapping,
    pub log_columns: ColumnMapping,
}

/// Future detention days, ascending and strictly after the run date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetentionDayPool {
    days: Vec<NaiveDate>,
}

impl DetentionDayPool {
    pub fn new(days: impl IntoIterator<Item = NaiveDate>, today: NaiveDate) -> Self {
        let days: BTreeSet<NaiveDate> = days.into_iter().filter(|day| *day > today).collect();
        Self {
            days: days.into_iter().collect(),
        }
    }

    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Earliest day after `today` that `used` does not already hold.
    pub fn first_available(&self, today: NaiveDate, used: &BTreeSet<NaiveDate>) -> Option<NaiveDate> {
        self.days
            .iter()
            .copied()
            .find(|day| *day > today && !used.contains(day))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

/// Contact addresses keyed by year group, plus the `Registers` mailbox.
pub type Contacts = HashMap<String, String>;

/// A queued notification; serialized as the blob payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub from_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_html: Option<String>,
}
