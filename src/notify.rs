//! Composition and queueing of notification emails.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::mapping::Field;
use crate::models::{Contacts, Email, EmailTemplate, Incident, Status};
use crate::report;
use crate::store::Row;

pub const REGISTERS_CONTACT: &str = "Registers";

const NEW_DETENTION_TEMPLATE: usize = 0;
const RESCHEDULED_TEMPLATE: usize = 1;

/// Parent template per incident category. Categories not listed here get no
/// parent email.
const PARENT_TEMPLATES: [(&str, usize); 8] = [
    ("Chromebook", 2),
    ("Equipment not present", 3),
    ("Homework not complete", 4),
    ("Late to lesson", 5),
    ("Misuse of Chromebook", 6),
    ("Mobile phone use", 7),
    ("Out of class", 8),
    ("Swearing", 9),
];

pub fn parent_template(category: &str) -> Option<usize> {
    PARENT_TEMPLATES
        .iter()
        .find(|(name, _)| *name == category)
        .map(|(_, index)| *index)
}

/// A queued job as handed to the drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEmail {
    pub id: i64,
    pub blob_id: Uuid,
    pub dequeue_count: u32,
    pub payload: String,
}

/// Durable, at-least-once notification queue with blob-backed payloads.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn enqueue(&self, email: &Email) -> Result<Uuid, StoreError>;

    async fn push_trigger(&self) -> Result<(), StoreError>;

    /// Consumes one drain trigger; `false` when none is waiting.
    async fn pop_trigger(&self) -> Result<bool, StoreError>;

    /// Leases the next visible job for `visibility` and bumps its count.
    async fn dequeue(&self, visibility: Duration) -> Result<Option<QueuedEmail>, StoreError>;

    /// Removes the job and its payload.
    async fn complete(&self, job: &QueuedEmail) -> Result<(), StoreError>;
}

pub fn read_contacts(rows: &[Row]) -> Contacts {
    rows.iter()
        .filter(|row| row.len() >= 2 && !row[0].trim().is_empty())
        .map(|row| (row[0].trim().to_string(), row[1].trim().to_string()))
        .collect()
}

pub fn read_templates(rows: &[Row]) -> Vec<EmailTemplate> {
    rows.iter()
        .map(|row| EmailTemplate {
            subject: row.first().cloned().unwrap_or_default(),
            body: row.get(1).cloned().unwrap_or_default(),
        })
        .collect()
}

/// Replaces `{{Field}}` placeholders with display values; newlines become
/// HTML line breaks.
pub fn fill_template(template: &str, incident: &Incident) -> String {
    let mut output = template.to_string();
    for field in Field::ALL {
        let placeholder = format!("{{{{{}}}}}", field.header());
        if output.contains(&placeholder) {
            output = output.replace(&placeholder, &field.display(incident, true));
        }
    }
    output.replace('\n', "<br />")
}

/// First weekday after `today`.
pub fn next_working_day(today: NaiveDate) -> NaiveDate {
    let mut day = today.succ_opt().unwrap_or(today);
    while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
        day = day.succ_opt().unwrap_or(day);
    }
    day
}

pub struct Mailer<'a> {
    config: &'a Config,
    templates: &'a [EmailTemplate],
    contacts: &'a Contacts,
}

impl<'a> Mailer<'a> {
    pub fn new(config: &'a Config, templates: &'a [EmailTemplate], contacts: &'a Contacts) -> Self {
        Self {
            config,
            templates,
            contacts,
        }
    }

    /// Every email owed for the active set after a run.
    pub fn compose(&self, incidents: &[Incident], today: NaiveDate) -> Vec<Email> {
        let mut emails = Vec::new();
        self.detention_lists(incidents, today, &mut emails);
        self.student_and_parent(incidents, &mut emails);
        self.overdue_lists(incidents, today, &mut emails);
        emails
    }

    fn email(&self, to: &str, subject: String, body: String, attachment_html: Option<String>) -> Email {
        Email {
            to: self.config.recipient(to).to_string(),
            subject,
            body,
            from_name: self.config.from_name.clone(),
            attachment_html,
        }
    }

    fn contact(&self, key: &str) -> Option<&str> {
        let contact = self.contacts.get(key).map(String::as_str);
        if contact.is_none() {
            warn!(contact = key, "no contact address configured, skipping email");
        }
        contact
    }

    fn template(&self, index: usize) -> Option<&EmailTemplate> {
        let template = self.templates.get(index);
        if template.is_none() {
            warn!(index, "email template missing, skipping email");
        }
        template
    }

    fn detention_lists(&self, incidents: &[Incident], today: NaiveDate, emails: &mut Vec<Email>) {
        let day = next_working_day(today);
        let mut tomorrow: Vec<&Incident> = incidents
            .iter()
            .filter(|i| i.status == Status::Pending && i.detention_date == Some(day))
            .collect();
        if tomorrow.is_empty() {
            return;
        }
        tomorrow.sort_by(|a, b| {
            (&a.reg, &a.surname, &a.forename).cmp(&(&b.reg, &b.surname, &b.forename))
        });
        let day_text = day.format("%A %-d %B %Y").to_string();

        let mut by_reg: BTreeMap<String, Vec<&Incident>> = BTreeMap::new();
        let mut by_year: BTreeMap<String, Vec<&Incident>> = BTreeMap::new();
        for incident in &tomorrow {
            by_reg.entry(incident.reg.clone()).or_default().push(incident);
            by_year.entry(incident.year()).or_default().push(incident);
        }

        if let Some(to) = self.contact(REGISTERS_CONTACT) {
            emails.push(self.email(
                to,
                format!("Lunchtime Detention Lists - {day_text}"),
                "Please print the attached student lists and put them into register folders.".to_string(),
                Some(report::registers_html(&by_reg, &day_text)),
            ));
        }
        for (year, students) in &by_year {
            if let Some(to) = self.contact(year) {
                emails.push(self.email(
                    to,
                    format!("Y{year} Lunchtime Detention List - {day_text}"),
                    report::year_list_html(students, &self.config.ledger_url),
                    None,
                ));
            }
        }
    }

    fn student_and_parent(&self, incidents: &[Incident], emails: &mut Vec<Email>) {
        for incident in incidents.iter().filter(|i| i.email_required) {
            let rescheduled = incident.previous_detention_date.is_some();
            let index = if rescheduled {
                RESCHEDULED_TEMPLATE
            } else {
                NEW_DETENTION_TEMPLATE
            };
            if let Some(template) = self.template(index) {
                emails.push(self.email(
                    &incident.student_email,
                    fill_template(&template.subject, incident),
                    fill_template(&template.body, incident),
                    None,
                ));
            }

            if rescheduled || incident.parent_email.is_empty() {
                continue;
            }
            let Some(template) = parent_template(&incident.incident).and_then(|i| self.template(i)) else {
                continue;
            };
            emails.push(self.email(
                &incident.parent_email,
                fill_template(&template.subject, incident),
                fill_template(&template.body, incident),
                None,
            ));
        }
    }

    fn overdue_lists(&self, incidents: &[Incident], today: NaiveDate, emails: &mut Vec<Email>) {
        let mut by_year: BTreeMap<String, Vec<&Incident>> = BTreeMap::new();
        for incident in incidents.iter().filter(|i| i.status == Status::Overdue) {
            by_year.entry(incident.year()).or_default().push(incident);
        }
        for (year, students) in &by_year {
            if let Some(to) = self.contact(year) {
                emails.push(self.email(
                    to,
                    format!(
                        "Y{year} Overdue Detentions as of {} - Action Needed",
                        today.format("%-d/%-m/%y")
                    ),
                    report::overdue_html(students, &self.config.ledger_url),
                    None,
                ));
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn templates() -> Vec<EmailTemplate> {
        (0..10)
            .map(|i| EmailTemplate {
                subject: format!("T{i} {{{{Surname}}}}"),
                body: format!("Dear {{{{ParentSalutation}}}}\nDetention {{{{DetentionDate}}}} #{i}"),
            })
            .collect()
    }

    fn contacts() -> Contacts {
        [
            ("Registers", "office@school.test"),
            ("9", "hoy9@school.test"),
            ("10", "hoy10@school.test"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn incident(reg: &str, status: Status, detention: Option<NaiveDate>) -> Incident {
        let mut incident = Incident {
            forename: "Sam".to_string(),
            surname: "LEE".to_string(),
            reg: reg.to_string(),
            incident: "Late to lesson".to_string(),
            student_email: "sam@school.test".to_string(),
            parent_email: "home@example.com".to_string(),
            status,
            detention_date: detention,
            ..Incident::default()
        };
        incident.normalize();
        incident
    }

    #[test]
    fn next_working_day_skips_weekends() {
        assert_eq!(next_working_day(day(2026, 10, 14)), day(2026, 10, 15));
        assert_eq!(next_working_day(day(2026, 10, 16)), day(2026, 10, 19));
        assert_eq!(next_working_day(day(2026, 10, 17)), day(2026, 10, 19));
    }

    #[test]
    fn unmapped_categories_have_no_parent_template() {
        assert_eq!(parent_template("Swearing"), Some(9));
        assert_eq!(parent_template("Failure to attend detention"), None);
    }

    #[test]
    fn fill_template_uses_long_dates_and_html_breaks() {
        let incident = incident("9A", Status::Pending, Some(day(2026, 10, 16)));
        let filled = fill_template("Dear {{ParentSalutation}}\nSee you {{DetentionDate}}", &incident);
        assert_eq!(filled, "Dear Parent/Carer<br />See you Friday 16 October 2026");
    }

    #[test]
    fn new_detention_emails_student_and_parent() {
        let config = test_config();
        let templates = templates();
        let contacts = contacts();
        let mut scheduled = incident("9A", Status::Pending, Some(day(2026, 10, 21)));
        scheduled.email_required = true;

        let emails = Mailer::new(&config, &templates, &contacts).compose(&[scheduled], day(2026, 10, 14));

        let recipients: Vec<_> = emails.iter().map(|e| (e.to.as_str(), e.subject.as_str())).collect();
        assert_eq!(
            recipients,
            vec![("sam@school.test", "T0 LEE"), ("home@example.com", "T5 LEE")]
        );
        assert_eq!(emails[0].from_name, "WPS Behaviour");
    }

    #[test]
    fn rescheduled_detention_skips_parent() {
        let config = test_config();
        let templates = templates();
        let contacts = contacts();
        let mut rescheduled = incident("9A", Status::Pending, Some(day(2026, 10, 21)));
        rescheduled.previous_detention_date = Some(day(2026, 10, 12));
        rescheduled.email_required = true;

        let emails = Mailer::new(&config, &templates, &contacts).compose(&[rescheduled], day(2026, 10, 14));
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].subject, "T1 LEE");
    }

    #[test]
    fn next_day_lists_go_to_registers_and_year_contacts() {
        let config = test_config();
        let templates = templates();
        let contacts = contacts();
        let incidents = vec![
            incident("9A", Status::Pending, Some(day(2026, 10, 15))),
            incident("10B", Status::Pending, Some(day(2026, 10, 15))),
            incident("10B", Status::Pending, Some(day(2026, 10, 16))),
        ];

        let emails = Mailer::new(&config, &templates, &contacts).compose(&incidents, day(2026, 10, 14));

        assert_eq!(emails.len(), 3);
        assert_eq!(emails[0].to, "office@school.test");
        assert!(emails[0].attachment_html.is_some());
        assert_eq!(emails[0].subject, "Lunchtime Detention Lists - Thursday 15 October 2026");
        assert_eq!(emails[1].subject, "Y10 Lunchtime Detention List - Thursday 15 October 2026");
        assert_eq!(emails[2].to, "hoy9@school.test");
    }

    #[test]
    fn overdue_lists_skip_years_without_contacts() {
        let config = test_config();
        let templates = templates();
        let contacts = contacts();
        let incidents = vec![
            incident("9A", Status::Overdue, Some(day(2026, 10, 12))),
            incident("11C", Status::Overdue, Some(day(2026, 10, 12))),
        ];

        let emails = Mailer::new(&config, &templates, &contacts).compose(&incidents, day(2026, 10, 14));
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].subject, "Y9 Overdue Detentions as of 14/10/26 - Action Needed");
    }

    #[test]
    fn debug_recipient_receives_everything() {
        let mut config = test_config();
        config.debug_recipient_email = Some("dev@school.test".to_string());
        let templates = templates();
        let contacts = contacts();
        let mut scheduled = incident("9A", Status::Pending, Some(day(2026, 10, 21)));
        scheduled.email_required = true;

        let emails = Mailer::new(&config, &templates, &contacts).compose(&[scheduled], day(2026, 10, 14));
        assert!(emails.iter().all(|e| e.to == "dev@school.test"));
    }

    #[test]
    fn contact_and_template_sheets_are_read() {
        let rows = vec![
            vec!["7".to_string(), "hoy7@school.test".to_string()],
            vec!["".to_string(), "nobody".to_string()],
            vec!["8".to_string()],
        ];
        let contacts = read_contacts(&rows);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts["7"], "hoy7@school.test");

        let templates = read_templates(&[vec!["Subject".to_string()]]);
        assert_eq!(templates[0].body, "");
    }
}
