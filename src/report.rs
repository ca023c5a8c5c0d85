use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::Incident;

const CELL: &str = "style=\"padding: 5px; border: 1px solid #999\"";
const SHORT_DAY: &str = "%a %-d %b";

fn table_header(output: &mut String, columns: &[&str]) {
    let _ = write!(
        output,
        "<table style=\"border-collapse: collapse\"><thead style=\"font-style: italic\"><tr>"
    );
    for column in columns {
        let _ = write!(output, "<td {CELL}>{column}</td>");
    }
    let _ = write!(output, "</tr></thead><tbody>");
}

fn detention_row(output: &mut String, student: &Incident) {
    let _ = write!(
        output,
        "<tr><td {CELL}><b>{}, {}</b></td><td {CELL}><b>{}</b></td><td {CELL}>{}</td><td {CELL}>{}</td><td {CELL}>{}</td><td {CELL}>{}</td></tr>",
        student.surname, student.forename, student.reg, student.incident, student.period, student.subject, student.staff
    );
}

fn detention_table(output: &mut String, students: &[&Incident]) {
    table_header(
        output,
        &["Student", "Reg", "Reason", "Period", "Subject", "Staff"],
    );
    for student in students {
        detention_row(output, student);
    }
    let _ = write!(output, "</tbody></table>");
}

fn ledger_link(output: &mut String, ledger_url: &str) {
    if !ledger_url.is_empty() {
        let _ = write!(
            output,
            "<br /><br /><a href=\"{ledger_url}\">Behaviour sheet</a>"
        );
    }
}

/// Printable attachment: one page per registration group.
pub fn registers_html(by_reg: &BTreeMap<String, Vec<&Incident>>, day: &str) -> String {
    let mut output = String::from("<html><head><title>Lunchtime Detention List</title></head><body>");
    for (reg, students) in by_reg {
        let _ = write!(
            output,
            "<h2 style=\"page-break-before: always\">{reg} Lunchtime Detentions - {day}</h2><p>Please remind the following students to attend their lunchtime detentions today.</p>"
        );
        detention_table(&mut output, students);
    }
    output.push_str("</body></html>");
    output
}

pub fn year_list_html(students: &[&Incident], ledger_url: &str) -> String {
    let mut output = String::new();
    detention_table(&mut output, students);
    ledger_link(&mut output, ledger_url);
    output
}

pub fn overdue_html(students: &[&Incident], ledger_url: &str) -> String {
    let mut output = String::from(
        "<span style=\"color: Red; font-weight: bold\">These past detentions need to be Resolved, Rescheduled, Cancelled or Escalated. Please update their status on the spreadsheet.</span><br /><br />",
    );
    table_header(&mut output, &["Student", "Detention Date"]);
    for student in students {
        let date = student
            .detention_date
            .map(|d: NaiveDate| d.format(SHORT_DAY).to_string())
            .unwrap_or_default();
        let _ = write!(
            output,
            "<tr><td {CELL}><b>{}, {}</b></td><td {CELL}><b>{date}</b></td></tr>",
            student.surname, student.forename
        );
    }
    output.push_str("</tbody></table>");
    ledger_link(&mut output, ledger_url);
    output
}
