//! Cursor and ledger reconciliation.
//!
//! The cursor (`Tracker::start_row`) is a contiguous prefix pointer into the
//! active ledger: every row above it is finished, every row at or below it is
//! scanned again on the next run. It only moves past rows that left the
//! active set this run, and stops at the first row that is still tracked.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::debug;

use crate::error::EngineError;
use crate::mapping::{format_short_date, parse_date, ColumnMapping, Field};
use crate::models::{DetentionDayPool, Incident, Tracker};
use crate::store::{sheets, CellUpdate, Row, SortKey, SortKind};

/// The first data row; row 1 holds the headers.
pub const FIRST_DATA_ROW: usize = 2;

pub const LEDGER_REQUIRED: [Field; 6] = [
    Field::Date,
    Field::Forename,
    Field::Surname,
    Field::StudentEmail,
    Field::DetentionDate,
    Field::Status,
];

pub const LOG_REQUIRED: [Field; 4] = [Field::Date, Field::Forename, Field::Surname, Field::Incident];

/// Columns written back for rows that changed in place.
const WRITE_BACK: [Field; 3] = [Field::DetentionDate, Field::PreviousDetentionDate, Field::Status];

/// Validates the tracker rows and both header rows.
pub fn read_tracker(app_data: &[Row], ledger_header: &[Row], log_header: &[Row]) -> Result<Tracker, EngineError> {
    let invalid = || {
        EngineError::validation(format!(
            "tracker data invalid, check the {} sheet",
            sheets::APP_DATA
        ))
    };
    let first_cell = |row: Option<&Row>| row.and_then(|r| r.first()).map(|c| c.trim().to_string());

    let last_exported = first_cell(app_data.first())
        .and_then(|cell| parse_date(&cell))
        .ok_or_else(invalid)?;
    let start_row: usize = first_cell(app_data.get(1))
        .and_then(|cell| cell.parse().ok())
        .ok_or_else(invalid)?;

    let ledger_columns = header_mapping(ledger_header);
    ledger_columns.require(sheets::EXPECTATIONS, &LEDGER_REQUIRED)?;
    let log_columns = header_mapping(log_header);
    log_columns.require(sheets::INCIDENTS, &LOG_REQUIRED)?;

    Ok(Tracker {
        last_exported,
        start_row: start_row.max(FIRST_DATA_ROW),
        ledger_columns,
        log_columns,
    })
}

fn header_mapping(header: &[Row]) -> ColumnMapping {
    header
        .first()
        .map(|row| ColumnMapping::from_headers(row.as_slice()))
        .unwrap_or_default()
}

pub fn tracker_updates(today: NaiveDate, new_start_row: usize) -> Vec<CellUpdate> {
    vec![
        CellUpdate {
            row: 1,
            column: 0,
            value: format_short_date(today),
        },
        CellUpdate {
            row: 2,
            column: 0,
            value: new_start_row.to_string(),
        },
    ]
}

pub fn read_detention_days(rows: &[Row], today: NaiveDate) -> DetentionDayPool {
    let days = rows
        .iter()
        .filter_map(|row| row.first())
        .filter_map(|cell| parse_date(cell));
    DetentionDayPool::new(days, today)
}

/// Rows read from the cursor onward.
#[derive(Debug, Default)]
pub struct ScannedTail {
    pub first_row: usize,
    pub row_count: usize,
    pub incidents: Vec<Incident>,
    /// Rows without any content; nothing to track there.
    pub blank_rows: Vec<usize>,
}

pub fn read_tail(rows: &[Row], mapping: &ColumnMapping, first_row: usize) -> Result<ScannedTail, EngineError> {
    let mut tail = ScannedTail {
        first_row,
        row_count: rows.len(),
        ..ScannedTail::default()
    };
    for (offset, row) in rows.iter().enumerate() {
        let row_number = first_row + offset;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            tail.blank_rows.push(row_number);
            continue;
        }
        let mut incident = mapping.interpret(row).map_err(|err| {
            EngineError::validation(format!("{} row {row_number}: {err}", sheets::EXPECTATIONS))
        })?;
        incident.spreadsheet_row = Some(row_number);
        tail.incidents.push(incident);
    }
    Ok(tail)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowFate {
    Active,
    Exited,
    Deleted,
    Blank,
}

/// Final write-set for the active ledger.
#[derive(Debug, Default, PartialEq)]
pub struct WriteSet {
    /// Unpersisted active incidents, rendered for appending.
    pub appends: Vec<Row>,
    pub updates: Vec<CellUpdate>,
    /// Cancelled rows, descending.
    pub deletes: Vec<usize>,
    pub new_start_row: usize,
}

/// Computes appends, in-place updates, deletions and the cursor advance.
pub fn plan_writes(
    tail: &ScannedTail,
    active: &[Incident],
    resolved: &[Incident],
    cancelled: &[Incident],
    mapping: &ColumnMapping,
) -> WriteSet {
    let appends = active
        .iter()
        .filter(|incident| incident.spreadsheet_row.is_none())
        .map(|incident| mapping.render(incident))
        .collect();

    let mut updates = Vec::new();
    for incident in active.iter().chain(resolved) {
        let Some(row) = incident.spreadsheet_row else {
            continue;
        };
        if !incident.is_changed {
            continue;
        }
        for field in WRITE_BACK {
            if let Some(column) = mapping.position(field) {
                updates.push(CellUpdate {
                    row,
                    column,
                    value: field.display(incident, false),
                });
            }
        }
    }

    let mut deletes: Vec<usize> = cancelled
        .iter()
        .filter_map(|incident| incident.spreadsheet_row)
        .collect();
    deletes.sort_unstable_by(|a, b| b.cmp(a));
    deletes.dedup();

    let mut fates = BTreeMap::new();
    for row in &tail.blank_rows {
        fates.insert(*row, RowFate::Blank);
    }
    let rows_of = |incidents: &[Incident], fate: RowFate| {
        incidents
            .iter()
            .filter_map(|incident| incident.spreadsheet_row)
            .map(move |row| (row, fate))
            .collect::<Vec<_>>()
    };
    fates.extend(rows_of(active, RowFate::Active));
    fates.extend(rows_of(resolved, RowFate::Exited));
    fates.extend(rows_of(cancelled, RowFate::Deleted));

    WriteSet {
        appends,
        updates,
        deletes,
        new_start_row: advance_cursor(tail, &fates),
    }
}

/// Walks the scanned rows top-down. Exited and blank rows move the cursor
/// forward; cancelled rows are deleted, so they neither count nor block; the
/// first active row stops the walk.
fn advance_cursor(tail: &ScannedTail, fates: &BTreeMap<usize, RowFate>) -> usize {
    let mut advanced = 0;
    for row in tail.first_row..tail.first_row + tail.row_count {
        match fates.get(&row).copied().unwrap_or(RowFate::Active) {
            RowFate::Exited | RowFate::Blank => advanced += 1,
            RowFate::Deleted => {}
            RowFate::Active => {
                debug!(row, "cursor held at first active row");
                break;
            }
        }
    }
    tail.first_row + advanced
}

/// Sort order for the active tail: outstanding statuses first, then by
/// detention date and student.
pub fn tail_sort_keys(mapping: &ColumnMapping) -> Vec<SortKey> {
    [
        (Field::Status, true, SortKind::Text),
        (Field::DetentionDate, false, SortKind::Date),
        (Field::Year, false, SortKind::Text),
        (Field::Surname, false, SortKind::Text),
        (Field::Forename, false, SortKind::Text),
    ]
    .into_iter()
    .filter_map(|(field, descending, kind)| {
        mapping.position(field).map(|column| SortKey {
            column,
            descending,
            kind,
        })
    })
    .collect()
}
