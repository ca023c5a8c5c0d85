//! Ledger store collaborator: named sheets of string cells with 1-based rows.

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::mapping::parse_date;

pub mod sheets {
    pub const APP_DATA: &str = "AppData";
    pub const EXPECTATIONS: &str = "Expectations";
    pub const INCIDENTS: &str = "Incidents";
    pub const DETENTION_DAYS: &str = "DetentionDays";
    pub const CONTACTS: &str = "Contacts";
    pub const EMAIL_TEMPLATES: &str = "EmailTemplates";

    pub const ALL: [&str; 6] = [APP_DATA, EXPECTATIONS, INCIDENTS, DETENTION_DAYS, CONTACTS, EMAIL_TEMPLATES];
}

pub type Row = Vec<String>;

/// Inclusive row range; `last: None` reads to the end of the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub first: usize,
    pub last: Option<usize>,
}

impl RowRange {
    pub fn from(first: usize) -> Self {
        Self { first, last: None }
    }

    pub fn single(row: usize) -> Self {
        Self {
            first: row,
            last: Some(row),
        }
    }

    pub fn all() -> Self {
        Self::from(1)
    }
}

/// One cell write; `column` is 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub row: usize,
    pub column: usize,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKind {
    Text,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
    pub kind: SortKind,
}

/// One step of a [`LedgerStore::apply_batch`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetWrite {
    Append { sheet: String, rows: Vec<Row> },
    Update { sheet: String, updates: Vec<CellUpdate> },
    /// Removes whole rows; later rows shift up. Rows are given in descending
    /// order so each index is still valid when it is applied.
    Delete { sheet: String, rows: Vec<usize> },
    /// Sorts every row from `first_row` to the end of the sheet.
    Sort { sheet: String, first_row: usize, keys: Vec<SortKey> },
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn read_range(&self, sheet: &str, range: RowRange) -> Result<Vec<Row>, StoreError>;

    async fn append_rows(&self, sheet: &str, rows: Vec<Row>) -> Result<(), StoreError>;

    async fn update_cells(&self, sheet: &str, updates: Vec<CellUpdate>) -> Result<(), StoreError>;

    /// Applies the writes in order, all or nothing. Row numbers in each step
    /// refer to the sheet as left by the steps before it.
    async fn apply_batch(&self, writes: Vec<SheetWrite>) -> Result<(), StoreError>;
}

/// Orders rows the way a spreadsheet does: blank cells always sort last,
/// dates compare chronologically, text compares case-insensitively.
pub fn sort_rows(rows: &mut [Row], keys: &[SortKey]) {
    rows.sort_by(|a, b| {
        keys.iter()
            .map(|key| compare_cells(cell(a, key.column), cell(b, key.column), key))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

fn cell(row: &Row, column: usize) -> &str {
    row.get(column).map(|value| value.trim()).unwrap_or("")
}

fn compare_cells(a: &str, b: &str, key: &SortKey) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }
    let ordering = match key.kind {
        SortKind::Date => match (parse_date(a), parse_date(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.cmp(b),
        },
        SortKind::Text => a.to_lowercase().cmp(&b.to_lowercase()),
    };
    if key.descending {
        ordering.reverse()
    } else {
        ordering
    }
}

/// Writes `value` into `row`, padding with blank cells as needed.
pub fn set_cell(row: &mut Row, column: usize, value: String) {
    if row.len() <= column {
        row.resize(column + 1, String::new());
    }
    row[column] = value;
}
