use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row as _, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::Email;
use crate::notify::{NotificationQueue, QueuedEmail};
use crate::store::{set_cell, sheets, sort_rows, CellUpdate, LedgerStore, Row, RowRange, SheetWrite, SortKey};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Loads a CSV file verbatim into `sheet`, header row included.
pub async fn import_csv(store: &dyn LedgerStore, sheet: &str, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect::<Row>());
    }

    let imported = rows.len();
    if imported > 0 {
        store.append_rows(sheet, rows).await?;
    }
    Ok(imported)
}

fn known_sheet(sheet: &str) -> Result<(), StoreError> {
    if sheets::ALL.contains(&sheet) {
        Ok(())
    } else {
        Err(StoreError::UnknownSheet(sheet.to_string()))
    }
}

fn row_index(row: usize) -> Result<i32, StoreError> {
    i32::try_from(row).map_err(|_| StoreError::Backend(format!("row {row} out of range")))
}

/// Sheets stored as `(sheet, row_index, cells)` with dense 1-based indexes.
pub struct PgLedger {
    pool: PgPool,
}

type Tx<'c> = Transaction<'c, Postgres>;

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs `writes` in one transaction.
    async fn commit(&self, writes: Vec<SheetWrite>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for write in writes {
            match write {
                SheetWrite::Append { sheet, rows } => append_in(&mut tx, &sheet, rows).await?,
                SheetWrite::Update { sheet, updates } => update_in(&mut tx, &sheet, updates).await?,
                SheetWrite::Delete { sheet, rows } => delete_in(&mut tx, &sheet, rows).await?,
                SheetWrite::Sort { sheet, first_row, keys } => sort_in(&mut tx, &sheet, first_row, &keys).await?,
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn lock_sheet(tx: &mut Tx<'_>, sheet: &str) -> Result<(), StoreError> {
    known_sheet(sheet)?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(sheet)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn decode_cells(record: &PgRow) -> Row {
    let cells: Vec<Option<String>> = record.get("cells");
    cells.into_iter().map(Option::unwrap_or_default).collect()
}

async fn insert_row(tx: &mut Tx<'_>, sheet: &str, index: i32, cells: Row) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO behaviour.sheet_rows (sheet, row_index, cells) VALUES ($1, $2, $3)")
        .bind(sheet)
        .bind(index)
        .bind(cells)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn append_in(tx: &mut Tx<'_>, sheet: &str, rows: Vec<Row>) -> Result<(), StoreError> {
    lock_sheet(tx, sheet).await?;
    let last: i32 = sqlx::query(
        "SELECT COALESCE(MAX(row_index), 0) AS last FROM behaviour.sheet_rows WHERE sheet = $1",
    )
    .bind(sheet)
    .fetch_one(&mut **tx)
    .await?
    .get("last");

    for (offset, cells) in rows.into_iter().enumerate() {
        insert_row(tx, sheet, last + row_index(offset + 1)?, cells).await?;
    }
    Ok(())
}

async fn update_in(tx: &mut Tx<'_>, sheet: &str, updates: Vec<CellUpdate>) -> Result<(), StoreError> {
    lock_sheet(tx, sheet).await?;
    let mut grouped: BTreeMap<usize, Vec<CellUpdate>> = BTreeMap::new();
    for update in updates {
        grouped.entry(update.row).or_default().push(update);
    }

    for (row, cell_updates) in grouped {
        let current = sqlx::query(
            "SELECT cells FROM behaviour.sheet_rows WHERE sheet = $1 AND row_index = $2 FOR UPDATE",
        )
        .bind(sheet)
        .bind(row_index(row)?)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::MissingRow {
            sheet: sheet.to_string(),
            row,
        })?;

        let mut cells = decode_cells(&current);
        for update in cell_updates {
            set_cell(&mut cells, update.column, update.value);
        }

        sqlx::query("UPDATE behaviour.sheet_rows SET cells = $3 WHERE sheet = $1 AND row_index = $2")
            .bind(sheet)
            .bind(row_index(row)?)
            .bind(cells)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn delete_in(tx: &mut Tx<'_>, sheet: &str, rows: Vec<usize>) -> Result<(), StoreError> {
    lock_sheet(tx, sheet).await?;
    sqlx::query("SET CONSTRAINTS ALL DEFERRED")
        .execute(&mut **tx)
        .await?;

    for row in rows {
        let index = row_index(row)?;
        let deleted = sqlx::query("DELETE FROM behaviour.sheet_rows WHERE sheet = $1 AND row_index = $2")
            .bind(sheet)
            .bind(index)
            .execute(&mut **tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::MissingRow {
                sheet: sheet.to_string(),
                row,
            });
        }
        sqlx::query(
            "UPDATE behaviour.sheet_rows SET row_index = row_index - 1 WHERE sheet = $1 AND row_index > $2",
        )
        .bind(sheet)
        .bind(index)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn sort_in(tx: &mut Tx<'_>, sheet: &str, first_row: usize, keys: &[SortKey]) -> Result<(), StoreError> {
    lock_sheet(tx, sheet).await?;
    let first = row_index(first_row)?;

    let records = sqlx::query(
        "SELECT cells FROM behaviour.sheet_rows WHERE sheet = $1 AND row_index >= $2 ORDER BY row_index",
    )
    .bind(sheet)
    .bind(first)
    .fetch_all(&mut **tx)
    .await?;
    let mut rows: Vec<Row> = records.iter().map(decode_cells).collect();
    sort_rows(&mut rows, keys);

    sqlx::query("DELETE FROM behaviour.sheet_rows WHERE sheet = $1 AND row_index >= $2")
        .bind(sheet)
        .bind(first)
        .execute(&mut **tx)
        .await?;
    for (offset, cells) in rows.into_iter().enumerate() {
        insert_row(tx, sheet, first + row_index(offset)?, cells).await?;
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn read_range(&self, sheet: &str, range: RowRange) -> Result<Vec<Row>, StoreError> {
        known_sheet(sheet)?;
        let last = range.last.map(row_index).transpose()?;
        let records = sqlx::query(
            r#"
            SELECT row_index, cells
            FROM behaviour.sheet_rows
            WHERE sheet = $1 AND row_index >= $2 AND ($3::INTEGER IS NULL OR row_index <= $3)
            ORDER BY row_index
            "#,
        )
        .bind(sheet)
        .bind(row_index(range.first)?)
        .bind(last)
        .fetch_all(&self.pool)
        .await?;

        let mut by_index = BTreeMap::new();
        for record in &records {
            let index: i32 = record.get("row_index");
            by_index.insert(index, decode_cells(record));
        }

        // Fill any gaps so position in the result still equals row offset.
        let first = row_index(range.first)?;
        let Some(&max) = by_index.keys().next_back() else {
            return Ok(Vec::new());
        };
        Ok((first..=max)
            .map(|index| by_index.remove(&index).unwrap_or_default())
            .collect())
    }

    async fn append_rows(&self, sheet: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        self.commit(vec![SheetWrite::Append {
            sheet: sheet.to_string(),
            rows,
        }])
        .await
    }

    async fn update_cells(&self, sheet: &str, updates: Vec<CellUpdate>) -> Result<(), StoreError> {
        self.commit(vec![SheetWrite::Update {
            sheet: sheet.to_string(),
            updates,
        }])
        .await
    }

    async fn apply_batch(&self, writes: Vec<SheetWrite>) -> Result<(), StoreError> {
        self.commit(writes).await
    }
}

/// Mail queue with payloads held as separate blobs, keyed by UUID.
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationQueue for PgQueue {
    async fn enqueue(&self, email: &Email) -> Result<Uuid, StoreError> {
        let payload = serde_json::to_string(email).map_err(|err| StoreError::Backend(err.to_string()))?;
        let blob_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO behaviour.email_blobs (id, payload) VALUES ($1, $2)")
            .bind(blob_id)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO behaviour.email_queue (blob_id) VALUES ($1)")
            .bind(blob_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(blob_id)
    }

    async fn push_trigger(&self) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO behaviour.email_triggers DEFAULT VALUES")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_trigger(&self) -> Result<bool, StoreError> {
        let popped = sqlx::query(
            r#"
            DELETE FROM behaviour.email_triggers
            WHERE id = (
                SELECT id FROM behaviour.email_triggers
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(popped.is_some())
    }

    async fn dequeue(&self, visibility: Duration) -> Result<Option<QueuedEmail>, StoreError> {
        let record = sqlx::query(
            r#"
            UPDATE behaviour.email_queue q
            SET dequeue_count = q.dequeue_count + 1,
                visible_at = now() + make_interval(secs => $1)
            WHERE q.id = (
                SELECT id FROM behaviour.email_queue
                WHERE visible_at <= now()
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING q.id, q.blob_id, q.dequeue_count,
                (SELECT b.payload FROM behaviour.email_blobs b WHERE b.id = q.blob_id) AS payload
            "#,
        )
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(|row| {
            let dequeue_count: i32 = row.get("dequeue_count");
            let payload: Option<String> = row.get("payload");
            QueuedEmail {
                id: row.get("id"),
                blob_id: row.get("blob_id"),
                dequeue_count: u32::try_from(dequeue_count).unwrap_or_default(),
                payload: payload.unwrap_or_default(),
            }
        }))
    }

    async fn complete(&self, job: &QueuedEmail) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM behaviour.email_queue WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM behaviour.email_blobs WHERE id = $1")
            .bind(job.blob_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryLedger;
    use std::io::Write;

    #[tokio::test]
    async fn import_keeps_header_and_ragged_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Key,Email").unwrap();
        writeln!(file, "Registers,office@school.test").unwrap();
        writeln!(file, "7").unwrap();

        let store = MemoryLedger::default();
        let imported = import_csv(&store, "Contacts", file.path()).await.unwrap();

        assert_eq!(imported, 3);
        let rows = store.sheet("Contacts");
        assert_eq!(rows[0], vec!["Key", "Email"]);
        assert_eq!(rows[2], vec!["7"]);
    }

    #[test]
    fn only_ledger_sheets_are_accepted() {
        assert!(known_sheet("DetentionDays").is_ok());
        assert!(matches!(known_sheet("Detentions"), Err(StoreError::UnknownSheet(_))));
    }

    #[test]
    fn row_index_rejects_overflow() {
        assert_eq!(row_index(12).unwrap(), 12);
        assert!(row_index(usize::MAX).is_err());
    }
}
