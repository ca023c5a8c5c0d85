//! One invocation of the incident lifecycle pipeline.
//!
//! The pure stages (state machine, escalation, allocation, reconciliation)
//! run in memory first. Ledger writes are then committed as one batch,
//! notifications are queued, and the cursor is written last.

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use crate::allocator::{self, Allocation};
use crate::calendar::{self, CalendarSync};
use crate::config::Config;
use crate::error::EngineError;
use crate::escalation;
use crate::intake::{self, Intake, ReportedIncident};
use crate::lifecycle;
use crate::models::{DetentionDayPool, Email, Incident, Tracker};
use crate::notify::{self, Mailer, NotificationQueue};
use crate::reconcile::{self, ScannedTail, WriteSet};
use crate::store::{sheets, LedgerStore, Row, RowRange, SheetWrite};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub scanned_rows: usize,
    pub resolved: usize,
    pub escalated: usize,
    pub cancelled: usize,
    pub logged: usize,
    pub appended: usize,
    pub updated_cells: usize,
    pub allocated: usize,
    pub unallocated: usize,
    pub emails_queued: usize,
    pub calendar_changes: usize,
    pub previous_start_row: usize,
    pub new_start_row: usize,
}

/// In-memory result of the pure stages.
#[derive(Debug)]
pub struct RunPlan {
    pub writes: WriteSet,
    /// Rows for the behaviour log: behaviour intake plus derived incidents.
    pub log_rows: Vec<Row>,
    /// Incidents tracked after this run.
    pub active: Vec<Incident>,
    pub cancelled: Vec<Incident>,
    pub resolved: usize,
    pub escalated: usize,
    pub allocation: Allocation,
}

/// State machine, then escalation, then allocation, then reconciliation.
/// Each stage consumes the previous stage's output.
pub fn plan_run(
    tracker: &Tracker,
    tail: &ScannedTail,
    intake: Intake,
    pool: &DetentionDayPool,
    today: NaiveDate,
) -> RunPlan {
    let classified = lifecycle::classify(tail.incidents.clone(), today);
    let derived = escalation::synthesize(&classified.escalated, today);

    let log_rows = intake
        .behaviour
        .iter()
        .chain(&derived)
        .map(|incident| tracker.log_columns.render(incident))
        .collect();

    let mut active = classified.active;
    active.extend(intake.expectations);
    active.extend(derived);
    let allocation = allocator::allocate(&mut active, pool, today);

    let writes = reconcile::plan_writes(
        tail,
        &active,
        &classified.resolved,
        &classified.cancelled,
        &tracker.ledger_columns,
    );

    RunPlan {
        writes,
        log_rows,
        active,
        resolved: classified.resolved.len(),
        escalated: classified.escalated.len(),
        cancelled: classified.cancelled,
        allocation,
    }
}

pub struct Engine<'a> {
    config: &'a Config,
    store: &'a dyn LedgerStore,
    queue: &'a dyn NotificationQueue,
    calendar: &'a dyn CalendarSync,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a dyn LedgerStore,
        queue: &'a dyn NotificationQueue,
        calendar: &'a dyn CalendarSync,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            calendar,
        }
    }

    pub async fn load_tracker(&self) -> Result<Tracker, EngineError> {
        let app_data = self.store.read_range(sheets::APP_DATA, RowRange::all()).await?;
        let ledger_header = self
            .store
            .read_range(sheets::EXPECTATIONS, RowRange::single(1))
            .await?;
        let log_header = self
            .store
            .read_range(sheets::INCIDENTS, RowRange::single(1))
            .await?;
        reconcile::read_tracker(&app_data, &ledger_header, &log_header)
    }

    /// Processes a batch of newly reported incidents for `today`.
    pub async fn run(&self, batch: Vec<ReportedIncident>, today: NaiveDate) -> Result<RunSummary, EngineError> {
        let tracker = self.load_tracker().await?;
        if tracker.last_exported >= today {
            return Err(EngineError::AlreadyRun {
                last_exported: tracker.last_exported,
            });
        }

        let intake = intake::prepare(batch);
        info!(
            expectations = intake.expectations.len(),
            behaviour = intake.behaviour.len(),
            start_row = tracker.start_row,
            "processing incidents"
        );

        let rows = self
            .store
            .read_range(sheets::EXPECTATIONS, RowRange::from(tracker.start_row))
            .await?;
        let tail = reconcile::read_tail(&rows, &tracker.ledger_columns, tracker.start_row)?;
        let days = self.store.read_range(sheets::DETENTION_DAYS, RowRange::all()).await?;
        let pool = reconcile::read_detention_days(&days, today);
        if pool.is_empty() {
            warn!("no detention days after today; new incidents will stay unscheduled");
        } else {
            debug!(days = ?pool.days(), "detention days available");
        }
        let contacts = notify::read_contacts(&self.store.read_range(sheets::CONTACTS, RowRange::all()).await?);
        let templates =
            notify::read_templates(&self.store.read_range(sheets::EMAIL_TEMPLATES, RowRange::all()).await?);

        let plan = plan_run(&tracker, &tail, intake, &pool, today);
        let mut summary = RunSummary {
            scanned_rows: tail.row_count,
            resolved: plan.resolved,
            escalated: plan.escalated,
            cancelled: plan.cancelled.len(),
            logged: plan.log_rows.len(),
            appended: plan.writes.appends.len(),
            updated_cells: plan.writes.updates.len(),
            allocated: plan.allocation.assigned,
            unallocated: plan.allocation.unassigned,
            previous_start_row: tracker.start_row,
            new_start_row: plan.writes.new_start_row,
            ..RunSummary::default()
        };

        self.apply_ledger_writes(&tracker, &plan).await?;

        let emails = Mailer::new(self.config, &templates, &contacts).compose(&plan.active, today);
        summary.emails_queued = self.queue_emails(&emails).await;

        self.store
            .update_cells(
                sheets::APP_DATA,
                reconcile::tracker_updates(today, plan.writes.new_start_row),
            )
            .await?;

        if self.config.calendar_enabled() {
            let changes = calendar::plan_changes(plan.active.iter().chain(&plan.cancelled), self.config);
            summary.calendar_changes = calendar::apply(self.calendar, &changes).await;
        }

        info!(?summary, "run completed");
        Ok(summary)
    }

    /// Log appends, ledger appends, in-place updates, bottom-up deletions and
    /// the tail sort, committed together. A failure leaves both sheets as
    /// they were, so escalations cannot be half-applied.
    async fn apply_ledger_writes(&self, tracker: &Tracker, plan: &RunPlan) -> Result<(), EngineError> {
        let mut batch = Vec::new();
        if !plan.log_rows.is_empty() {
            batch.push(SheetWrite::Append {
                sheet: sheets::INCIDENTS.to_string(),
                rows: plan.log_rows.clone(),
            });
        }
        let writes = &plan.writes;
        if !writes.appends.is_empty() {
            batch.push(SheetWrite::Append {
                sheet: sheets::EXPECTATIONS.to_string(),
                rows: writes.appends.clone(),
            });
        }
        if !writes.updates.is_empty() {
            batch.push(SheetWrite::Update {
                sheet: sheets::EXPECTATIONS.to_string(),
                updates: writes.updates.clone(),
            });
        }
        if !writes.deletes.is_empty() {
            batch.push(SheetWrite::Delete {
                sheet: sheets::EXPECTATIONS.to_string(),
                rows: writes.deletes.clone(),
            });
        }
        let keys = reconcile::tail_sort_keys(&tracker.ledger_columns);
        if !keys.is_empty() {
            batch.push(SheetWrite::Sort {
                sheet: sheets::EXPECTATIONS.to_string(),
                first_row: writes.new_start_row,
                keys,
            });
        }
        if !batch.is_empty() {
            self.store.apply_batch(batch).await?;
        }
        Ok(())
    }

    /// Queues every email plus one drain trigger. Failures only delay
    /// notifications, so they are logged and the run carries on.
    async fn queue_emails(&self, emails: &[Email]) -> usize {
        let mut queued = 0;
        for email in emails {
            match self.config.retry.run("enqueue", || self.queue.enqueue(email)).await {
                Ok(_) => queued += 1,
                Err(err) => error!(to = %email.to, subject = %email.subject, error = %err, "failed to queue email"),
            }
        }
        if queued > 0 {
            if let Err(err) = self.config.retry.run("push_trigger", || self.queue.push_trigger()).await {
                error!(error = %err, "failed to queue drain trigger");
            }
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::memory::MemoryCalendar;
    use crate::config::test_config;
    use crate::error::StoreError;
    use crate::models::Status;
    use crate::notify::memory::MemoryQueue;
    use crate::store::memory::{describe, MemoryLedger};
    use crate::store::CellUpdate;
    use async_trait::async_trait;

    const LEDGER_HEADER: [&str; 14] = [
        "Date",
        "Forename",
        "Surname",
        "Reg",
        "Incident",
        "Period",
        "Class",
        "Staff",
        "StudentEmail",
        "ParentEmail",
        "ParentSalutation",
        "DetentionDate",
        "PreviousDetentionDate",
        "Status",
    ];
    const STATUS: usize = 13;
    const DETENTION: usize = 11;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()
    }

    fn ledger(last_exported: &str) -> MemoryLedger {
        MemoryLedger::default()
            .with_sheet(sheets::APP_DATA, vec![vec![last_exported], vec!["2"]])
            .with_sheet(
                sheets::EXPECTATIONS,
                vec![
                    LEDGER_HEADER.to_vec(),
                    vec!["1-Oct-26", "Ann", "Ash", "9A", "Late to lesson", "P1", "9A/Ma", "JBR", "ann@school.test", "", "", "6-Oct-26", "", "Resolved"],
                    vec!["2-Oct-26", "Ben", "Birch", "10B", "Swearing", "P2", "10B/En", "KLM", "ben@school.test", "home.ben@example.com", "", "9-Oct-26", "", "Escalate"],
                    vec!["5-Oct-26", "Cat", "Cole", "9C", "Mobile phone use", "P3", "", "", "cat@school.test", "", "", "14-Oct-26", "", ""],
                    vec!["6-Oct-26", "Dan", "Dale", "10A", "Late to lesson", "P4", "", "", "dan@school.test", "", "", "12-Oct-26", "", "Reschedule"],
                    vec!["7-Oct-26", "Eve", "Elm", "9B", "Out of class", "P5", "", "", "eve@school.test", "", "", "20-Oct-26", "", "Cancel"],
                    vec!["8-Oct-26", "Fay", "Fir", "9A", "Homework not complete", "P1", "", "", "fay@school.test", "parent.fay@example.com", "mr fir", "", "", ""],
                ],
            )
            .with_sheet(
                sheets::INCIDENTS,
                vec![vec!["Date", "Forename", "Surname", "Reg", "Incident", "Period", "Comments", "StudentEmail"]],
            )
            .with_sheet(
                sheets::DETENTION_DAYS,
                vec![vec!["13-Oct-26"], vec!["15-Oct-26"], vec!["16-Oct-26"], vec!["19-Oct-26"]],
            )
            .with_sheet(
                sheets::CONTACTS,
                vec![
                    vec!["Registers", "office@school.test"],
                    vec!["9", "hoy9@school.test"],
                    vec!["10", "hoy10@school.test"],
                ],
            )
            .with_sheet(
                sheets::EMAIL_TEMPLATES,
                (0..10).map(|_| vec!["Detention for {{Forename}}", "On {{DetentionDate}}"]).collect(),
            )
    }

    fn batch() -> Vec<ReportedIncident> {
        vec![
            ReportedIncident {
                date: today(),
                forename: "Gus".to_string(),
                surname: "Gale".to_string(),
                reg: "8D".to_string(),
                incident: "Expectation - Equipment not present".to_string(),
                student_email: "gus@school.test".to_string(),
                ..ReportedIncident::default()
            },
            ReportedIncident {
                date: today(),
                forename: "Ann".to_string(),
                surname: "Ash".to_string(),
                reg: "9A".to_string(),
                incident: "Fighting".to_string(),
                student_email: "ann@school.test".to_string(),
                ..ReportedIncident::default()
            },
        ]
    }

    #[tokio::test]
    async fn full_run_reconciles_ledger_and_advances_cursor() {
        let config = test_config();
        let store = ledger("13-Oct-26");
        let queue = MemoryQueue::default();
        let calendar = MemoryCalendar::default();

        let summary = Engine::new(&config, &store, &queue, &calendar)
            .run(batch(), today())
            .await
            .unwrap();

        assert_eq!(summary.scanned_rows, 6);
        assert_eq!(summary.resolved, 2);
        assert_eq!(summary.escalated, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.logged, 2);
        assert_eq!(summary.appended, 2);
        assert_eq!(summary.allocated, 4);
        assert_eq!(summary.unallocated, 0);
        assert_eq!(summary.new_start_row, 4);

        let app_data = store.sheet(sheets::APP_DATA);
        assert_eq!(app_data, vec![vec!["14-Oct-26".to_string()], vec!["4".to_string()]]);

        let expectations = store.sheet(sheets::EXPECTATIONS);
        assert_eq!(expectations.len(), 8);
        assert_eq!(expectations[2][STATUS], "Resolved");
        assert_eq!(expectations[3][1], "Cat");
        assert_eq!(expectations[3][STATUS], "Overdue");
        assert!(expectations.iter().all(|row| row[1] != "Eve"));
        assert!(expectations[4..].iter().all(|row| row[DETENTION] == "15-Oct-26"));

        let dan = expectations.iter().find(|row| row[1] == "Dan").unwrap();
        assert_eq!(dan[12], "12-Oct-26");
        assert_eq!(dan[STATUS], "");

        let log = store.sheet(sheets::INCIDENTS);
        assert_eq!(log.len(), 3);
        assert_eq!(log[1][4], "Fighting");
        assert_eq!(log[2][4], "Failure to attend detention");
        assert!(log[2][6].starts_with("Did not attend detention on Fri 9 Oct, for Swearing"));

        assert_eq!(queue.triggers(), 1);
        let emails = queue.pending();
        assert_eq!(emails.len(), summary.emails_queued);
        assert!(emails.iter().any(|e| e.to == "parent.fay@example.com"));
        assert!(!emails.iter().any(|e| e.to == "home.ben@example.com"));
        assert!(emails.iter().any(|e| e.to == "office@school.test" && e.attachment_html.is_some()));
        assert!(emails.iter().any(|e| e.subject.starts_with("Y9 Overdue Detentions")));

        assert_eq!(summary.calendar_changes, 6);
        assert_eq!(calendar.applied.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn cursor_is_written_after_every_ledger_mutation() {
        let config = test_config();
        let store = ledger("13-Oct-26");
        let queue = MemoryQueue::default();
        let calendar = MemoryCalendar::default();

        Engine::new(&config, &store, &queue, &calendar)
            .run(batch(), today())
            .await
            .unwrap();

        assert_eq!(
            store.operations(),
            vec![
                "append Incidents 2",
                "append Expectations 2",
                "update Expectations 12",
                "delete Expectations [6]",
                "sort Expectations 4",
                "update AppData 2",
            ]
        );
    }

    #[tokio::test]
    async fn refuses_to_run_twice_in_one_day() {
        let config = test_config();
        let store = ledger("14-Oct-26");
        let queue = MemoryQueue::default();
        let calendar = MemoryCalendar::default();

        let err = Engine::new(&config, &store, &queue, &calendar)
            .run(batch(), today())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::AlreadyRun { .. }));
        assert!(store.operations().is_empty());
    }

    #[tokio::test]
    async fn invalid_tracker_aborts_before_any_write() {
        let config = test_config();
        let store = ledger("13-Oct-26").with_sheet(sheets::APP_DATA, vec![vec!["13-Oct-26"]]);
        let queue = MemoryQueue::default();
        let calendar = MemoryCalendar::default();

        let err = Engine::new(&config, &store, &queue, &calendar)
            .run(batch(), today())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
        assert!(store.operations().is_empty());
    }

    #[tokio::test]
    async fn queue_outage_does_not_block_the_cursor() {
        let config = test_config();
        let store = ledger("13-Oct-26");
        let queue = MemoryQueue::failing();
        let calendar = MemoryCalendar::default();

        let summary = Engine::new(&config, &store, &queue, &calendar)
            .run(batch(), today())
            .await
            .unwrap();

        assert_eq!(summary.emails_queued, 0);
        assert_eq!(queue.triggers(), 0);
        assert_eq!(store.sheet(sheets::APP_DATA)[1], vec!["4".to_string()]);
    }

    #[tokio::test]
    async fn debug_recipient_skips_calendar() {
        let mut config = test_config();
        config.debug_recipient_email = Some("dev@school.test".to_string());
        let store = ledger("13-Oct-26");
        let queue = MemoryQueue::default();
        let calendar = MemoryCalendar::default();

        let summary = Engine::new(&config, &store, &queue, &calendar)
            .run(batch(), today())
            .await
            .unwrap();

        assert_eq!(summary.calendar_changes, 0);
        assert!(queue.pending().iter().all(|e| e.to == "dev@school.test"));
    }

    /// Delegates to a memory ledger but fails one kind of call.
    struct FailingLedger {
        inner: MemoryLedger,
        fail_sheet: &'static str,
        fail_on: &'static str,
    }

    impl FailingLedger {
        fn check(&self, op: &str, sheet: &str) -> Result<(), StoreError> {
            if op == self.fail_on && sheet == self.fail_sheet {
                Err(StoreError::Backend(format!("{op} unavailable")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl LedgerStore for FailingLedger {
        async fn read_range(&self, sheet: &str, range: RowRange) -> Result<Vec<Row>, StoreError> {
            self.inner.read_range(sheet, range).await
        }

        async fn append_rows(&self, sheet: &str, rows: Vec<Row>) -> Result<(), StoreError> {
            self.check("append", sheet)?;
            self.inner.append_rows(sheet, rows).await
        }

        async fn update_cells(&self, sheet: &str, updates: Vec<CellUpdate>) -> Result<(), StoreError> {
            self.check("update", sheet)?;
            self.inner.update_cells(sheet, updates).await
        }

        async fn apply_batch(&self, writes: Vec<SheetWrite>) -> Result<(), StoreError> {
            let failing = format!("{} {} ", self.fail_on, self.fail_sheet);
            if writes.iter().any(|write| describe(write).starts_with(&failing)) {
                return Err(StoreError::Backend(format!("{} unavailable", self.fail_on)));
            }
            self.inner.apply_batch(writes).await
        }
    }

    #[tokio::test]
    async fn store_failure_leaves_cursor_untouched() {
        let config = test_config();
        let store = FailingLedger {
            inner: ledger("13-Oct-26"),
            fail_sheet: sheets::EXPECTATIONS,
            fail_on: "delete",
        };
        let queue = MemoryQueue::default();
        let calendar = MemoryCalendar::default();

        let err = Engine::new(&config, &store, &queue, &calendar)
            .run(batch(), today())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(
            store.inner.sheet(sheets::APP_DATA),
            vec![vec!["13-Oct-26".to_string()], vec!["2".to_string()]]
        );
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn rerun_after_failed_cursor_write_does_not_escalate_twice() {
        let config = test_config();
        let store = FailingLedger {
            inner: ledger("13-Oct-26"),
            fail_sheet: sheets::APP_DATA,
            fail_on: "update",
        };
        let queue = MemoryQueue::default();
        let calendar = MemoryCalendar::default();

        let first = Engine::new(&config, &store, &queue, &calendar)
            .run(Vec::new(), today())
            .await;
        assert!(first.is_err());
        let logged_after_first = store.inner.sheet(sheets::INCIDENTS).len();
        let emails_after_first = queue.pending().len();

        let summary = Engine::new(&config, &store.inner, &queue, &calendar)
            .run(Vec::new(), today())
            .await
            .unwrap();

        assert_eq!(summary.escalated, 0);
        assert_eq!(summary.allocated, 0);
        assert_eq!(store.inner.sheet(sheets::INCIDENTS).len(), logged_after_first);
        assert_eq!(store.inner.sheet(sheets::APP_DATA)[0], vec!["14-Oct-26".to_string()]);
        // Only the contact lists are sent again; student emails are not repeated.
        let student_emails = queue
            .pending()
            .iter()
            .filter(|e| e.to.ends_with("@school.test") && !e.to.starts_with("hoy") && e.to != "office@school.test")
            .count();
        assert!(queue.pending().len() > emails_after_first);
        assert_eq!(student_emails, 3);
    }

    fn missed_detentions_for(rows: &[Row], forename: &str, incident_column: usize) -> usize {
        rows.iter()
            .filter(|row| row[1] == forename && row[incident_column] == escalation::MISSED_DETENTION)
            .count()
    }

    #[tokio::test]
    async fn interrupted_ledger_update_is_not_escalated_twice() {
        let config = test_config();
        let store = FailingLedger {
            inner: ledger("13-Oct-26"),
            fail_sheet: sheets::EXPECTATIONS,
            fail_on: "update",
        };
        let queue = MemoryQueue::default();
        let calendar = MemoryCalendar::default();
        let expectations_before = store.inner.sheet(sheets::EXPECTATIONS);
        let log_before = store.inner.sheet(sheets::INCIDENTS);

        let first = Engine::new(&config, &store, &queue, &calendar)
            .run(Vec::new(), today())
            .await;
        assert!(matches!(first, Err(EngineError::Store(_))));
        assert_eq!(store.inner.sheet(sheets::EXPECTATIONS), expectations_before);
        assert_eq!(store.inner.sheet(sheets::INCIDENTS), log_before);
        assert!(queue.pending().is_empty());

        let summary = Engine::new(&config, &store.inner, &queue, &calendar)
            .run(Vec::new(), today())
            .await
            .unwrap();

        assert_eq!(summary.escalated, 1);
        let expectations = store.inner.sheet(sheets::EXPECTATIONS);
        let log = store.inner.sheet(sheets::INCIDENTS);
        assert_eq!(missed_detentions_for(&expectations, "Ben", 4), 1);
        assert_eq!(missed_detentions_for(&log, "Ben", 4), 1);
        assert_eq!(
            expectations.iter().find(|row| row[1] == "Ben").map(|row| row[STATUS].as_str()),
            Some("Resolved")
        );
    }

    #[test]
    fn plan_assigns_same_student_consecutive_days() {
        let tracker = Tracker {
            last_exported: today(),
            start_row: 2,
            ledger_columns: crate::mapping::ColumnMapping::from_headers(&LEDGER_HEADER),
            log_columns: crate::mapping::ColumnMapping::from_headers(&["Date", "Forename", "Surname", "Incident"]),
        };
        let intake = Intake {
            expectations: vec![
                Incident {
                    student_email: "a@school.test".to_string(),
                    ..Incident::default()
                },
                Incident {
                    student_email: "a@school.test".to_string(),
                    ..Incident::default()
                },
            ],
            behaviour: Vec::new(),
        };
        let pool = DetentionDayPool::new(
            vec![today() + chrono::Duration::days(2), today() + chrono::Duration::days(3)],
            today(),
        );

        let plan = plan_run(&tracker, &ScannedTail { first_row: 2, ..ScannedTail::default() }, intake, &pool, today());

        let dates: Vec<_> = plan.active.iter().map(|i| i.detention_date).collect();
        assert_eq!(
            dates,
            vec![Some(today() + chrono::Duration::days(2)), Some(today() + chrono::Duration::days(3))]
        );
        assert!(plan.active.iter().all(|i| i.status == Status::Pending && i.email_required));
        assert_eq!(plan.writes.appends.len(), 2);
        assert_eq!(plan.writes.new_start_row, 2);
    }
}
