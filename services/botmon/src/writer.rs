//! Bulk persistence of accumulated batches.
//!
//! A batch is split by record kind (keeping accumulation order) and each
//! non-empty part becomes exactly one multi-row parameterized `INSERT`.

use crate::config::TableNames;
use crate::record::{InteractionEvent, LogEntry, Record};
use crate::sink::{Sink, SinkError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Columns of the interactions table, in parameter order
pub const INTERACTION_COLUMNS: [&str; 14] = [
    "date",
    "time",
    "id",
    "type",
    "user_id",
    "chat_id",
    "message_id",
    "text",
    "media",
    "is_inline",
    "is_forwarded",
    "is_reply",
    "was_edited",
    "result_id",
];

/// Columns of the logs table, in parameter order
pub const LOG_COLUMNS: [&str; 6] = ["date", "time", "update_id", "level", "message", "payload"];

/// A failed bulk insert
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Bulk insert of {rows} rows into {table} failed: {source}")]
    Rejected {
        table: String,
        rows: usize,
        #[source]
        source: SinkError,
    },
}

/// Statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    UInt(u64),
    Int(i64),
    Bool(bool),
    Str(String),
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Date(date) => serializer.serialize_str(&date.format("%Y-%m-%d").to_string()),
            SqlValue::DateTime(time) => {
                serializer.serialize_str(&time.format("%Y-%m-%d %H:%M:%S").to_string())
            }
            SqlValue::UInt(value) => serializer.serialize_u64(*value),
            SqlValue::Int(value) => serializer.serialize_i64(*value),
            // UInt8 columns
            SqlValue::Bool(value) => serializer.serialize_u8(u8::from(*value)),
            SqlValue::Str(value) => serializer.serialize_str(value),
        }
    }
}

/// One multi-row insert with positional `?` placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct BulkStatement {
    /// Target table
    pub table: String,
    /// SQL text
    pub sql: String,
    /// Parameters, row-major
    pub params: Vec<SqlValue>,
    /// Number of rows covered
    pub rows: usize,
}

impl BulkStatement {
    fn new(table: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let values = vec![placeholders.as_str(); rows.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            columns.join(", "),
            values
        );

        Self {
            table: table.to_string(),
            sql,
            rows: rows.len(),
            params: rows.into_iter().flatten().collect(),
        }
    }
}

/// Result of writing one batch
#[derive(Debug, Default)]
pub struct WriteOutcome {
    /// Statements issued
    pub statements: usize,
    /// Rows the sink accepted
    pub rows_written: usize,
    /// Rows lost to rejected statements
    pub rows_dropped: usize,
    pub failures: Vec<WriteError>,
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Writes batches of mixed records to a [`Sink`]
#[derive(Clone)]
pub struct BulkWriter {
    sink: Arc<dyn Sink>,
    tables: TableNames,
}

impl BulkWriter {
    pub fn new(sink: Arc<dyn Sink>, tables: TableNames) -> Self {
        Self { sink, tables }
    }

    /// Build the statements for a batch, interactions first
    pub fn build_statements(&self, batch: &[Record]) -> Vec<BulkStatement> {
        let mut interactions = Vec::new();
        let mut logs = Vec::new();

        for record in batch {
            match record {
                Record::Interaction(event) => {
                    interactions.push(interaction_row(record.date_bucket(), event))
                }
                Record::Log(entry) => logs.push(log_row(record.date_bucket(), entry)),
            }
        }

        let mut statements = Vec::with_capacity(2);
        if !interactions.is_empty() {
            statements.push(BulkStatement::new(
                &self.tables.interactions,
                &INTERACTION_COLUMNS,
                interactions,
            ));
        }
        if !logs.is_empty() {
            statements.push(BulkStatement::new(&self.tables.logs, &LOG_COLUMNS, logs));
        }
        statements
    }

    /// Persist a batch.
    ///
    /// Statements run concurrently and independently; a rejected statement
    /// does not affect the other one.
    #[instrument(skip(self, batch), fields(records = batch.len()))]
    pub async fn write(&self, batch: &[Record]) -> WriteOutcome {
        let statements = self.build_statements(batch);
        if statements.is_empty() {
            debug!("Empty batch, nothing to write");
            return WriteOutcome::default();
        }

        let results = futures::future::join_all(statements.iter().map(|statement| async move {
            (statement, self.sink.execute(statement).await)
        }))
        .await;

        let mut outcome = WriteOutcome {
            statements: statements.len(),
            ..Default::default()
        };

        for (statement, result) in results {
            match result {
                Ok(()) => {
                    debug!(table = %statement.table, rows = statement.rows, "Bulk insert done");
                    outcome.rows_written += statement.rows;
                }
                Err(source) => {
                    outcome.rows_dropped += statement.rows;
                    outcome.failures.push(WriteError::Rejected {
                        table: statement.table.clone(),
                        rows: statement.rows,
                        source,
                    });
                }
            }
        }

        outcome
    }
}

fn interaction_row(date: NaiveDate, event: &InteractionEvent) -> Vec<SqlValue> {
    vec![
        SqlValue::Date(date),
        SqlValue::DateTime(event.timestamp),
        SqlValue::UInt(event.event_id),
        SqlValue::Str(event.kind.as_str().to_string()),
        SqlValue::Int(event.actor_id),
        SqlValue::Int(event.conversation_id.unwrap_or_default()),
        SqlValue::Str(event.reference_id.clone()),
        SqlValue::Str(event.text.clone()),
        SqlValue::Str(
            event
                .media
                .map(|media| media.as_str().to_string())
                .unwrap_or_default(),
        ),
        SqlValue::Bool(event.is_inline),
        SqlValue::Bool(event.is_forwarded),
        SqlValue::Bool(event.is_reply),
        SqlValue::Bool(event.was_edited),
        SqlValue::Str(event.result_id.clone().unwrap_or_default()),
    ]
}

fn log_row(date: NaiveDate, entry: &LogEntry) -> Vec<SqlValue> {
    vec![
        SqlValue::Date(date),
        SqlValue::DateTime(entry.timestamp),
        SqlValue::UInt(entry.related_event_id),
        SqlValue::Str(entry.severity.as_str().to_string()),
        SqlValue::Str(entry.message.clone()),
        SqlValue::Str(entry.payload.clone().unwrap_or_default()),
    ]
}
