//! Storage sink abstraction used by the bulk writer.

use crate::writer::BulkStatement;
use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink unreachable: {0}")]
    Unreachable(String),

    #[error("Failed to create table {table}: {message}")]
    Schema { table: String, message: String },

    #[error("Statement against {table} rejected: {message}")]
    Rejected { table: String, message: String },
}

/// Columnar store accepting parameterized bulk statements
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sink: Send + Sync {
    /// Check connectivity and create the tables if they are absent
    async fn prepare(&self) -> Result<(), SinkError>;

    /// Execute one bulk insert statement
    async fn execute(&self, statement: &BulkStatement) -> Result<(), SinkError>;
}
