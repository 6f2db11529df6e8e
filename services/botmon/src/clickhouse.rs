//! ClickHouse implementation of [`Sink`].

use crate::config::{ClickHouseConfig, TableNames};
use crate::sink::{Sink, SinkError};
use crate::writer::BulkStatement;
use async_trait::async_trait;
use clickhouse::Client;
use tracing::{debug, info, instrument};

/// DDL for the interactions table
pub fn interactions_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    date Date,
    time DateTime('UTC'),
    id UInt64,
    type String,
    user_id Int64,
    chat_id Int64,
    message_id String,
    text String,
    media String,
    is_inline UInt8,
    is_forwarded UInt8,
    is_reply UInt8,
    was_edited UInt8,
    result_id String
) ENGINE = MergeTree()
PARTITION BY toYYYYMM(date)
ORDER BY (date, id, type, user_id)"
    )
}

/// DDL for the logs table
pub fn logs_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    date Date,
    time DateTime('UTC'),
    update_id UInt64,
    level String,
    message String,
    payload String
) ENGINE = MergeTree()
PARTITION BY toYYYYMM(date)
ORDER BY (date, update_id, level)"
    )
}

/// Sink writing into a ClickHouse database over HTTP
#[derive(Clone)]
pub struct ClickHouseSink {
    client: Client,
    tables: TableNames,
}

impl ClickHouseSink {
    pub fn new(config: &ClickHouseConfig, tables: TableNames) -> Self {
        Self {
            client: config.build_client(),
            tables,
        }
    }

    async fn ping(&self) -> Result<(), SinkError> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn create_table(&self, table: &str, ddl: String) -> Result<(), SinkError> {
        self.client
            .query(&ddl)
            .execute()
            .await
            .map_err(|e| SinkError::Schema {
                table: table.to_string(),
                message: e.to_string(),
            })?;
        debug!(table, "Table ready");
        Ok(())
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    #[instrument(skip(self))]
    async fn prepare(&self) -> Result<(), SinkError> {
        self.ping().await?;

        self.create_table(
            &self.tables.interactions,
            interactions_table_ddl(&self.tables.interactions),
        )
        .await?;
        self.create_table(&self.tables.logs, logs_table_ddl(&self.tables.logs))
            .await?;

        info!(
            interactions = %self.tables.interactions,
            logs = %self.tables.logs,
            "ClickHouse schema ready"
        );
        Ok(())
    }

    #[instrument(skip(self, statement), fields(table = %statement.table, rows = statement.rows))]
    async fn execute(&self, statement: &BulkStatement) -> Result<(), SinkError> {
        let mut query = self.client.query(&statement.sql);
        for param in &statement.params {
            query = query.bind(param);
        }

        query.execute().await.map_err(|e| SinkError::Rejected {
            table: statement.table.clone(),
            message: e.to_string(),
        })
    }
}
