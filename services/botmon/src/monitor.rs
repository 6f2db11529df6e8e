//! Producer-facing pipeline handle.

use crate::clickhouse::ClickHouseSink;
use crate::config::{Config, MonitorConfig};
use crate::engine::{BatchEngine, Control, PipelineStats, StatsSnapshot};
use crate::normalizer;
use crate::record::{LogEntry, Record, Severity};
use crate::sink::{Sink, SinkError};
use crate::update::RawEvent;
use crate::writer::BulkWriter;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const CONTROL_CAPACITY: usize = 16;

tokio::task_local! {
    static CURRENT_EVENT: u64;
}

/// Errors surfaced by the pipeline handle
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Sink setup failed: {0}")]
    Setup(#[from] SinkError),

    #[error("Pipeline is closed")]
    Closed,
}

struct Inner {
    records: mpsc::Sender<Record>,
    control: mpsc::Sender<Control>,
    stats: Arc<PipelineStats>,
    echo_logs: bool,
}

/// Cloneable handle to a running pipeline.
///
/// The engine keeps running until [`Monitor::close`] is called or every
/// clone of the handle has been dropped.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    /// Prepare the sink and start the engine.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(config: &MonitorConfig, sink: Arc<dyn Sink>) -> Result<Self, MonitorError> {
        sink.prepare().await?;

        let capacity = config.buffer_size();
        let (records_tx, records_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let stats = Arc::new(PipelineStats::default());

        let writer = BulkWriter::new(sink, config.tables.clone());
        let engine = BatchEngine::new(
            records_rx,
            control_rx,
            writer,
            capacity,
            config.tick_period(),
            stats.clone(),
        );
        tokio::spawn(engine.run());

        info!(
            buffer_size = capacity,
            tick_ms = config.tick_period().as_millis() as u64,
            "Monitor started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                records: records_tx,
                control: control_tx,
                stats,
                echo_logs: config.echo_logs,
            }),
        })
    }

    /// Connect to ClickHouse as configured and start the pipeline
    pub async fn connect(config: &Config) -> Result<Self, MonitorError> {
        let sink = ClickHouseSink::new(&config.clickhouse, config.monitor.tables.clone());
        Self::new(&config.monitor, Arc::new(sink)).await
    }

    /// Normalize and enqueue an upstream event.
    ///
    /// Waits while the queue is full. Returns `false` when the event carries
    /// nothing to record or the pipeline is closed.
    pub async fn submit<E: RawEvent + ?Sized>(&self, event: &E) -> bool {
        match normalizer::normalize(event) {
            Some(interaction) => self.enqueue(interaction.into()).await,
            None => {
                debug!(event_id = event.event_id(), "Event not applicable");
                self.inner.stats.record_skipped();
                false
            }
        }
    }

    /// Submit `event`, then run `handler` with the event as the current one.
    ///
    /// An error returned by the handler is also recorded as an error log
    /// entry.
    pub async fn handle<E, F, T, H>(&self, event: &E, handler: F) -> Result<T, H>
    where
        E: RawEvent + ?Sized,
        F: Future<Output = Result<T, H>>,
        H: fmt::Display,
    {
        self.submit(event).await;

        let event_id = event.event_id();
        let result = CURRENT_EVENT.scope(event_id, handler).await;
        if let Err(ref e) = result {
            self.log_for(event_id, Severity::Error, e.to_string(), None)
                .await;
        }
        result
    }

    /// Run `fut` with `event_id` as the current event for log entries
    pub async fn with_event<F: Future>(&self, event_id: u64, fut: F) -> F::Output {
        CURRENT_EVENT.scope(event_id, fut).await
    }

    /// Event being handled by the calling task, 0 outside of a handler
    pub fn current_event() -> u64 {
        CURRENT_EVENT.try_with(|id| *id).unwrap_or(0)
    }

    /// Enqueue a log entry related to the current event
    pub async fn log(
        &self,
        severity: Severity,
        message: impl Into<String>,
        payload: Option<Value>,
    ) -> bool {
        self.log_for(Self::current_event(), severity, message, payload)
            .await
    }

    /// Enqueue a log entry related to `event_id`
    pub async fn log_for(
        &self,
        event_id: u64,
        severity: Severity,
        message: impl Into<String>,
        payload: Option<Value>,
    ) -> bool {
        let entry = LogEntry::new(event_id, severity, message, payload.as_ref());
        if self.inner.echo_logs {
            echo(&entry);
        }
        self.enqueue(entry.into()).await
    }

    pub async fn debug(&self, message: impl Into<String>, payload: Option<Value>) -> bool {
        self.log(Severity::Debug, message, payload).await
    }

    pub async fn info(&self, message: impl Into<String>, payload: Option<Value>) -> bool {
        self.log(Severity::Info, message, payload).await
    }

    pub async fn warn(&self, message: impl Into<String>, payload: Option<Value>) -> bool {
        self.log(Severity::Warn, message, payload).await
    }

    pub async fn error(&self, message: impl Into<String>, payload: Option<Value>) -> bool {
        self.log(Severity::Error, message, payload).await
    }

    /// Flush everything enqueued so far and wait for the write to finish.
    ///
    /// Succeeds even when the sink rejected the batch.
    pub async fn flush(&self) -> Result<(), MonitorError> {
        self.request(Control::Flush).await
    }

    /// Stop accepting records, flush what is pending and stop the engine
    pub async fn close(&self) -> Result<(), MonitorError> {
        self.request(Control::Close).await?;
        info!("Monitor closed");
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    async fn request(
        &self,
        control: impl FnOnce(oneshot::Sender<()>) -> Control,
    ) -> Result<(), MonitorError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .control
            .send(control(done_tx))
            .await
            .map_err(|_| MonitorError::Closed)?;
        done_rx.await.map_err(|_| MonitorError::Closed)
    }

    async fn enqueue(&self, record: Record) -> bool {
        match self.inner.records.send(record).await {
            Ok(()) => {
                self.inner.stats.record_enqueued();
                true
            }
            Err(_) => {
                debug!("Pipeline closed, record discarded");
                false
            }
        }
    }
}

/// Mirror a log entry to tracing at its own level.
///
/// The payload is attached as a compact JSON string field; layout and level
/// casing are left to the installed subscriber.
fn echo(entry: &LogEntry) {
    let event_id = entry.related_event_id;
    let payload = entry.payload.as_deref().unwrap_or_default();
    match entry.severity {
        Severity::Debug => debug!(event_id, payload, "{}", entry.message),
        Severity::Info => info!(event_id, payload, "{}", entry.message),
        Severity::Warn => warn!(event_id, payload, "{}", entry.message),
        Severity::Error => error!(event_id, payload, "{}", entry.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::sink::testing::RecordingSink;
    use crate::sink::MockSink;
    use crate::update::{Chat, Message, Update, User};
    use crate::writer::{BulkStatement, SqlValue};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time;

    /// Sink whose inserts wait until released
    struct GatedSink {
        gate: Semaphore,
        rows: AtomicUsize,
    }

    impl GatedSink {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                rows: AtomicUsize::new(0),
            }
        }

        fn release(&self) {
            self.gate.add_permits(1000);
        }
    }

    #[async_trait]
    impl Sink for GatedSink {
        async fn prepare(&self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn execute(&self, statement: &BulkStatement) -> Result<(), SinkError> {
            self.gate.acquire().await.unwrap().forget();
            self.rows.fetch_add(statement.rows, Ordering::SeqCst);
            Ok(())
        }
    }

    fn update(id: u64) -> Update {
        Update {
            update_id: id,
            message: Some(Message {
                message_id: id as i64,
                from: Some(User {
                    id: 42,
                    first_name: "Test".to_string(),
                    ..Default::default()
                }),
                chat: Some(Chat {
                    id: 100,
                    kind: "private".to_string(),
                }),
                text: Some(format!("message {}", id)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn start(buffer_size: usize) -> (Monitor, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = MonitorConfig::default()
            .with_buffer_size(buffer_size)
            .with_tick_period(Duration::from_secs(5));
        let monitor = Monitor::new(&config, sink.clone()).await.unwrap();
        (monitor, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_partial_batch() {
        let (monitor, sink) = start(1000).await;

        for id in 1..=999 {
            assert!(monitor.submit(&update(id)).await);
        }

        time::sleep(Duration::from_millis(4900)).await;
        assert!(sink.statements().is_empty());

        time::sleep(Duration::from_millis(200)).await;
        let statements = sink.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].table, "updates");
        assert_eq!(statements[0].rows, 999);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_flush_without_timer() {
        let (monitor, sink) = start(1000).await;

        for id in 1..=1000 {
            monitor.submit(&update(id)).await;
        }
        time::sleep(Duration::from_millis(10)).await;

        let statements = sink.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].rows, 1000);
        assert_eq!(monitor.stats().rows_persisted, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_entry_reaches_log_table() {
        let (monitor, sink) = start(1000).await;

        assert!(
            monitor
                .log_for(42, Severity::Error, "boom", Some(json!({"x": 1})))
                .await
        );
        monitor.flush().await.unwrap();

        let statements = sink.statements();
        assert_eq!(statements.len(), 1);
        let params = &statements[0].params;
        assert_eq!(statements[0].table, "log");
        assert_eq!(statements[0].rows, 1);
        assert_eq!(params[2], SqlValue::UInt(42));
        assert_eq!(params[3], SqlValue::Str("error".to_string()));
        assert_eq!(params[4], SqlValue::Str("boom".to_string()));
        assert_eq!(params[5], SqlValue::Str(r#"{"x":1}"#.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_write_does_not_hang_flush() {
        let (monitor, sink) = start(1000).await;
        sink.set_failing(true);

        monitor.submit(&update(1)).await;
        monitor.flush().await.unwrap();
        assert_eq!(monitor.stats().rows_dropped, 1);

        sink.set_failing(false);
        monitor.flush().await.unwrap();
        assert_eq!(sink.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush_issues_nothing() {
        let (monitor, sink) = start(1000).await;

        monitor.flush().await.unwrap();
        assert_eq!(sink.attempts(), 0);
        assert_eq!(monitor.stats().flushes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_batch_issues_one_statement_per_kind() {
        let (monitor, sink) = start(1000).await;

        monitor.submit(&update(1)).await;
        monitor.info("first", None).await;
        monitor.submit(&update(2)).await;
        monitor.flush().await.unwrap();

        let statements = sink.statements();
        assert_eq!(statements.len(), 2);
        let tables: Vec<_> = statements.iter().map(|s| s.table.as_str()).collect();
        assert!(tables.contains(&"updates") && tables.contains(&"log"));
        assert_eq!(monitor.stats().rows_persisted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_applicable_events_are_not_enqueued() {
        let (monitor, sink) = start(1000).await;

        let mut anonymous = update(1);
        if let Some(message) = anonymous.message.as_mut() {
            message.from = None;
        }
        let mut service = update(2);
        if let Some(message) = service.message.as_mut() {
            message.text = None;
            message.group_chat_created = true;
        }

        assert!(!monitor.submit(&anonymous).await);
        assert!(!monitor.submit(&service).await);
        assert!(!monitor.submit(&Update::default()).await);

        monitor.flush().await.unwrap();
        let stats = monitor.stats();
        assert_eq!(stats.records_enqueued, 0);
        assert_eq!(stats.records_skipped, 3);
        assert!(sink.statements().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_pipeline() {
        let (monitor, sink) = start(1000).await;

        monitor.submit(&update(1)).await;
        monitor.close().await.unwrap();
        assert_eq!(sink.statements().len(), 1);

        assert!(!monitor.submit(&update(2)).await);
        assert!(!monitor.info("late", None).await);

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.attempts(), 1);

        assert!(matches!(monitor.close().await, Err(MonitorError::Closed)));
        assert!(matches!(monitor.flush().await, Err(MonitorError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_logged_against_event() {
        let (monitor, sink) = start(1000).await;

        let result: Result<(), String> = monitor
            .handle(&update(7), async {
                assert_eq!(Monitor::current_event(), 7);
                Err("handler failed".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(Monitor::current_event(), 0);

        monitor.flush().await.unwrap();
        let log = sink
            .statements()
            .into_iter()
            .find(|s| s.table == "log")
            .unwrap();
        assert_eq!(log.params[2], SqlValue::UInt(7));
        assert_eq!(log.params[3], SqlValue::Str("error".to_string()));
        assert_eq!(log.params[4], SqlValue::Str("handler failed".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_uses_current_event() {
        let (monitor, sink) = start(1000).await;

        monitor
            .with_event(9, async {
                monitor.warn("inside", None).await;
            })
            .await;
        monitor.warn("outside", None).await;
        monitor.flush().await.unwrap();

        let statements = sink.statements();
        let params = &statements[0].params;
        assert_eq!(params[2], SqlValue::UInt(9));
        assert_eq!(params[6 + 2], SqlValue::UInt(0));
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported() {
        let mut sink = MockSink::new();
        sink.expect_prepare()
            .times(1)
            .returning(|| Err(SinkError::Unreachable("connection refused".to_string())));
        sink.expect_execute().never();

        let result = Monitor::new(&MonitorConfig::default(), Arc::new(sink)).await;
        assert!(matches!(
            result,
            Err(MonitorError::Setup(SinkError::Unreachable(_)))
        ));
    }

    #[tokio::test]
    async fn test_custom_tables_are_used() {
        let sink = Arc::new(RecordingSink::default());
        let config = MonitorConfig {
            tables: TableNames {
                interactions: "bot_updates".to_string(),
                logs: "bot_log".to_string(),
            },
            ..Default::default()
        };

        let monitor = Monitor::new(&config, sink.clone()).await.unwrap();
        monitor.submit(&update(1)).await;
        monitor.close().await.unwrap();

        assert_eq!(sink.statements()[0].table, "bot_updates");
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_waits_while_queue_is_full() {
        let sink = Arc::new(GatedSink::new());
        let config = MonitorConfig::default()
            .with_buffer_size(2)
            .with_tick_period(Duration::from_secs(60));
        let monitor = Monitor::new(&config, sink.clone()).await.unwrap();

        // Two records fill the accumulator and block the flush, two more fill the queue
        for id in 1..=4 {
            assert!(monitor.submit(&update(id)).await);
        }

        let producer = monitor.clone();
        let pending = tokio::spawn(async move { producer.submit(&update(5)).await });

        time::sleep(Duration::from_secs(1)).await;
        assert!(!pending.is_finished());
        assert_eq!(monitor.stats().records_enqueued, 4);

        sink.release();
        assert!(pending.await.unwrap());

        monitor.flush().await.unwrap();
        assert_eq!(sink.rows.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flushes_each_see_their_records() {
        let (monitor, sink) = start(1000).await;

        let callers = (1..=8u64).map(|caller| {
            let monitor = monitor.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                monitor
                    .log_for(caller, Severity::Info, format!("caller {}", caller), None)
                    .await;
                monitor.flush().await.unwrap();

                sink.statements()
                    .iter()
                    .filter(|s| s.table == "log")
                    .flat_map(|s| s.params.chunks(6))
                    .any(|row| row[2] == SqlValue::UInt(caller))
            })
        });

        for persisted in futures::future::join_all(callers).await {
            assert!(persisted.unwrap());
        }
        assert_eq!(monitor.stats().rows_persisted, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echoed_entry_is_still_persisted_compact() {
        let sink = Arc::new(RecordingSink::default());
        let config = MonitorConfig::default().with_echo_logs(true);
        let monitor = Monitor::new(&config, sink.clone()).await.unwrap();

        monitor
            .warn("disk low", Some(json!({"free": 5, "unit": "gb"})))
            .await;
        monitor.flush().await.unwrap();

        let params = &sink.statements()[0].params;
        assert_eq!(params[3], SqlValue::Str("warn".to_string()));
        assert_eq!(
            params[5],
            SqlValue::Str(r#"{"free":5,"unit":"gb"}"#.to_string())
        );
    }
}
