//! Batching and flush engine.
//!
//! A single task owns the accumulator. Producers reach it only through the
//! bounded records queue; flush and close requests arrive on a separate
//! control channel, each carrying its own completion sender.

use crate::record::Record;
use crate::writer::BulkWriter;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

/// Request sent to the engine on the control channel
#[derive(Debug)]
pub(crate) enum Control {
    /// Drain the queue, flush, then signal completion
    Flush(oneshot::Sender<()>),
    /// Stop accepting records, drain, flush a last time, then exit
    Close(oneshot::Sender<()>),
}

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Capacity,
    Timer,
    Explicit,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Capacity => "capacity",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Explicit => "explicit",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Pipeline counters shared between the handle and the engine
#[derive(Debug, Default)]
pub struct PipelineStats {
    records_enqueued: AtomicU64,
    records_skipped: AtomicU64,
    flushes: AtomicU64,
    rows_persisted: AtomicU64,
    rows_dropped: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records_enqueued: u64,
    pub records_skipped: u64,
    pub flushes: u64,
    pub rows_persisted: u64,
    pub rows_dropped: u64,
}

impl PipelineStats {
    pub(crate) fn record_enqueued(&self) {
        self.records_enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("botmon.records.enqueued").increment(1);
    }

    pub(crate) fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("botmon.records.skipped").increment(1);
    }

    fn flushed(&self, persisted: usize, dropped: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.rows_persisted
            .fetch_add(persisted as u64, Ordering::Relaxed);
        self.rows_dropped.fetch_add(dropped as u64, Ordering::Relaxed);

        metrics::counter!("botmon.flush.count").increment(1);
        metrics::counter!("botmon.rows.persisted").increment(persisted as u64);
        metrics::counter!("botmon.rows.dropped").increment(dropped as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            rows_persisted: self.rows_persisted.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
        }
    }
}

/// The coordinating task behind a [`Monitor`](crate::monitor::Monitor)
pub(crate) struct BatchEngine {
    records: mpsc::Receiver<Record>,
    control: mpsc::Receiver<Control>,
    writer: BulkWriter,
    buffer: Vec<Record>,
    capacity: usize,
    tick_period: Duration,
    stats: Arc<PipelineStats>,
}

impl BatchEngine {
    pub(crate) fn new(
        records: mpsc::Receiver<Record>,
        control: mpsc::Receiver<Control>,
        writer: BulkWriter,
        capacity: usize,
        tick_period: Duration,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            records,
            control,
            writer,
            buffer: Vec::with_capacity(capacity),
            capacity,
            tick_period,
            stats,
        }
    }

    /// Run until closed or until every producer handle is gone
    #[instrument(skip(self), fields(capacity = self.capacity, tick_ms = self.tick_period.as_millis() as u64))]
    pub(crate) async fn run(mut self) {
        let mut ticker = time::interval_at(Instant::now() + self.tick_period, self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Batch engine started");

        loop {
            tokio::select! {
                biased;

                control = self.control.recv() => match control {
                    Some(Control::Flush(done)) => {
                        self.drain_queued().await;
                        self.flush(FlushTrigger::Explicit).await;
                        let _ = done.send(());
                    }
                    Some(Control::Close(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.flush(FlushTrigger::Timer).await;
                }
                record = self.records.recv() => match record {
                    Some(record) => self.accept(record).await,
                    None => {
                        debug!("All producers gone");
                        self.flush(FlushTrigger::Shutdown).await;
                        break;
                    }
                },
            }
        }

        info!("Batch engine stopped");
    }

    async fn accept(&mut self, record: Record) {
        self.buffer.push(record);
        if self.buffer.len() >= self.capacity {
            self.flush(FlushTrigger::Capacity).await;
        }
    }

    /// Move everything already queued into the accumulator.
    ///
    /// Bounded by the queue capacity so producers that keep sending cannot
    /// starve the pending request.
    async fn drain_queued(&mut self) {
        for _ in 0..self.capacity {
            match self.records.try_recv() {
                Ok(record) => self.accept(record).await,
                Err(_) => break,
            }
        }
    }

    async fn shutdown(&mut self) {
        self.records.close();
        while let Some(record) = self.records.recv().await {
            self.accept(record).await;
        }
        self.flush(FlushTrigger::Shutdown).await;
    }

    /// Hand the accumulator to the writer; it is empty afterwards whatever
    /// the outcome.
    #[instrument(skip(self, trigger), fields(trigger = trigger.as_str(), records = self.buffer.len()))]
    async fn flush(&mut self, trigger: FlushTrigger) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity));
        let outcome = self.writer.write(&batch).await;

        for failure in &outcome.failures {
            error!(error = %failure, "Batch dropped");
        }

        self.stats
            .flushed(outcome.rows_written, outcome.rows_dropped);

        debug!(
            statements = outcome.statements,
            persisted = outcome.rows_written,
            dropped = outcome.rows_dropped,
            "Flush complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::record::{LogEntry, Severity};
    use crate::sink::testing::RecordingSink;

    struct Harness {
        records: mpsc::Sender<Record>,
        control: mpsc::Sender<Control>,
        sink: Arc<RecordingSink>,
        stats: Arc<PipelineStats>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_engine(capacity: usize, tick: Duration) -> Harness {
        let (records_tx, records_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::channel(8);
        let sink = Arc::new(RecordingSink::default());
        let stats = Arc::new(PipelineStats::default());
        let writer = BulkWriter::new(sink.clone(), TableNames::default());

        let engine = BatchEngine::new(records_rx, control_rx, writer, capacity, tick, stats.clone());
        let task = tokio::spawn(engine.run());

        Harness {
            records: records_tx,
            control: control_tx,
            sink,
            stats,
            task,
        }
    }

    fn entry(n: u64) -> Record {
        LogEntry::new(n, Severity::Info, format!("entry {}", n), None).into()
    }

    async fn request_flush(control: &mpsc::Sender<Control>) {
        let (done_tx, done_rx) = oneshot::channel();
        control.send(Control::Flush(done_tx)).await.unwrap();
        done_rx.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_flush_at_threshold() {
        let harness = spawn_engine(3, Duration::from_secs(60));

        for n in 0..7 {
            harness.records.send(entry(n)).await.unwrap();
        }
        time::sleep(Duration::from_millis(1)).await;

        let statements = harness.sink.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|s| s.rows == 3));

        // The seventh record is still pending
        request_flush(&harness.control).await;
        let statements = harness.sink.statements();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[2].rows, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_skips_empty_accumulator() {
        let harness = spawn_engine(10, Duration::from_secs(1));

        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(harness.sink.attempts(), 0);
        assert_eq!(harness.stats.snapshot().flushes, 0);

        harness.records.send(entry(1)).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.sink.statements().len(), 1);
        assert_eq!(harness.stats.snapshot().flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_flush_includes_records_sent_before_request() {
        let harness = spawn_engine(100, Duration::from_secs(60));

        for n in 0..5 {
            harness.records.send(entry(n)).await.unwrap();
        }
        request_flush(&harness.control).await;

        let statements = harness.sink.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].rows, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_drops_batch() {
        let harness = spawn_engine(100, Duration::from_secs(60));
        harness.sink.set_failing(true);

        harness.records.send(entry(1)).await.unwrap();
        request_flush(&harness.control).await;

        harness.sink.set_failing(false);
        request_flush(&harness.control).await;

        assert_eq!(harness.sink.attempts(), 1);
        assert!(harness.sink.statements().is_empty());
        let stats = harness.stats.snapshot();
        assert_eq!(stats.rows_dropped, 1);
        assert_eq!(stats.rows_persisted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_and_stops() {
        let harness = spawn_engine(100, Duration::from_secs(1));

        harness.records.send(entry(1)).await.unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        harness.control.send(Control::Close(done_tx)).await.unwrap();
        done_rx.await.unwrap();

        assert_eq!(harness.sink.statements().len(), 1);
        assert!(harness.records.send(entry(2)).await.is_err());

        harness.task.await.unwrap();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.sink.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_producers_flushes_remainder() {
        let harness = spawn_engine(100, Duration::from_secs(60));

        harness.records.send(entry(1)).await.unwrap();
        harness.records.send(entry(2)).await.unwrap();

        let Harness {
            records,
            control,
            sink,
            task,
            ..
        } = harness;
        drop(records);
        drop(control);
        task.await.unwrap();

        let statements = sink.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].rows, 2);
    }
}
