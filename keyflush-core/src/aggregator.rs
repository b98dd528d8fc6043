//! The aggregator buffers records per key and flushes them to the [Sink] once they are final.
//!
//! A record is final when the global threshold (minimum watermark across all sources) has reached
//! its event time: every source has then produced something later (or finished), and since every
//! source is ordered, nothing earlier can still arrive. Flushed records are written in event-time
//! order per key, ties broken by arrival order, and are evicted from memory.
//!
//! The buffer and the watermark table are owned by a single actor task. Every request
//! (ingest, completion, flush) is a message handled to completion before the next one is looked
//! at, so a flush always sees a consistent view of both and can never interleave with an ingest.
//! [AggregatorHandle] is the cloneable front used by the source readers and the coordinator.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::message::{BufferedRecord, ParsedRecord, SourceId};
use crate::sink::Sink;
use crate::watermark::{Watermark, WatermarkTable};

const DEFAULT_FLUSH_EVERY: usize = 1;
const DEFAULT_SINK_MAX_RETRY_ATTEMPTS: u16 = 3;
const DEFAULT_SINK_RETRY_INTERVAL_MS: u64 = 10;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Tuning of the aggregator. None of these affect correctness, only how soon records leave
/// memory.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Number of ingest requests between automatic flushes. Completion events always trigger one.
    /// `0` disables automatic flushing entirely.
    pub flush_every: usize,
    /// Optional periodic flush.
    pub flush_interval: Option<Duration>,
    /// How many times a failed sink write is retried before the flush gives up.
    pub sink_max_retry_attempts: u16,
    pub sink_retry_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_every: DEFAULT_FLUSH_EVERY,
            flush_interval: None,
            sink_max_retry_attempts: DEFAULT_SINK_MAX_RETRY_ATTEMPTS,
            sink_retry_interval: Duration::from_millis(DEFAULT_SINK_RETRY_INTERVAL_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// global threshold the pass flushed up to
    pub threshold: Watermark,
    /// records written to the sink
    pub flushed: usize,
    /// keys that had at least one record written
    pub keys: usize,
}

impl FlushStats {
    fn empty(threshold: Watermark) -> Self {
        Self {
            threshold,
            flushed: 0,
            keys: 0,
        }
    }
}

/// Counters over the whole lifetime of an aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub ingested: u64,
    pub flushed: u64,
    /// records currently waiting in the buffer
    pub buffered: usize,
    /// keys currently present in the buffer
    pub keys: usize,
    /// records that arrived with an event time below a threshold that was already flushed
    pub late: u64,
    pub sink_failures: u64,
}

/// Buffer, watermark table and sink. Only ever touched by one task at a time.
struct AggregatorState<S> {
    buffer: BTreeMap<String, Vec<BufferedRecord>>,
    watermarks: WatermarkTable,
    sink: S,
    config: AggregatorConfig,
    next_sequence: u64,
    /// highest threshold a pass has flushed up to
    flushed_threshold: Watermark,
    finalized: bool,
    stats: AggregatorStats,
}

impl<S> AggregatorState<S>
where
    S: Sink,
{
    fn new(sources: Vec<SourceId>, sink: S, config: AggregatorConfig) -> Self {
        Self {
            buffer: BTreeMap::new(),
            watermarks: WatermarkTable::new(sources),
            sink,
            config,
            next_sequence: 0,
            flushed_threshold: Watermark::Unseen,
            finalized: false,
            stats: AggregatorStats::default(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::Aggregator(
                "aggregator has already been finalized".to_string(),
            ));
        }
        Ok(())
    }

    /// Buffers the record under its key and advances the watermark of the source. A record behind
    /// the source's watermark is still buffered but does not move the watermark back.
    fn ingest(&mut self, source: &str, record: ParsedRecord) -> Result<()> {
        self.ensure_open()?;

        if !self.watermarks.advance(source, record.event_time)? {
            debug!(
                source,
                key = %record.key,
                event_time = %record.event_time,
                "Out of order record, watermark not advanced"
            );
        }

        // equal to the flushed threshold is still in order, ties go by arrival
        if Watermark::At(record.event_time) < self.flushed_threshold {
            // it will go out with the next pass, possibly after later records of the same key
            self.stats.late += 1;
            warn!(
                source,
                key = %record.key,
                event_time = %record.event_time,
                flushed_up_to = %self.flushed_threshold,
                "Late record arrived after its threshold was flushed"
            );
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.buffer
            .entry(record.key)
            .or_default()
            .push(BufferedRecord {
                event_time: record.event_time,
                sequence,
                payload: record.payload,
            });
        self.stats.ingested += 1;
        Ok(())
    }

    fn mark_source_complete(&mut self, source: &str) -> Result<()> {
        self.ensure_open()?;
        self.watermarks.complete(source)
    }

    async fn flush_if_possible(&mut self) -> Result<FlushStats> {
        self.ensure_open()?;
        let threshold = self.watermarks.global_threshold();
        self.flush_up_to(threshold).await
    }

    async fn final_flush(&mut self) -> Result<FlushStats> {
        self.ensure_open()?;
        if !self.watermarks.all_complete() {
            warn!(watermarks = ?self.watermarks.snapshot(), "Final flush while some sources are not complete");
        }
        let stats = self.flush_up_to(Watermark::Complete).await?;
        self.finalized = true;
        info!(
            flushed = stats.flushed,
            keys = stats.keys,
            total_flushed = self.stats.flushed,
            "Final flush done"
        );
        Ok(stats)
    }

    /// Writes every buffered record at or below `threshold` and evicts it. The flush set of a key
    /// is taken out of the buffer before anything is written; whatever could not be written is
    /// put back, so a failing sink never loses records.
    async fn flush_up_to(&mut self, threshold: Watermark) -> Result<FlushStats> {
        let mut stats = FlushStats::empty(threshold);
        if threshold == Watermark::Unseen {
            return Ok(stats);
        }

        let ready_keys: Vec<String> = self
            .buffer
            .iter()
            .filter(|(_, records)| records.iter().any(|r| threshold.covers(r.event_time)))
            .map(|(key, _)| key.clone())
            .collect();

        for key in ready_keys {
            let Some(records) = self.buffer.remove(&key) else {
                continue;
            };
            let (mut ready, pending): (Vec<_>, Vec<_>) = records
                .into_iter()
                .partition(|r| threshold.covers(r.event_time));
            ready.sort_by_key(|r| (r.event_time, r.sequence));

            let mut written = 0;
            let mut failure = None;
            for record in &ready {
                if let Err(e) = self.write_with_retry(&key, record).await {
                    failure = Some(e);
                    break;
                }
                written += 1;
            }

            let mut remaining = ready.split_off(written);
            remaining.extend(pending);
            if !remaining.is_empty() {
                self.buffer.insert(key.clone(), remaining);
            }

            stats.flushed += written;
            self.stats.flushed += written as u64;
            if written > 0 {
                stats.keys += 1;
            }

            if let Some(e) = failure {
                self.stats.sink_failures += 1;
                error!(key = %key, error = ?e, written, "Sink write failed, unwritten records stay buffered");
                if let Err(flush_err) = self.sink.flush().await {
                    error!(error = ?flush_err, "Failed to flush sink after write failure");
                }
                return Err(e);
            }
        }

        if stats.flushed > 0 {
            self.sink.flush().await?;
        }
        if threshold > self.flushed_threshold {
            self.flushed_threshold = threshold;
        }

        debug!(
            threshold = %threshold,
            flushed = stats.flushed,
            keys = stats.keys,
            buffered_keys = self.buffer.len(),
            "Flush pass done"
        );
        Ok(stats)
    }

    async fn write_with_retry(&mut self, key: &str, record: &BufferedRecord) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.sink.write(key, record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts < self.config.sink_max_retry_attempts => {
                    attempts += 1;
                    warn!(key, attempts, error = ?e, "Retrying sink write");
                    tokio::time::sleep(self.config.sink_retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            buffered: self.buffer.values().map(Vec::len).sum(),
            keys: self.buffer.len(),
            ..self.stats
        }
    }
}

enum ActorMessage {
    Ingest {
        source: SourceId,
        records: Vec<ParsedRecord>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Complete {
        source: SourceId,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Flush {
        respond_to: oneshot::Sender<Result<FlushStats>>,
    },
    FinalFlush {
        respond_to: oneshot::Sender<Result<FlushStats>>,
    },
    Stats {
        respond_to: oneshot::Sender<AggregatorStats>,
    },
    Watermarks {
        respond_to: oneshot::Sender<Vec<(SourceId, Watermark)>>,
    },
}

struct AggregatorActor<S> {
    receiver: mpsc::Receiver<ActorMessage>,
    state: AggregatorState<S>,
    ingests_since_flush: usize,
}

impl<S> AggregatorActor<S>
where
    S: Sink,
{
    fn new(receiver: mpsc::Receiver<ActorMessage>, state: AggregatorState<S>) -> Self {
        Self {
            receiver,
            state,
            ingests_since_flush: 0,
        }
    }

    async fn run(mut self) {
        let mut ticker = self.state.config.flush_interval.map(|period| {
            // first tick one period from now, not immediately
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
                _ = tick(&mut ticker) => self.auto_flush("interval").await,
            }
        }

        let stats = self.state.stats();
        if stats.buffered > 0 {
            warn!(
                buffered = stats.buffered,
                keys = stats.keys,
                "Aggregator stopped with unflushed records"
            );
        }
        debug!(?stats, "Aggregator stopped");
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Ingest {
                source,
                records,
                respond_to,
            } => {
                let result = records
                    .into_iter()
                    .try_for_each(|record| self.state.ingest(&source, record));
                let ingested = result.is_ok();
                let _ = respond_to.send(result);

                if ingested {
                    self.ingests_since_flush += 1;
                    let flush_every = self.state.config.flush_every;
                    if flush_every > 0 && self.ingests_since_flush >= flush_every {
                        self.auto_flush("ingest").await;
                    }
                }
            }
            ActorMessage::Complete { source, respond_to } => {
                let result = self.state.mark_source_complete(&source);
                let completed = result.is_ok();
                let _ = respond_to.send(result);

                if completed && self.state.config.flush_every > 0 {
                    self.auto_flush("source complete").await;
                }
            }
            ActorMessage::Flush { respond_to } => {
                self.ingests_since_flush = 0;
                let _ = respond_to.send(self.state.flush_if_possible().await);
            }
            ActorMessage::FinalFlush { respond_to } => {
                self.ingests_since_flush = 0;
                let _ = respond_to.send(self.state.final_flush().await);
            }
            ActorMessage::Stats { respond_to } => {
                let _ = respond_to.send(self.state.stats());
            }
            ActorMessage::Watermarks { respond_to } => {
                let _ = respond_to.send(self.state.watermarks.snapshot());
            }
        }
    }

    /// Flush nobody is waiting for. Failures are logged and the records stay buffered for the
    /// next pass.
    async fn auto_flush(&mut self, trigger: &'static str) {
        self.ingests_since_flush = 0;
        if self.state.finalized {
            return;
        }
        if let Err(e) = self.state.flush_if_possible().await {
            error!(trigger, error = ?e, "Automatic flush failed");
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Cloneable handle to the aggregator actor. The actor stops once every handle is dropped.
#[derive(Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl AggregatorHandle {
    /// Spawns the aggregator actor for the given sources, writing finalized records to `sink`.
    pub fn new<S>(sources: Vec<SourceId>, sink: S, config: AggregatorConfig) -> Self
    where
        S: Sink + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let state = AggregatorState::new(sources, sink, config);
        tokio::spawn(async move {
            let actor = AggregatorActor::new(receiver, state);
            actor.run().await;
        });
        Self { sender }
    }

    /// Buffers a single record produced by `source`.
    pub async fn ingest(&self, source: &str, record: ParsedRecord) -> Result<()> {
        self.ingest_batch(source, vec![record]).await
    }

    /// Buffers a batch of records produced by `source`, in the order given.
    pub async fn ingest_batch(&self, source: &str, records: Vec<ParsedRecord>) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ActorMessage::Ingest {
            source: source.to_string(),
            records,
            respond_to,
        })
        .await?;
        rx.await?
    }

    /// Marks `source` as exhausted. Calling it more than once has no further effect.
    pub async fn mark_source_complete(&self, source: &str) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ActorMessage::Complete {
            source: source.to_string(),
            respond_to,
        })
        .await?;
        rx.await?
    }

    /// Flushes everything at or below the current global threshold.
    pub async fn flush_if_possible(&self) -> Result<FlushStats> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ActorMessage::Flush { respond_to }).await?;
        rx.await?
    }

    /// Flushes every buffered record regardless of watermarks. Succeeds at most once; afterwards
    /// the aggregator refuses any further request that would change its state.
    pub async fn final_flush(&self) -> Result<FlushStats> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ActorMessage::FinalFlush { respond_to }).await?;
        rx.await?
    }

    pub async fn stats(&self) -> Result<AggregatorStats> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ActorMessage::Stats { respond_to }).await?;
        Ok(rx.await?)
    }

    /// Snapshot of the watermark table, sorted by source.
    pub async fn watermarks(&self) -> Result<Vec<(SourceId, Watermark)>> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ActorMessage::Watermarks { respond_to }).await?;
        Ok(rx.await?)
    }

    async fn send(&self, msg: ActorMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::Aggregator("aggregator is not running".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::message::EventTime;
    use crate::test_utils::{CollectingSink, FailingSink};

    fn ts(secs: i64) -> EventTime {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(key: &str, secs: i64, payload: &str) -> ParsedRecord {
        ParsedRecord::new(key, ts(secs), payload.to_string())
    }

    fn sources(names: &[&str]) -> Vec<SourceId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// automatic flushing off, so every flush in a test is explicit
    fn manual() -> AggregatorConfig {
        AggregatorConfig {
            flush_every: 0,
            sink_retry_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_three_sources_single_key() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a", "b", "c"]), sink.clone(), manual());

        aggregator.ingest("a", record("u1", 10, "a10")).await.unwrap();
        aggregator.ingest("b", record("u1", 20, "b20")).await.unwrap();
        aggregator.ingest("c", record("u1", 30, "c30")).await.unwrap();

        let stats = aggregator.flush_if_possible().await.unwrap();
        assert_eq!(stats.threshold, Watermark::At(ts(10)));
        assert_eq!(stats.flushed, 1);
        assert_eq!(sink.payloads("u1"), vec!["a10"]);

        aggregator.mark_source_complete("a").await.unwrap();
        let stats = aggregator.flush_if_possible().await.unwrap();
        assert_eq!(stats.threshold, Watermark::At(ts(20)));
        assert_eq!(stats.flushed, 1);
        assert_eq!(sink.payloads("u1"), vec!["a10", "b20"]);

        let stats = aggregator.final_flush().await.unwrap();
        assert_eq!(stats.threshold, Watermark::Complete);
        assert_eq!(stats.flushed, 1);
        assert_eq!(sink.payloads("u1"), vec!["a10", "b20", "c30"]);

        let totals = aggregator.stats().await.unwrap();
        assert_eq!(totals.ingested, 3);
        assert_eq!(totals.flushed, 3);
        assert_eq!(totals.buffered, 0);
        assert_eq!(totals.keys, 0);
    }

    #[tokio::test]
    async fn test_unseen_source_starves_flushing() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a", "b"]), sink.clone(), manual());

        for (i, key) in ["u1", "u2", "u3"].iter().enumerate() {
            aggregator
                .ingest("a", record(key, 10 * (i as i64 + 1), key))
                .await
                .unwrap();
        }
        aggregator.ingest("a", record("u1", 100, "late")).await.unwrap();

        let stats = aggregator.flush_if_possible().await.unwrap();
        assert_eq!(stats.threshold, Watermark::Unseen);
        assert_eq!(stats.flushed, 0);
        assert!(sink.is_empty());

        // once b shows up the threshold is b's watermark
        aggregator.ingest("b", record("u2", 25, "b25")).await.unwrap();
        let stats = aggregator.flush_if_possible().await.unwrap();
        assert_eq!(stats.threshold, Watermark::At(ts(25)));
        assert_eq!(stats.flushed, 3);
        assert_eq!(sink.payloads("u1"), vec!["u1"]);
        assert_eq!(sink.payloads("u2"), vec!["u2", "b25"]);
        assert!(sink.payloads("u3").is_empty());
    }

    #[tokio::test]
    async fn test_completed_idle_source_releases_threshold() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a", "b"]), sink.clone(), manual());

        aggregator.ingest("a", record("u1", 100, "a100")).await.unwrap();
        assert_eq!(aggregator.flush_if_possible().await.unwrap().flushed, 0);

        aggregator.mark_source_complete("b").await.unwrap();
        let stats = aggregator.flush_if_possible().await.unwrap();
        assert_eq!(stats.threshold, Watermark::At(ts(100)));
        assert_eq!(sink.payloads("u1"), vec!["a100"]);
    }

    #[tokio::test]
    async fn test_flush_orders_by_event_time_then_arrival() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a", "b"]), sink.clone(), manual());

        aggregator
            .ingest_batch(
                "a",
                vec![record("u1", 5, "a5"), record("u1", 20, "a20-first")],
            )
            .await
            .unwrap();
        aggregator
            .ingest_batch(
                "b",
                vec![
                    record("u1", 1, "b1"),
                    record("u1", 20, "b20-second"),
                    record("u1", 30, "b30"),
                ],
            )
            .await
            .unwrap();

        aggregator.final_flush().await.unwrap();
        assert_eq!(
            sink.payloads("u1"),
            vec!["b1", "a5", "a20-first", "b20-second", "b30"]
        );
    }

    #[tokio::test]
    async fn test_safety_never_flushes_beyond_min_watermark() {
        let sink = CollectingSink::default();
        let names = ["s0", "s1", "s2"];
        let aggregator = AggregatorHandle::new(sources(&names), sink.clone(), manual());

        // each source walks forward at its own pace
        let mut produced: HashMap<&str, i64> = HashMap::new();
        for step in 0..30i64 {
            let name = names[(step % 3) as usize];
            let secs = step * (1 + step % 3);
            let entry = produced.entry(name).or_insert(0);
            let secs = secs.max(*entry);
            *entry = secs;
            aggregator
                .ingest(name, record(&format!("k{}", step % 4), secs, "x"))
                .await
                .unwrap();

            let stats = aggregator.flush_if_possible().await.unwrap();
            let min = names
                .iter()
                .map(|n| produced.get(n).copied())
                .min()
                .flatten();
            for written in sink.drain() {
                let min = min.expect("nothing may flush while a source is unseen");
                assert!(written.event_time <= ts(min));
                assert!(stats.threshold.covers(written.event_time));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_loss_no_duplicates() {
        let sink = CollectingSink::default();
        let config = AggregatorConfig {
            flush_every: 1,
            ..manual()
        };
        let aggregator = AggregatorHandle::new(sources(&["a", "b", "c", "d"]), sink.clone(), config);

        let mut tasks = Vec::new();
        for (idx, name) in ["a", "b", "c", "d"].into_iter().enumerate() {
            let aggregator = aggregator.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..250i64 {
                    let secs = i * 4 + idx as i64;
                    let payload = format!("{name}-{i}");
                    aggregator
                        .ingest(name, record(&format!("user{}", i % 7), secs, &payload))
                        .await
                        .unwrap();
                }
                aggregator.mark_source_complete(name).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        aggregator.final_flush().await.unwrap();

        let written = sink.records();
        assert_eq!(written.len(), 1000);
        let mut payloads: Vec<_> = written.iter().map(|w| w.payload.clone()).collect();
        payloads.sort();
        payloads.dedup();
        assert_eq!(payloads.len(), 1000);

        // per key output is in event time order
        let mut last: HashMap<String, EventTime> = HashMap::new();
        for w in &written {
            if let Some(prev) = last.insert(w.key.clone(), w.event_time) {
                assert!(prev <= w.event_time);
            }
        }

        let stats = aggregator.stats().await.unwrap();
        assert_eq!(stats.ingested, stats.flushed);
        assert_eq!(stats.buffered, 0);
    }

    #[tokio::test]
    async fn test_mark_source_complete_is_idempotent() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a", "b"]), sink.clone(), manual());
        aggregator.ingest("b", record("u1", 10, "b10")).await.unwrap();

        aggregator.mark_source_complete("a").await.unwrap();
        let once = aggregator.watermarks().await.unwrap();
        aggregator.mark_source_complete("a").await.unwrap();
        assert_eq!(aggregator.watermarks().await.unwrap(), once);
        assert_eq!(
            once,
            vec![
                ("a".to_string(), Watermark::Complete),
                ("b".to_string(), Watermark::At(ts(10)))
            ]
        );
        assert_eq!(aggregator.flush_if_possible().await.unwrap().flushed, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_record_does_not_retract_watermark() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a", "b"]), sink.clone(), manual());

        aggregator.ingest("a", record("u1", 50, "a50")).await.unwrap();
        aggregator.ingest("b", record("u1", 40, "b40")).await.unwrap();
        assert_eq!(aggregator.flush_if_possible().await.unwrap().flushed, 1);

        // behind both its own watermark and the flushed threshold
        aggregator.ingest("a", record("u1", 30, "a30")).await.unwrap();
        let watermarks = aggregator.watermarks().await.unwrap();
        assert_eq!(watermarks[0], ("a".to_string(), Watermark::At(ts(50))));

        let stats = aggregator.stats().await.unwrap();
        assert_eq!(stats.late, 1);
        assert_eq!(stats.buffered, 2);

        // still emitted, after the record it should have preceded
        aggregator.flush_if_possible().await.unwrap();
        assert_eq!(sink.payloads("u1"), vec!["b40", "a30"]);
    }

    #[tokio::test]
    async fn test_record_at_flushed_threshold_is_not_late() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a", "b"]), sink.clone(), manual());

        aggregator.ingest("a", record("u1", 40, "a40")).await.unwrap();
        aggregator.ingest("b", record("u1", 40, "b40")).await.unwrap();
        let stats = aggregator.flush_if_possible().await.unwrap();
        assert_eq!(stats.threshold, Watermark::At(ts(40)));

        // non-decreasing order allows another record at the same time
        aggregator.ingest("a", record("u1", 40, "a40-again")).await.unwrap();
        assert_eq!(aggregator.stats().await.unwrap().late, 0);

        aggregator.final_flush().await.unwrap();
        assert_eq!(sink.payloads("u1"), vec!["a40", "b40", "a40-again"]);
    }

    #[tokio::test]
    async fn test_unknown_source_is_rejected() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a"]), sink.clone(), manual());

        let result = aggregator.ingest("nope", record("u1", 1, "x")).await;
        assert!(matches!(result, Err(Error::Watermark(_))));
        assert!(aggregator.mark_source_complete("nope").await.is_err());
        assert_eq!(aggregator.stats().await.unwrap().buffered, 0);
    }

    #[tokio::test]
    async fn test_final_flush_only_once() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a"]), sink.clone(), manual());
        aggregator.ingest("a", record("u1", 1, "x")).await.unwrap();

        assert_eq!(aggregator.final_flush().await.unwrap().flushed, 1);
        assert!(matches!(
            aggregator.final_flush().await,
            Err(Error::Aggregator(_))
        ));
        assert!(aggregator.ingest("a", record("u1", 2, "y")).await.is_err());
        assert!(aggregator.flush_if_possible().await.is_err());
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_records_buffered() {
        // fails more often than it is retried
        let sink = FailingSink::new(5);
        let config = AggregatorConfig {
            sink_max_retry_attempts: 2,
            ..manual()
        };
        let aggregator = AggregatorHandle::new(sources(&["a"]), sink.clone(), config);

        aggregator.ingest("a", record("u1", 1, "one")).await.unwrap();
        aggregator.ingest("a", record("u1", 2, "two")).await.unwrap();
        aggregator.mark_source_complete("a").await.unwrap();

        let result = aggregator.flush_if_possible().await;
        assert!(matches!(result, Err(Error::Sink(_))));
        let stats = aggregator.stats().await.unwrap();
        assert_eq!(stats.buffered, 2);
        assert_eq!(stats.sink_failures, 1);
        assert!(sink.inner.is_empty());

        // the sink recovers on the next pass, nothing lost, nothing duplicated
        let stats = aggregator.final_flush().await.unwrap();
        assert_eq!(stats.flushed, 2);
        assert_eq!(sink.inner.payloads("u1"), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_sink_write_retried_within_pass() {
        let sink = FailingSink::new(2);
        let config = AggregatorConfig {
            sink_max_retry_attempts: 3,
            ..manual()
        };
        let aggregator = AggregatorHandle::new(sources(&["a"]), sink.clone(), config);
        aggregator.ingest("a", record("u1", 1, "one")).await.unwrap();

        let stats = aggregator.final_flush().await.unwrap();
        assert_eq!(stats.flushed, 1);
        assert_eq!(sink.inner.payloads("u1"), vec!["one"]);
        assert_eq!(aggregator.stats().await.unwrap().sink_failures, 0);
    }

    #[tokio::test]
    async fn test_automatic_flush_after_ingest() {
        let sink = CollectingSink::default();
        let config = AggregatorConfig {
            flush_every: 2,
            ..manual()
        };
        let aggregator = AggregatorHandle::new(sources(&["a", "b"]), sink.clone(), config);

        aggregator.ingest("a", record("u1", 10, "a10")).await.unwrap();
        aggregator.ingest("b", record("u1", 20, "b20")).await.unwrap();
        // the second ingest triggered a pass inside the actor, stats is queued behind it
        let stats = aggregator.stats().await.unwrap();
        assert_eq!(stats.flushed, 1);
        assert_eq!(sink.payloads("u1"), vec!["a10"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let sink = CollectingSink::default();
        let config = AggregatorConfig {
            flush_interval: Some(Duration::from_millis(100)),
            ..manual()
        };
        let aggregator = AggregatorHandle::new(sources(&["a"]), sink.clone(), config);
        aggregator.ingest("a", record("u1", 10, "a10")).await.unwrap();
        assert!(sink.is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(aggregator.stats().await.unwrap().flushed, 1);
        assert_eq!(sink.payloads("u1"), vec!["a10"]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let sink = CollectingSink::default();
        let aggregator = AggregatorHandle::new(sources(&["a"]), sink.clone(), manual());
        aggregator.ingest_batch("a", vec![]).await.unwrap();
        assert_eq!(
            aggregator.watermarks().await.unwrap(),
            vec![("a".to_string(), Watermark::Unseen)]
        );
        let stats = aggregator.final_flush().await.unwrap();
        assert_eq!(stats.flushed, 0);
    }
}
