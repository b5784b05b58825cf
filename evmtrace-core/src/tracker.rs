use crate::{
    db::Database,
    error::{EvmtraceError, Result},
    event::{DecodeOutcome, LogDecoder},
    metrics::{HealthCheck, HealthStatus, Metrics},
    rpc::LogSource,
    types::{BlockNumber, BlockRange, InsertOutcome, LogFilter, TrackedEvent},
    watermark::{Watermark, WatermarkStore},
};
use alloy_primitives::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tracker settings, resolved once at startup
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub app_name: String,
    pub contract_address: Address,
    pub start_block: BlockNumber,
    pub batch_size: u64,
    /// Pause between backfill batches
    pub batch_delay: Duration,
    pub poll_interval: Duration,
    pub rescan_enabled: bool,
    pub rescan_interval: Duration,
    /// Blocks re-read below the watermark on each rescan
    pub rescan_window: u64,
    pub resubscribe_delay: Duration,
}

impl TrackerConfig {
    pub fn new(app_name: impl Into<String>, contract_address: Address) -> Self {
        Self {
            app_name: app_name.into(),
            contract_address,
            start_block: 0,
            batch_size: 1000,
            batch_delay: Duration::ZERO,
            poll_interval: Duration::from_secs(60),
            rescan_enabled: false,
            rescan_interval: Duration::from_secs(600),
            rescan_window: 100,
            resubscribe_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Initializing,
    Backfilling,
    Tracking,
    Stopped,
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerState::Initializing => write!(f, "initializing"),
            TrackerState::Backfilling => write!(f, "backfilling"),
            TrackerState::Tracking => write!(f, "tracking"),
            TrackerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counts for one processed block range
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RangeStats {
    pub logs_found: usize,
    pub stored: usize,
    pub duplicates: usize,
    /// Logs stored as UnknownEvent
    pub unrecognized: usize,
}

impl RangeStats {
    pub fn merge(&mut self, other: RangeStats) {
        self.logs_found += other.logs_found;
        self.stored += other.stored;
        self.duplicates += other.duplicates;
        self.unrecognized += other.unrecognized;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSummary {
    pub start_block: BlockNumber,
    pub head_block: BlockNumber,
    pub ranges: usize,
    pub stats: RangeStats,
    /// Cancelled before reaching the head
    pub interrupted: bool,
}

/// Lazily yields consecutive block ranges covering `[from, to]`
#[derive(Debug, Clone)]
pub struct BatchPlan {
    next: Option<BlockNumber>,
    to: BlockNumber,
    size: u64,
}

impl BatchPlan {
    pub fn new(from: BlockNumber, to: BlockNumber, size: u64) -> Self {
        Self {
            next: (from <= to).then_some(from),
            to,
            size: size.max(1),
        }
    }

    /// Ranges not yet yielded
    pub fn remaining(&self) -> u64 {
        match self.next {
            Some(start) => ((self.to - start) / self.size).saturating_add(1),
            None => 0,
        }
    }
}

impl Iterator for BatchPlan {
    type Item = BlockRange;

    fn next(&mut self) -> Option<BlockRange> {
        let start = self.next?;
        let end = start.saturating_add(self.size - 1).min(self.to);
        self.next = if end < self.to { Some(end + 1) } else { None };
        Some(BlockRange::new(start, end))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.remaining()) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

struct TrackerInner {
    config: TrackerConfig,
    source: Arc<dyn LogSource>,
    db: Database,
    decoder: LogDecoder,
    watermark: Watermark,
    metrics: Arc<Metrics>,
    state: watch::Sender<TrackerState>,
}

/// Keeps the event store in sync with the contract's on-chain logs
#[derive(Clone)]
pub struct EventTracker {
    inner: Arc<TrackerInner>,
}

impl EventTracker {
    pub fn new(
        config: TrackerConfig,
        source: Arc<dyn LogSource>,
        db: Database,
        decoder: LogDecoder,
        metrics: Arc<Metrics>,
    ) -> Self {
        let store = WatermarkStore::new(db.clone(), config.app_name.clone());
        let (state, _) = watch::channel(TrackerState::Initializing);

        Self {
            inner: Arc::new(TrackerInner {
                config,
                source,
                db,
                decoder,
                watermark: Watermark::new(store),
                metrics,
                state,
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> TrackerState {
        *self.inner.state.borrow()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Last fully processed block
    pub async fn watermark(&self) -> BlockNumber {
        self.inner.watermark.get().await
    }

    fn set_state(&self, state: TrackerState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!(
                "[{}] Tracker state: {} -> {}",
                self.inner.config.app_name, previous, state
            );
        }
    }

    /// Resolve the block to start from and persist it as the watermark baseline
    ///
    /// Fails when the store already holds events for this application but none at or
    /// beyond the configured start block.
    pub async fn initialize(&self) -> Result<BlockNumber> {
        self.set_state(TrackerState::Initializing);
        let config = &self.inner.config;

        let store_max = self.inner.db.max_block_number(&config.app_name).await?;
        if let Some(recorded) = store_max {
            if recorded < config.start_block {
                return Err(EvmtraceError::StartBlockAhead {
                    app_name: config.app_name.clone(),
                    start_block: config.start_block,
                    recorded,
                });
            }
        }

        let persisted = self.inner.watermark.load().await?;
        let effective = persisted
            .unwrap_or(config.start_block)
            .max(config.start_block)
            .max(store_max.unwrap_or(0));

        self.inner.watermark.advance(effective).await?;

        info!(
            "[{}] Starting from block {} (configured {}, watermark {:?}, store max {:?})",
            config.app_name, effective, config.start_block, persisted, store_max
        );

        Ok(effective)
    }

    /// Split `[from, to]` into consecutive ranges of at most `size` blocks
    pub fn plan_batches(from: BlockNumber, to: BlockNumber, size: u64) -> BatchPlan {
        BatchPlan::new(from, to, size)
    }

    /// Catch up from `start` to the current chain head, one batch at a time
    pub async fn backfill(
        &self,
        start: BlockNumber,
        cancel: &CancellationToken,
    ) -> Result<BackfillSummary> {
        self.set_state(TrackerState::Backfilling);
        let config = &self.inner.config;

        let head = self.inner.source.head_block_number().await?;
        let batches = Self::plan_batches(start, head, config.batch_size);
        let total = batches.remaining();
        info!(
            "[{}] Backfilling blocks {} to {} in {} batches",
            config.app_name, start, head, total
        );

        let mut summary = BackfillSummary {
            start_block: start,
            head_block: head,
            ranges: 0,
            stats: RangeStats::default(),
            interrupted: false,
        };

        for (idx, range) in (0u64..).zip(batches) {
            if cancel.is_cancelled() {
                warn!(
                    "[{}] Backfill cancelled before batch {}/{}",
                    config.app_name,
                    idx + 1,
                    total
                );
                summary.interrupted = true;
                return Ok(summary);
            }

            let stats = self.process_range(range).await?;
            self.inner.watermark.advance(range.to).await?;
            summary.ranges += 1;
            summary.stats.merge(stats);

            info!(
                "[{}] Backfill batch {}/{} ({}): {} logs, {} stored, {} duplicates",
                config.app_name,
                idx + 1,
                total,
                range,
                stats.logs_found,
                stats.stored,
                stats.duplicates
            );

            if !config.batch_delay.is_zero() && idx + 1 < total {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(config.batch_delay) => {}
                }
            }
        }

        self.inner.watermark.advance(head).await?;
        info!(
            "[{}] Backfill complete at block {}: {} logs, {} stored",
            config.app_name, head, summary.stats.logs_found, summary.stats.stored
        );

        Ok(summary)
    }

    /// Fetch, decode and persist every log of the contract in `range`
    ///
    /// Duplicates are skipped. Any other store failure aborts the range.
    pub async fn process_range(&self, range: BlockRange) -> Result<RangeStats> {
        let result = self.process_range_inner(range).await;
        self.inner.metrics.record_range(result.is_err());
        result
    }

    async fn process_range_inner(&self, range: BlockRange) -> Result<RangeStats> {
        let config = &self.inner.config;
        let filter = LogFilter {
            address: config.contract_address,
            topics: self.inner.decoder.catalog().topic_filter(),
            from_block: range.from,
            to_block: range.to,
        };

        let logs = self.inner.source.get_logs(&filter).await?;
        self.inner.metrics.record_logs(logs.len());

        let mut stats = RangeStats {
            logs_found: logs.len(),
            ..RangeStats::default()
        };

        for log in &logs {
            let decoded = match self.inner.decoder.decode(log) {
                DecodeOutcome::Decoded(event) => Some(event),
                DecodeOutcome::Unmatched => None,
                DecodeOutcome::Malformed(_) => {
                    self.inner.metrics.record_decode_failure();
                    None
                }
            };

            let event = TrackedEvent::from_log(
                log,
                decoded,
                &config.app_name,
                &config.contract_address,
            );
            if event.is_unknown() {
                stats.unrecognized += 1;
            }

            match self.inner.db.insert_event(&event).await {
                Ok(InsertOutcome::Stored) => {
                    stats.stored += 1;
                    self.inner.metrics.record_db_insert(false, false);
                    self.inner
                        .metrics
                        .record_event(&event.event_name, event.is_unknown());
                }
                Ok(InsertOutcome::DuplicateIgnored) => {
                    stats.duplicates += 1;
                    self.inner.metrics.record_db_insert(false, true);
                    debug!(
                        "[{}] Duplicate {} at {}:{}, skipped",
                        config.app_name, event.event_name, event.transaction_hash, event.log_index
                    );
                }
                Err(e) => {
                    self.inner.metrics.record_db_insert(true, false);
                    return Err(e);
                }
            }
        }

        debug!(
            "[{}] Processed range {}: {} logs, {} stored, {} duplicates, {} unrecognized",
            config.app_name,
            range,
            stats.logs_found,
            stats.stored,
            stats.duplicates,
            stats.unrecognized
        );

        Ok(stats)
    }

    /// Process everything after the watermark up to `head`. `None` when already there.
    async fn catch_up(&self, head: BlockNumber) -> Result<Option<RangeStats>> {
        let watermark = self.inner.watermark.get().await;
        if head <= watermark {
            return Ok(None);
        }

        let mut total = RangeStats::default();
        for range in Self::plan_batches(watermark + 1, head, self.inner.config.batch_size) {
            let stats = self.process_range(range).await?;
            self.inner.watermark.advance(range.to).await?;
            total.merge(stats);
        }

        info!(
            "[{}] Processed blocks {} to {}: {} logs, {} stored",
            self.inner.config.app_name,
            watermark + 1,
            head,
            total.logs_found,
            total.stored
        );

        Ok(Some(total))
    }

    /// React to a new head height from the block subscription
    pub async fn handle_new_block(&self, block: BlockNumber) -> Result<Option<RangeStats>> {
        self.catch_up(block).await
    }

    /// Query the chain head once and process anything new
    pub async fn poll_once(&self) -> Result<Option<RangeStats>> {
        let head = self.inner.source.head_block_number().await?;
        self.catch_up(head).await
    }

    /// Re-read the trailing window below the watermark without moving it
    pub async fn rescan_once(&self) -> Result<RangeStats> {
        let watermark = self.inner.watermark.get().await;
        let range = BlockRange::new(
            watermark.saturating_sub(self.inner.config.rescan_window),
            watermark,
        );

        let stats = self.process_range(range).await?;
        info!(
            "[{}] Rescanned blocks {}: {} logs, {} newly stored",
            self.inner.config.app_name, range, stats.logs_found, stats.stored
        );

        Ok(stats)
    }

    /// Initialize, backfill, then track until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let start = self.initialize().await?;
        let summary = self.backfill(start, &cancel).await?;

        if summary.interrupted || cancel.is_cancelled() {
            self.set_state(TrackerState::Stopped);
            self.log_metrics();
            return Ok(());
        }

        self.track(cancel).await;
        Ok(())
    }

    /// Run the live, poll and rescan loops until `cancel` fires
    pub async fn track(&self, cancel: CancellationToken) {
        self.set_state(TrackerState::Tracking);
        let config = &self.inner.config;
        info!(
            "[{}] Tracking started for {} at block {}",
            config.app_name,
            config.contract_address,
            self.watermark().await
        );

        let mut handles = vec![
            tokio::spawn(self.clone().live_loop(cancel.clone())),
            tokio::spawn(self.clone().poll_loop(cancel.clone())),
        ];
        if config.rescan_enabled {
            handles.push(tokio::spawn(self.clone().rescan_loop(cancel.clone())));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("[{}] Tracking task failed: {}", config.app_name, e);
            }
        }

        self.log_metrics();
        self.set_state(TrackerState::Stopped);
    }

    fn log_metrics(&self) {
        self.inner.metrics.log_summary();
        let status = HealthCheck::new(self.inner.metrics.clone()).check();
        if status == HealthStatus::Healthy {
            info!("[{}] Health: {}", self.inner.config.app_name, status);
        } else {
            warn!("[{}] Health: {}", self.inner.config.app_name, status);
        }
    }

    /// Sleep for `delay`. Returns false if cancelled first.
    async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn live_loop(self, cancel: CancellationToken) {
        let app_name = self.inner.config.app_name.clone();
        let delay = self.inner.config.resubscribe_delay;

        while !cancel.is_cancelled() {
            let mut subscription = match self.inner.source.subscribe_new_blocks().await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!("[{}] Failed to subscribe to new blocks: {}", app_name, e);
                    self.inner.metrics.record_resubscription();
                    if !Self::pause(delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };
            info!("[{}] Subscribed to new blocks", app_name);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        subscription.unsubscribe();
                        info!("[{}] Unsubscribed from new blocks", app_name);
                        return;
                    }
                    next = subscription.recv() => {
                        let Some(block) = next else {
                            warn!(
                                "[{}] Block subscription ended, resubscribing in {:?}",
                                app_name, delay
                            );
                            break;
                        };
                        if let Err(e) = self.handle_new_block(block).await {
                            error!("[{}] Failed to process block {}: {}", app_name, block, e);
                        }
                    }
                }
            }

            self.inner.metrics.record_resubscription();
            if !Self::pause(delay, &cancel).await {
                break;
            }
        }
    }

    async fn poll_loop(self, cancel: CancellationToken) {
        let app_name = self.inner.config.app_name.clone();
        let period = self.inner.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(Some(stats)) => debug!("[{}] Poll stored {} events", app_name, stats.stored),
                        Ok(None) => debug!("[{}] Poll found no new blocks", app_name),
                        Err(e) => error!("[{}] Poll failed: {}", app_name, e),
                    }
                }
            }
        }

        debug!("[{}] Poll loop stopped", app_name);
    }

    async fn rescan_loop(self, cancel: CancellationToken) {
        let app_name = self.inner.config.app_name.clone();
        let period = self.inner.config.rescan_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.rescan_once().await {
                        error!("[{}] Rescan failed: {}", app_name, e);
                    }
                    self.log_metrics();
                }
            }
        }

        debug!("[{}] Rescan loop stopped", app_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{tests::ERC20_ABI, EventCatalog};
    use crate::db::{sqlite::SqliteBackend, DatabaseBackend, EventRecord};
    use crate::rpc::BlockSubscription;
    use crate::types::{RawLog, UNKNOWN_EVENT};
    use alloy_primitives::{Bytes, B256, U256};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const APP: &str = "test-app";

    #[derive(Default)]
    struct MockLogSource {
        head: AtomicU64,
        logs: Mutex<Vec<RawLog>>,
        queries: Mutex<Vec<(BlockNumber, BlockNumber)>>,
        fail_head: AtomicBool,
        /// Sender of the open block subscription
        subscriber: Mutex<Option<mpsc::Sender<BlockNumber>>>,
        /// End every block subscription as soon as it is opened
        end_subscriptions: AtomicBool,
    }

    impl MockLogSource {
        fn with_head(head: BlockNumber) -> Self {
            let source = Self::default();
            source.head.store(head, Ordering::SeqCst);
            source
        }

        fn push_log(&self, log: RawLog) {
            self.logs.lock().unwrap().push(log);
        }

        fn queries(&self) -> Vec<(BlockNumber, BlockNumber)> {
            self.queries.lock().unwrap().clone()
        }

        fn is_subscribed(&self) -> bool {
            self.subscriber.lock().unwrap().is_some()
        }

        async fn announce(&self, block: BlockNumber) {
            let sender = self.subscriber.lock().unwrap().clone().unwrap();
            sender.send(block).await.unwrap();
        }
    }

    #[async_trait]
    impl LogSource for MockLogSource {
        async fn head_block_number(&self) -> Result<BlockNumber> {
            if self.fail_head.load(Ordering::SeqCst) {
                return Err(EvmtraceError::Rpc("connection refused".to_string()));
            }
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
            self.queries
                .lock()
                .unwrap()
                .push((filter.from_block, filter.to_block));

            let logs = self.logs.lock().unwrap();
            Ok(logs
                .iter()
                .filter(|log| log.address == filter.address)
                .filter(|log| log.block_number >= filter.from_block && log.block_number <= filter.to_block)
                .filter(|log| {
                    filter.topics.is_empty()
                        || log.topic0().map_or(false, |t| filter.topics.contains(t))
                })
                .cloned()
                .collect())
        }

        async fn subscribe_new_blocks(&self) -> Result<BlockSubscription> {
            let (sender, receiver) = mpsc::channel(16);
            if !self.end_subscriptions.load(Ordering::SeqCst) {
                *self.subscriber.lock().unwrap() = Some(sender);
            }
            Ok(BlockSubscription::new(receiver, None))
        }
    }

    fn contract() -> Address {
        Address::repeat_byte(0x11)
    }

    fn transfer_log(block: BlockNumber, tx_byte: u8, log_index: u64) -> RawLog {
        RawLog {
            address: contract(),
            topics: vec![
                EventCatalog::calculate_signature_hash("Transfer(address,address,uint256)"),
                Address::repeat_byte(0x01).into_word(),
                Address::repeat_byte(0x02).into_word(),
            ],
            data: Bytes::from(U256::from(1000u64).to_be_bytes::<32>().to_vec()),
            block_number: block,
            transaction_hash: B256::repeat_byte(tx_byte),
            log_index,
        }
    }

    struct Harness {
        _dir: TempDir,
        db: Database,
        source: Arc<MockLogSource>,
        tracker: EventTracker,
    }

    /// Wraps a real backend and fails inserts while `failing` is set
    struct FlakyBackend {
        inner: SqliteBackend,
        failing: AtomicBool,
    }

    #[async_trait]
    impl DatabaseBackend for FlakyBackend {
        async fn run_migrations(&self) -> Result<()> {
            self.inner.run_migrations().await
        }

        async fn insert_event(&self, event: &TrackedEvent) -> Result<InsertOutcome> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EvmtraceError::Database("disk I/O error".to_string()));
            }
            self.inner.insert_event(event).await
        }

        async fn max_block_number(&self, app_name: &str) -> Result<Option<BlockNumber>> {
            self.inner.max_block_number(app_name).await
        }

        async fn get_events_by_block_range(
            &self,
            app_name: &str,
            start_block: BlockNumber,
            end_block: BlockNumber,
        ) -> Result<Vec<EventRecord>> {
            self.inner
                .get_events_by_block_range(app_name, start_block, end_block)
                .await
        }

        async fn get_events_by_name(
            &self,
            app_name: &str,
            event_name: &str,
        ) -> Result<Vec<EventRecord>> {
            self.inner.get_events_by_name(app_name, event_name).await
        }

        async fn count_events(&self, app_name: &str) -> Result<u64> {
            self.inner.count_events(app_name).await
        }

        async fn get_watermark(&self, app_name: &str) -> Result<Option<BlockNumber>> {
            self.inner.get_watermark(app_name).await
        }

        async fn set_watermark(&self, app_name: &str, block_number: BlockNumber) -> Result<()> {
            self.inner.set_watermark(app_name, block_number).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    fn db_url(dir: &TempDir) -> String {
        format!("sqlite:{}", dir.path().join("tracker.db").display())
    }

    async fn harness(source: MockLogSource, wanted: &[&str], configure: impl FnOnce(&mut TrackerConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&db_url(&dir)).await.unwrap();
        harness_with_db(dir, db, source, wanted, configure)
    }

    fn harness_with_db(
        dir: TempDir,
        db: Database,
        source: MockLogSource,
        wanted: &[&str],
        configure: impl FnOnce(&mut TrackerConfig),
    ) -> Harness {
        let wanted: Vec<String> = wanted.iter().map(|s| s.to_string()).collect();
        let catalog = EventCatalog::load_from_str(ERC20_ABI, &wanted).unwrap();

        let mut config = TrackerConfig::new(APP, contract());
        configure(&mut config);

        let source = Arc::new(source);
        let tracker = EventTracker::new(
            config,
            source.clone(),
            db.clone(),
            LogDecoder::new(Arc::new(catalog)),
            Arc::new(Metrics::new()),
        );

        Harness {
            _dir: dir,
            db,
            source,
            tracker,
        }
    }

    /// Poll `check` until it holds, for at most two seconds
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_plan_batches() {
        let plan = EventTracker::plan_batches(500, 2500, 1000);
        assert_eq!(plan.remaining(), 3);
        let ranges: Vec<_> = plan.collect();
        assert_eq!(
            ranges,
            vec![
                BlockRange::new(500, 1499),
                BlockRange::new(1500, 2499),
                BlockRange::new(2500, 2500),
            ]
        );

        assert_eq!(EventTracker::plan_batches(10, 9, 1000).next(), None);
        assert_eq!(
            EventTracker::plan_batches(7, 7, 1000).collect::<Vec<_>>(),
            vec![BlockRange::new(7, 7)]
        );
        assert_eq!(EventTracker::plan_batches(0, 2, 0).count(), 3);
    }

    #[test]
    fn test_plan_batches_is_lazy_over_long_histories() {
        let mut plan = EventTracker::plan_batches(0, 20_000_000, 1);
        assert_eq!(plan.remaining(), 20_000_001);
        assert_eq!(plan.next(), Some(BlockRange::new(0, 0)));
        assert_eq!(plan.nth(1), Some(BlockRange::new(2, 2)));
        assert_eq!(plan.remaining(), 19_999_998);

        let mut tail = EventTracker::plan_batches(BlockNumber::MAX - 1, BlockNumber::MAX, 10);
        assert_eq!(tail.next(), Some(BlockRange::new(BlockNumber::MAX - 1, BlockNumber::MAX)));
        assert_eq!(tail.next(), None);
    }

    #[tokio::test]
    async fn test_backfill_has_no_gaps() {
        let h = harness(MockLogSource::with_head(2500), &["Transfer"], |c| c.start_block = 500).await;
        h.source.push_log(transfer_log(600, 0xa1, 0));
        h.source.push_log(transfer_log(2500, 0xa2, 0));

        let start = h.tracker.initialize().await.unwrap();
        assert_eq!(start, 500);

        let summary = h.tracker.backfill(start, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.ranges, 3);
        assert_eq!(summary.stats.stored, 2);
        assert!(!summary.interrupted);
        assert_eq!(
            h.source.queries(),
            vec![(500, 1499), (1500, 2499), (2500, 2500)]
        );
        assert_eq!(h.tracker.watermark().await, 2500);
        assert_eq!(h.db.get_watermark(APP).await.unwrap(), Some(2500));
        assert_eq!(h.tracker.state(), TrackerState::Backfilling);
    }

    #[tokio::test]
    async fn test_start_block_guard() {
        let h = harness(MockLogSource::with_head(20_000), &["Transfer"], |c| c.start_block = 10_000).await;

        let existing = TrackedEvent::from_log(&transfer_log(9000, 0xb1, 0), None, APP, &contract());
        h.db.insert_event(&existing).await.unwrap();

        let err = h.tracker.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            EvmtraceError::StartBlockAhead { start_block: 10_000, recorded: 9000, .. }
        ));
        assert!(err.is_fatal());
        assert!(h.source.queries().is_empty());
    }

    #[tokio::test]
    async fn test_effective_start_uses_highest_known_block() {
        let h = harness(MockLogSource::with_head(20_000), &["Transfer"], |c| c.start_block = 10_000).await;

        let existing = TrackedEvent::from_log(&transfer_log(12_000, 0xb2, 0), None, APP, &contract());
        h.db.insert_event(&existing).await.unwrap();
        assert_eq!(h.tracker.initialize().await.unwrap(), 12_000);

        h.db.set_watermark(APP, 15_000).await.unwrap();
        assert_eq!(h.tracker.initialize().await.unwrap(), 15_000);
        assert_eq!(h.db.get_watermark(APP).await.unwrap(), Some(15_000));
    }

    #[tokio::test]
    async fn test_empty_store_does_not_trigger_guard() {
        let h = harness(MockLogSource::with_head(0), &["Transfer"], |c| c.start_block = 10_000).await;
        assert_eq!(h.tracker.initialize().await.unwrap(), 10_000);
        assert_eq!(h.db.get_watermark(APP).await.unwrap(), Some(10_000));
    }

    #[tokio::test]
    async fn test_duplicate_logs_are_idempotent() {
        let h = harness(MockLogSource::with_head(100), &["Transfer"], |_| {}).await;
        h.source.push_log(transfer_log(50, 0xc1, 0));
        h.source.push_log(transfer_log(50, 0xc1, 1));

        let range = BlockRange::new(0, 100);
        let first = h.tracker.process_range(range).await.unwrap();
        let second = h.tracker.process_range(range).await.unwrap();

        assert_eq!(first.stored, 2);
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(h.db.count_events(APP).await.unwrap(), 2);
        assert_eq!(h.tracker.metrics().snapshot().duplicate_events, 2);
    }

    #[tokio::test]
    async fn test_unknown_event_is_stored_raw() {
        let h = harness(MockLogSource::with_head(100), &[], |_| {}).await;
        let mut log = transfer_log(70, 0xd1, 4);
        log.topics = vec![B256::repeat_byte(0xee), B256::repeat_byte(0x01)];
        log.data = Bytes::from(vec![0xca, 0xfe]);
        h.source.push_log(log);

        let stats = h.tracker.process_range(BlockRange::new(0, 100)).await.unwrap();
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(stats.stored, 1);

        let records = h.db.get_events_by_block_range(APP, 70, 70).await.unwrap();
        assert_eq!(records.len(), 1);
        let event = &records[0].event;
        assert_eq!(event.event_name, UNKNOWN_EVENT);
        assert_eq!(event.raw_data, "0xcafe");
        assert_eq!(
            event.topics,
            vec![format!("0x{}", "ee".repeat(32)), format!("0x{}", "01".repeat(32))]
        );
        assert!(event.decoded_arguments.is_none());
    }

    #[tokio::test]
    async fn test_decoded_event_is_stored_with_arguments() {
        let h = harness(MockLogSource::with_head(100), &["Transfer"], |_| {}).await;
        h.source.push_log(transfer_log(10, 0xd2, 0));

        h.tracker.process_range(BlockRange::new(0, 100)).await.unwrap();

        let records = h.db.get_events_by_name(APP, "Transfer").await.unwrap();
        assert_eq!(records.len(), 1);
        let event = &records[0].event;
        assert_eq!(event.event_signature.as_deref(), Some("Transfer(address,address,uint256)"));
        assert_eq!(event.decoded_arguments.as_ref().unwrap()["value"], "1000");
        assert_eq!(event.contract_address, contract().to_checksum(None));
    }

    #[tokio::test]
    async fn test_rescan_is_non_destructive() {
        let h = harness(MockLogSource::with_head(1000), &["Transfer"], |c| c.rescan_window = 100).await;
        h.source.push_log(transfer_log(950, 0xe1, 0));

        let start = h.tracker.initialize().await.unwrap();
        h.tracker.backfill(start, &CancellationToken::new()).await.unwrap();
        assert_eq!(h.db.count_events(APP).await.unwrap(), 1);

        // A log the node only returned late
        h.source.push_log(transfer_log(990, 0xe2, 0));

        let stats = h.tracker.rescan_once().await.unwrap();
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(h.source.queries().last(), Some(&(900, 1000)));
        assert_eq!(h.tracker.watermark().await, 1000);
        assert_eq!(h.db.count_events(APP).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_block_at_or_below_watermark_is_ignored() {
        let h = harness(MockLogSource::with_head(500), &["Transfer"], |_| {}).await;
        let start = h.tracker.initialize().await.unwrap();
        h.tracker.backfill(start, &CancellationToken::new()).await.unwrap();
        let queries_before = h.source.queries().len();

        assert_eq!(h.tracker.handle_new_block(500).await.unwrap(), None);
        assert_eq!(h.tracker.handle_new_block(400).await.unwrap(), None);
        assert_eq!(h.source.queries().len(), queries_before);

        h.source.push_log(transfer_log(503, 0xf1, 0));
        let stats = h.tracker.handle_new_block(505).await.unwrap().unwrap();
        assert_eq!(stats.stored, 1);
        assert_eq!(h.source.queries().last(), Some(&(501, 505)));
        assert_eq!(h.tracker.watermark().await, 505);
    }

    #[tokio::test]
    async fn test_poll_failure_keeps_watermark() {
        let h = harness(MockLogSource::with_head(300), &["Transfer"], |_| {}).await;
        let start = h.tracker.initialize().await.unwrap();
        h.tracker.backfill(start, &CancellationToken::new()).await.unwrap();

        h.source.fail_head.store(true, Ordering::SeqCst);
        assert!(h.tracker.poll_once().await.is_err());
        assert_eq!(h.tracker.watermark().await, 300);

        h.source.fail_head.store(false, Ordering::SeqCst);
        h.source.head.store(350, Ordering::SeqCst);
        assert!(h.tracker.poll_once().await.unwrap().is_some());
        assert_eq!(h.tracker.watermark().await, 350);
    }

    #[tokio::test]
    async fn test_cancelled_backfill_stops_between_batches() {
        let h = harness(MockLogSource::with_head(5000), &["Transfer"], |c| c.batch_size = 1000).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h.tracker.backfill(0, &cancel).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.ranges, 0);
        assert!(h.source.queries().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let source = MockLogSource::with_head(10);
        source.end_subscriptions.store(true, Ordering::SeqCst);
        let h = harness(source, &["Transfer"], |c| {
            c.poll_interval = Duration::from_millis(20);
            c.resubscribe_delay = Duration::from_millis(20);
        })
        .await;

        let cancel = CancellationToken::new();
        let tracker = h.tracker.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { tracker.run(token).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(h.tracker.state(), TrackerState::Stopped);
        assert_eq!(h.tracker.watermark().await, 10);
        assert!(h.tracker.metrics().snapshot().resubscriptions > 0);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_range_and_keeps_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FlakyBackend {
            inner: SqliteBackend::new(&db_url(&dir)).await.unwrap(),
            failing: AtomicBool::new(false),
        });
        let db = Database::from_backend(backend.clone());
        let h = harness_with_db(dir, db, MockLogSource::with_head(100), &[], |_| {});

        let start = h.tracker.initialize().await.unwrap();
        h.tracker.backfill(start, &CancellationToken::new()).await.unwrap();
        assert_eq!(h.tracker.watermark().await, 100);

        h.source.push_log(transfer_log(150, 0x91, 0));
        let mut unknown = transfer_log(160, 0x92, 0);
        unknown.topics = vec![B256::repeat_byte(0xee)];
        h.source.push_log(unknown);
        h.source.head.store(200, Ordering::SeqCst);

        backend.failing.store(true, Ordering::SeqCst);
        let err = h.tracker.poll_once().await.unwrap_err();
        assert!(matches!(err, EvmtraceError::Database(_)));
        assert_eq!(h.tracker.watermark().await, 100);
        assert_eq!(h.db.get_watermark(APP).await.unwrap(), Some(100));
        assert_eq!(h.db.count_events(APP).await.unwrap(), 0);
        let snapshot = h.tracker.metrics().snapshot();
        assert_eq!(snapshot.db_insert_failures, 1);
        assert_eq!(snapshot.ranges_failed, 1);

        backend.failing.store(false, Ordering::SeqCst);
        let stats = h.tracker.poll_once().await.unwrap().unwrap();
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(h.source.queries().last(), Some(&(101, 200)));
        assert_eq!(h.tracker.watermark().await, 200);
        assert_eq!(h.db.get_watermark(APP).await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_stored_as_unknown() {
        let h = harness(MockLogSource::with_head(200), &["Transfer"], |_| {}).await;
        h.source.push_log(transfer_log(140, 0x81, 0));
        let mut truncated = transfer_log(150, 0x82, 0);
        truncated.data = Bytes::from(vec![0x01, 0x02]);
        h.source.push_log(truncated);
        h.source.push_log(transfer_log(160, 0x83, 0));

        let stats = h.tracker.process_range(BlockRange::new(100, 200)).await.unwrap();
        assert_eq!(stats.logs_found, 3);
        assert_eq!(stats.stored, 3);
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(h.tracker.metrics().snapshot().decode_failures, 1);

        let records = h.db.get_events_by_block_range(APP, 100, 200).await.unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.event.event_name.as_str()).collect();
        assert_eq!(names, ["Transfer", UNKNOWN_EVENT, "Transfer"]);

        let malformed = &records[1].event;
        assert_eq!(malformed.raw_data, "0x0102");
        assert!(malformed.decoded_arguments.is_none());
        assert_eq!(malformed.topics.len(), 3);
    }

    #[tokio::test]
    async fn test_run_processes_announced_blocks() {
        let h = harness(MockLogSource::with_head(10), &["Transfer"], |_| {}).await;

        let cancel = CancellationToken::new();
        let tracker = h.tracker.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { tracker.run(token).await });

        let source = h.source.clone();
        assert!(
            eventually(|| {
                let source = source.clone();
                async move { source.is_subscribed() }
            })
            .await
        );
        assert_eq!(h.tracker.watermark().await, 10);

        h.source.push_log(transfer_log(15, 0x71, 0));
        h.source.announce(20).await;

        let tracker = h.tracker.clone();
        assert!(
            eventually(|| {
                let tracker = tracker.clone();
                async move { tracker.watermark().await == 20 }
            })
            .await
        );
        assert!(h.source.queries().contains(&(11, 20)));
        assert_eq!(h.db.count_events(APP).await.unwrap(), 1);
        assert_eq!(h.tracker.state(), TrackerState::Tracking);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(h.tracker.state(), TrackerState::Stopped);
        assert_eq!(h.tracker.metrics().snapshot().resubscriptions, 0);
    }

    #[tokio::test]
    async fn test_run_rescans_trailing_window() {
        let h = harness(MockLogSource::with_head(1000), &["Transfer"], |c| {
            c.rescan_enabled = true;
            c.rescan_interval = Duration::from_millis(50);
            c.rescan_window = 100;
            c.poll_interval = Duration::from_millis(20);
        })
        .await;

        let cancel = CancellationToken::new();
        let tracker = h.tracker.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { tracker.run(token).await });

        let tracker = h.tracker.clone();
        assert!(
            eventually(|| {
                let tracker = tracker.clone();
                async move { tracker.state() == TrackerState::Tracking }
            })
            .await
        );

        // Returned by the node only after backfill passed it
        h.source.push_log(transfer_log(990, 0x61, 0));

        let db = h.db.clone();
        assert!(
            eventually(|| {
                let db = db.clone();
                async move { db.count_events(APP).await.unwrap() == 1 }
            })
            .await
        );
        assert!(h.source.queries().contains(&(900, 1000)));
        assert_eq!(h.tracker.watermark().await, 1000);
        assert_eq!(h.db.get_watermark(APP).await.unwrap(), Some(1000));

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(h.tracker.watermark().await, 1000);
    }
}
