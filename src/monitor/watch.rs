//! Event Monitor - confirmation tracking loop
//!
//! Consumes new heads from a [`BlockFeed`], pulls transfer logs for the watched
//! address through the rate-limited [`ChainAccess`], and forwards a transfer to
//! the [`TransferSink`] only once it is `confirmation_depth` blocks deep and its
//! block is still canonical. Transfers from reorged blocks are never forwarded.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::{MonitorError, MonitorState};
use crate::chain::types::{normalize_address, same_address};
use crate::chain::{BlockFeed, BlockHead, ChainAccess, ChainNotification, ChainTransferEvent, TransferKey};
use crate::events::{AlertSeverity, SettlementEvent, SettlementNotifier};

/// Receives confirmed, canonical transfers. Must tolerate redelivery.
#[async_trait]
pub trait TransferSink: Send + Sync {
    async fn on_confirmed_transfer(&self, event: ChainTransferEvent) -> Result<(), MonitorError>;
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub confirmation_depth: u64,
    /// Blocks re-scanned on (re)subscribe
    pub rescan_blocks: u64,
    pub channel_capacity: usize,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: 12,
            rescan_blocks: 64,
            channel_capacity: 256,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            max_reconnect_attempts: 10,
        }
    }
}

impl MonitorConfig {
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.reconnect_base.saturating_mul(factor).min(self.reconnect_max)
    }
}

enum MonitorCommand {
    RotateAddress {
        address: String,
        ack: oneshot::Sender<()>,
    },
    Stop,
}

/// Control handle for a spawned monitor.
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
    state: watch::Receiver<MonitorState>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state.clone()
    }

    /// Swap the watched address without losing already-observed transfers.
    pub async fn rotate_address(&self, address: &str) -> Result<(), MonitorError> {
        let address = normalize_address(address)?;
        let (ack, done) = oneshot::channel();
        self.commands
            .send(MonitorCommand::RotateAddress { address, ack })
            .await
            .map_err(|_| MonitorError::NotRunning)?;
        done.await.map_err(|_| MonitorError::NotRunning)
    }

    /// Kill the task without a clean stop, as a crashed monitor would.
    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.task.abort();
    }

    /// Stop and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.commands.send(MonitorCommand::Stop).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Monitor task ended abnormally");
        }
    }
}

enum LoopExit {
    Stop,
    Reconnect(String),
    Resubscribe,
}

pub struct EventMonitor {
    access: Arc<ChainAccess>,
    feed: Arc<dyn BlockFeed>,
    sink: Arc<dyn TransferSink>,
    notifier: Arc<dyn SettlementNotifier>,
    config: MonitorConfig,
    address: String,
    /// Observed, not yet forwarded
    pending: BTreeMap<TransferKey, ChainTransferEvent>,
    /// Forwarded keys with their block, pruned behind the rescan window
    forwarded: BTreeMap<TransferKey, u64>,
    last_scanned: Option<u64>,
    last_head: Option<BlockHead>,
    /// Forced rescan start after a reorg; cleared only once that rescan succeeds
    rewind_to: Option<u64>,
    state_tx: watch::Sender<MonitorState>,
}

impl EventMonitor {
    pub fn new(
        access: Arc<ChainAccess>,
        feed: Arc<dyn BlockFeed>,
        sink: Arc<dyn TransferSink>,
        notifier: Arc<dyn SettlementNotifier>,
        address: &str,
        config: MonitorConfig,
    ) -> Result<Self, MonitorError> {
        let (state_tx, _) = watch::channel(MonitorState::Stopped);
        Ok(Self {
            access,
            feed,
            sink,
            notifier,
            config,
            address: normalize_address(address)?,
            pending: BTreeMap::new(),
            forwarded: BTreeMap::new(),
            last_scanned: None,
            last_head: None,
            rewind_to: None,
            state_tx,
        })
    }

    pub fn spawn(self) -> MonitorHandle {
        let (commands, rx) = mpsc::channel(8);
        let state = self.state_tx.subscribe();
        let task = tokio::spawn(self.run(rx));
        MonitorHandle {
            commands,
            state,
            task,
        }
    }

    fn set_state(&self, state: MonitorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Monitor state change");
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<MonitorCommand>) {
        self.set_state(MonitorState::Starting);
        info!(
            address = %self.address,
            feed = self.feed.name(),
            depth = self.config.confirmation_depth,
            "Event monitor starting"
        );

        let mut failures = 0u32;
        loop {
            let exit = match self.connect().await {
                Ok(mut feed) => {
                    failures = 0;
                    self.set_state(MonitorState::Running);
                    self.consume(&mut feed, &mut commands).await
                }
                Err(e) => LoopExit::Reconnect(e.to_string()),
            };

            match exit {
                LoopExit::Stop => break,
                LoopExit::Resubscribe => continue,
                LoopExit::Reconnect(reason) => {
                    failures = failures.saturating_add(1);
                    // alert once per outage, then keep trying at the capped delay
                    if failures == self.config.max_reconnect_attempts.saturating_add(1) {
                        error!(
                            attempts = self.config.max_reconnect_attempts,
                            reason,
                            "Reconnect attempts exhausted, retrying at max backoff"
                        );
                        self.notifier.publish(SettlementEvent::alert(
                            AlertSeverity::Critical,
                            "event_monitor",
                            format!(
                                "subscription lost after {} reconnect attempts: {}",
                                self.config.max_reconnect_attempts, reason
                            ),
                        ));
                    }
                    self.set_state(MonitorState::Reconnecting);
                    let delay = self.config.reconnect_delay(failures);
                    warn!(attempt = failures, ?delay, reason, "Resubscribing after backoff");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        cmd = commands.recv() => match cmd {
                            None | Some(MonitorCommand::Stop) => break,
                            Some(MonitorCommand::RotateAddress { address, ack }) => {
                                self.rotate(address);
                                let _ = ack.send(());
                            }
                        },
                    }
                }
            }
        }

        self.set_state(MonitorState::Stopped);
        info!(pending = self.pending.len(), "Event monitor stopped");
    }

    /// Subscribe, then catch up on anything missed while unsubscribed.
    async fn connect(&mut self) -> Result<crate::chain::FeedHandle, MonitorError> {
        let feed = self.feed.subscribe(self.config.channel_capacity).await?;
        self.rescan().await?;
        Ok(feed)
    }

    async fn consume(
        &mut self,
        feed: &mut crate::chain::FeedHandle,
        commands: &mut mpsc::Receiver<MonitorCommand>,
    ) -> LoopExit {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None | Some(MonitorCommand::Stop) => return LoopExit::Stop,
                    Some(MonitorCommand::RotateAddress { address, ack }) => {
                        self.rotate(address);
                        let _ = ack.send(());
                        return LoopExit::Resubscribe;
                    }
                },
                note = feed.next() => match note {
                    Some(ChainNotification::NewHead(head)) => {
                        let number = head.number;
                        if let Err(e) = self.on_head(head).await {
                            warn!(head = number, error = %e, "Head processing failed, retrying on next head");
                        }
                    }
                    Some(ChainNotification::Disconnected(reason)) => {
                        return LoopExit::Reconnect(reason);
                    }
                    None => return LoopExit::Reconnect("feed closed".to_string()),
                },
            }
        }
    }

    fn rotate(&mut self, address: String) {
        info!(from = %self.address, to = %address, "Rotating watched receiving address");
        self.address = address;
        // new address needs its own rescan window
        self.last_scanned = None;
    }

    async fn rescan(&mut self) -> Result<(), MonitorError> {
        let tip = self.access.block_number().await?;
        let window_start = tip.saturating_sub(self.config.rescan_blocks);
        let from = match self.last_scanned {
            Some(scanned) => (scanned + 1).min(window_start),
            None => window_start,
        };
        debug!(from, tip, "Rescanning transfer logs");
        self.catch_up(from, tip).await?;
        self.last_scanned = Some(tip);
        self.last_head = self.access.block_by_number(tip).await?;
        self.process_confirmations(tip).await
    }

    /// Scan `[from, to]`, widened down to any outstanding reorg rewind.
    ///
    /// Pending transfers inside a rewound range are replaced only after the
    /// logs were fetched, so a failed scan loses nothing.
    async fn catch_up(&mut self, from: u64, to: u64) -> Result<(), MonitorError> {
        let from = self.rewind_to.map_or(from, |r| r.min(from));
        if from > to {
            return Ok(());
        }
        let events = self.access.transfer_logs(&self.address, from, to).await?;
        if self.rewind_to.take().is_some() {
            self.discard_from(from);
        }
        for event in events {
            self.observe(event);
        }
        Ok(())
    }

    fn schedule_rewind(&mut self, orphan_block: u64, tip: u64) -> u64 {
        let start = orphan_block.min(tip.saturating_sub(self.config.confirmation_depth));
        let start = self.rewind_to.map_or(start, |r| r.min(start));
        self.rewind_to = Some(start);
        start
    }

    /// First block of our processed chain known to be orphaned, if any.
    async fn detect_reorg(&self, head: &BlockHead) -> Result<Option<u64>, MonitorError> {
        let Some(prev) = &self.last_head else {
            return Ok(None);
        };
        if head.number == prev.number && head.hash == prev.hash {
            return Ok(None);
        }
        if head.number <= prev.number {
            return Ok(Some(head.number));
        }
        if head.number == prev.number + 1 && head.parent_hash == prev.hash {
            return Ok(None);
        }
        // skipped heads or a parent mismatch: is our last head still canonical?
        let canonical = self.access.block_hash(prev.number).await?;
        if canonical.as_deref() == Some(prev.hash.as_str()) {
            Ok(None)
        } else {
            Ok(Some(prev.number))
        }
    }

    fn observe(&mut self, event: ChainTransferEvent) {
        let key = event.key();
        if self.forwarded.contains_key(&key) {
            return;
        }
        match self.pending.get(&key) {
            Some(existing) if existing.block_hash == event.block_hash => {}
            _ => {
                debug!(key = %key, block = event.block_number, amount = %event.amount, "Observed transfer");
                self.pending.insert(key, event);
            }
        }
    }

    async fn on_head(&mut self, head: BlockHead) -> Result<(), MonitorError> {
        let tip = head.number;
        if let Some(orphan) = self.detect_reorg(&head).await? {
            let rewind_to = self.schedule_rewind(orphan, tip);
            warn!(head = tip, orphan, rewind_to, "Chain reorganization detected, rescanning");
        }

        let from = self.last_scanned.map_or(tip, |s| s + 1);
        self.catch_up(from, tip).await?;

        self.last_scanned = Some(tip);
        self.last_head = Some(head);
        self.process_confirmations(tip).await
    }

    fn discard_from(&mut self, block: u64) {
        let before = self.pending.len();
        let address = self.address.clone();
        self.pending
            .retain(|_, e| e.block_number < block || !same_address(&e.to_address, &address));
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(dropped, from_block = block, "Discarded pending transfers for rescan");
        }
    }

    async fn process_confirmations(&mut self, tip: u64) -> Result<(), MonitorError> {
        let mut due: Vec<ChainTransferEvent> = self
            .pending
            .values()
            .filter(|e| tip.saturating_sub(e.block_number) >= self.config.confirmation_depth)
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.block_number, e.log_index));

        let mut orphaned: Option<u64> = None;
        for event in due {
            let key = event.key();
            let canonical = self.access.block_hash(event.block_number).await?;
            if canonical.as_deref() != Some(event.block_hash.as_str()) {
                warn!(
                    key = %key,
                    block = event.block_number,
                    observed_hash = %event.block_hash,
                    canonical_hash = ?canonical,
                    "Transfer block no longer canonical, dropping"
                );
                self.pending.remove(&key);
                orphaned = Some(orphaned.map_or(event.block_number, |b| b.min(event.block_number)));
                continue;
            }

            match self.sink.on_confirmed_transfer(event.clone()).await {
                Ok(()) => {
                    self.pending.remove(&key);
                    self.forwarded.insert(key, event.block_number);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Sink failed, will retry on next head");
                }
            }
        }

        // re-included transfers may sit at another height, rescan up to the tip
        if let Some(block) = orphaned {
            let rewind_to = self.schedule_rewind(block, tip);
            self.catch_up(rewind_to, tip).await?;
        }

        let horizon = tip.saturating_sub(self.config.rescan_blocks + self.config.confirmation_depth);
        self.forwarded.retain(|_, block| *block >= horizon);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{MockChain, MockFeed};
    use crate::chain::{ChainAccessConfig, ChainError, RateLimitParams, RetrySettings, RpcTier};
    use crate::events::testing::RecordingNotifier;
    use crate::money::MoneyAmount;
    use std::sync::Mutex;

    pub const WATCHED: &str = "0x1111111111111111111111111111111111111111";
    const OTHER: &str = "0x2222222222222222222222222222222222222222";

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ChainTransferEvent>>,
        fail_next: Mutex<u32>,
    }

    impl RecordingSink {
        fn keys(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.key().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl TransferSink for RecordingSink {
        async fn on_confirmed_transfer(&self, event: ChainTransferEvent) -> Result<(), MonitorError> {
            {
                let mut fail = self.fail_next.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(MonitorError::Sink("store unavailable".into()));
                }
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Fixture {
        chain: Arc<MockChain>,
        feed: Arc<MockFeed>,
        sink: Arc<RecordingSink>,
        notifier: Arc<RecordingNotifier>,
        handle: MonitorHandle,
    }

    fn access(chain: Arc<MockChain>) -> Arc<ChainAccess> {
        Arc::new(
            ChainAccess::new(
                chain,
                ChainAccessConfig {
                    limits: RateLimitParams::for_tier(RpcTier::Enterprise),
                    retry: RetrySettings {
                        max_retries: 1,
                        base_delay: Duration::from_millis(1),
                        max_delay: Duration::from_millis(5),
                    },
                    log_chunk_size: 1_000,
                },
            )
            .unwrap(),
        )
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            confirmation_depth: 12,
            rescan_blocks: 20,
            channel_capacity: 16,
            reconnect_base: Duration::from_millis(5),
            reconnect_max: Duration::from_millis(20),
            max_reconnect_attempts: 3,
        }
    }

    async fn start(tip: u64) -> Fixture {
        let chain = Arc::new(MockChain::new());
        chain.mine_to(tip);
        let feed = Arc::new(MockFeed::new());
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let handle = EventMonitor::new(
            access(chain.clone()),
            feed.clone(),
            sink.clone(),
            notifier.clone(),
            WATCHED,
            config(),
        )
        .unwrap()
        .spawn();
        wait_for_state(&handle, MonitorState::Running).await;
        Fixture {
            chain,
            feed,
            sink,
            notifier,
            handle,
        }
    }

    async fn wait_for_state(handle: &MonitorHandle, state: MonitorState) {
        let mut rx = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met");
    }

    async fn advance(f: &Fixture, to: u64) {
        for n in (f.chain.head().number + 1)..=to {
            f.chain.mine_to(n);
            f.feed.push_head(f.chain.block(n)).await;
        }
    }

    /// Let the monitor drain its feed
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_forwards_only_after_confirmation_depth() {
        let f = start(100).await;
        f.feed.wait_for_subscriptions(1).await;

        f.chain.mine_to(101);
        f.chain.add_transfer("0xaa", 0, WATCHED, MoneyAmount::from_whole(10), 101);
        f.chain.add_transfer("0xbb", 0, OTHER, MoneyAmount::from_whole(10), 101);
        f.feed.push_head(f.chain.block(101)).await;

        advance(&f, 112).await;
        settle().await;
        assert!(f.sink.keys().is_empty(), "11 confirmations is not enough");

        advance(&f, 113).await;
        wait_until(|| f.sink.keys().len() == 1).await;
        assert_eq!(f.sink.keys(), vec!["0xaa:0".to_string()]);

        advance(&f, 120).await;
        settle().await;
        assert_eq!(f.sink.keys().len(), 1, "forwarded exactly once");
        f.handle.stop().await;
    }

    #[tokio::test]
    async fn test_reorged_transfer_is_never_forwarded() {
        let f = start(100).await;

        f.chain.mine_to(105);
        f.chain.add_transfer("0xdead", 0, WATCHED, MoneyAmount::from_whole(5), 105);
        for n in 101..=105 {
            f.feed.push_head(f.chain.block(n)).await;
        }
        settle().await;

        // fork replaces block 105 onward; the transfer is gone
        f.chain.reorg_from(104);
        f.feed.push_head(f.chain.block(105)).await;
        advance(&f, 125).await;
        settle().await;

        assert!(f.sink.keys().is_empty());
        f.handle.stop().await;
    }

    #[tokio::test]
    async fn test_sink_failure_is_retried_on_next_head() {
        let f = start(100).await;
        *f.sink.fail_next.lock().unwrap() = 1;

        f.chain.mine_to(101);
        f.chain.add_transfer("0xaa", 3, WATCHED, MoneyAmount::from_whole(1), 101);
        advance(&f, 113).await;
        settle().await;
        assert!(f.sink.keys().is_empty());

        advance(&f, 114).await;
        wait_until(|| f.sink.keys() == vec!["0xaa:3".to_string()]).await;
        f.handle.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_resubscribes_and_catches_up() {
        let f = start(100).await;
        f.feed.disconnect("socket reset").await;
        f.feed.wait_for_subscriptions(2).await;
        wait_for_state(&f.handle, MonitorState::Running).await;

        // transfer mined while no head was delivered still gets picked up
        f.chain.mine_to(110);
        f.chain.add_transfer("0xcafe", 1, WATCHED, MoneyAmount::from_whole(3), 106);
        f.feed.disconnect("again").await;
        f.feed.wait_for_subscriptions(3).await;
        wait_for_state(&f.handle, MonitorState::Running).await;

        advance(&f, 118).await;
        wait_until(|| f.sink.keys() == vec!["0xcafe:1".to_string()]).await;
        f.handle.stop().await;
    }

    #[tokio::test]
    async fn test_transfer_reincluded_at_other_height_after_skipped_heads() {
        let f = start(100).await;

        f.chain.mine_to(101);
        f.chain.add_transfer("0xfeed", 0, WATCHED, MoneyAmount::from_whole(7), 101);
        f.feed.push_head(f.chain.block(101)).await;
        f.chain.mine_to(105);
        f.feed.push_head(f.chain.block(105)).await;
        settle().await;

        // polling feed skips 106..109; the transfer lands again at 103 on the new fork
        f.chain.reorg_from(101);
        f.chain.add_transfer("0xfeed", 0, WATCHED, MoneyAmount::from_whole(7), 103);
        f.chain.mine_to(110);
        f.feed.push_head(f.chain.block(110)).await;

        advance(&f, 130).await;
        wait_until(|| !f.sink.keys().is_empty()).await;
        settle().await;
        assert_eq!(f.sink.keys(), vec!["0xfeed:0".to_string()]);
        let forwarded = f.sink.events.lock().unwrap()[0].clone();
        assert_eq!(forwarded.block_number, 103);
        assert_eq!(forwarded.block_hash, f.chain.block_hash_at(103));
        f.handle.stop().await;
    }

    #[tokio::test]
    async fn test_failed_reorg_rescan_keeps_pending_transfer() {
        let f = start(100).await;

        f.chain.mine_to(101);
        f.chain.add_transfer("0xbeef", 0, WATCHED, MoneyAmount::from_whole(4), 101);
        f.feed.push_head(f.chain.block(101)).await;
        advance(&f, 105).await;
        settle().await;

        // shallow fork above the transfer; the rescan it triggers fails
        f.chain.reorg_from(104);
        f.chain.fail_next(ChainError::Parse("truncated log payload".into()));
        f.feed.push_head(f.chain.block(104)).await;
        settle().await;

        // next head skips ahead, the rewind must still be honored
        f.chain.mine_to(110);
        f.feed.push_head(f.chain.block(110)).await;
        advance(&f, 125).await;
        wait_until(|| f.sink.keys() == vec!["0xbeef:0".to_string()]).await;
        f.handle.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_alerts_and_keeps_retrying() {
        let f = start(100).await;
        f.feed.fail_subscribes(5);
        f.feed.disconnect("gone").await;

        wait_until(|| f.notifier.count("alert") == 1).await;
        f.feed.wait_for_subscriptions(2).await;
        wait_for_state(&f.handle, MonitorState::Running).await;
        assert_eq!(f.notifier.count("alert"), 1);

        f.chain.mine_to(101);
        f.chain.add_transfer("0xaa", 0, WATCHED, MoneyAmount::from_whole(1), 101);
        f.feed.push_head(f.chain.block(101)).await;
        advance(&f, 113).await;
        wait_until(|| f.sink.keys() == vec!["0xaa:0".to_string()]).await;
        f.handle.stop().await;
    }

    #[tokio::test]
    async fn test_rotate_address_keeps_pending() {
        let f = start(100).await;

        f.chain.mine_to(101);
        f.chain.add_transfer("0xold", 0, WATCHED, MoneyAmount::from_whole(1), 101);
        f.feed.push_head(f.chain.block(101)).await;
        settle().await;

        f.chain.mine_to(102);
        f.chain.add_transfer("0xnew", 0, OTHER, MoneyAmount::from_whole(2), 102);
        f.handle.rotate_address(OTHER).await.unwrap();
        f.feed.wait_for_subscriptions(2).await;
        wait_for_state(&f.handle, MonitorState::Running).await;

        advance(&f, 114).await;
        wait_until(|| f.sink.keys().len() == 2).await;
        assert_eq!(f.sink.keys(), vec!["0xold:0".to_string(), "0xnew:0".to_string()]);
        f.handle.stop().await;
    }
}
