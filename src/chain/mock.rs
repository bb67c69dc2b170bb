//! Scriptable chain and subscription doubles for tests.

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::ChainError;
use super::feed::{BlockFeed, ChainNotification, FeedHandle};
use super::rpc::{ChainRpc, methods};
use super::types::{BlockHead, ChainTransferEvent, TxReceipt, same_address};
use crate::money::MoneyAmount;

struct MockState {
    head: u64,
    fork: u64,
    blocks: BTreeMap<u64, BlockHead>,
    logs: Vec<ChainTransferEvent>,
    failures: VecDeque<ChainError>,
    send_failures: VecDeque<ChainError>,
    log_queries: Vec<(u64, u64)>,
    calls: HashMap<&'static str, usize>,
    token_balance: MoneyAmount,
    native_balance: u128,
    nonce: u64,
    gas_price: u128,
    receipts: HashMap<String, TxReceipt>,
    known: HashSet<String>,
    sent: Vec<String>,
}

pub struct MockChain {
    state: Mutex<MockState>,
}

fn block_hash(number: u64, fork: u64) -> String {
    format!("0x{:060x}{:04x}", number, fork)
}

impl MockChain {
    pub fn new() -> Self {
        let genesis = BlockHead {
            number: 0,
            hash: block_hash(0, 0),
            parent_hash: block_hash(0, 0),
        };
        Self {
            state: Mutex::new(MockState {
                head: 0,
                fork: 0,
                blocks: BTreeMap::from([(0, genesis)]),
                logs: Vec::new(),
                failures: VecDeque::new(),
                send_failures: VecDeque::new(),
                log_queries: Vec::new(),
                calls: HashMap::new(),
                token_balance: MoneyAmount::from_whole(1_000_000),
                native_balance: 10u128.pow(18),
                nonce: 0,
                gas_price: 1_000_000_000,
                receipts: HashMap::new(),
                known: HashSet::new(),
                sent: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Extend the canonical chain up to `number`
    pub fn mine_to(&self, number: u64) {
        let mut s = self.state();
        let fork = s.fork;
        for n in (s.head + 1)..=number {
            let parent = s.blocks[&(n - 1)].hash.clone();
            s.blocks.insert(
                n,
                BlockHead {
                    number: n,
                    hash: block_hash(n, fork),
                    parent_hash: parent,
                },
            );
        }
        s.head = s.head.max(number);
    }

    /// Replace every block from `from` onward with a new fork; logs in those blocks vanish.
    pub fn reorg_from(&self, from: u64) {
        let mut s = self.state();
        s.fork += 1;
        let fork = s.fork;
        let head = s.head;
        for n in from.max(1)..=head {
            let parent = s.blocks[&(n - 1)].hash.clone();
            s.blocks.insert(
                n,
                BlockHead {
                    number: n,
                    hash: block_hash(n, fork),
                    parent_hash: parent,
                },
            );
        }
        s.logs.retain(|log| log.block_number < from);
    }

    pub fn head(&self) -> BlockHead {
        let s = self.state();
        s.blocks[&s.head].clone()
    }

    pub fn block(&self, number: u64) -> BlockHead {
        self.state().blocks[&number].clone()
    }

    pub fn block_hash_at(&self, number: u64) -> String {
        self.block(number).hash
    }

    /// Record a transfer in an already mined block
    pub fn add_transfer(
        &self,
        tx_hash: &str,
        log_index: u64,
        to: &str,
        amount: MoneyAmount,
        block: u64,
    ) -> ChainTransferEvent {
        let mut s = self.state();
        let event = ChainTransferEvent {
            tx_hash: tx_hash.to_lowercase(),
            log_index,
            from_address: "0x9999999999999999999999999999999999999999".into(),
            to_address: to.to_lowercase(),
            amount,
            block_number: block,
            block_hash: s.blocks[&block].hash.clone(),
        };
        s.logs.push(event.clone());
        event
    }

    pub fn fail_next(&self, error: ChainError) {
        self.state().failures.push_back(error);
    }

    pub fn fail_next_send(&self, error: ChainError) {
        self.state().send_failures.push_back(error);
    }

    pub fn set_token_balance(&self, amount: MoneyAmount) {
        self.state().token_balance = amount;
    }

    pub fn set_native_balance(&self, wei: u128) {
        self.state().native_balance = wei;
    }

    pub fn set_receipt(&self, tx_hash: &str, block_number: u64, success: bool) {
        let hash = tx_hash.to_lowercase();
        let mut s = self.state();
        s.known.insert(hash.clone());
        s.receipts.insert(
            hash.clone(),
            TxReceipt {
                tx_hash: hash,
                block_number,
                success,
            },
        );
    }

    /// Make a transaction visible in the mempool without broadcasting it
    pub fn mark_known(&self, tx_hash: &str) {
        self.state().known.insert(tx_hash.to_lowercase());
    }

    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state().log_queries.clone()
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    fn begin(&self, method: &'static str) -> Result<std::sync::MutexGuard<'_, MockState>, ChainError> {
        let mut s = self.state();
        *s.calls.entry(method).or_default() += 1;
        match s.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(s),
        }
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.begin(methods::BLOCK_NUMBER)?.head)
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockHead>, ChainError> {
        let s = self.begin(methods::GET_BLOCK)?;
        if number > s.head {
            return Ok(None);
        }
        Ok(s.blocks.get(&number).cloned())
    }

    async fn transfer_logs(
        &self,
        to: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainTransferEvent>, ChainError> {
        let mut s = self.begin(methods::GET_LOGS)?;
        s.log_queries.push((from_block, to_block));
        Ok(s.logs
            .iter()
            .filter(|log| {
                same_address(&log.to_address, to)
                    && log.block_number >= from_block
                    && log.block_number <= to_block
            })
            .cloned()
            .collect())
    }

    async fn token_balance(&self, _owner: &str) -> Result<MoneyAmount, ChainError> {
        Ok(self.begin(methods::TOKEN_BALANCE)?.token_balance.clone())
    }

    async fn native_balance(&self, _owner: &str) -> Result<u128, ChainError> {
        Ok(self.begin(methods::NATIVE_BALANCE)?.native_balance)
    }

    async fn pending_nonce(&self, _owner: &str) -> Result<u64, ChainError> {
        Ok(self.begin(methods::NONCE)?.nonce)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.begin(methods::GAS_PRICE)?.gas_price)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self
            .begin(methods::RECEIPT)?
            .receipts
            .get(&tx_hash.to_lowercase())
            .cloned())
    }

    async fn transaction_known(&self, tx_hash: &str) -> Result<bool, ChainError> {
        Ok(self.begin(methods::GET_TX)?.known.contains(&tx_hash.to_lowercase()))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ChainError> {
        let mut s = self.begin(methods::SEND_RAW)?;
        if let Some(error) = s.send_failures.pop_front() {
            return Err(error);
        }
        let hash = format!("0x{}", hex::encode(Keccak256::digest(raw)));
        s.nonce += 1;
        s.known.insert(hash.clone());
        s.sent.push(hash.clone());
        Ok(hash)
    }
}

/// Subscription double: each `subscribe` opens a fresh channel the test drives.
#[derive(Default)]
pub struct MockFeed {
    senders: Mutex<Vec<mpsc::Sender<ChainNotification>>>,
    fail_subscribe: Mutex<u32>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    /// Fail the next `n` subscribe attempts
    pub fn fail_subscribes(&self, n: u32) {
        *self.fail_subscribe.lock().unwrap() = n;
    }

    /// Sender for the most recent subscription
    pub fn sender(&self) -> mpsc::Sender<ChainNotification> {
        self.senders.lock().unwrap().last().cloned().unwrap()
    }

    pub async fn wait_for_subscriptions(&self, n: usize) {
        for _ in 0..1_000 {
            if self.subscriptions() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} subscriptions, saw {}", n, self.subscriptions());
    }

    pub async fn push_head(&self, head: BlockHead) {
        self.sender()
            .send(ChainNotification::NewHead(head))
            .await
            .unwrap();
    }

    pub async fn disconnect(&self, reason: &str) {
        let sender = self.sender();
        sender
            .send(ChainNotification::Disconnected(reason.to_string()))
            .await
            .unwrap();
    }
}

#[async_trait]
impl BlockFeed for MockFeed {
    async fn subscribe(&self, capacity: usize) -> Result<FeedHandle, ChainError> {
        {
            let mut failures = self.fail_subscribe.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChainError::Subscription("mock subscribe refused".into()));
            }
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.senders.lock().unwrap().push(tx);
        Ok(FeedHandle::new(rx, None))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
