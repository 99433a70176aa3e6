//! In-memory test doubles shared by the unit tests

use crate::error::{RpcError, RpcResult, TxResult};
use crate::rpc::{ResultCache, Transport};
use crate::tx::TxSigner;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256, U64};
use ethers::utils::keccak256;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

struct NodeState {
    block_number: u64,
    gas_price: U256,
    base_fee: U256,
    pending_nonce: u64,
    estimate_gas: U256,
    estimate_error: Option<String>,
    tips: HashMap<u64, Vec<U256>>,
    failing: HashSet<String>,
    broadcast_error: Option<String>,
    broadcast_delay: Option<Duration>,
    lost_broadcast_replies: usize,
    auto_mine: bool,
    sent_raw: Vec<Bytes>,
    receipts: HashMap<H256, (u64, bool)>,
    urls_seen: Vec<String>,
}

/// Scriptable single-chain node answering the handful of methods the
/// crate uses
#[derive(Clone)]
pub struct FakeNode {
    state: Arc<Mutex<NodeState>>,
}

impl FakeNode {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeState {
                block_number: 100,
                gas_price: U256::exp10(10),
                base_fee: U256::exp10(10),
                pending_nonce: 0,
                estimate_gas: U256::from(21_000),
                estimate_error: None,
                tips: HashMap::new(),
                failing: HashSet::new(),
                broadcast_error: None,
                broadcast_delay: None,
                lost_broadcast_replies: 0,
                auto_mine: false,
                sent_raw: Vec::new(),
                receipts: HashMap::new(),
                urls_seen: Vec::new(),
            })),
        }
    }

    pub fn fail_url(&self, url: &str) {
        self.state.lock().failing.insert(url.to_string());
    }

    pub fn urls_seen(&self) -> Vec<String> {
        self.state.lock().urls_seen.clone()
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().block_number
    }

    pub fn set_block_number(&self, number: u64) {
        self.state.lock().block_number = number;
    }

    pub fn advance_blocks(&self, count: u64) {
        self.state.lock().block_number += count;
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state.lock().gas_price = price;
    }

    pub fn set_base_fee(&self, fee: U256) {
        self.state.lock().base_fee = fee;
    }

    pub fn set_block_tips(&self, block: u64, tips: Vec<U256>) {
        self.state.lock().tips.insert(block, tips);
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        self.state.lock().pending_nonce = nonce;
    }

    pub fn set_estimate_gas(&self, gas: U256) {
        self.state.lock().estimate_gas = gas;
    }

    /// Revert every gas estimate with `message`
    pub fn fail_estimates(&self, message: Option<&str>) {
        self.state.lock().estimate_error = message.map(str::to_string);
    }

    /// Accept the next `count` broadcasts but time out their replies
    pub fn lose_broadcast_replies(&self, count: usize) {
        self.state.lock().lost_broadcast_replies = count;
    }

    /// Answer every broadcast with a node error carrying `message`
    pub fn reject_broadcasts(&self, message: Option<&str>) {
        self.state.lock().broadcast_error = message.map(str::to_string);
    }

    /// Stall every broadcast for `delay` before answering
    pub fn set_broadcast_delay(&self, delay: Option<Duration>) {
        self.state.lock().broadcast_delay = delay;
    }

    /// Mine every accepted broadcast immediately with a successful receipt
    pub fn set_auto_mine(&self, enabled: bool) {
        self.state.lock().auto_mine = enabled;
    }

    /// Include `hash` in the current block
    pub fn mine(&self, hash: H256, success: bool) {
        let mut state = self.state.lock();
        let block = state.block_number;
        state.receipts.insert(hash, (block, success));
    }

    pub fn sent_raw(&self) -> Vec<Bytes> {
        self.state.lock().sent_raw.clone()
    }

    fn answer(&self, request: &Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request["method"].as_str().unwrap_or_default();
        let params = &request["params"];

        match self.dispatch(method, params) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            }),
        }
    }

    fn dispatch(&self, method: &str, params: &Value) -> Result<Value, (i64, String)> {
        let mut state = self.state.lock();
        match method {
            "eth_blockNumber" => Ok(json!(U64::from(state.block_number))),
            "eth_chainId" => Ok(json!("0x1")),
            "eth_gasPrice" => Ok(json!(state.gas_price)),
            "eth_getTransactionCount" => Ok(json!(U256::from(state.pending_nonce))),
            "eth_estimateGas" => match &state.estimate_error {
                Some(message) => Err((3, message.clone())),
                None => Ok(json!(state.estimate_gas)),
            },
            "eth_sendRawTransaction" => {
                if let Some(message) = &state.broadcast_error {
                    return Err((-32000, message.clone()));
                }
                let raw: Bytes = serde_json::from_value(params[0].clone())
                    .map_err(|e| (-32602, e.to_string()))?;
                if state.sent_raw.contains(&raw) {
                    return Err((-32000, "already known".to_string()));
                }
                let hash = H256::from(keccak256(&raw));
                state.sent_raw.push(raw);
                if state.auto_mine {
                    let block = state.block_number;
                    state.receipts.insert(hash, (block, true));
                }
                Ok(json!(hash))
            }
            "eth_getTransactionReceipt" => {
                let hash: H256 = serde_json::from_value(params[0].clone())
                    .map_err(|e| (-32602, e.to_string()))?;
                Ok(match state.receipts.get(&hash) {
                    Some((block, success)) => json!({
                        "transactionHash": hash,
                        "blockNumber": U64::from(*block),
                        "blockHash": H256::from_low_u64_be(*block),
                        "gasUsed": U256::from(21_000),
                        "status": if *success { "0x1" } else { "0x0" },
                    }),
                    None => Value::Null,
                })
            }
            "eth_getBlockByNumber" => {
                let number = match params[0].as_str() {
                    Some("latest") | Some("pending") | None => state.block_number,
                    Some(tag) => u64::from_str_radix(tag.trim_start_matches("0x"), 16)
                        .map_err(|e| (-32602, e.to_string()))?,
                };
                if number > state.block_number {
                    return Ok(Value::Null);
                }
                let transactions: Vec<Value> = state
                    .tips
                    .get(&number)
                    .map(|tips| {
                        tips.iter()
                            .map(|tip| json!({"maxPriorityFeePerGas": tip}))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({
                    "number": U64::from(number),
                    "baseFeePerGas": state.base_fee,
                    "transactions": transactions,
                }))
            }
            other => Err((-32601, format!("method {} not found", other))),
        }
    }
}

#[async_trait]
impl Transport for FakeNode {
    async fn send(&self, url: &str, body: &Value) -> RpcResult<Value> {
        let (failing, delay) = {
            let mut state = self.state.lock();
            state.urls_seen.push(url.to_string());
            (state.failing.contains(url), state.broadcast_delay)
        };
        if failing {
            return Err(RpcError::ConnectionError("connection refused".to_string()));
        }

        let is_broadcast = |request: &Value| request["method"] == "eth_sendRawTransaction";
        let broadcasts = match body {
            Value::Array(requests) => requests.iter().any(is_broadcast),
            request => is_broadcast(request),
        };
        if let (true, Some(delay)) = (broadcasts, delay) {
            tokio::time::sleep(delay).await;
        }

        let reply = match body {
            Value::Array(requests) => Value::Array(requests.iter().map(|r| self.answer(r)).collect()),
            request => self.answer(request),
        };

        if broadcasts {
            let mut state = self.state.lock();
            if state.lost_broadcast_replies > 0 {
                state.lost_broadcast_replies -= 1;
                return Err(RpcError::Timeout { timeout_ms: 0 });
            }
        }
        Ok(reply)
    }

    fn pool_size(&self) -> usize {
        1
    }

    fn resize_pool(&self, _size: usize) -> RpcResult<()> {
        Ok(())
    }

    fn refresh(&self) -> RpcResult<()> {
        Ok(())
    }
}

/// HashMap-backed result cache; `broken()` fails every operation
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Value>>,
    broken: bool,
}

impl MemoryCache {
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        if self.broken {
            anyhow::bail!("cache unavailable");
        }
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value, _ttl: Duration) -> anyhow::Result<()> {
        if self.broken {
            anyhow::bail!("cache unavailable");
        }
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// Signer that skips the signature and returns the unsigned RLP
pub struct FakeSigner {
    address: Address,
    chain_id: u64,
}

impl FakeSigner {
    pub fn new(address: Address, chain_id: u64) -> Self {
        Self { address, chain_id }
    }
}

#[async_trait]
impl TxSigner for FakeSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> TxResult<Bytes> {
        Ok(tx.rlp())
    }
}
