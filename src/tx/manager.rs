//! Transaction lifecycle manager
//!
//! Owns the pending-transaction state machine for one signer on one
//! (chain, network): submission, confirmation tracking, replace-by-fee
//! (cancel / speed-up) and the background timeout sweep.

use super::gas::{format_gwei, gwei_to_wei, GasOptimizer, GasPrice};
use super::nonce::NonceSequencer;
use super::signer::TxSigner;
use super::types::{PendingTransaction, TransactionDraft, TxLookup, TxStatus, TRANSFER_GAS_LIMIT};
use crate::config::TxConfig;
use crate::error::{RpcError, TxError, TxResult};
use crate::rpc::{ChainTarget, Receipt, RpcClient};

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::{Bytes, H256, U256};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Submits and tracks transactions for one signer
pub struct TransactionManager {
    client: Arc<RpcClient>,
    gas: Arc<GasOptimizer>,
    signer: Arc<dyn TxSigner>,
    nonces: NonceSequencer,
    target: ChainTarget,
    config: TxConfig,
    fee_ceiling: U256,
    /// Append-only record of every broadcast, keyed by record id
    history: DashMap<Uuid, PendingTransaction>,
    /// Hash to record id, for every record
    by_hash: DashMap<H256, Uuid>,
    /// Non-terminal transactions, hash to record id
    live: DashMap<H256, Uuid>,
    /// Live transactions plus submissions still in flight
    occupied: AtomicUsize,
}

impl TransactionManager {
    pub fn new(
        client: Arc<RpcClient>,
        gas: Arc<GasOptimizer>,
        signer: Arc<dyn TxSigner>,
        target: ChainTarget,
        config: TxConfig,
    ) -> Self {
        info!(
            address = ?signer.address(),
            chain_target = %target,
            max_pending = config.max_pending_txs,
            "Transaction manager initialized"
        );

        Self {
            nonces: NonceSequencer::new(signer.address(), target.clone()),
            fee_ceiling: gwei_to_wei(config.max_fee_ceiling_gwei),
            client,
            gas,
            signer,
            target,
            config,
            history: DashMap::new(),
            by_hash: DashMap::new(),
            live: DashMap::new(),
            occupied: AtomicUsize::new(0),
        }
    }

    pub fn target(&self) -> &ChainTarget {
        &self.target
    }

    pub fn nonces(&self) -> &NonceSequencer {
        &self.nonces
    }

    pub fn gas(&self) -> &Arc<GasOptimizer> {
        &self.gas
    }

    /// Seed the nonce sequencer from the chain
    pub async fn initialize(&self) -> TxResult<u64> {
        self.nonces.initialize(&self.client).await
    }

    /// Number of non-terminal transactions
    pub fn pending_count(&self) -> usize {
        self.live.len()
    }

    /// Every record ever broadcast, oldest first
    pub fn history(&self) -> Vec<PendingTransaction> {
        let mut records: Vec<PendingTransaction> =
            self.history.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|tx| tx.submitted_at);
        records
    }

    /// Decorate, sign and broadcast a draft; optionally wait for its receipt
    pub async fn submit(
        &self,
        draft: TransactionDraft,
        wait_for_receipt: bool,
    ) -> TxResult<(H256, Option<Receipt>)> {
        let result = self.submit_inner(draft, wait_for_receipt).await;
        if let Err(e) = &result {
            crate::metrics::record_tx_error(&self.target, e.kind());
        }
        result
    }

    async fn submit_inner(
        &self,
        draft: TransactionDraft,
        wait_for_receipt: bool,
    ) -> TxResult<(H256, Option<Receipt>)> {
        self.reserve_slot()?;

        let hash = match self.prepare_and_broadcast(draft).await {
            Ok(hash) => hash,
            Err(e) => {
                self.release_slot();
                return Err(e);
            }
        };

        if !wait_for_receipt {
            return Ok((hash, None));
        }

        let receipt = self.wait_for_receipt(hash, None).await?;
        Ok((hash, Some(receipt)))
    }

    async fn prepare_and_broadcast(&self, draft: TransactionDraft) -> TxResult<H256> {
        let draft = self.gas.decorate(&draft).await?;
        self.check_fee_ceiling(&draft)?;
        self.broadcast(draft, None).await
    }

    /// Poll for a receipt until it reaches the configured depth or `timeout`
    /// (default: the confirmation timeout) elapses
    ///
    /// A timeout here leaves the record pending; the sweep owns that transition.
    pub async fn wait_for_receipt(&self, hash: H256, timeout: Option<Duration>) -> TxResult<Receipt> {
        let limit = timeout.unwrap_or_else(|| Duration::from_secs(self.config.confirmation_timeout_secs));
        let poll = Duration::from_millis(self.config.receipt_poll_interval_ms);
        let deadline = Instant::now().checked_add(limit);

        loop {
            match self.check_confirmation(hash).await {
                Ok(Some((receipt, confirmations))) => {
                    self.finalize(hash, &receipt, confirmations);
                    return Ok(receipt);
                }
                Ok(None) => {}
                Err(TxError::Rpc(e)) if e.is_retryable() => {
                    warn!(tx_hash = ?hash, error = %e, "Receipt poll failed, will retry");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(TxError::ConfirmationTimeout { tx_hash: hash });
                }
                Some(deadline) => poll.min(deadline - now),
                None => poll,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Live record, history entry, or unknown
    pub fn status(&self, hash: &H256) -> TxLookup {
        let id = match self.by_hash.get(hash) {
            Some(id) => *id,
            None => return TxLookup::Unknown,
        };
        let record = match self.history.get(&id) {
            Some(record) => record.clone(),
            None => return TxLookup::Unknown,
        };

        if self.live.contains_key(hash) {
            TxLookup::Live(record)
        } else {
            TxLookup::History(record)
        }
    }

    /// Replace a pending transaction with a zero-value self-transfer at the
    /// same nonce
    pub async fn cancel(&self, hash: H256) -> TxResult<H256> {
        let result = self.replace(hash, Replacement::Cancel).await;
        if let Err(e) = &result {
            crate::metrics::record_tx_error(&self.target, e.kind());
        }
        result
    }

    /// Resubmit a pending transaction's payload at the same nonce with a
    /// higher fee
    pub async fn speed_up(&self, hash: H256) -> TxResult<H256> {
        let result = self.replace(hash, Replacement::SpeedUp).await;
        if let Err(e) = &result {
            crate::metrics::record_tx_error(&self.target, e.kind());
        }
        result
    }

    async fn replace(&self, hash: H256, kind: Replacement) -> TxResult<H256> {
        let original = self.live_record(&hash)?;
        let original_fee = original.draft.fee().ok_or_else(|| {
            TxError::GasEstimation(format!("transaction {:?} carries no fee", hash))
        })?;

        let (draft, bump) = match kind {
            Replacement::Cancel => (
                TransactionDraft {
                    to: Some(self.signer.address()),
                    value: U256::zero(),
                    data: Bytes::new(),
                    nonce: Some(original.nonce),
                    gas_limit: Some(U256::from(TRANSFER_GAS_LIMIT)),
                    ..TransactionDraft::default()
                },
                self.config.cancel_bump_percent,
            ),
            Replacement::SpeedUp => (
                TransactionDraft {
                    nonce: Some(original.nonce),
                    ..original.draft.clone()
                },
                self.config.speed_up_bump_percent,
            ),
        };
        let draft = draft.with_fee(original_fee.bumped(bump));
        self.check_fee_ceiling(&draft)?;

        let new_hash = self.broadcast(draft, Some(hash)).await?;
        // The replacement joins the live index without a reserved slot
        self.occupied.fetch_add(1, Ordering::AcqRel);

        let status = kind.status();
        if self.transition(&hash, status, |record| record.replaced_by = Some(new_hash)) {
            match kind {
                Replacement::Cancel => crate::metrics::record_tx_cancelled(&self.target),
                Replacement::SpeedUp => crate::metrics::record_tx_speedup(&self.target),
            }
        } else {
            warn!(
                tx_hash = ?hash,
                replacement = ?new_hash,
                "Original settled before its replacement was recorded"
            );
        }

        info!(
            tx_hash = ?hash,
            replacement = ?new_hash,
            nonce = original.nonce,
            status = %status,
            "Transaction replaced"
        );
        Ok(new_hash)
    }

    /// One pass over the live index: expire old transactions and settle
    /// confirmed ones; returns how many left the live index
    pub async fn sweep_once(&self) -> usize {
        let timeout = Duration::from_secs(self.config.confirmation_timeout_secs);
        let live: Vec<(H256, Instant)> = self
            .live
            .iter()
            .filter_map(|entry| {
                let hash = *entry.key();
                self.history
                    .get(entry.value())
                    .map(|record| (hash, record.submitted_instant))
            })
            .collect();

        let mut settled = 0;
        for (hash, submitted) in live {
            if submitted.elapsed() >= timeout {
                if self.transition(&hash, TxStatus::Timeout, |_| {}) {
                    crate::metrics::record_tx_timeout(&self.target);
                    warn!(tx_hash = ?hash, "Transaction timed out waiting for confirmation");
                    settled += 1;
                }
                continue;
            }

            match self.check_confirmation(hash).await {
                Ok(Some((receipt, confirmations))) => {
                    if self.finalize(hash, &receipt, confirmations) {
                        settled += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(tx_hash = ?hash, error = %e, "Sweep receipt check failed"),
            }
        }

        if settled > 0 {
            debug!(chain_target = %self.target, settled, "Sweep settled transactions");
        }
        settled
    }

    /// Run `sweep_once` every `sweep_interval_secs`
    pub fn spawn_sweep(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// Assign nonce and gas limit, sign, broadcast and record
    async fn broadcast(&self, draft: TransactionDraft, replaces: Option<H256>) -> TxResult<H256> {
        let (nonce, allocated) = match draft.nonce {
            Some(nonce) => (nonce, false),
            None => (self.nonces.next(&self.client).await?, true),
        };

        let (draft, raw) = match self.build_and_sign(draft, nonce).await {
            Ok(signed) => signed,
            Err(e) => {
                // Nothing reached the network
                if allocated && self.nonces.release(nonce).await {
                    debug!(nonce, error = %e, "Returned nonce after failed preparation");
                }
                return Err(e);
            }
        };
        let local_hash = H256::from_slice(&Keccak256::digest(&raw));

        match self.client.send_raw_transaction(&raw, &self.target).await {
            Ok(hash) => {
                if hash != local_hash {
                    warn!(
                        tx_hash = ?hash,
                        local_hash = ?local_hash,
                        "Node reported a different transaction hash"
                    );
                }
                Ok(self.accept(hash, draft, replaces))
            }
            Err(RpcError::Node { message, .. }) if is_already_known(&message) => {
                // An earlier attempt landed even though its reply was lost
                info!(local_hash = ?local_hash, nonce, "Node already holds transaction");
                Ok(self.accept(local_hash, draft, replaces))
            }
            Err(e @ RpcError::Timeout { .. }) => {
                // The node may still have it; keep the nonce consumed and a terminal record
                let mut record = PendingTransaction::new(
                    local_hash,
                    self.target.clone(),
                    self.signer.address(),
                    draft,
                    replaces,
                );
                record.status = TxStatus::Timeout;
                record.finalized_at = Some(Utc::now());
                self.by_hash.insert(local_hash, record.id);
                self.history.insert(record.id, record);
                crate::metrics::record_tx_timeout(&self.target);

                warn!(local_hash = ?local_hash, nonce, "Broadcast timed out");
                Err(TxError::BroadcastFailed {
                    message: e.to_string(),
                    local_hash: Some(local_hash),
                })
            }
            Err(e) => {
                warn!(local_hash = ?local_hash, nonce, error = %e, "Broadcast failed");
                if matches!(&e, RpcError::Node { message, .. } if is_nonce_too_low(message)) {
                    match self.nonces.resync(&self.client).await {
                        Ok(synced) => info!(nonce = synced, "Nonce resynced after rejection"),
                        Err(sync_err) => warn!(error = %sync_err, "Nonce resync failed"),
                    }
                }
                Err(TxError::BroadcastFailed {
                    message: e.to_string(),
                    local_hash: Some(local_hash),
                })
            }
        }
    }

    /// Fill in nonce and gas limit, then sign
    async fn build_and_sign(
        &self,
        draft: TransactionDraft,
        nonce: u64,
    ) -> TxResult<(TransactionDraft, Bytes)> {
        let gas_limit = match draft.gas_limit {
            Some(gas_limit) => gas_limit,
            None => self.estimate_gas_limit(&draft).await?,
        };
        let draft = TransactionDraft {
            nonce: Some(nonce),
            gas_limit: Some(gas_limit),
            ..draft
        };

        let typed = draft.to_typed_transaction(self.signer.address(), self.signer.chain_id())?;
        let raw = self.signer.sign_transaction(&typed).await?;
        Ok((draft, raw))
    }

    fn accept(&self, hash: H256, draft: TransactionDraft, replaces: Option<H256>) -> H256 {
        let nonce = draft.nonce.unwrap_or_default();
        self.record(PendingTransaction::new(
            hash,
            self.target.clone(),
            self.signer.address(),
            draft,
            replaces,
        ));
        crate::metrics::record_tx_sent(&self.target);
        info!(tx_hash = ?hash, nonce, chain_target = %self.target, "Transaction broadcast");
        hash
    }

    async fn estimate_gas_limit(&self, draft: &TransactionDraft) -> TxResult<U256> {
        let call = draft.call_object(self.signer.address());
        let estimate = self
            .client
            .estimate_gas(call, &self.target)
            .await
            .map_err(|e| match e {
                RpcError::Node { message, .. } => TxError::GasEstimation(message),
                other => TxError::Rpc(other),
            })?;

        let scale = U256::from(100u64.saturating_add(self.config.gas_limit_buffer_percent));
        Ok(estimate.saturating_mul(scale) / 100)
    }

    fn check_fee_ceiling(&self, draft: &TransactionDraft) -> TxResult<()> {
        let fee = draft
            .fee()
            .as_ref()
            .map(GasPrice::fee_per_gas)
            .unwrap_or_default();
        if fee > self.fee_ceiling {
            return Err(TxError::GasPriceTooHigh {
                price: format_gwei(fee),
                ceiling: format_gwei(self.fee_ceiling),
            });
        }
        Ok(())
    }

    /// Receipt plus confirmation count once the configured depth is reached
    async fn check_confirmation(&self, hash: H256) -> TxResult<Option<(Receipt, u64)>> {
        let receipt = match self.client.transaction_receipt(hash, &self.target).await? {
            Some(receipt) => receipt,
            None => return Ok(None),
        };
        let mined_at = match receipt.block_number {
            Some(number) => number.as_u64(),
            None => return Ok(None),
        };

        let depth = self.config.confirmation_depth.max(1);
        if depth == 1 {
            return Ok(Some((receipt, 1)));
        }

        let latest = self.client.block_number(&self.target).await?;
        let confirmations = latest.saturating_sub(mined_at) + 1;
        if confirmations >= depth {
            return Ok(Some((receipt, confirmations)));
        }

        if let Some(id) = self.by_hash.get(&hash).map(|id| *id) {
            if let Some(mut record) = self.history.get_mut(&id) {
                if record.status == TxStatus::Pending {
                    record.confirmations = confirmations;
                }
            }
        }
        Ok(None)
    }

    fn finalize(&self, hash: H256, receipt: &Receipt, confirmations: u64) -> bool {
        let status = if receipt.succeeded() {
            TxStatus::Confirmed
        } else {
            TxStatus::Failed
        };

        let changed = self.transition(&hash, status, |record| {
            record.receipt = Some(receipt.clone());
            record.confirmations = confirmations;
        });
        if changed {
            match status {
                TxStatus::Confirmed => crate::metrics::record_tx_confirmed(&self.target),
                _ => crate::metrics::record_tx_failed(&self.target),
            }
            info!(tx_hash = ?hash, status = %status, confirmations, "Transaction settled");
        }
        changed
    }

    /// Move a pending record to a terminal status; terminal records never change
    fn transition<F>(&self, hash: &H256, status: TxStatus, update: F) -> bool
    where
        F: FnOnce(&mut PendingTransaction),
    {
        let id = match self.by_hash.get(hash) {
            Some(id) => *id,
            None => return false,
        };

        let changed = match self.history.get_mut(&id) {
            Some(mut record) if record.status == TxStatus::Pending => {
                record.status = status;
                record.finalized_at = Some(Utc::now());
                update(record.value_mut());
                true
            }
            _ => false,
        };

        if changed && self.live.remove(hash).is_some() {
            self.release_slot();
            crate::metrics::set_pending_transactions(&self.target, self.live.len());
        }
        changed
    }

    fn record(&self, record: PendingTransaction) {
        let (id, hash) = (record.id, record.hash);
        self.history.insert(id, record);
        self.by_hash.insert(hash, id);
        self.live.insert(hash, id);
        crate::metrics::set_pending_transactions(&self.target, self.live.len());
    }

    fn live_record(&self, hash: &H256) -> TxResult<PendingTransaction> {
        match self.status(hash) {
            TxLookup::Live(record) => Ok(record),
            TxLookup::History(record) => Err(TxError::NotPending {
                tx_hash: *hash,
                status: record.status.to_string(),
            }),
            TxLookup::Unknown => Err(TxError::NotFound { tx_hash: *hash }),
        }
    }

    fn reserve_slot(&self) -> TxResult<()> {
        let max = self.config.max_pending_txs;
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| TxError::MaxPendingExceeded { max })
    }

    fn release_slot(&self) {
        let _ = self
            .occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

fn is_already_known(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("already known") || message.contains("known transaction")
}

fn is_nonce_too_low(message: &str) -> bool {
    message.to_ascii_lowercase().contains("nonce too low")
}

#[derive(Debug, Clone, Copy)]
enum Replacement {
    Cancel,
    SpeedUp,
}

impl Replacement {
    fn status(self) -> TxStatus {
        match self {
            Replacement::Cancel => TxStatus::Cancelled,
            Replacement::SpeedUp => TxStatus::Replaced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GasConfig, RpcConfig, TransportKind};
    use crate::rpc::retry::{Backoff, RetryPolicy};
    use crate::rpc::{Endpoint, EndpointPool};
    use crate::test_utils::{FakeNode, FakeSigner};
    use ethers::types::Address;
    use ethers::utils::keccak256;
    use std::collections::HashSet;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    fn target() -> ChainTarget {
        ChainTarget::new("ethereum", "mainnet")
    }

    fn manager_with(node: &FakeNode, gas: GasConfig, tx: TxConfig) -> Arc<TransactionManager> {
        build(node, gas, tx, RetryPolicy::none())
    }

    fn build(node: &FakeNode, gas: GasConfig, tx: TxConfig, retry: RetryPolicy) -> Arc<TransactionManager> {
        let mut pool = EndpointPool::new();
        pool.add(Endpoint::new(target(), "https://a.example.com", 1.0, TransportKind::Http));
        let client = Arc::new(
            RpcClient::new(Arc::new(pool), Arc::new(node.clone()), &RpcConfig::default())
                .with_retry_policy(retry),
        );
        let optimizer = Arc::new(GasOptimizer::new(client.clone(), target(), &gas));
        Arc::new(TransactionManager::new(
            client,
            optimizer,
            Arc::new(FakeSigner::new(Address::repeat_byte(0xaa), 1)),
            target(),
            tx,
        ))
    }

    fn manager(node: &FakeNode) -> Arc<TransactionManager> {
        manager_with(node, GasConfig::default(), TxConfig::default())
    }

    fn transfer() -> TransactionDraft {
        TransactionDraft::new(Address::repeat_byte(0x11)).value(1_000u64)
    }

    fn record(manager: &TransactionManager, hash: H256) -> PendingTransaction {
        manager.status(&hash).transaction().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_submit_records_pending_transaction() {
        let node = FakeNode::new();
        node.set_pending_nonce(7);
        node.set_estimate_gas(U256::from(50_000));
        let manager = manager(&node);

        let (hash, receipt) = manager.submit(transfer(), false).await.unwrap();
        assert!(receipt.is_none());

        let lookup = manager.status(&hash);
        assert!(matches!(lookup, TxLookup::Live(_)));
        let tx = lookup.transaction().unwrap();
        assert_eq!(tx.status, TxStatus::Pending);
        assert_eq!(tx.nonce, 7);
        // 20% buffer over the estimate
        assert_eq!(tx.draft.gas_limit, Some(U256::from(60_000)));
        assert!(tx.draft.max_fee_per_gas.is_some());
        assert_eq!(tx.draft.gas_price, None);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(node.sent_raw().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_and_wait_confirms() {
        let node = FakeNode::new();
        node.set_auto_mine(true);
        let manager = manager(&node);

        let (hash, receipt) = manager.submit(transfer(), true).await.unwrap();
        assert_eq!(receipt.unwrap().transaction_hash, hash);
        assert_eq!(manager.status(&hash).status(), Some(TxStatus::Confirmed));
        assert!(matches!(manager.status(&hash), TxLookup::History(_)));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reverted_receipt_marks_failed() {
        let node = FakeNode::new();
        let manager = manager(&node);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        node.mine(hash, false);

        let receipt = manager.wait_for_receipt(hash, None).await.unwrap();
        assert!(!receipt.succeeded());
        assert_eq!(manager.status(&hash).status(), Some(TxStatus::Failed));
    }

    #[tokio::test]
    async fn test_pending_ceiling_consumes_no_nonce() {
        let node = FakeNode::new();
        node.set_pending_nonce(100);
        let tx = TxConfig {
            max_pending_txs: 2,
            ..TxConfig::default()
        };
        let manager = manager_with(&node, GasConfig::default(), tx);

        manager.submit(transfer(), false).await.unwrap();
        manager.submit(transfer(), false).await.unwrap();
        let before = manager.nonces().current().await;
        let sent = node.sent_raw().len();

        let err = manager.submit(transfer(), false).await.unwrap_err();
        assert!(matches!(err, TxError::MaxPendingExceeded { max: 2 }));
        assert_eq!(manager.nonces().current().await, before);
        assert_eq!(before, Some(102));
        assert_eq!(node.sent_raw().len(), sent);
    }

    #[tokio::test]
    async fn test_fee_ceiling_rejects_before_nonce() {
        let node = FakeNode::new();
        node.set_base_fee(gwei(400));
        let tx = TxConfig {
            max_fee_ceiling_gwei: 100.0,
            ..TxConfig::default()
        };
        let manager = manager_with(&node, GasConfig::default(), tx);

        let err = manager.submit(transfer(), false).await.unwrap_err();
        assert!(matches!(err, TxError::GasPriceTooHigh { .. }));
        assert_eq!(manager.nonces().current().await, None);
        assert!(node.sent_raw().is_empty());

        // The slot was given back
        node.set_base_fee(gwei(10));
        manager.gas().invalidate();
        manager.submit(transfer(), false).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_get_distinct_gapless_nonces() {
        let node = FakeNode::new();
        node.set_pending_nonce(20);
        let tx = TxConfig {
            max_pending_txs: 100,
            ..TxConfig::default()
        };
        let manager = manager_with(&node, GasConfig::default(), tx);

        let handles: Vec<_> = (0..25)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let draft = transfer().value(i as u64 + 1).gas_limit(21_000u64);
                    manager.submit(draft, false).await.unwrap().0
                })
            })
            .collect();

        let mut nonces = HashSet::new();
        for handle in handles {
            let hash = handle.await.unwrap();
            assert!(nonces.insert(record(&manager, hash).nonce));
        }
        assert_eq!(nonces, (20..45).collect::<HashSet<u64>>());
    }

    #[tokio::test]
    async fn test_cancel_bumps_fee_and_reuses_nonce() {
        let node = FakeNode::new();
        node.set_gas_price(U256::from(50));
        let gas = GasConfig {
            use_eip1559: false,
            min_gas_price_gwei: 0.0,
            ..GasConfig::default()
        };
        let manager = manager_with(&node, gas, TxConfig::default());

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        let nonce_before = manager.nonces().current().await;

        let replacement = manager.cancel(hash).await.unwrap();
        let original = record(&manager, hash);
        let cancel = record(&manager, replacement);

        assert_eq!(original.status, TxStatus::Cancelled);
        assert_eq!(original.replaced_by, Some(replacement));
        assert_eq!(cancel.replaces, Some(hash));
        assert_eq!(cancel.nonce, original.nonce);
        assert_eq!(cancel.draft.to, Some(Address::repeat_byte(0xaa)));
        assert_eq!(cancel.draft.value, U256::zero());
        assert!(cancel.draft.gas_price.unwrap() >= U256::from(55));
        assert_eq!(manager.nonces().current().await, nonce_before);
    }

    #[tokio::test]
    async fn test_cancel_bumps_eip1559_fees_and_reuses_nonce() {
        let node = FakeNode::new();
        node.set_base_fee(U256::from(24));
        let gas = GasConfig {
            base_fee_multiplier: 1.0,
            default_priority_fee_gwei: 0.000_000_026,
            ..GasConfig::default()
        };
        let manager = manager_with(&node, gas, TxConfig::default());

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        let original = record(&manager, hash);
        assert_eq!(original.draft.max_fee_per_gas, Some(U256::from(50)));
        let nonce_before = manager.nonces().current().await;

        let replacement = manager.cancel(hash).await.unwrap();
        let cancel = record(&manager, replacement);

        assert_eq!(record(&manager, hash).status, TxStatus::Cancelled);
        assert_eq!(cancel.nonce, original.nonce);
        assert_eq!(cancel.draft.value, U256::zero());
        assert_eq!(cancel.draft.gas_price, None);
        assert!(cancel.draft.max_fee_per_gas.unwrap() >= U256::from(55));
        assert!(
            cancel.draft.max_priority_fee_per_gas.unwrap()
                > original.draft.max_priority_fee_per_gas.unwrap()
        );
        assert_eq!(manager.nonces().current().await, nonce_before);
    }

    #[tokio::test]
    async fn test_speed_up_keeps_payload_and_bumps_fee() {
        let node = FakeNode::new();
        node.set_base_fee(U256::from(24));
        let gas = GasConfig {
            base_fee_multiplier: 1.0,
            default_priority_fee_gwei: 0.000_000_026,
            ..GasConfig::default()
        };
        let manager = manager_with(&node, gas, TxConfig::default());

        let draft = transfer().data(vec![0xde, 0xad, 0xbe, 0xef]);
        let (hash, _) = manager.submit(draft, false).await.unwrap();
        let original = record(&manager, hash);
        assert_eq!(original.draft.max_fee_per_gas, Some(U256::from(50)));

        let replacement = manager.speed_up(hash).await.unwrap();
        let sped = record(&manager, replacement);

        assert_eq!(record(&manager, hash).status, TxStatus::Replaced);
        assert_eq!(sped.nonce, original.nonce);
        assert_eq!(sped.draft.to, original.draft.to);
        assert_eq!(sped.draft.value, original.draft.value);
        assert_eq!(sped.draft.data, original.draft.data);
        assert_eq!(sped.draft.gas_limit, original.draft.gas_limit);
        assert!(sped.draft.max_fee_per_gas.unwrap() >= U256::from(60));
        assert!(sped.draft.max_priority_fee_per_gas.unwrap() > original.draft.max_priority_fee_per_gas.unwrap());
    }

    #[tokio::test]
    async fn test_replacements_bypass_pending_ceiling() {
        let node = FakeNode::new();
        let tx = TxConfig {
            max_pending_txs: 1,
            ..TxConfig::default()
        };
        let manager = manager_with(&node, GasConfig::default(), tx);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        let replacement = manager.speed_up(hash).await.unwrap();
        assert_eq!(manager.pending_count(), 1);

        // The slot passed to the replacement
        assert!(matches!(
            manager.submit(transfer(), false).await,
            Err(TxError::MaxPendingExceeded { .. })
        ));
        node.mine(replacement, true);
        manager.sweep_once().await;
        manager.submit(transfer(), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_replacing_settled_or_unknown_transactions() {
        let node = FakeNode::new();
        node.set_auto_mine(true);
        let manager = manager(&node);

        let (hash, _) = manager.submit(transfer(), true).await.unwrap();
        assert!(matches!(manager.cancel(hash).await, Err(TxError::NotPending { .. })));
        assert!(matches!(
            manager.speed_up(H256::repeat_byte(9)).await,
            Err(TxError::NotFound { .. })
        ));
        assert!(matches!(manager.status(&H256::repeat_byte(9)), TxLookup::Unknown));
    }

    #[tokio::test]
    async fn test_broadcast_rejection_records_nothing_but_consumes_nonce() {
        let node = FakeNode::new();
        node.set_pending_nonce(3);
        node.reject_broadcasts(Some("insufficient funds"));
        let manager = manager(&node);

        let err = manager.submit(transfer(), false).await.unwrap_err();
        let local_hash = match err {
            TxError::BroadcastFailed { local_hash, .. } => local_hash.unwrap(),
            other => panic!("unexpected error: {:?}", other),
        };
        assert!(matches!(manager.status(&local_hash), TxLookup::Unknown));
        assert!(manager.history().is_empty());
        assert_eq!(manager.nonces().current().await, Some(4));
    }

    #[tokio::test]
    async fn test_failed_estimate_returns_nonce() {
        let node = FakeNode::new();
        node.set_pending_nonce(5);
        node.fail_estimates(Some("execution reverted"));
        let manager = manager(&node);

        let err = manager.submit(transfer(), false).await.unwrap_err();
        assert!(matches!(err, TxError::GasEstimation(_)));
        assert_eq!(manager.nonces().current().await, Some(5));
        assert!(node.sent_raw().is_empty());

        node.fail_estimates(None);
        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        assert_eq!(record(&manager, hash).nonce, 5);
    }

    #[tokio::test]
    async fn test_nonce_too_low_resyncs_sequencer() {
        let node = FakeNode::new();
        let manager = manager(&node);
        manager.initialize().await.unwrap();

        // Another sender advanced the account behind our back
        node.set_pending_nonce(9);
        node.reject_broadcasts(Some("nonce too low"));
        let err = manager.submit(transfer(), false).await.unwrap_err();
        assert!(matches!(err, TxError::BroadcastFailed { .. }));
        assert_eq!(manager.nonces().current().await, Some(9));

        node.reject_broadcasts(None);
        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        assert_eq!(record(&manager, hash).nonce, 9);
    }

    #[tokio::test]
    async fn test_lost_reply_then_already_known_is_tracked() {
        let node = FakeNode::new();
        node.lose_broadcast_replies(1);
        let retry = RetryPolicy::new(1, Backoff::Fixed(Duration::ZERO));
        let manager = build(&node, GasConfig::default(), TxConfig::default(), retry);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();

        let sent = node.sent_raw();
        assert_eq!(sent.len(), 1);
        assert_eq!(hash, H256::from(keccak256(&sent[0])));
        assert!(matches!(manager.status(&hash), TxLookup::Live(_)));
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.history().len(), 1);

        node.mine(hash, true);
        assert_eq!(manager.sweep_once().await, 1);
        assert_eq!(manager.status(&hash).status(), Some(TxStatus::Confirmed));
    }

    #[tokio::test]
    async fn test_huge_estimate_saturates_gas_limit() {
        let node = FakeNode::new();
        node.set_estimate_gas(U256::MAX);
        let manager = manager(&node);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        assert_eq!(record(&manager, hash).draft.gas_limit, Some(U256::MAX / 100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_wait_returns_receipt() {
        let node = FakeNode::new();
        let manager = manager(&node);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for_receipt(hash, Some(Duration::MAX)).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        node.mine(hash, true);

        assert!(waiter.await.unwrap().unwrap().succeeded());
        assert_eq!(manager.status(&hash).status(), Some(TxStatus::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_timeout_is_recorded_terminal() {
        let node = FakeNode::new();
        node.set_broadcast_delay(Some(Duration::from_secs(60)));
        let manager = manager(&node);

        let err = manager.submit(transfer(), false).await.unwrap_err();
        let local_hash = match err {
            TxError::BroadcastFailed { local_hash, .. } => local_hash.unwrap(),
            other => panic!("unexpected error: {:?}", other),
        };

        let lookup = manager.status(&local_hash);
        assert!(matches!(lookup, TxLookup::History(_)));
        assert_eq!(lookup.status(), Some(TxStatus::Timeout));
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.nonces().current().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_leaves_record_pending() {
        let node = FakeNode::new();
        let manager = manager(&node);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        let err = manager
            .wait_for_receipt(hash, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::ConfirmationTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(manager.status(&hash).status(), Some(TxStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_and_terminal_state_sticks() {
        let node = FakeNode::new();
        let tx = TxConfig {
            confirmation_timeout_secs: 30,
            ..TxConfig::default()
        };
        let manager = manager_with(&node, GasConfig::default(), tx);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        assert_eq!(manager.sweep_once().await, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.sweep_once().await, 1);
        assert_eq!(manager.status(&hash).status(), Some(TxStatus::Timeout));

        // A late receipt does not resurrect it
        node.mine(hash, true);
        assert_eq!(manager.sweep_once().await, 0);
        assert!(manager.wait_for_receipt(hash, Some(Duration::ZERO)).await.is_ok());
        assert_eq!(manager.status(&hash).status(), Some(TxStatus::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_waits_for_confirmation_depth() {
        let node = FakeNode::new();
        let tx = TxConfig {
            confirmation_depth: 3,
            ..TxConfig::default()
        };
        let manager = manager_with(&node, GasConfig::default(), tx);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        node.mine(hash, true);
        assert_eq!(manager.sweep_once().await, 0);
        assert_eq!(record(&manager, hash).confirmations, 1);

        node.advance_blocks(2);
        assert_eq!(manager.sweep_once().await, 1);
        let settled = record(&manager, hash);
        assert_eq!(settled.status, TxStatus::Confirmed);
        assert_eq!(settled.confirmations, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweep_settles_in_background() {
        let node = FakeNode::new();
        let manager = manager(&node);

        let (hash, _) = manager.submit(transfer(), false).await.unwrap();
        node.mine(hash, true);

        let handle = manager.clone().spawn_sweep();
        tokio::time::sleep(Duration::from_secs(6)).await;
        handle.abort();

        assert_eq!(manager.status(&hash).status(), Some(TxStatus::Confirmed));
    }
}
