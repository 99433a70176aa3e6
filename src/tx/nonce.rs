//! Nonce sequencing for one signing identity
//!
//! The counter sits behind an async mutex: reading and incrementing it is the
//! only serialized step of transaction submission.

use crate::error::{TxError, TxResult};
use crate::rpc::{ChainTarget, RpcClient};

use ethers::types::Address;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Hands out strictly increasing nonces for one (signer, chain, network)
pub struct NonceSequencer {
    address: Address,
    target: ChainTarget,
    /// Next nonce to hand out; `None` until first synced with the chain
    next: Mutex<Option<u64>>,
}

impl NonceSequencer {
    pub fn new(address: Address, target: ChainTarget) -> Self {
        Self {
            address,
            target,
            next: Mutex::new(None),
        }
    }

    /// Seed the counter from the chain's pending transaction count
    pub async fn initialize(&self, client: &RpcClient) -> TxResult<u64> {
        let mut next = self.next.lock().await;
        let on_chain = self.fetch(client).await?;
        *next = Some(on_chain);

        info!(
            address = ?self.address,
            chain_target = %self.target,
            nonce = on_chain,
            "Nonce sequencer initialized"
        );
        Ok(on_chain)
    }

    /// Read and increment; initializes lazily on first use
    pub async fn next(&self, client: &RpcClient) -> TxResult<u64> {
        let mut next = self.next.lock().await;
        let nonce = match *next {
            Some(nonce) => nonce,
            None => self.fetch(client).await?,
        };
        *next = Some(nonce + 1);

        debug!(address = ?self.address, nonce, "Allocated nonce");
        Ok(nonce)
    }

    /// Hand back a nonce that never reached the network
    ///
    /// Only the most recently issued nonce can be reclaimed; returns whether
    /// the counter moved back.
    pub async fn release(&self, nonce: u64) -> bool {
        let mut next = self.next.lock().await;
        if *next != nonce.checked_add(1) {
            return false;
        }
        *next = Some(nonce);

        debug!(address = ?self.address, nonce, "Released unused nonce");
        true
    }

    /// Raise the counter to the chain's pending count if the chain is ahead
    pub async fn resync(&self, client: &RpcClient) -> TxResult<u64> {
        let mut next = self.next.lock().await;
        let on_chain = self.fetch(client).await?;

        let synced = match *next {
            Some(local) if local >= on_chain => local,
            Some(local) => {
                warn!(
                    address = ?self.address,
                    local,
                    on_chain,
                    "Chain nonce ahead of local counter, resyncing"
                );
                on_chain
            }
            None => on_chain,
        };
        *next = Some(synced);
        Ok(synced)
    }

    /// Next nonce that would be handed out, if initialized
    pub async fn current(&self) -> Option<u64> {
        *self.next.lock().await
    }

    async fn fetch(&self, client: &RpcClient) -> TxResult<u64> {
        client
            .transaction_count(self.address, "pending", &self.target)
            .await
            .map_err(|e| TxError::NonceInitializationFailed(e.to_string()))
    }
}
