//! Transaction drafts, lifecycle records and status lookups

use super::gas::GasPrice;
use crate::error::{TxError, TxResult};
use crate::rpc::{ChainTarget, Receipt};

use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, H256, U256};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use uuid::Uuid;

/// Gas limit of a plain value transfer
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

/// An operation to submit; fields left `None` are filled in by the manager
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionDraft {
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub nonce: Option<u64>,
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

impl TransactionDraft {
    pub fn new(to: Address) -> Self {
        Self {
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn value(mut self, value: impl Into<U256>) -> Self {
        self.value = value.into();
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn gas_limit(mut self, gas_limit: impl Into<U256>) -> Self {
        self.gas_limit = Some(gas_limit.into());
        self
    }

    /// The fee fields currently attached, if a complete set is present
    pub fn fee(&self) -> Option<GasPrice> {
        match (self.max_fee_per_gas, self.max_priority_fee_per_gas, self.gas_price) {
            (Some(max_fee_per_gas), Some(max_priority_fee_per_gas), _) => Some(GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }),
            (_, _, Some(price)) => Some(GasPrice::Legacy(price)),
            _ => None,
        }
    }

    /// Attach one fee set and strip the other
    pub fn with_fee(mut self, fee: GasPrice) -> Self {
        match fee {
            GasPrice::Legacy(price) => {
                self.gas_price = Some(price);
                self.max_fee_per_gas = None;
                self.max_priority_fee_per_gas = None;
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                self.gas_price = None;
                self.max_fee_per_gas = Some(max_fee_per_gas);
                self.max_priority_fee_per_gas = Some(max_priority_fee_per_gas);
            }
        }
        self
    }

    /// Call object for `eth_estimateGas`
    pub fn call_object(&self, from: Address) -> Value {
        let mut call = json!({
            "from": from,
            "value": self.value,
            "data": self.data,
        });
        if let Some(to) = self.to {
            call["to"] = json!(to);
        }
        call
    }

    /// Build the signable transaction; nonce, gas limit and fee must be set
    pub fn to_typed_transaction(&self, from: Address, chain_id: u64) -> TxResult<TypedTransaction> {
        let nonce = self
            .nonce
            .ok_or_else(|| TxError::Signing("draft has no nonce".to_string()))?;
        let gas_limit = self
            .gas_limit
            .ok_or_else(|| TxError::Signing("draft has no gas limit".to_string()))?;
        let fee = self
            .fee()
            .ok_or_else(|| TxError::Signing("draft has no fee".to_string()))?;

        let typed = match fee {
            GasPrice::Legacy(price) => {
                let mut tx = TransactionRequest::new()
                    .from(from)
                    .value(self.value)
                    .data(self.data.clone())
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(price)
                    .chain_id(chain_id);
                if let Some(to) = self.to {
                    tx = tx.to(to);
                }
                TypedTransaction::Legacy(tx)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut tx = Eip1559TransactionRequest::new()
                    .from(from)
                    .value(self.value)
                    .data(self.data.clone())
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas)
                    .chain_id(chain_id);
                if let Some(to) = self.to {
                    tx = tx.to(to);
                }
                TypedTransaction::Eip1559(tx)
            }
        };

        Ok(typed)
    }
}

/// Lifecycle state; everything but `Pending` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
    Timeout,
    Cancelled,
    Replaced,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Timeout => "timeout",
            TxStatus::Cancelled => "cancelled",
            TxStatus::Replaced => "replaced",
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broadcast transaction and everything learned about it since
#[derive(Debug, Clone, Serialize)]
pub struct PendingTransaction {
    pub id: Uuid,
    pub hash: H256,
    pub target: ChainTarget,
    pub from: Address,
    pub nonce: u64,
    /// Fully populated draft that was signed
    pub draft: TransactionDraft,
    pub status: TxStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip)]
    pub submitted_instant: Instant,
    pub finalized_at: Option<DateTime<Utc>>,
    pub confirmations: u64,
    pub receipt: Option<Receipt>,
    /// Hash of the cancel/speed-up that superseded this one
    pub replaced_by: Option<H256>,
    /// Hash this transaction superseded
    pub replaces: Option<H256>,
}

impl PendingTransaction {
    pub fn new(
        hash: H256,
        target: ChainTarget,
        from: Address,
        draft: TransactionDraft,
        replaces: Option<H256>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            hash,
            target,
            from,
            nonce: draft.nonce.unwrap_or_default(),
            draft,
            status: TxStatus::Pending,
            submitted_at: Utc::now(),
            submitted_instant: Instant::now(),
            finalized_at: None,
            confirmations: 0,
            receipt: None,
            replaced_by: None,
            replaces,
        }
    }
}

/// Result of a status lookup by hash
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", content = "transaction", rename_all = "lowercase")]
pub enum TxLookup {
    /// Still tracked in the live index
    Live(PendingTransaction),
    /// Reached a terminal state
    History(PendingTransaction),
    Unknown,
}

impl TxLookup {
    pub fn transaction(&self) -> Option<&PendingTransaction> {
        match self {
            TxLookup::Live(tx) | TxLookup::History(tx) => Some(tx),
            TxLookup::Unknown => None,
        }
    }

    pub fn status(&self) -> Option<TxStatus> {
        self.transaction().map(|tx| tx.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eip1559() -> GasPrice {
        GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(50),
            max_priority_fee_per_gas: U256::from(2),
        }
    }

    #[test]
    fn test_with_fee_strips_the_other_set() {
        let draft = TransactionDraft::new(Address::repeat_byte(1))
            .with_fee(GasPrice::Legacy(U256::from(7)))
            .with_fee(eip1559());
        assert_eq!(draft.gas_price, None);
        assert_eq!(draft.fee(), Some(eip1559()));

        let draft = draft.with_fee(GasPrice::Legacy(U256::from(9)));
        assert_eq!(draft.max_fee_per_gas, None);
        assert_eq!(draft.max_priority_fee_per_gas, None);
        assert_eq!(draft.fee(), Some(GasPrice::Legacy(U256::from(9))));
    }

    #[test]
    fn test_typed_transaction_requires_nonce_gas_and_fee() {
        let from = Address::repeat_byte(2);
        let draft = TransactionDraft::new(Address::repeat_byte(1)).value(5u64);
        assert!(draft.to_typed_transaction(from, 1).is_err());

        let draft = draft.nonce(3).gas_limit(21_000u64).with_fee(eip1559());
        let typed = draft.to_typed_transaction(from, 1).unwrap();
        assert!(matches!(typed, TypedTransaction::Eip1559(_)));
        assert_eq!(typed.nonce(), Some(&U256::from(3)));
        assert_eq!(typed.value(), Some(&U256::from(5)));
    }

    #[test]
    fn test_call_object_omits_missing_recipient() {
        let draft = TransactionDraft {
            data: Bytes::from(vec![0x60, 0x00]),
            ..TransactionDraft::default()
        };
        let call = draft.call_object(Address::zero());
        assert!(call.get("to").is_none());
        assert_eq!(call["data"], "0x6000");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TxStatus::Pending.is_terminal());
        for status in [
            TxStatus::Confirmed,
            TxStatus::Failed,
            TxStatus::Timeout,
            TxStatus::Cancelled,
            TxStatus::Replaced,
        ] {
            assert!(status.is_terminal());
        }
    }
}
