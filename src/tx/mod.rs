//! Transaction submission with nonce sequencing, fee optimization and
//! lifecycle tracking

pub mod gas;
pub mod manager;
pub mod nonce;
pub mod signer;
pub mod types;

pub use crate::rpc::Receipt;
pub use gas::{CostEstimate, Eip1559Quote, GasOptimizer, GasPrice, GasStrategy};
pub use manager::TransactionManager;
pub use nonce::NonceSequencer;
pub use signer::{LocalWalletSigner, TxSigner};
pub use types::{PendingTransaction, TransactionDraft, TxLookup, TxStatus};
