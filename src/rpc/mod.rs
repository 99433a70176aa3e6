//! JSON-RPC access to blockchain nodes through a pool of competing endpoints

pub mod batch;
pub mod cache;
pub mod client;
pub mod endpoint;
pub mod maintenance;
pub mod pool;
pub mod retry;
pub mod transport;
pub mod types;

pub use batch::BatchQueue;
pub use cache::{cache_key, ResultCache};
pub use client::{RpcClient, RpcStats};
pub use endpoint::{Endpoint, EndpointReport, EndpointStats};
pub use maintenance::{InFlightMonitor, PoolLimits, ResourceMonitor};
pub use pool::EndpointPool;
pub use retry::{Backoff, RetryPolicy};
pub use transport::{HttpTransport, Transport};
pub use types::{ChainTarget, JsonRpcErrorObject, JsonRpcRequest, JsonRpcResponse, Receipt};
