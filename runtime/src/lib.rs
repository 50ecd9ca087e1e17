//! # Brokered RPC Runtime
//!
//! Request/response orchestration over a publish/subscribe broker.
//!
//! ## Core Components
//!
//! - **ChannelSession**: one connection and one channel per domain, with bounded reconnection
//! - **ResponseTable**: outstanding requests keyed by correlation id
//! - **ConsumerLoop**: reads the response queue and resolves pending requests
//! - **PublishGate**: FIFO, bounded-concurrency gate around publishing, with pacing
//! - **Producer**: publishes request envelopes on the current channel
//! - **RpcClient**: the `call` surface
//! - **ProviderRegistry**: creates and caches one bundle of the above per domain
//!
//! ## Control Flow
//!
//! ```text
//! caller ─▶ RpcClient::call ─▶ PublishGate ─▶ Producer ─▶ broker
//!                                                           │
//! caller ◀─ ResponseTable::resolve ◀─ ConsumerLoop ◀────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use brokered_rpc_runtime::ProviderRegistry;
//! use brokered_rpc_core::Method;
//!
//! let registry = ProviderRegistry::from_env(broker)?;
//! registry.start_listening("payments").await?;
//! registry.start_publishing("payments").await?;
//!
//! let client = registry.client("payments")?;
//! let receipt: Receipt = client.call_as(Method::new("charge"), &charge).await?;
//! ```

pub mod client;
pub mod consumer;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod observer;
pub mod producer;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod table;

pub use client::{DEFAULT_CALL_TIMEOUT, RpcClient};
pub use consumer::ConsumerLoop;
pub use error::RpcError;
pub use gate::{GatePermit, PublishGate};
pub use observer::LoggingFailureObserver;
pub use producer::Producer;
pub use reconnect::ReconnectPolicy;
pub use registry::{DomainBundle, ProviderRegistry};
pub use session::{ChannelSession, QueueBinding, SessionState, Topology};
pub use table::{ResponseTable, Waiter};
