//! # parley-core
//!
//! Real-time delivery and durable persistence pipeline for Parley.
//!
//! ## Architecture
//!
//! - **ConnectionRegistry**: maps a user id to the outbound handle of its live connection
//! - **MessageRouter**: one per accepted connection; delivers inbound frames directly to
//!   the recipient and publishes a durable copy to the log
//! - **DurableLog**: partitioned, at-least-once log (in-memory or Kafka)
//! - **PersistenceConsumer**: single serial reader of the log that stores every message,
//!   with bounded retry and dead-lettering
//! - **MessageStore**: persistence of message records (libSQL)
//!
//! ```text
//! client -> MessageRouter -+-> ConnectionRegistry -> recipient's outbound channel
//!                          |
//!                          +-> log(main) -> PersistenceConsumer -> MessageStore
//!                                                |
//!                                                +-> log(retry) / log(dead-letter)
//! ```

pub mod auth;
pub mod config;
pub mod consumer;
pub mod log;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod store;
pub mod telemetry;

pub use auth::{AuthError, IdentityGate, JwtGate, TokenIssuer};
pub use config::{ConfigError, GatewayConfig, PersistConfig};
pub use consumer::{ConsumerSettings, Outcome, PersistenceConsumer};
pub use log::{LogConsumer, LogError, LogProducer, LogRecord, OutboundRecord};
pub use message::{CodecError, Message, UserId};
pub use registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame, Registration, SendResult};
pub use router::{InboundFrame, MessageRouter, RouterShared};
pub use store::{LibSqlMessageStore, MessageStore, StoreError};
