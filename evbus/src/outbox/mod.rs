//! Outbox 扩展点（outbox）
//!
//! 可选的持久化投递层，不改变发布方与订阅方代码：
//! - `DurablePublisher`：写入记录后分发，或在调用方事务中暂存、提交后分发；
//! - `RedeliveryWorker`：认领到期记录重投，指数退避，超过次数进入死信；
//! - `OutboxStore`：存储接口，内置内存实现与 Postgres 实现（`infra-sqlx`）。
//!
//! 投递语义为至少一次：处理器需自行保证幂等。
//!
pub mod config;
pub mod in_memory;
#[cfg(feature = "infra-sqlx")]
pub mod postgres;
pub mod publisher;
pub mod record;
pub mod store;
pub mod worker;

pub use config::RedeliveryConfig;
pub use in_memory::{InMemoryOutboxStore, InMemoryOutboxTx};
#[cfg(feature = "infra-sqlx")]
pub use postgres::PgOutboxStore;
pub use publisher::{Delivery, DurablePublisher, StagedEvent};
pub use record::{DispatchRecord, RecordStatus};
pub use store::{OutboxStore, OutboxTransaction};
pub use worker::{RedeliveryReport, RedeliveryWorker, WorkerHandle};
