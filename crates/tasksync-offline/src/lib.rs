//! # TaskSync Offline
//!
//! Client-side support for working without a connection.
//!
//! Mutations made while offline are written to a durable [`SyncStore`]
//! before the UI is told they happened. When the connection returns the
//! [`OfflineQueue`] replays them in order per resource; the server's
//! answer decides whether an item is done, retried later, surfaced as
//! failed, or turned into a [`ConflictRecord`] for the user to settle with
//! the [`ConflictResolver`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tasksync_offline::{FileStore, OfflineQueue, OperationKind, SyncQueueItem, WsClient};
//! use tasksync_types::ResourceKind;
//!
//! # async fn run() -> tasksync_offline::Result<()> {
//! let store = Arc::new(FileStore::open("./data/queue.log")?);
//! let queue = OfflineQueue::new(store);
//!
//! queue.enqueue(SyncQueueItem::new(
//!     OperationKind::Update,
//!     ResourceKind::Task,
//!     "t1",
//!     json!({"title": "Buy oat milk"}),
//! ))?;
//!
//! let (client, _events) = WsClient::connect("ws://localhost:8080/ws", "<token>").await?;
//! let report = queue.replay(&client).await?;
//! for conflict in report.conflicts {
//!     println!("{} needs a decision", conflict.resource_id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage backends
//!
//! - [`FileStore`]: checksummed JSON-lines log, fsync per write (default)
//! - [`MemoryStore`]: tests
//! - `RocksStore`: RocksDB, behind the `rocksdb-backend` feature

pub mod conflict;
pub mod error;
pub mod item;
pub mod queue;
pub mod retry;
pub mod state;
pub mod store;
pub mod transport;
pub mod ws;

pub use conflict::{ConflictResolver, ResolutionOutcome};
pub use error::{OfflineError, Result, StoreError, StoreResult};
pub use item::{ConflictRecord, ItemStatus, OperationKind, Resolution, SyncQueueItem};
pub use queue::{OfflineQueue, ReplayReport, SyncedItem};
pub use retry::RetryPolicy;
pub use state::{Applied, LocalState};
#[cfg(feature = "rocksdb-backend")]
pub use store::RocksStore;
pub use store::{FileStore, FileStoreStats, MemoryStore, SyncStore};
pub use transport::{SendError, SyncTransport};
pub use ws::{EventReceiver, WsClient};
