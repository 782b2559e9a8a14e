//! # rusqlite-conn-mgr
//!
//! A concurrent SQLite connection manager that multiplexes caller "lock
//! contexts" over one write connection and N read connections against a
//! single WAL-mode database file.
//!
//! ## Core Types
//!
//! - **[`Registry`]**: name-to-pool map and the entry point for every
//!   operation
//! - **[`PoolConfig`]**: pool sizing and pragma configuration
//! - **[`SqlValue`]**: tagged parameter/column value
//! - **[`QueryResult`]**: rows, column metadata, and change counters
//! - **[`Error`]**: error type for all operations
//!
//! ## Architecture
//!
//! - **One writer, N readers**: SQLite's WAL mode allows one writer and
//!   many readers; the pool enforces that shape with independent FIFO wait
//!   queues per lock kind.
//! - **Lock contexts**: callers name each lock request with an opaque
//!   context ID and learn of the grant through a callback; all SQL for a
//!   granted context runs on the one connection it is bound to.
//! - **One handle, one thread**: each connection's SQLite handle is owned
//!   by a dedicated worker thread and work items execute strictly in
//!   enqueue order.
//!
//! ## Usage Pattern
//!
//! ```text
//! 1. Registry::open a database (spawns the pool's worker threads)
//! 2. request_lock(ctx) and wait for the context-available callback
//! 3. execute_in_context(ctx, ...) as often as needed
//! 4. release_lock(ctx), which hands the connection to the next waiter
//! 5. Registry::close (or close_all) when done
//! ```

mod config;
mod connection;
mod error;
mod execute;
mod import;
mod pool;
mod registry;
mod value;

// Re-export public types
pub use config::PoolConfig;
pub use error::{Error, Result};
pub use execute::{ColumnInfo, QueryResult};
pub use pool::{ContextCallback, LockKind, UpdateHook, UpdateOp};
pub use registry::{PoolCallbacks, Registry};
pub use value::{Row, SqlValue};
