//! Configuration for SQLite connection pools

use std::time::Duration;

/// Configuration for a database pool
///
/// # Examples
///
/// ```
/// use rusqlite_conn_mgr::PoolConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
///
/// // Customize specific fields
/// let config = PoolConfig {
///     read_connections: 2,
///     busy_timeout: Duration::from_secs(30),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
   /// Number of read-only connections opened alongside the write connection
   ///
   /// Each read connection runs on its own worker thread, so this controls
   /// how many read lock contexts can execute SQL concurrently. A value of
   /// zero disables concurrency: every lock request, read or write, is
   /// served by the write connection.
   ///
   /// Default: 4
   pub read_connections: usize,

   /// SQLite busy timeout applied to every connection
   ///
   /// Bounds how long a statement waits on the database file before
   /// returning SQLITE_BUSY. Mostly relevant when another process also has
   /// the file open.
   ///
   /// Default: 5 seconds
   pub busy_timeout: Duration,

   /// `PRAGMA journal_size_limit` applied to the write connection, in bytes
   ///
   /// Keeps the WAL file from growing without bound between checkpoints.
   ///
   /// Default: 6291456 (6 MiB)
   pub journal_size_limit: i64,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         read_connections: 4,
         busy_timeout: Duration::from_secs(5),
         journal_size_limit: 6_291_456,
      }
   }
}
