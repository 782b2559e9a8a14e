//! Error types for rusqlite-conn-mgr

use thiserror::Error;

/// Errors that may occur when working with rusqlite-conn-mgr
#[derive(Error, Debug)]
pub enum Error {
   /// Open was called for a database name that is already registered.
   #[error("database {0:?} is already open")]
   AlreadyOpen(String),

   /// The operation targeted a database name that is not registered.
   #[error("database {0:?} is not open")]
   NotOpen(String),

   /// Work was issued against a context ID that no longer holds a lock on
   /// any connection of the target pool.
   #[error("context is no longer available")]
   ContextInvalid,

   /// Attach or detach was attempted while at least one connection had a
   /// granted lock.
   #[error("some DB connections were locked")]
   ConnectionsLocked,

   /// The connection (or its whole pool) has been closed and cannot accept
   /// further work.
   #[error("database has been closed")]
   DatabaseClosed,

   /// A statement in an imported SQL file failed. The whole import was
   /// rolled back.
   #[error("import failed at line {line}: {message}")]
   ImportFailed { line: usize, message: String },

   /// Error from the rusqlite library. Driver errors are converted to this variant
   #[error("SQLite error: {0}")]
   Sqlite(#[from] rusqlite::Error),

   /// IO error when accessing database or import files. Standard library IO
   /// errors are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
