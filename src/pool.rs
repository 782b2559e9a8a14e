//! A pool of SQLite connections for one database: a single write connection
//! plus N read connections, multiplexing caller lock contexts.
//!
//! ## Architecture
//!
//! - **Lock contexts**: the caller names each lock request with an opaque
//!   context ID. A granted context is bound to exactly one connection's
//!   lock slot until it is released.
//! - **Wait queues**: read and write requests queue independently, FIFO
//!   within each kind. They never block each other at the pool level
//!   because they target disjoint connections.
//! - **Locking discipline**: one pool-level mutex guards the wait queues
//!   and every slot transition. It is never held while SQLite work runs,
//!   and the context-available callback always fires after it is released.
//!
//! ## WAL setup
//!
//! Right after open, WAL-mode pragmas are queued on the write connection
//! and `synchronous = NORMAL` on each reader. The per-connection queues are
//! FIFO, so these run before any user work.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::hooks::Action;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionRole};
use crate::error::{Error, Result};
use crate::execute::{self, QueryResult};
use crate::import;
use crate::value::SqlValue;

/// The kind of lock a context is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
   Read,
   Write,
}

/// Row-change operation reported by the update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
   Insert,
   Delete,
   Update,
}

impl UpdateOp {
   /// SQLite's authorizer code for this operation.
   pub fn code(self) -> i32 {
      match self {
         UpdateOp::Insert => 18,
         UpdateOp::Delete => 9,
         UpdateOp::Update => 23,
      }
   }

   fn from_action(action: Action) -> Option<Self> {
      match action {
         Action::SQLITE_INSERT => Some(UpdateOp::Insert),
         Action::SQLITE_DELETE => Some(UpdateOp::Delete),
         Action::SQLITE_UPDATE => Some(UpdateOp::Update),
         _ => None,
      }
   }
}

/// Fired once per granted lock, with `(database_name, context_id)`.
///
/// Invoked from whichever thread performed the grant, after the pool mutex
/// has been released. The callback must not call back into the pool for
/// the same database on the calling thread.
pub type ContextCallback = Arc<dyn Fn(&str, &str) + Send + Sync + 'static>;

/// Fired after each row insert/update/delete on the write connection, with
/// `(op, database, table, rowid)`.
pub type UpdateHook = Box<dyn FnMut(UpdateOp, &str, &str, i64) + Send + 'static>;

#[derive(Default)]
struct Waiters {
   read: VecDeque<String>,
   write: VecDeque<String>,
}

/// Connection pool for one database.
pub(crate) struct Pool {
   name: String,
   base_path: String,
   writer: Connection,
   readers: Vec<Connection>,
   waiters: Mutex<Waiters>,
   on_context_available: ContextCallback,
}

impl Pool {
   pub fn open(
      name: &str,
      path: &str,
      base_path: &str,
      config: &PoolConfig,
      on_context_available: ContextCallback,
      update_hook: Option<UpdateHook>,
   ) -> Result<Self> {
      // A memory database is private to each handle, so readers could never
      // see the writer's tables; run without concurrency instead.
      let read_connections = if is_memory_path(path) { 0 } else { config.read_connections };

      let writer = Connection::open(
         path,
         ConnectionRole::Write,
         config.busy_timeout,
         format!("sqlite-{name}-writer"),
      )?;

      let journal_size_limit = config.journal_size_limit;
      writer.queue_work(Box::new(move |handle| {
         if let Some(conn) = handle
            && let Err(error) = configure_writer(conn, journal_size_limit)
         {
            warn!(%error, "write connection setup failed");
         }
      }))?;

      if let Some(hook) = update_hook {
         install_update_hook(&writer, hook)?;
      }

      let mut readers = Vec::with_capacity(read_connections);
      for index in 0..read_connections {
         let reader = Connection::open(
            path,
            ConnectionRole::Read,
            config.busy_timeout,
            format!("sqlite-{name}-reader-{index}"),
         )?;

         reader.queue_work(Box::new(|handle| {
            if let Some(conn) = handle
               && let Err(error) = conn.pragma_update(None, "synchronous", "NORMAL")
            {
               warn!(%error, "read connection setup failed");
            }
         }))?;

         readers.push(reader);
      }

      Ok(Self {
         name: name.to_owned(),
         base_path: base_path.to_owned(),
         writer,
         readers,
         waiters: Mutex::new(Waiters::default()),
         on_context_available,
      })
   }

   fn concurrency_enabled(&self) -> bool {
      !self.readers.is_empty()
   }

   fn connections(&self) -> impl Iterator<Item = &Connection> {
      std::iter::once(&self.writer).chain(self.readers.iter())
   }

   /// Ask for a lock. If one is free the context is bound immediately and
   /// the callback fires before this returns; otherwise the context joins
   /// the tail of its kind's wait queue.
   pub fn request_lock(&self, context_id: &str, kind: LockKind) -> Result<()> {
      let granted = {
         let mut waiters = self.waiters.lock();
         match kind {
            LockKind::Read if self.concurrency_enabled() => {
               if !waiters.read.is_empty() {
                  // Preserve FIFO fairness among queued readers
                  waiters.read.push_back(context_id.to_owned());
                  false
               } else if let Some(reader) =
                  self.readers.iter().find(|reader| reader.lock_is_empty())
               {
                  reader.activate_lock(context_id);
                  true
               } else {
                  waiters.read.push_back(context_id.to_owned());
                  false
               }
            }
            // With concurrency disabled every lock goes to the writer
            _ => {
               if self.writer.lock_is_empty() {
                  self.writer.activate_lock(context_id);
                  true
               } else {
                  waiters.write.push_back(context_id.to_owned());
                  false
               }
            }
         }
      };

      if granted {
         self.notify_available(context_id);
      } else {
         debug!(db = %self.name, context = %context_id, ?kind, "lock request queued");
      }
      Ok(())
   }

   /// Release a context's lock and hand the connection to the next waiter
   /// of the same kind, if any. Unknown or already-released contexts are a
   /// silent no-op.
   pub fn release_lock(&self, context_id: &str) {
      let next = {
         let mut waiters = self.waiters.lock();
         if self.writer.matches_lock(context_id) {
            self.writer.clear_lock();
            let next = waiters.write.pop_front();
            if let Some(next) = &next {
               self.writer.activate_lock(next);
            }
            next
         } else if let Some(reader) =
            self.readers.iter().find(|reader| reader.matches_lock(context_id))
         {
            reader.clear_lock();
            let next = waiters.read.pop_front();
            if let Some(next) = &next {
               // The freed reader serves the queue head directly
               reader.activate_lock(next);
            }
            next
         } else {
            return;
         }
      };

      debug!(db = %self.name, context = %context_id, "lock released");
      if let Some(next) = next {
         self.notify_available(&next);
      }
   }

   fn notify_available(&self, context_id: &str) {
      debug!(db = %self.name, context = %context_id, "lock granted");
      (self.on_context_available)(&self.name, context_id);
   }

   fn connection_for_context(&self, context_id: &str) -> Result<&Connection> {
      self
         .connections()
         .find(|conn| conn.matches_lock(context_id))
         .ok_or(Error::ContextInvalid)
   }

   /// Run `job` on the connection bound to `context_id`, blocking until the
   /// worker has executed it.
   fn run_in_context<T, F>(&self, context_id: &str, job: F) -> Result<T>
   where
      T: Send + 'static,
      F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
   {
      self.connection_for_context(context_id)?.run(job)
   }

   pub fn execute_in_context(
      &self,
      context_id: &str,
      sql: String,
      params: Vec<SqlValue>,
   ) -> Result<QueryResult> {
      self.run_in_context(context_id, move |conn| execute::execute(conn, &sql, &params))
   }

   pub fn execute_literal_in_context(&self, context_id: &str, sql: String) -> Result<u64> {
      self.run_in_context(context_id, move |conn| execute::execute_literal(conn, &sql))
   }

   /// Execute a list of statements atomically on the context's connection:
   /// BEGIN, all statements in order, COMMIT; rolled back on the first
   /// error. Returns the result of each statement.
   pub fn execute_batch_in_context(
      &self,
      context_id: &str,
      statements: Vec<(String, Vec<SqlValue>)>,
   ) -> Result<Vec<QueryResult>> {
      self.run_in_context(context_id, move |conn| {
         execute::execute_literal(conn, "BEGIN")?;

         let mut results = Vec::with_capacity(statements.len());
         for (sql, params) in &statements {
            match execute::execute(conn, sql, params) {
               Ok(result) => results.push(result),
               Err(error) => {
                  if let Err(rollback_error) = execute::execute_literal(conn, "ROLLBACK") {
                     warn!(%rollback_error, "rollback after failed batch also failed");
                  }
                  return Err(error);
               }
            }
         }

         execute::execute_literal(conn, "COMMIT")?;
         Ok(results)
      })
   }

   /// ATTACH a database on every connection so the alias resolves no matter
   /// which connection later serves a context. All lock slots must be
   /// empty. If the attach fails partway, already-attached connections are
   /// reverted best-effort before the error is returned.
   pub fn attach(&self, db_file: &str, alias: &str) -> Result<()> {
      self.ensure_all_unlocked()?;

      let path = crate::registry::db_path(db_file, &self.base_path);
      let attach_sql = format!("ATTACH DATABASE '{path}' AS {alias}");

      let mut attached = 0;
      let mut failure = None;
      for conn in self.connections() {
         let sql = attach_sql.clone();
         match conn.run(move |handle| execute::execute_literal(handle, &sql).map(|_| ())) {
            Ok(()) => attached += 1,
            Err(error) => {
               failure = Some(error);
               break;
            }
         }
      }

      if let Some(error) = failure {
         let detach_sql = format!("DETACH DATABASE {alias}");
         for conn in self.connections().take(attached) {
            let sql = detach_sql.clone();
            if let Err(revert_error) =
               conn.run(move |handle| execute::execute_literal(handle, &sql).map(|_| ()))
            {
               warn!(db = %self.name, alias, %revert_error, "reverting partial attach failed");
            }
         }
         return Err(error);
      }

      debug!(db = %self.name, alias, "database attached on all connections");
      Ok(())
   }

   /// DETACH an alias on every connection. All lock slots must be empty.
   pub fn detach(&self, alias: &str) -> Result<()> {
      self.ensure_all_unlocked()?;

      let detach_sql = format!("DETACH DATABASE {alias}");
      for conn in self.connections() {
         let sql = detach_sql.clone();
         conn.run(move |handle| execute::execute_literal(handle, &sql).map(|_| ()))?;
      }

      debug!(db = %self.name, alias, "database detached on all connections");
      Ok(())
   }

   fn ensure_all_unlocked(&self) -> Result<()> {
      // Holding the pool mutex keeps grants out while the slots are checked
      let _waiters = self.waiters.lock();
      if self.connections().any(|conn| !conn.lock_is_empty()) {
         return Err(Error::ConnectionsLocked);
      }
      Ok(())
   }

   /// Install `hook` on the write connection, replacing any previous hook.
   /// Only the writer mutates rows, so readers never need one.
   pub fn register_update_hook(&self, hook: UpdateHook) -> Result<()> {
      install_update_hook(&self.writer, hook)
   }

   /// Import a SQL text file on the write connection inside one
   /// transaction. The caller is expected to hold the write lock so no
   /// other writer work interleaves. Returns the number of executed
   /// statements.
   pub fn import_file(&self, path: &Path) -> Result<usize> {
      let text = std::fs::read_to_string(path)?;
      let statements = import::split_statements(&text);
      if statements.is_empty() {
         return Ok(0);
      }

      debug!(db = %self.name, statements = statements.len(), "importing SQL file");
      self.writer.run(move |handle| import::run_import(handle, &statements))
   }

   /// Close every connection. Queued work is drained and rejected; held
   /// and queued contexts become unreachable.
   pub fn close(&self) {
      debug!(db = %self.name, "closing pool");
      {
         let mut waiters = self.waiters.lock();
         waiters.read.clear();
         waiters.write.clear();
      }
      for conn in self.connections() {
         conn.close();
      }
   }
}

fn is_memory_path(path: &str) -> bool {
   path == ":memory:" || path.starts_with("file::memory:") || path.contains("mode=memory")
}

fn configure_writer(conn: &rusqlite::Connection, journal_size_limit: i64) -> rusqlite::Result<()> {
   conn.pragma_update(None, "journal_mode", "WAL")?;
   conn.pragma_update(None, "journal_size_limit", journal_size_limit)?;
   conn.pragma_update(None, "synchronous", "NORMAL")
}

fn install_update_hook(writer: &Connection, hook: UpdateHook) -> Result<()> {
   writer.queue_work(Box::new(move |handle| {
      if let Some(conn) = handle {
         let mut hook = hook;
         conn.update_hook(Some(
            move |action: Action, db: &str, table: &str, rowid: i64| {
               if let Some(op) = UpdateOp::from_action(action) {
                  hook(op, db, table, rowid);
               }
            },
         ));
      }
   }))
}
