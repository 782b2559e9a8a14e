//! Process-wide registry of open database pools.
//!
//! Every caller-facing operation is addressed by database name (and, for
//! work, a context ID); the registry resolves the name to a [`Pool`] and
//! delegates. There is deliberately no global instance: the embedder owns
//! one `Registry` and threads it through, which keeps tests hermetic.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::execute::QueryResult;
use crate::pool::{ContextCallback, LockKind, Pool, UpdateHook};
use crate::value::SqlValue;

/// Everything a pool reports back to the embedder: the mandatory
/// context-available callback and an optional update hook for the write
/// connection.
pub struct PoolCallbacks {
   /// Fired once per granted lock with `(database_name, context_id)`.
   pub on_context_available: ContextCallback,
   /// Installed on the write connection at open, if present. Can also be
   /// (re)registered later through [`Registry::register_update_hook`].
   pub update_hook: Option<UpdateHook>,
}

impl PoolCallbacks {
   /// Callbacks with only the context-available notification.
   pub fn new(on_context_available: ContextCallback) -> Self {
      Self { on_context_available, update_hook: None }
   }
}

/// Resolve a database name against a base directory.
///
/// `:memory:` and `file:` URI forms pass through unchanged; everything else
/// is joined onto the base path.
pub(crate) fn db_path(name: &str, base_path: &str) -> String {
   if name == ":memory:" || name.starts_with("file:") {
      return name.to_owned();
   }
   Path::new(base_path).join(name).to_string_lossy().into_owned()
}

/// Registry mapping database names to their connection pools.
#[derive(Default)]
pub struct Registry {
   pools: Mutex<HashMap<String, Arc<Pool>>>,
}

impl Registry {
   pub fn new() -> Self {
      Self::default()
   }

   fn pool(&self, name: &str) -> Result<Arc<Pool>> {
      self
         .pools
         .lock()
         .get(name)
         .cloned()
         .ok_or_else(|| Error::NotOpen(name.to_owned()))
   }

   /// Open a database and register its pool under `name`.
   ///
   /// Fails with [`Error::AlreadyOpen`] if the name is taken. For memory
   /// databases the configured reader count is ignored, since each handle
   /// would see its own private database.
   pub fn open(
      &self,
      name: &str,
      base_path: &str,
      config: Option<PoolConfig>,
      callbacks: PoolCallbacks,
   ) -> Result<()> {
      let mut pools = self.pools.lock();
      if pools.contains_key(name) {
         return Err(Error::AlreadyOpen(name.to_owned()));
      }

      let path = db_path(name, base_path);
      debug!(db = %name, path = %path, "opening database");

      let config = config.unwrap_or_default();
      let pool = Pool::open(
         name,
         &path,
         base_path,
         &config,
         callbacks.on_context_available,
         callbacks.update_hook,
      )?;
      pools.insert(name.to_owned(), Arc::new(pool));
      Ok(())
   }

   /// Close every connection of `name` and drop it from the registry.
   pub fn close(&self, name: &str) -> Result<()> {
      let pool = self
         .pools
         .lock()
         .remove(name)
         .ok_or_else(|| Error::NotOpen(name.to_owned()))?;
      pool.close();
      Ok(())
   }

   /// Close every registered database. Process-shutdown hook.
   pub fn close_all(&self) {
      let pools: Vec<Arc<Pool>> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
      for pool in pools {
         pool.close();
      }
   }

   /// Close `name` if it is open, then delete its database file.
   ///
   /// A missing file is not an error. Workers are joined before the unlink,
   /// so there is no race within this registry; racing `remove` against a
   /// concurrent `open` of the same name is the caller's responsibility.
   pub fn remove(&self, name: &str, base_path: &str) -> Result<()> {
      if let Some(pool) = self.pools.lock().remove(name) {
         pool.close();
      }

      let path = db_path(name, base_path);
      if !Path::new(&path).exists() {
         info!(db = %name, path = %path, "database file does not exist, nothing to remove");
         return Ok(());
      }

      std::fs::remove_file(&path)?;
      // WAL sidecars go with the database file
      for suffix in ["-wal", "-shm"] {
         let _ = std::fs::remove_file(format!("{path}{suffix}"));
      }
      debug!(db = %name, path = %path, "database file removed");
      Ok(())
   }

   /// Request a lock; the pool's context-available callback fires when the
   /// lock is granted (possibly before this returns).
   pub fn request_lock(&self, name: &str, context_id: &str, kind: LockKind) -> Result<()> {
      self.pool(name)?.request_lock(context_id, kind)
   }

   /// Release a context's lock and wake the next waiter. Unknown database
   /// names and unknown contexts are silent no-ops, so callers may bail
   /// out of a lock they never ended up using.
   pub fn release_lock(&self, name: &str, context_id: &str) {
      if let Ok(pool) = self.pool(name) {
         pool.release_lock(context_id);
      }
   }

   /// Execute a parameterized statement on the connection bound to
   /// `context_id`.
   pub fn execute_in_context(
      &self,
      name: &str,
      context_id: &str,
      sql: &str,
      params: Vec<SqlValue>,
   ) -> Result<QueryResult> {
      self.pool(name)?.execute_in_context(context_id, sql.to_owned(), params)
   }

   /// Execute a parameter-free statement, returning only the change count.
   pub fn execute_literal_in_context(
      &self,
      name: &str,
      context_id: &str,
      sql: &str,
   ) -> Result<u64> {
      self.pool(name)?.execute_literal_in_context(context_id, sql.to_owned())
   }

   /// Execute several statements atomically on the context's connection.
   pub fn execute_batch_in_context(
      &self,
      name: &str,
      context_id: &str,
      statements: Vec<(String, Vec<SqlValue>)>,
   ) -> Result<Vec<QueryResult>> {
      self.pool(name)?.execute_batch_in_context(context_id, statements)
   }

   /// ATTACH `db_file` as `alias` on every connection of `name`.
   pub fn attach(&self, name: &str, db_file: &str, alias: &str) -> Result<()> {
      self.pool(name)?.attach(db_file, alias)
   }

   /// DETACH `alias` on every connection of `name`.
   pub fn detach(&self, name: &str, alias: &str) -> Result<()> {
      self.pool(name)?.detach(alias)
   }

   /// Install an update hook on the write connection of `name`, replacing
   /// any previous hook.
   pub fn register_update_hook(&self, name: &str, hook: UpdateHook) -> Result<()> {
      self.pool(name)?.register_update_hook(hook)
   }

   /// Import a SQL file on the write connection of `name` inside one
   /// transaction. The caller should hold the write lock.
   pub fn import_file(&self, name: &str, path: &Path) -> Result<usize> {
      self.pool(name)?.import_file(path)
   }
}
