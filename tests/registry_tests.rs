//! End-to-end tests driving the registry the way a binding layer would:
//! open a database, request locks by context ID, wait for the
//! context-available callback, run SQL in the granted context, release.

use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use rusqlite_conn_mgr::{
   ContextCallback, Error, LockKind, PoolCallbacks, PoolConfig, Registry, SqlValue,
};
use uuid::Uuid;

struct TestDb {
   registry: Registry,
   grants: Receiver<(String, String)>,
   dir: tempfile::TempDir,
}

fn setup_test_db(name: &str, read_connections: usize) -> TestDb {
   let dir = tempfile::tempdir().unwrap();
   let (tx, grants) = unbounded();
   let callback: ContextCallback = Arc::new(move |db: &str, context: &str| {
      let _ = tx.send((db.to_owned(), context.to_owned()));
   });

   let registry = Registry::new();
   registry
      .open(
         name,
         dir.path().to_str().unwrap(),
         Some(PoolConfig { read_connections, ..Default::default() }),
         PoolCallbacks::new(callback),
      )
      .unwrap();

   TestDb { registry, grants, dir }
}

impl TestDb {
   fn base(&self) -> &str {
      self.dir.path().to_str().unwrap()
   }

   fn expect_grant(&self, db: &str, context: &str) {
      let (granted_db, granted_context) = self
         .grants
         .recv_timeout(Duration::from_secs(1))
         .expect("expected a lock grant");
      assert_eq!((granted_db.as_str(), granted_context.as_str()), (db, context));
   }

   fn expect_no_grant(&self) {
      assert!(
         self.grants.recv_timeout(Duration::from_millis(100)).is_err(),
         "expected no lock grant"
      );
   }
}

// ============================================================================
// Lock granting & fairness
// ============================================================================

#[test]
fn test_open_insert_read() {
   let t = setup_test_db("db1", 2);

   let ctx_w = Uuid::new_v4().to_string();
   t.registry.request_lock("db1", &ctx_w, LockKind::Write).unwrap();
   t.expect_grant("db1", &ctx_w);

   t.registry
      .execute_in_context("db1", &ctx_w, "CREATE TABLE t (x INT)", vec![])
      .unwrap();
   let insert = t.registry
      .execute_in_context(
         "db1",
         &ctx_w,
         "INSERT INTO t VALUES (?1)",
         vec![SqlValue::Integer(7)],
      )
      .unwrap();
   assert_eq!(insert.rows_affected, 1);
   assert_eq!(insert.last_insert_id, 1);

   t.registry.release_lock("db1", &ctx_w);

   let ctx_r = Uuid::new_v4().to_string();
   t.registry.request_lock("db1", &ctx_r, LockKind::Read).unwrap();
   t.expect_grant("db1", &ctx_r);

   let result = t.registry
      .execute_in_context("db1", &ctx_r, "SELECT x FROM t", vec![])
      .unwrap();
   assert_eq!(result.rows.len(), 1);
   assert_eq!(result.rows[0]["x"], SqlValue::Integer(7));
   assert_eq!(result.rows_affected, 0);

   t.registry.release_lock("db1", &ctx_r);
   t.registry.close("db1").unwrap();
}

#[test]
fn test_concurrent_readers_and_queued_third() {
   let t = setup_test_db("db1", 2);

   t.registry.request_lock("db1", "r1", LockKind::Read).unwrap();
   t.expect_grant("db1", "r1");
   t.registry.request_lock("db1", "r2", LockKind::Read).unwrap();
   t.expect_grant("db1", "r2");

   // Both contexts can run SQL without either releasing
   let a = t.registry
      .execute_in_context("db1", "r1", "SELECT 1 AS one", vec![])
      .unwrap();
   let b = t.registry
      .execute_in_context("db1", "r2", "SELECT 1 AS one", vec![])
      .unwrap();
   assert_eq!(a.rows[0]["one"], SqlValue::Integer(1));
   assert_eq!(b.rows[0]["one"], SqlValue::Integer(1));

   // A third reader has to wait for a release
   t.registry.request_lock("db1", "r3", LockKind::Read).unwrap();
   t.expect_no_grant();

   t.registry.release_lock("db1", "r1");
   t.expect_grant("db1", "r3");

   t.registry.close("db1").unwrap();
}

#[test]
fn test_four_readers_execute_simultaneously() {
   // Burns a measurable amount of time inside SQLite itself
   const SLOW_QUERY: &str = "WITH RECURSIVE cnt(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM cnt WHERE x < 3000000) SELECT COUNT(*) AS n FROM cnt";

   let dir = tempfile::tempdir().unwrap();
   let (tx, grants) = unbounded();
   let registry = Arc::new(Registry::new());
   registry
      .open(
         "db1",
         dir.path().to_str().unwrap(),
         Some(PoolConfig { read_connections: 4, ..Default::default() }),
         PoolCallbacks::new(Arc::new(move |_db: &str, context: &str| {
            let _ = tx.send(context.to_owned());
         })),
      )
      .unwrap();

   let contexts = ["r1", "r2", "r3", "r4"];
   for context in contexts {
      registry.request_lock("db1", context, LockKind::Read).unwrap();
      assert_eq!(grants.recv_timeout(Duration::from_secs(1)).unwrap(), context);
   }

   // Calibrate how long one run takes on this machine
   let start = Instant::now();
   registry
      .execute_in_context("db1", "r1", SLOW_QUERY, vec![])
      .unwrap();
   let single = start.elapsed();

   // All four contexts run the same query at once, each on its own reader
   let barrier = Arc::new(Barrier::new(contexts.len() + 1));
   let workers: Vec<_> = contexts
      .iter()
      .map(|&context| {
         let registry = Arc::clone(&registry);
         let barrier = Arc::clone(&barrier);
         std::thread::spawn(move || {
            barrier.wait();
            registry
               .execute_in_context("db1", context, SLOW_QUERY, vec![])
               .unwrap();
         })
      })
      .collect();

   barrier.wait();
   let start = Instant::now();
   for worker in workers {
      worker.join().unwrap();
   }
   let concurrent = start.elapsed();

   // Serial execution would take about four single intervals; simultaneous
   // execution stays close to one
   assert!(
      concurrent < single * 3,
      "4 concurrent readers took {concurrent:?}, single run took {single:?}"
   );

   registry.close("db1").unwrap();
}

#[test]
fn test_writer_queueing() {
   let t = setup_test_db("db1", 1);

   t.registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   t.expect_grant("db1", "w1");

   t.registry.request_lock("db1", "w2", LockKind::Write).unwrap();
   t.expect_no_grant();

   t.registry.release_lock("db1", "w1");
   t.expect_grant("db1", "w2");

   t.registry.close("db1").unwrap();
}

#[test]
fn test_read_waiters_granted_in_request_order() {
   let t = setup_test_db("db1", 1);

   t.registry.request_lock("db1", "r1", LockKind::Read).unwrap();
   t.expect_grant("db1", "r1");

   t.registry.request_lock("db1", "r2", LockKind::Read).unwrap();
   t.registry.request_lock("db1", "r3", LockKind::Read).unwrap();
   t.expect_no_grant();

   t.registry.release_lock("db1", "r1");
   t.expect_grant("db1", "r2");
   t.registry.release_lock("db1", "r2");
   t.expect_grant("db1", "r3");

   t.registry.close("db1").unwrap();
}

#[test]
fn test_released_context_cannot_run_sql() {
   let t = setup_test_db("db1", 1);

   t.registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   t.expect_grant("db1", "w1");
   t.registry.release_lock("db1", "w1");

   let result = t.registry.execute_in_context("db1", "w1", "SELECT 1", vec![]);
   assert!(matches!(result, Err(Error::ContextInvalid)));

   t.registry.close("db1").unwrap();
}

// ============================================================================
// WAL configuration
// ============================================================================

#[test]
fn test_writer_runs_in_wal_mode() {
   let t = setup_test_db("db1", 2);

   t.registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   t.expect_grant("db1", "w1");

   let result = t.registry
      .execute_in_context("db1", "w1", "PRAGMA journal_mode", vec![])
      .unwrap();
   assert_eq!(result.rows[0]["journal_mode"], SqlValue::Text("wal".into()));

   t.registry.close("db1").unwrap();
}

// ============================================================================
// Update hook
// ============================================================================

#[test]
fn test_update_hook_reports_insert() {
   let t = setup_test_db("db1", 1);

   let (tx, rx) = unbounded();
   t.registry
      .register_update_hook(
         "db1",
         Box::new(move |op, db: &str, table: &str, rowid| {
            let _ = tx.send((op.code(), db.to_owned(), table.to_owned(), rowid));
         }),
      )
      .unwrap();

   t.registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   t.expect_grant("db1", "w1");
   t.registry
      .execute_in_context("db1", "w1", "CREATE TABLE t (x INT)", vec![])
      .unwrap();
   t.registry
      .execute_in_context("db1", "w1", "INSERT INTO t VALUES (1)", vec![])
      .unwrap();

   let (code, db, table, rowid) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
   assert_eq!(code, 18);
   assert_eq!(db, "main");
   assert_eq!(table, "t");
   assert_eq!(rowid, 1);

   t.registry.close("db1").unwrap();
}

#[test]
fn test_update_hook_reports_update_and_delete_codes() {
   let t = setup_test_db("db1", 1);

   let (tx, rx) = unbounded();
   t.registry
      .register_update_hook(
         "db1",
         Box::new(move |op, _db: &str, _table: &str, _rowid| {
            let _ = tx.send(op.code());
         }),
      )
      .unwrap();

   t.registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   t.expect_grant("db1", "w1");
   for sql in [
      "CREATE TABLE t (x INT)",
      "INSERT INTO t VALUES (1)",
      "UPDATE t SET x = 2",
      // A bare DELETE would take the truncate path, which skips the hook
      "DELETE FROM t WHERE x = 2",
   ] {
      t.registry.execute_in_context("db1", "w1", sql, vec![]).unwrap();
   }

   let mut codes = Vec::new();
   for _ in 0..3 {
      codes.push(rx.recv_timeout(Duration::from_secs(1)).unwrap());
   }
   assert_eq!(codes, [18, 23, 9]);

   t.registry.close("db1").unwrap();
}

#[test]
fn test_update_hook_can_be_installed_at_open() {
   let dir = tempfile::tempdir().unwrap();
   let (grant_tx, grants) = unbounded();
   let (hook_tx, hook_rx) = unbounded();

   let registry = Registry::new();
   registry
      .open(
         "db1",
         dir.path().to_str().unwrap(),
         Some(PoolConfig { read_connections: 0, ..Default::default() }),
         PoolCallbacks {
            on_context_available: Arc::new(move |_db: &str, context: &str| {
               let _ = grant_tx.send(context.to_owned());
            }),
            update_hook: Some(Box::new(move |op, _db: &str, table: &str, rowid| {
               let _ = hook_tx.send((op.code(), table.to_owned(), rowid));
            })),
         },
      )
      .unwrap();

   registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   grants.recv_timeout(Duration::from_secs(1)).unwrap();
   registry
      .execute_in_context("db1", "w1", "CREATE TABLE t (x INT)", vec![])
      .unwrap();
   registry
      .execute_in_context("db1", "w1", "INSERT INTO t VALUES (5)", vec![])
      .unwrap();

   assert_eq!(
      hook_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
      (18, "t".to_string(), 1)
   );

   registry.close("db1").unwrap();
}

// ============================================================================
// Attach / detach
// ============================================================================

#[test]
fn test_attach_requires_idle_connections() {
   let t = setup_test_db("db1", 1);

   // Seed the database that will be attached
   t.registry
      .open(
         "other.db",
         t.base(),
         Some(PoolConfig { read_connections: 0, ..Default::default() }),
         PoolCallbacks::new(Arc::new(|_: &str, _: &str| {})),
      )
      .unwrap();
   t.registry.request_lock("other.db", "ow", LockKind::Write).unwrap();
   t.registry
      .execute_in_context("other.db", "ow", "CREATE TABLE o (v INT)", vec![])
      .unwrap();
   t.registry
      .execute_in_context("other.db", "ow", "INSERT INTO o VALUES (42)", vec![])
      .unwrap();
   t.registry.release_lock("other.db", "ow");
   t.registry.close("other.db").unwrap();

   // Attach is refused while any context holds a lock
   t.registry.request_lock("db1", "r1", LockKind::Read).unwrap();
   t.expect_grant("db1", "r1");
   let result = t.registry.attach("db1", "other.db", "att");
   assert!(matches!(result, Err(Error::ConnectionsLocked)));

   // After release it succeeds and the alias is visible on every connection
   t.registry.release_lock("db1", "r1");
   t.registry.attach("db1", "other.db", "att").unwrap();

   t.registry.request_lock("db1", "r2", LockKind::Read).unwrap();
   t.expect_grant("db1", "r2");
   let rows = t.registry
      .execute_in_context("db1", "r2", "SELECT v FROM att.o", vec![])
      .unwrap();
   assert_eq!(rows.rows[0]["v"], SqlValue::Integer(42));
   t.registry.release_lock("db1", "r2");

   // Detach removes the alias again
   t.registry.detach("db1", "att").unwrap();
   t.registry.request_lock("db1", "r3", LockKind::Read).unwrap();
   t.expect_grant("db1", "r3");
   let result = t.registry.execute_in_context("db1", "r3", "SELECT v FROM att.o", vec![]);
   assert!(result.is_err());

   t.registry.close("db1").unwrap();
}

// ============================================================================
// Batch execution
// ============================================================================

#[test]
fn test_batch_commits_atomically() {
   let t = setup_test_db("db1", 0);

   t.registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   t.expect_grant("db1", "w1");
   t.registry
      .execute_in_context(
         "db1",
         "w1",
         "CREATE TABLE accounts (id INTEGER PRIMARY KEY, val INTEGER NOT NULL)",
         vec![],
      )
      .unwrap();
   t.registry
      .execute_in_context(
         "db1",
         "w1",
         "INSERT INTO accounts (id, val) VALUES (1, 100), (2, 50)",
         vec![],
      )
      .unwrap();

   // Successful batch commits both statements
   let results = t.registry
      .execute_batch_in_context(
         "db1",
         "w1",
         vec![
            ("UPDATE accounts SET val = val - 30 WHERE id = 1".into(), vec![]),
            ("UPDATE accounts SET val = val + 30 WHERE id = 2".into(), vec![]),
         ],
      )
      .unwrap();
   assert_eq!(results.len(), 2);
   assert_eq!(results[0].rows_affected, 1);

   // Failed batch rolls back both statements
   let result = t.registry.execute_batch_in_context(
      "db1",
      "w1",
      vec![
         ("UPDATE accounts SET val = 999 WHERE id = 1".into(), vec![]),
         ("INSERT INTO accounts (id, val) VALUES (3, NULL)".into(), vec![]),
      ],
   );
   assert!(result.is_err());

   let rows = t.registry
      .execute_in_context("db1", "w1", "SELECT val FROM accounts ORDER BY id", vec![])
      .unwrap();
   assert_eq!(rows.rows[0]["val"], SqlValue::Integer(70));
   assert_eq!(rows.rows[1]["val"], SqlValue::Integer(80));

   t.registry.close("db1").unwrap();
}

// ============================================================================
// Import
// ============================================================================

#[test]
fn test_import_file_runs_in_one_transaction() {
   let t = setup_test_db("db1", 1);

   let import_path = t.dir.path().join("seed.sql");
   std::fs::write(
      &import_path,
      "-- seed data; with a comment\nCREATE TABLE t (x INT, note TEXT);\nINSERT INTO t VALUES (1, 'semi;colon');\nINSERT INTO t VALUES (2, 'plain');",
   )
   .unwrap();

   t.registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   t.expect_grant("db1", "w1");

   let count = t.registry.import_file("db1", &import_path).unwrap();
   assert_eq!(count, 3);

   let rows = t.registry
      .execute_in_context("db1", "w1", "SELECT note FROM t ORDER BY x", vec![])
      .unwrap();
   assert_eq!(rows.rows[0]["note"], SqlValue::Text("semi;colon".into()));

   t.registry.close("db1").unwrap();
}

#[test]
fn test_failed_import_reports_line_and_rolls_back() {
   let t = setup_test_db("db1", 1);

   let import_path = t.dir.path().join("bad.sql");
   std::fs::write(
      &import_path,
      "CREATE TABLE t (x INT NOT NULL);\nINSERT INTO t VALUES (1);\nINSERT INTO t VALUES (NULL);",
   )
   .unwrap();

   t.registry.request_lock("db1", "w1", LockKind::Write).unwrap();
   t.expect_grant("db1", "w1");

   let error = t.registry.import_file("db1", &import_path).unwrap_err();
   match error {
      Error::ImportFailed { line, .. } => assert_eq!(line, 3),
      other => panic!("unexpected error: {other}"),
   }

   // The table from statement one was rolled back with everything else
   let result = t.registry.execute_in_context("db1", "w1", "SELECT * FROM t", vec![]);
   assert!(result.is_err());

   t.registry.close("db1").unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_close_makes_name_unknown() {
   let t = setup_test_db("db1", 1);
   t.registry.close("db1").unwrap();

   assert!(matches!(t.registry.close("db1"), Err(Error::NotOpen(_))));
   assert!(matches!(
      t.registry.request_lock("db1", "ctx", LockKind::Read),
      Err(Error::NotOpen(_))
   ));
}

#[test]
fn test_close_all_closes_every_database() {
   let t = setup_test_db("db1", 1);
   t.registry
      .open("db2", t.base(), None, PoolCallbacks::new(Arc::new(|_: &str, _: &str| {})))
      .unwrap();

   t.registry.close_all();

   assert!(matches!(t.registry.close("db1"), Err(Error::NotOpen(_))));
   assert!(matches!(t.registry.close("db2"), Err(Error::NotOpen(_))));
}

#[test]
fn test_remove_never_opened_database_is_ok() {
   let t = setup_test_db("db1", 1);
   t.registry.remove("ghost.db", t.base()).unwrap();
   t.registry.close("db1").unwrap();
}
