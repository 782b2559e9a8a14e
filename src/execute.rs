//! SQL execution primitives used by connection workers.
//!
//! Two entry points: [`execute`] for parameterized statements that
//! materialize rows and column metadata, and [`execute_literal`] for
//! statements where only the change count matters (PRAGMAs, ATTACH/DETACH,
//! transaction control).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::{Row, SqlValue};

/// Metadata for one result column, collected once per statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
   /// Column name as reported by the statement.
   pub name: String,
   /// Declared type from the table schema, or `"UNKNOWN"` for expressions.
   pub decl_type: String,
   /// Zero-based position in the result set.
   pub index: usize,
}

/// Result of executing a single statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
   /// Materialized rows, one ordered column-name-to-value map per row.
   pub rows: Vec<Row>,
   /// Column metadata for the statement's result set.
   pub columns: Vec<ColumnInfo>,
   /// Number of rows changed by the statement. Zero for read-only
   /// statements, regardless of what earlier statements changed.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only meaningful after an INSERT on a table with a ROWID.
   pub last_insert_id: i64,
}

/// Prepare `sql`, bind `params` by 1-based position, step to completion and
/// materialize every row.
pub fn execute(
   conn: &rusqlite::Connection,
   sql: &str,
   params: &[SqlValue],
) -> Result<QueryResult> {
   let mut stmt = conn.prepare(sql)?;

   for (i, value) in params.iter().enumerate() {
      stmt.raw_bind_parameter(i + 1, value)?;
   }

   let columns: Vec<ColumnInfo> = stmt
      .columns()
      .iter()
      .enumerate()
      .map(|(index, column)| ColumnInfo {
         name: column.name().to_owned(),
         decl_type: column.decl_type().unwrap_or("UNKNOWN").to_owned(),
         index,
      })
      .collect();

   // sqlite3_changes reports the most recent write on the whole connection,
   // so a read-only statement must not pick up a stale count.
   let readonly = stmt.readonly();

   let mut result_rows: Vec<Row> = Vec::new();
   let mut rows = stmt.raw_query();
   while let Some(row) = rows.next()? {
      let mut map = IndexMap::with_capacity(columns.len());
      for column in &columns {
         map.insert(column.name.clone(), SqlValue::from(row.get_ref(column.index)?));
      }
      result_rows.push(map);
   }
   drop(rows);

   Ok(QueryResult {
      rows: result_rows,
      columns,
      rows_affected: if readonly { 0 } else { conn.changes() },
      last_insert_id: conn.last_insert_rowid(),
   })
}

/// Run a parameter-free statement, discarding any rows it returns.
///
/// Returns the number of rows changed.
pub fn execute_literal(conn: &rusqlite::Connection, sql: &str) -> Result<u64> {
   let mut stmt = conn.prepare(sql)?;
   let readonly = stmt.readonly();

   let mut rows = stmt.raw_query();
   while rows.next()?.is_some() {}
   drop(rows);

   Ok(if readonly { 0 } else { conn.changes() })
}
