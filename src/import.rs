//! SQL file import: statement splitting and transactional execution.

use tracing::warn;

use crate::error::{Error, Result};
use crate::execute::execute_literal;

/// One statement carved out of an imported file, with the line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SqlStatement {
   pub sql: String,
   pub line: usize,
}

/// Split SQL text on semicolons, honoring single-quoted strings (with `''`
/// escapes) and stripping `--` line comments and `/* */` block comments.
pub(crate) fn split_statements(text: &str) -> Vec<SqlStatement> {
   let mut statements = Vec::new();
   let mut current = String::new();
   let mut start_line = 1;
   let mut line = 1;
   let mut in_string = false;
   let mut chars = text.chars().peekable();

   while let Some(c) = chars.next() {
      if c == '\n' {
         line += 1;
      }

      if in_string {
         current.push(c);
         if c == '\'' {
            // A doubled quote stays inside the string
            if chars.peek() == Some(&'\'') {
               current.push(chars.next().unwrap());
            } else {
               in_string = false;
            }
         }
         continue;
      }

      match c {
         '\'' => {
            in_string = true;
            current.push(c);
         }
         '-' if chars.peek() == Some(&'-') => {
            for c in chars.by_ref() {
               if c == '\n' {
                  line += 1;
                  current.push('\n');
                  break;
               }
            }
         }
         '/' if chars.peek() == Some(&'*') => {
            chars.next();
            let mut prev = ' ';
            for c in chars.by_ref() {
               if c == '\n' {
                  line += 1;
               }
               if prev == '*' && c == '/' {
                  break;
               }
               prev = c;
            }
         }
         ';' => {
            let sql = current.trim();
            if !sql.is_empty() {
               statements.push(SqlStatement { sql: sql.to_owned(), line: start_line });
            }
            current.clear();
            start_line = line;
         }
         _ => {
            if current.trim().is_empty() && !c.is_whitespace() {
               start_line = line;
            }
            current.push(c);
         }
      }
   }

   let sql = current.trim();
   if !sql.is_empty() {
      statements.push(SqlStatement { sql: sql.to_owned(), line: start_line });
   }

   statements
}

/// Run every statement inside one transaction. On the first failure the
/// transaction is rolled back and the failing statement's line and message
/// are reported. Returns the number of executed statements.
pub(crate) fn run_import(
   conn: &mut rusqlite::Connection,
   statements: &[SqlStatement],
) -> Result<usize> {
   execute_literal(conn, "BEGIN")?;

   for statement in statements {
      if let Err(error) = execute_literal(conn, &statement.sql) {
         if let Err(rollback_error) = execute_literal(conn, "ROLLBACK") {
            warn!(%rollback_error, "rollback after failed import also failed");
         }
         return Err(Error::ImportFailed {
            line: statement.line,
            message: error.to_string(),
         });
      }
   }

   execute_literal(conn, "COMMIT")?;
   Ok(statements.len())
}
