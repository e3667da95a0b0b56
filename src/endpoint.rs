//! A sqlx SQLite pool as a routable endpoint

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use replica_router::{Endpoint, EndpointError, WritePosition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Pool, Sqlite};
use tracing::{debug, trace, warn};

use crate::Error;

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only set for INSERT operations on tables with a ROWID.
   /// Tables created with `WITHOUT ROWID` will not set this value (returns 0).
   pub last_insert_id: i64,
}

/// A query with its JSON bind values, sent either for its effect or its rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SqlStatement {
   /// Run for its effect; produces [`StatementOutput::Write`].
   Execute { query: String, values: Vec<JsonValue> },
   /// Run for its rows; produces [`StatementOutput::Rows`].
   Fetch { query: String, values: Vec<JsonValue> },
}

impl SqlStatement {
   pub fn execute(query: impl Into<String>, values: Vec<JsonValue>) -> Self {
      SqlStatement::Execute {
         query: query.into(),
         values,
      }
   }

   pub fn fetch(query: impl Into<String>, values: Vec<JsonValue>) -> Self {
      SqlStatement::Fetch {
         query: query.into(),
         values,
      }
   }

   pub fn query(&self) -> &str {
      match self {
         SqlStatement::Execute { query, .. } | SqlStatement::Fetch { query, .. } => query,
      }
   }
}

/// What a [`SqlStatement`] produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementOutput {
   Write(WriteQueryResult),
   Rows(Vec<IndexMap<String, JsonValue>>),
}

impl StatementOutput {
   pub fn into_write(self) -> Result<WriteQueryResult, Error> {
      match self {
         StatementOutput::Write(result) => Ok(result),
         StatementOutput::Rows(_) => Err(Error::UnexpectedOutput { expected: "write" }),
      }
   }

   pub fn into_rows(self) -> Result<Vec<IndexMap<String, JsonValue>>, Error> {
      match self {
         StatementOutput::Rows(rows) => Ok(rows),
         StatementOutput::Write(_) => Err(Error::UnexpectedOutput { expected: "rows" }),
      }
   }
}

/// A connection checked out of an endpoint's pool.
///
/// Transactions are opened with a plain `BEGIN` that sqlx does not track, so
/// the connection remembers it. Dropped with a transaction still open, it is
/// closed instead of going back to the pool.
pub struct PooledConnection {
   conn: PoolConnection<Sqlite>,
   in_transaction: bool,
}

impl PooledConnection {
   fn new(conn: PoolConnection<Sqlite>) -> Self {
      Self {
         conn,
         in_transaction: false,
      }
   }

   pub fn in_transaction(&self) -> bool {
      self.in_transaction
   }
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      if self.in_transaction {
         debug!("Closing connection with an open transaction instead of pooling it");
         self.conn.close_on_drop();
      }
   }
}

/// One SQLite node behind an externally configured pool.
///
/// The pool decides connection limits, timeouts and pragmas. Replicas are
/// usually opened read-only by the caller (`SqliteConnectOptions::read_only`).
pub struct SqliteEndpoint {
   name: String,
   pool: Pool<Sqlite>,
   healthy: AtomicBool,
   lag: Mutex<Option<Duration>>,
   position_query: Option<String>,
   applied: Mutex<Option<WritePosition>>,
}

impl SqliteEndpoint {
   pub fn new(name: impl Into<String>, pool: Pool<Sqlite>) -> Self {
      Self {
         name: name.into(),
         pool,
         healthy: AtomicBool::new(true),
         lag: Mutex::new(None),
         position_query: None,
         applied: Mutex::new(None),
      }
   }

   /// Query returning a single non-negative integer: this node's position
   /// in the replication stream. Run on the primary after every committed
   /// write.
   pub fn with_position_query(mut self, query: impl Into<String>) -> Self {
      self.position_query = Some(query.into());
      self
   }

   pub fn pool(&self) -> &Pool<Sqlite> {
      &self.pool
   }

   /// Take this node in or out of rotation. A closed pool is always unhealthy.
   pub fn set_healthy(&self, healthy: bool) {
      debug!(endpoint = %self.name, healthy, "Endpoint health changed");
      self.healthy.store(healthy, Ordering::Release);
   }

   /// Record the replication lag last observed for this node.
   pub fn report_lag(&self, lag: Option<Duration>) {
      *self.lag.lock().unwrap_or_else(PoisonError::into_inner) = lag;
   }

   /// Record the replication position this replica has applied.
   pub fn report_applied_position(&self, position: Option<WritePosition>) {
      *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = position;
   }

   /// Close the underlying pool.
   pub async fn close_pool(&self) {
      self.pool.close().await;
   }
}

impl Endpoint for SqliteEndpoint {
   type Connection = PooledConnection;
   type Statement = SqlStatement;
   type Output = StatementOutput;

   fn name(&self) -> &str {
      &self.name
   }

   async fn open(&self) -> Result<PooledConnection, EndpointError> {
      let conn = self.pool.acquire().await.map_err(classify)?;
      Ok(PooledConnection::new(conn))
   }

   async fn close(&self, mut conn: PooledConnection) {
      if conn.in_transaction {
         // COMMIT or ROLLBACK failed earlier; the pool must not get it back dirty
         match sqlx::query("ROLLBACK").execute(&mut *conn.conn).await {
            Ok(_) => conn.in_transaction = false,
            Err(err) => {
               warn!(endpoint = %self.name, error = %err, "Rollback before release failed");
            }
         }
      }
      // Returns the connection to the pool, or closes it if still dirty
      drop(conn);
   }

   async fn begin(&self, conn: &mut PooledConnection) -> Result<(), EndpointError> {
      sqlx::query("BEGIN")
         .execute(&mut *conn.conn)
         .await
         .map_err(classify)?;
      conn.in_transaction = true;
      Ok(())
   }

   async fn commit(&self, conn: &mut PooledConnection) -> Result<(), EndpointError> {
      sqlx::query("COMMIT")
         .execute(&mut *conn.conn)
         .await
         .map_err(classify)?;
      conn.in_transaction = false;
      Ok(())
   }

   async fn rollback(&self, conn: &mut PooledConnection) -> Result<(), EndpointError> {
      sqlx::query("ROLLBACK")
         .execute(&mut *conn.conn)
         .await
         .map_err(classify)?;
      conn.in_transaction = false;
      Ok(())
   }

   async fn execute(
      &self,
      conn: &mut PooledConnection,
      statement: &SqlStatement,
   ) -> Result<StatementOutput, EndpointError> {
      trace!(endpoint = %self.name, query = statement.query(), "Executing statement");
      match statement {
         SqlStatement::Execute { query, values } => {
            let result = bind_values(sqlx::query(query), values)
               .execute(&mut *conn.conn)
               .await
               .map_err(classify)?;
            Ok(StatementOutput::Write(WriteQueryResult {
               rows_affected: result.rows_affected(),
               last_insert_id: result.last_insert_rowid(),
            }))
         }
         SqlStatement::Fetch { query, values } => {
            let rows = bind_values(sqlx::query(query), values)
               .fetch_all(&mut *conn.conn)
               .await
               .map_err(classify)?;
            let rows = rows
               .iter()
               .map(crate::decode::row_to_json)
               .collect::<Result<Vec<_>, Error>>()
               .map_err(|err| match err {
                  Error::Sqlx(err) => classify(err),
                  other => EndpointError::non_transient(other),
               })?;
            Ok(StatementOutput::Rows(rows))
         }
      }
   }

   fn is_healthy(&self) -> bool {
      self.healthy.load(Ordering::Acquire) && !self.pool.is_closed()
   }

   fn lag(&self) -> Option<Duration> {
      *self.lag.lock().unwrap_or_else(PoisonError::into_inner)
   }

   async fn write_position(
      &self,
      conn: &mut PooledConnection,
   ) -> Result<Option<WritePosition>, EndpointError> {
      let Some(query) = self.position_query.as_deref() else {
         return Ok(None);
      };
      let position: i64 = sqlx::query_scalar(query)
         .fetch_one(&mut *conn.conn)
         .await
         .map_err(classify)?;
      Ok(u64::try_from(position).ok().map(WritePosition::new))
   }

   fn applied_position(&self) -> Option<WritePosition> {
      *self.applied.lock().unwrap_or_else(PoisonError::into_inner)
   }
}

/// SQLite primary result codes that mean "try again, maybe elsewhere".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;
const SQLITE_CANTOPEN: i32 = 14;

/// Tag a sqlx error as transient (connection-level, retryable on another
/// node) or non-transient (the statement itself was rejected).
pub fn classify(err: sqlx::Error) -> EndpointError {
   let transient = match &err {
      sqlx::Error::Io(_)
      | sqlx::Error::Tls(_)
      | sqlx::Error::Protocol(_)
      | sqlx::Error::PoolTimedOut
      | sqlx::Error::PoolClosed
      | sqlx::Error::WorkerCrashed => true,
      sqlx::Error::Database(db_err) => db_err
         .code()
         .and_then(|code| code.parse::<i32>().ok())
         .is_some_and(|code| {
            // Extended codes carry the primary code in the low byte
            matches!(
               code & 0xff,
               SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_CANTOPEN
            )
         }),
      _ => false,
   };

   if transient {
      EndpointError::transient(err)
   } else {
      EndpointError::non_transient(err)
   }
}

/// Bind JSON values to a SQLx query in order.
fn bind_values<'q>(
   mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
   values: &[JsonValue],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
   for value in values {
      query = bind_value(query, value.clone());
   }
   query
}

/// Helper function to bind a JSON value to a SQLx query
fn bind_value<'q>(
   query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
   value: JsonValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::String(s) => query.bind(s),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Value too large for i64, use f64 (will lose precision)
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use replica_router::FailureKind;

   #[test]
   fn test_connection_level_errors_are_transient() {
      for err in [
         sqlx::Error::PoolTimedOut,
         sqlx::Error::PoolClosed,
         sqlx::Error::WorkerCrashed,
         sqlx::Error::Protocol("unexpected frame".into()),
         sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
         )),
      ] {
         assert_eq!(classify(err).kind(), FailureKind::Transient);
      }
   }

   #[test]
   fn test_statement_errors_are_not_transient() {
      for err in [
         sqlx::Error::RowNotFound,
         sqlx::Error::ColumnNotFound("missing".into()),
      ] {
         assert_eq!(classify(err).kind(), FailureKind::NonTransient);
      }
   }

   #[tokio::test]
   async fn test_close_rolls_back_before_pooling() {
      let pool = sqlx::sqlite::SqlitePoolOptions::new()
         .max_connections(1)
         .connect("sqlite::memory:")
         .await
         .unwrap();
      let endpoint = SqliteEndpoint::new("primary", pool);

      let mut conn = endpoint.open().await.unwrap();
      endpoint.begin(&mut conn).await.unwrap();
      assert!(conn.in_transaction());
      endpoint.commit(&mut conn).await.unwrap();
      assert!(!conn.in_transaction());

      endpoint.begin(&mut conn).await.unwrap();
      endpoint.close(conn).await;

      // Same physical connection: BEGIN fails if the last one is still open
      let mut conn = endpoint.open().await.unwrap();
      endpoint.begin(&mut conn).await.unwrap();
      endpoint.rollback(&mut conn).await.unwrap();
      assert_eq!(endpoint.write_position(&mut conn).await.unwrap(), None);
   }

   #[tokio::test]
   async fn test_write_position_query() {
      let pool = sqlx::sqlite::SqlitePoolOptions::new()
         .max_connections(1)
         .connect("sqlite::memory:")
         .await
         .unwrap();
      let endpoint = SqliteEndpoint::new("primary", pool).with_position_query("SELECT 42");
      let mut conn = endpoint.open().await.unwrap();

      assert_eq!(
         endpoint.write_position(&mut conn).await.unwrap(),
         Some(WritePosition::new(42))
      );
      assert_eq!(endpoint.applied_position(), None);
      endpoint.report_applied_position(Some(WritePosition::new(7)));
      assert_eq!(endpoint.applied_position(), Some(WritePosition::new(7)));
   }

   #[test]
   fn test_statement_kinds() {
      let stmt = SqlStatement::fetch("SELECT 1", vec![]);
      assert_eq!(stmt.query(), "SELECT 1");
      assert!(matches!(
         StatementOutput::Rows(vec![]).into_write(),
         Err(Error::UnexpectedOutput { expected: "write" })
      ));
   }
}
