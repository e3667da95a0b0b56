//! Interactive use of one logical connection

use indexmap::IndexMap;
use replica_router::{Consistency, LogicalConnection, OperationKind, RouteDecision, SessionState};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::endpoint::{SqlStatement, SqliteEndpoint, WriteQueryResult};
use crate::{Error, Result};

/// Statement in a transaction with query and bind values
#[derive(Debug, Clone, Deserialize)]
pub struct Statement {
   pub query: String,
   pub values: Vec<JsonValue>,
}

/// A logical connection speaking JSON rows.
///
/// Writes outside a transaction are autocommitted by SQLite; the session
/// starts the freshness window right away so later reads on this session
/// keep going to the primary until replicas can have caught up.
pub struct DatabaseSession {
   conn: LogicalConnection<SqliteEndpoint>,
}

impl DatabaseSession {
   pub(crate) fn new(conn: LogicalConnection<SqliteEndpoint>) -> Self {
      Self { conn }
   }

   /// Execute a write query (INSERT/UPDATE/DELETE) on the primary
   pub async fn execute(
      &mut self,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<WriteQueryResult> {
      let statement = SqlStatement::execute(query, values);
      let output = self.conn.write(&statement).await?;
      if !self.conn.in_transaction() {
         // Autocommitted; only tells the router the write is durable
         self.conn.commit().await?;
      }
      output.into_write()
   }

   /// Execute a SELECT query, possibly returning multiple rows
   pub async fn fetch_all(
      &mut self,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<Vec<IndexMap<String, JsonValue>>> {
      self.fetch_all_with(query, values, Consistency::Session).await
   }

   /// Like [`fetch_all`](Self::fetch_all), with an explicit consistency level.
   /// [`Consistency::Strong`] always reads from the primary.
   pub async fn fetch_all_with(
      &mut self,
      query: String,
      values: Vec<JsonValue>,
      consistency: Consistency,
   ) -> Result<Vec<IndexMap<String, JsonValue>>> {
      let statement = SqlStatement::fetch(query, values);
      let output = self
         .conn
         .execute(&statement, OperationKind::Read, consistency)
         .await?;
      output.into_rows()
   }

   /// Execute a SELECT query expecting zero or one result
   pub async fn fetch_one(
      &mut self,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<Option<IndexMap<String, JsonValue>>> {
      // Add LIMIT 2 to detect if query returns multiple rows
      let limited_query = format!("{} LIMIT 2", query.trim_end_matches(';'));

      let mut rows = self.fetch_all(limited_query, values).await?;
      match rows.len() {
         0 => Ok(None),
         1 => Ok(rows.pop()),
         count => Err(Error::MultipleRowsReturned(count)),
      }
   }

   /// Execute multiple write statements atomically within a transaction.
   ///
   /// Commits when every statement succeeds. Otherwise rolls back and
   /// returns the statement's error, or
   /// [`Error::TransactionRollbackFailed`] if the rollback failed too.
   pub async fn execute_transaction(
      &mut self,
      statements: Vec<Statement>,
   ) -> Result<Vec<WriteQueryResult>> {
      self.begin().await?;

      let result = async {
         let mut results = Vec::with_capacity(statements.len());
         for statement in statements {
            let statement = SqlStatement::execute(statement.query, statement.values);
            results.push(self.conn.write(&statement).await?.into_write()?);
         }
         Ok::<Vec<WriteQueryResult>, Error>(results)
      }
      .await;

      match result {
         Ok(results) => {
            self.commit().await?;
            Ok(results)
         }
         Err(e) => match self.rollback().await {
            // Rollback succeeded, return original error
            Ok(()) => Err(e),

            // Rollback also failed, return the rollback error and the original error
            Err(rollback_err) => Err(Error::TransactionRollbackFailed {
               transaction_error: e.to_string(),
               rollback_error: rollback_err.to_string(),
            }),
         },
      }
   }

   /// Begin a read-write transaction on the primary
   pub async fn begin(&mut self) -> Result<()> {
      self.conn.begin_transaction().await?;
      Ok(())
   }

   /// Begin a transaction that may run on a replica. Writing inside it fails
   /// if it did.
   pub async fn begin_read_only(&mut self) -> Result<()> {
      self.conn.begin_read_only_transaction().await?;
      Ok(())
   }

   pub async fn commit(&mut self) -> Result<()> {
      self.conn.commit().await?;
      Ok(())
   }

   pub async fn rollback(&mut self) -> Result<()> {
      self.conn.rollback().await?;
      Ok(())
   }

   /// Declare a write made elsewhere that the next reads must observe.
   pub fn require_fresh_reads(&mut self) -> Result<()> {
      self.conn.require_fresh_reads()?;
      Ok(())
   }

   /// Release the physical connection, rolling back an open transaction.
   pub async fn close(&mut self) -> Result<()> {
      self.conn.close().await?;
      Ok(())
   }

   pub fn state(&self) -> SessionState {
      self.conn.state()
   }

   pub fn in_transaction(&self) -> bool {
      self.conn.in_transaction()
   }

   /// Where the most recent statement ran and why.
   pub fn last_decision(&self) -> Option<RouteDecision> {
      self.conn.last_decision()
   }
}

impl Drop for DatabaseSession {
   fn drop(&mut self) {
      if !self.conn.is_closed() {
         // An open transaction makes the connection close instead of pooling
         debug!(state = %self.conn.state(), "Dropping unclosed database session");
      }
   }
}
