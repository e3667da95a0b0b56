use std::sync::Arc;

use indexmap::IndexMap;
use replica_router::{Cluster, ClusterBuilder, FreshnessPolicy, RouterConfig, StateListener};
use serde_json::Value as JsonValue;
use sqlx::{Pool, Sqlite};
use tokio::sync::Mutex;
use tracing::debug;

use crate::endpoint::{SqliteEndpoint, WriteQueryResult};
use crate::session::{DatabaseSession, Statement};
use crate::{Error, Result};

/// A primary SQLite database and its read replicas behind one JSON-facing
/// handle.
///
/// The one-shot methods (`execute`, `fetch_all`, ...) share a single logical
/// connection, so a read issued after a write through this handle observes
/// the write. Use [`session`](Self::session) for an independent connection,
/// e.g. one per request.
pub struct ReplicatedDatabase {
   cluster: Arc<Cluster<SqliteEndpoint>>,
   default_session: Mutex<DatabaseSession>,
}

impl ReplicatedDatabase {
   /// Route between `primary` and `replicas`, in priority order.
   pub fn new(
      primary: Pool<Sqlite>,
      replicas: impl IntoIterator<Item = Pool<Sqlite>>,
      config: RouterConfig,
   ) -> Self {
      Self::from_cluster(Self::builder(primary, replicas).config(config).build())
   }

   /// Like [`new`](Self::new), with a custom freshness policy and state
   /// listener.
   pub fn with_policy(
      primary: Pool<Sqlite>,
      replicas: impl IntoIterator<Item = Pool<Sqlite>>,
      config: RouterConfig,
      freshness: impl FreshnessPolicy + 'static,
      listener: Arc<dyn StateListener>,
   ) -> Self {
      let cluster = Self::builder(primary, replicas)
         .config(config)
         .freshness(freshness)
         .state_listener(listener)
         .build();

      Self::from_cluster(cluster)
   }

   /// Endpoints are named `primary`, `replica-0`, `replica-1`, ...
   fn builder(
      primary: Pool<Sqlite>,
      replicas: impl IntoIterator<Item = Pool<Sqlite>>,
   ) -> ClusterBuilder<SqliteEndpoint> {
      Cluster::builder(SqliteEndpoint::new("primary", primary)).replicas(
         replicas
            .into_iter()
            .enumerate()
            .map(|(i, pool)| SqliteEndpoint::new(format!("replica-{i}"), pool)),
      )
   }

   /// Use an already built cluster of SQLite endpoints.
   pub fn from_cluster(cluster: Arc<Cluster<SqliteEndpoint>>) -> Self {
      let default_session = Mutex::new(DatabaseSession::new(cluster.connect()));
      Self {
         cluster,
         default_session,
      }
   }

   pub fn cluster(&self) -> &Arc<Cluster<SqliteEndpoint>> {
      &self.cluster
   }

   /// Open an independent logical connection.
   pub fn session(&self) -> DatabaseSession {
      DatabaseSession::new(self.cluster.connect())
   }

   /// Execute a write query (INSERT/UPDATE/DELETE)
   pub async fn execute(
      &self,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<WriteQueryResult> {
      self.default_session.lock().await.execute(query, values).await
   }

   /// Execute multiple write statements atomically within a transaction.
   ///
   /// This method:
   /// 1. Begins a transaction on the primary
   /// 2. Executes all statements in order
   /// 3. Commits on success
   /// 4. Rolls back on any error
   ///
   /// Returns the result of each statement execution.
   pub async fn execute_transaction(
      &self,
      statements: Vec<(String, Vec<JsonValue>)>,
   ) -> Result<Vec<WriteQueryResult>> {
      let statements = statements
         .into_iter()
         .map(|(query, values)| Statement { query, values })
         .collect();

      self
         .default_session
         .lock()
         .await
         .execute_transaction(statements)
         .await
   }

   /// Execute a SELECT query, possibly returning multiple rows
   pub async fn fetch_all(
      &self,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<Vec<IndexMap<String, JsonValue>>> {
      self.default_session.lock().await.fetch_all(query, values).await
   }

   /// Execute a SELECT query expecting zero or one result
   pub async fn fetch_one(
      &self,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<Option<IndexMap<String, JsonValue>>> {
      self.default_session.lock().await.fetch_one(query, values).await
   }

   /// Close the shared logical connection and every pool.
   pub async fn close(self) -> Result<()> {
      let mut session = self.default_session.lock().await;
      match session.close().await {
         Ok(()) | Err(Error::Router(replica_router::Error::SessionClosed)) => {}
         Err(err) => return Err(err),
      }
      drop(session);

      self.cluster.primary().close_pool().await;
      for replica in self.cluster.replicas() {
         replica.close_pool().await;
      }
      debug!(replicas = self.cluster.replicas().len(), "Closed replicated database");
      Ok(())
   }
}
