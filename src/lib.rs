//! # sqlx-replica-router
//!
//! SQLite on [sqlx](https://docs.rs/sqlx) with a primary and read replicas,
//! routed by [`replica_router`].
//!
//! Every node is an existing `Pool<Sqlite>`. Writes, transactions and reads
//! that must observe a recent write run on the primary; other reads are
//! spread to the first healthy replica. Rows come back as ordered JSON maps.
//!
//! ## Example
//!
//! ```ignore
//! use sqlx_replica_router::{ReplicatedDatabase, RouterConfig};
//! use serde_json::json;
//!
//! let db = ReplicatedDatabase::new(primary_pool, [replica_pool], RouterConfig::default());
//!
//! db.execute("INSERT INTO users (name) VALUES ($1)".into(), vec![json!("Alice")])
//!    .await?;
//! // Served by the primary: the insert is still inside the freshness window
//! let user = db
//!    .fetch_one("SELECT * FROM users WHERE name = $1".into(), vec![json!("Alice")])
//!    .await?;
//!
//! db.close().await?;
//! ```

mod decode;
mod endpoint;
mod error;
mod session;
mod wrapper;

pub use endpoint::{
   PooledConnection, SqlStatement, SqliteEndpoint, StatementOutput, WriteQueryResult, classify,
};
pub use error::{Error, Result};
pub use session::{DatabaseSession, Statement};
pub use wrapper::ReplicatedDatabase;

// Re-export the routing types callers configure and inspect
pub use replica_router::{
   AppliedPosition, AssumedPropagation, Consistency, FreshnessPolicy, Reason, ReplicaFailure,
   ReportedLag, RouteDecision, RouterConfig, RoutingTarget, SessionState, StateListener,
   WritePosition,
};
