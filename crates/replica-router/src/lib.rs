//! # replica-router
//!
//! Routes one logical database connection between a primary and its read
//! replicas while keeping the guarantees of a single connection.
//!
//! ## Core Types
//!
//! - **[`Cluster`]**: the primary, replicas in priority order, and shared cooldown state
//! - **[`LogicalConnection`]**: what applications hold; routes every call
//! - **[`Endpoint`]**: the capability a physical node must provide
//! - **[`RouterConfig`]**: freshness window, cooldown and replica failure settings
//! - **[`Error`]**: error type for routed operations
//!
//! ## Guarantees
//!
//! - **Writes never hit replicas**: every write, and every read asking for
//!   [`Consistency::Strong`], goes to the primary
//! - **Read-your-writes**: after a write, reads stay on the primary until the
//!   write is committed and the freshness window has passed, unless a
//!   replica proves it caught up (see [`FreshnessPolicy`])
//! - **Transaction affinity**: a transaction never moves between nodes
//! - **Failover**: unhealthy or recently failed replicas are skipped; a
//!   transient replica failure is retried once on the next candidate, with
//!   the primary as last resort (see [`ReplicaFailure`])
//!
//! ## Example
//!
//! ```ignore
//! use replica_router::{Cluster, RouterConfig};
//!
//! let cluster = Cluster::builder(primary)
//!    .replica(replica_a)
//!    .replica(replica_b)
//!    .config(RouterConfig::default())
//!    .build();
//!
//! let mut conn = cluster.connect();
//! conn.write("UPDATE users SET name = 'Alice' WHERE id = 1").await?;
//! conn.commit().await?;
//! // Still served by the primary: the write is inside the freshness window
//! let rows = conn.read("SELECT name FROM users WHERE id = 1").await?;
//! conn.close().await?;
//! ```

mod cluster;
mod config;
mod connection;
mod consistency;
mod endpoint;
mod error;
mod failover;
mod routing;
mod session;

// Re-export public types
pub use cluster::{Cluster, ClusterBuilder};
pub use config::{ReplicaFailure, RouterConfig};
pub use connection::LogicalConnection;
pub use consistency::{
   AppliedPosition, AssumedPropagation, ConsistencyState, ConsistencyTracker, FreshnessPolicy,
   ReadConstraint, ReplicaProgress, ReportedLag, WriteMark,
};
pub use endpoint::{Endpoint, ReplicaId, RoutingTarget, WritePosition};
pub use error::{BoxError, EndpointError, Error, FailureKind, Result};
pub use failover::{Cooldowns, FailoverHandler};
pub use routing::{Consistency, OperationKind, Reason, RouteDecision, RouteRequest, decide};
pub use session::{NoopStateListener, SessionState, StateListener};
