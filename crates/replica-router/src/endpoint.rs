//! The capability the router needs from one physical database node

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EndpointError;

/// Position of a replica in the cluster's priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(usize);

impl ReplicaId {
   pub fn new(index: usize) -> Self {
      Self(index)
   }

   pub fn index(self) -> usize {
      self.0
   }
}

impl fmt::Display for ReplicaId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// A point in the primary's replication stream (a log sequence number, a
/// commit index, ...). Later writes have larger positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WritePosition(u64);

impl WritePosition {
   pub fn new(position: u64) -> Self {
      Self(position)
   }

   pub fn get(self) -> u64 {
      self.0
   }
}

impl fmt::Display for WritePosition {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "@{}", self.0)
   }
}

/// The physical node chosen to serve one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingTarget {
   Primary,
   Replica(ReplicaId),
}

impl RoutingTarget {
   pub fn is_primary(self) -> bool {
      matches!(self, RoutingTarget::Primary)
   }

   pub fn replica(self) -> Option<ReplicaId> {
      match self {
         RoutingTarget::Primary => None,
         RoutingTarget::Replica(id) => Some(id),
      }
   }
}

impl fmt::Display for RoutingTarget {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         RoutingTarget::Primary => write!(f, "primary"),
         RoutingTarget::Replica(id) => write!(f, "replica {id}"),
      }
   }
}

/// One database node (primary or replica) as seen by the router.
///
/// Implementations wrap whatever driver and pool the application already
/// uses. Connection lifetime belongs to that pool: [`Endpoint::close`] hands a
/// connection back, it does not shut the node down.
///
/// Every fallible call reports an [`EndpointError`] whose
/// [`FailureKind`](crate::FailureKind) decides whether the router may retry
/// the operation on another node.
pub trait Endpoint: Send + Sync + 'static {
   /// A checked-out physical connection.
   type Connection: Send;
   /// The operation the driver executes (a SQL string, a prepared query, ...).
   type Statement: Sync + ?Sized;
   /// What a successful execution produces.
   type Output: Send;

   /// Human readable name used in logs.
   fn name(&self) -> &str;

   fn open(&self) -> impl Future<Output = Result<Self::Connection, EndpointError>> + Send;

   fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send;

   fn begin(
      &self,
      conn: &mut Self::Connection,
   ) -> impl Future<Output = Result<(), EndpointError>> + Send;

   fn commit(
      &self,
      conn: &mut Self::Connection,
   ) -> impl Future<Output = Result<(), EndpointError>> + Send;

   fn rollback(
      &self,
      conn: &mut Self::Connection,
   ) -> impl Future<Output = Result<(), EndpointError>> + Send;

   fn execute(
      &self,
      conn: &mut Self::Connection,
      statement: &Self::Statement,
   ) -> impl Future<Output = Result<Self::Output, EndpointError>> + Send;

   /// Best-effort, non-blocking health signal.
   fn is_healthy(&self) -> bool;

   /// Estimated replication lag, if the node knows it.
   fn lag(&self) -> Option<Duration> {
      None
   }

   /// Where the write just committed on `conn` landed in the replication
   /// stream. Only called on the primary; `None` if the node does not track
   /// positions.
   fn write_position(
      &self,
      _conn: &mut Self::Connection,
   ) -> impl Future<Output = Result<Option<WritePosition>, EndpointError>> + Send {
      async { Ok(None) }
   }

   /// Latest position this replica has applied, if known. Must not block.
   fn applied_position(&self) -> Option<WritePosition> {
      None
   }
}
