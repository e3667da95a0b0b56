//! The connection handle applications use

use std::sync::Arc;

use crate::cluster::Cluster;
use crate::consistency::ConsistencyState;
use crate::endpoint::{Endpoint, RoutingTarget};
use crate::error::Result;
use crate::routing::{Consistency, OperationKind, RouteDecision};
use crate::session::{Session, SessionState};

/// One logical database connection over a [`Cluster`].
///
/// Behaves like a single connection: writes and anything after them are
/// served by the primary, reads go to replicas when that cannot be observed,
/// and a transaction stays on the node it started on.
///
/// Obtained from [`Cluster::connect`]. Meant for one caller at a time.
pub struct LogicalConnection<E: Endpoint> {
   session: Session<E>,
}

impl<E: Endpoint> LogicalConnection<E> {
   pub(crate) fn new(cluster: Arc<Cluster<E>>) -> Self {
      Self {
         session: Session::new(cluster),
      }
   }

   /// Run `statement`, routed by `kind` and the `consistency` override.
   pub async fn execute(
      &mut self,
      statement: &E::Statement,
      kind: OperationKind,
      consistency: Consistency,
   ) -> Result<E::Output> {
      self.session.execute(statement, kind, consistency).await
   }

   pub async fn read(&mut self, statement: &E::Statement) -> Result<E::Output> {
      self
         .execute(statement, OperationKind::Read, Consistency::Session)
         .await
   }

   pub async fn write(&mut self, statement: &E::Statement) -> Result<E::Output> {
      self
         .execute(statement, OperationKind::Write, Consistency::Session)
         .await
   }

   /// Begin a read-write transaction on the primary.
   pub async fn begin_transaction(&mut self) -> Result<()> {
      self.session.begin_transaction(OperationKind::Write).await
   }

   /// Begin a transaction routed like a read. Writing inside it fails with
   /// [`Error::TransactionAffinityViolation`](crate::Error::TransactionAffinityViolation)
   /// if it landed on a replica.
   pub async fn begin_read_only_transaction(&mut self) -> Result<()> {
      self.session.begin_transaction(OperationKind::Read).await
   }

   pub async fn commit(&mut self) -> Result<()> {
      self.session.finish(true).await
   }

   pub async fn rollback(&mut self) -> Result<()> {
      self.session.finish(false).await
   }

   /// Release the physical connection. Closing twice fails with
   /// [`Error::SessionClosed`](crate::Error::SessionClosed).
   pub async fn close(&mut self) -> Result<()> {
      self.session.close().await
   }

   /// Declare a write made outside this connection that its next reads
   /// must observe.
   pub fn require_fresh_reads(&mut self) -> Result<()> {
      self.session.require_fresh_reads()
   }

   pub fn state(&self) -> SessionState {
      self.session.state()
   }

   pub fn is_closed(&self) -> bool {
      self.state() == SessionState::Closed
   }

   pub fn in_transaction(&self) -> bool {
      self.session.in_transaction()
   }

   /// Node the held physical connection points at, if any.
   pub fn bound_target(&self) -> Option<RoutingTarget> {
      self.session.bound_target()
   }

   /// Where the most recent operation was routed and why.
   pub fn last_decision(&self) -> Option<RouteDecision> {
      self.session.last_decision()
   }

   pub fn consistency(&self) -> &ConsistencyState {
      self.session.consistency()
   }
}
