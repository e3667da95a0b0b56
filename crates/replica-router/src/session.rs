//! Logical session state machine
//!
//! ```text
//!            operation                 begin
//! Unbound ─────────────▶ BoundIdle ─────────────▶ BoundInTransaction
//!    │                    │  ▲   ▲   commit/rollback         │
//!    │                    │  └───┼───────────────────────────┘
//!    │                    │      └── operation (may rebind)
//!    └──────── close ─────┴────────────── close ──────────▶ Closed
//! ```
//!
//! Between transactions every operation is routed again and may move the
//! session to another node. Inside a transaction the node is fixed; asking
//! for a different one fails with
//! [`Error::TransactionAffinityViolation`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::cluster::Cluster;
use crate::config::ReplicaFailure;
use crate::consistency::{ConsistencyState, ConsistencyTracker, WriteMark};
use crate::endpoint::{Endpoint, RoutingTarget};
use crate::error::{EndpointError, Error, Result};
use crate::routing::{self, Consistency, OperationKind, Reason, RouteDecision, RouteRequest};

/// Lifecycle state of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
   /// No physical connection chosen yet.
   Unbound,
   /// Bound to a node, no transaction; the next operation may rebind.
   BoundIdle,
   /// Bound to a node with an open transaction; the node is fixed.
   BoundInTransaction,
   /// Terminal.
   Closed,
}

impl fmt::Display for SessionState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         SessionState::Unbound => write!(f, "unbound"),
         SessionState::BoundIdle => write!(f, "bound_idle"),
         SessionState::BoundInTransaction => write!(f, "bound_in_transaction"),
         SessionState::Closed => write!(f, "closed"),
      }
   }
}

/// Observes state transitions of every logical connection in a cluster.
pub trait StateListener: Send + Sync {
   /// Called after the state changed from `from` to `to`.
   fn transition(&self, from: SessionState, to: SessionState);
}

/// Ignores transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStateListener;

impl StateListener for NoopStateListener {
   fn transition(&self, _from: SessionState, _to: SessionState) {}
}

/// Something the session runs on its bound physical connection.
trait Operation<E: Endpoint>: Sync {
   type Output: Send;

   fn run<'a>(
      &'a self,
      endpoint: &'a E,
      conn: &'a mut E::Connection,
   ) -> impl Future<Output = std::result::Result<Self::Output, EndpointError>> + Send + 'a;
}

struct Begin;

impl<E: Endpoint> Operation<E> for Begin {
   type Output = ();

   fn run<'a>(
      &'a self,
      endpoint: &'a E,
      conn: &'a mut E::Connection,
   ) -> impl Future<Output = std::result::Result<(), EndpointError>> + Send + 'a {
      endpoint.begin(conn)
   }
}

struct Execute<'s, E: Endpoint>(&'s E::Statement);

impl<E: Endpoint> Operation<E> for Execute<'_, E> {
   type Output = E::Output;

   fn run<'a>(
      &'a self,
      endpoint: &'a E,
      conn: &'a mut E::Connection,
   ) -> impl Future<Output = std::result::Result<E::Output, EndpointError>> + Send + 'a {
      endpoint.execute(conn, self.0)
   }
}

/// A physical connection the session currently holds.
struct Bound<C> {
   target: RoutingTarget,
   conn: C,
}

/// State of one logical connection. Not meant for concurrent use; every
/// method takes `&mut self`.
pub(crate) struct Session<E: Endpoint> {
   cluster: Arc<Cluster<E>>,
   bound: Option<Bound<E::Connection>>,
   in_transaction: bool,
   closed: bool,
   tracker: ConsistencyTracker,
   last_decision: Option<RouteDecision>,
}

impl<E: Endpoint> Session<E> {
   pub(crate) fn new(cluster: Arc<Cluster<E>>) -> Self {
      let tracker = ConsistencyTracker::new(cluster.config().required_freshness);
      Self {
         cluster,
         bound: None,
         in_transaction: false,
         closed: false,
         tracker,
         last_decision: None,
      }
   }

   pub(crate) fn state(&self) -> SessionState {
      if self.closed {
         return SessionState::Closed;
      }
      match self.bound {
         None => SessionState::Unbound,
         Some(_) if self.in_transaction => SessionState::BoundInTransaction,
         Some(_) => SessionState::BoundIdle,
      }
   }

   pub(crate) fn bound_target(&self) -> Option<RoutingTarget> {
      self.bound.as_ref().map(|bound| bound.target)
   }

   pub(crate) fn in_transaction(&self) -> bool {
      self.in_transaction
   }

   pub(crate) fn consistency(&self) -> &ConsistencyState {
      self.tracker.state()
   }

   pub(crate) fn last_decision(&self) -> Option<RouteDecision> {
      self.last_decision
   }

   pub(crate) async fn execute(
      &mut self,
      statement: &E::Statement,
      kind: OperationKind,
      consistency: Consistency,
   ) -> Result<E::Output> {
      self.ensure_open()?;
      let before = self.state();
      let result = self
         .route_and_run(kind, consistency, &Execute::<E>(statement))
         .await;
      if result.is_ok() && kind == OperationKind::Write {
         self.tracker.record_write(Instant::now());
         if !self.in_transaction {
            self.capture_write_position().await;
         }
      }
      self.notify(before);
      result
   }

   /// Begin a transaction on the node a `kind` operation would be routed to.
   pub(crate) async fn begin_transaction(&mut self, kind: OperationKind) -> Result<()> {
      self.ensure_open()?;
      if self.in_transaction {
         return Err(Error::TransactionAlreadyActive);
      }
      let before = self.state();
      let result = self.route_and_run(kind, Consistency::Session, &Begin).await;
      if result.is_ok() {
         self.in_transaction = true;
         self.tracker.record_transaction_start();
         debug!(endpoint = ?self.bound_target(), ?kind, "Transaction started");
      }
      self.notify(before);
      result
   }

   /// Commit (`commit == true`) or roll back the open transaction.
   ///
   /// Without an open transaction no endpoint is touched, but the
   /// consistency tracker still sees the transaction boundary.
   pub(crate) async fn finish(&mut self, commit: bool) -> Result<()> {
      self.ensure_open()?;
      let before = self.state();
      let ended_transaction = self.in_transaction;
      let wrote = self.tracker.state().has_pending_write();
      let result = if ended_transaction {
         self.end_transaction(commit).await
      } else {
         Ok(())
      };
      if result.is_ok() {
         self.tracker.record_transaction_end(commit, Instant::now());
         if commit && ended_transaction && wrote {
            self.capture_write_position().await;
         }
      } else {
         self.tracker.record_transaction_unresolved();
      }
      self.notify(before);
      result
   }

   /// Treat the next reads as if this session had just written.
   pub(crate) fn require_fresh_reads(&mut self) -> Result<()> {
      self.ensure_open()?;
      self.tracker.require_fresh_reads(Instant::now());
      Ok(())
   }

   /// Release the physical connection and refuse further use. An open
   /// transaction is rolled back first.
   pub(crate) async fn close(&mut self) -> Result<()> {
      self.ensure_open()?;
      let before = self.state();
      if self.in_transaction {
         warn!(endpoint = ?self.bound_target(), "Closing logical connection with an open transaction, rolling back");
         match self.end_transaction(false).await {
            Ok(()) => self.tracker.record_transaction_end(false, Instant::now()),
            Err(err) => {
               warn!(error = %err, "Rollback on close failed");
               self.tracker.record_transaction_unresolved();
            }
         }
      }
      self.release().await;
      self.closed = true;
      self.notify(before);
      Ok(())
   }

   fn ensure_open(&self) -> Result<()> {
      if self.closed {
         return Err(Error::SessionClosed);
      }
      Ok(())
   }

   fn transaction_target(&self) -> Option<RoutingTarget> {
      if self.in_transaction {
         self.bound_target()
      } else {
         None
      }
   }

   fn notify(&self, before: SessionState) {
      let after = self.state();
      if before != after {
         trace!(from = %before, to = %after, "Logical connection state changed");
         self.cluster.listener().transition(before, after);
      }
   }

   async fn route_and_run<Op: Operation<E>>(
      &mut self,
      kind: OperationKind,
      consistency: Consistency,
      op: &Op,
   ) -> Result<Op::Output> {
      let now = Instant::now();
      let read_constraint = self.tracker.read_constraint(now);
      let request = RouteRequest {
         kind,
         consistency,
         transaction_target: self.transaction_target(),
         read_constraint,
      };
      let write = self.tracker.write_mark(now);
      let cluster = &self.cluster;
      let decision = routing::decide(&request, |since_write| {
         cluster.select_replica(now, since_write.and(write), &[])
      });
      trace!(endpoint = %decision.target, reason = %decision.reason, ?kind, "Routed operation");
      self.last_decision = Some(decision);

      if self.in_transaction {
         self.run_in_transaction(decision.target, op).await
      } else {
         self.dispatch(decision, write, op).await
      }
   }

   /// Run on the transaction's node. No retries: moving would split the
   /// transaction.
   async fn run_in_transaction<Op: Operation<E>>(
      &mut self,
      target: RoutingTarget,
      op: &Op,
   ) -> Result<Op::Output> {
      let cluster = &self.cluster;
      let Some(bound) = self.bound.as_mut() else {
         return Err(Error::NoActiveTransaction);
      };
      if bound.target != target {
         warn!(bound = %bound.target, requested = %target, "Refusing to move an open transaction");
         return Err(Error::TransactionAffinityViolation {
            bound: bound.target,
            requested: target,
         });
      }

      match op.run(cluster.endpoint(target), &mut bound.conn).await {
         Ok(output) => Ok(output),
         Err(err) => {
            if err.is_transient() {
               cluster.report_failure(target, Instant::now());
            }
            Err(Error::from_endpoint(target, err))
         }
      }
   }

   /// Run outside a transaction: first choice, then at most one retry on the
   /// next candidate if the first failed transiently and the cluster falls
   /// back on replica failures.
   async fn dispatch<Op: Operation<E>>(
      &mut self,
      decision: RouteDecision,
      write: Option<WriteMark>,
      op: &Op,
   ) -> Result<Op::Output> {
      let first = decision.target;
      let failure = match self.attempt(first, op).await {
         Ok(output) => return Ok(output),
         Err(err) if err.is_transient() => err,
         Err(err) => {
            return Err(Error::NonTransientExec {
               endpoint: first,
               source: err,
            });
         }
      };
      self.abandon(first, &failure).await;
      if first.is_primary() {
         return Err(Error::AllEndpointsUnavailable {
            tried: vec![first],
            source: failure,
         });
      }
      if self.cluster.config().replica_failure == ReplicaFailure::Propagate {
         debug!(failed = %first, "Propagating replica failure");
         return Err(Error::TransientEndpoint {
            endpoint: first,
            source: failure,
         });
      }

      let fallback = match self
         .cluster
         .select_replica(Instant::now(), write, &[first])
      {
         Some(id) => RouteDecision::replica(id, Reason::Failover),
         None => RouteDecision::primary(Reason::Failover),
      };
      debug!(failed = %first, retry = %fallback.target, "Retrying on next candidate");
      self.last_decision = Some(fallback);

      match self.attempt(fallback.target, op).await {
         Ok(output) => Ok(output),
         Err(err) if err.is_transient() => {
            self.abandon(fallback.target, &err).await;
            Err(Error::AllEndpointsUnavailable {
               tried: vec![first, fallback.target],
               source: err,
            })
         }
         Err(err) => Err(Error::NonTransientExec {
            endpoint: fallback.target,
            source: err,
         }),
      }
   }

   /// Bind to `target` (reusing the held connection when it already points
   /// there) and run `op`.
   async fn attempt<Op: Operation<E>>(
      &mut self,
      target: RoutingTarget,
      op: &Op,
   ) -> std::result::Result<Op::Output, EndpointError> {
      let bound = match self.bound.take() {
         Some(bound) if bound.target == target => bound,
         previous => {
            if let Some(previous) = previous {
               trace!(endpoint = %previous.target, "Releasing physical connection to rebind");
               self
                  .cluster
                  .endpoint(previous.target)
                  .close(previous.conn)
                  .await;
            }
            let endpoint = self.cluster.endpoint(target);
            let conn = endpoint.open().await?;
            debug!(endpoint = %target, name = endpoint.name(), "Bound physical connection");
            Bound { target, conn }
         }
      };

      let bound = self.bound.insert(bound);
      op.run(self.cluster.endpoint(target), &mut bound.conn).await
   }

   /// Drop the connection to a node that just failed transiently.
   async fn abandon(&mut self, target: RoutingTarget, failure: &EndpointError) {
      debug!(endpoint = %target, error = %failure, "Abandoning physical connection");
      self.cluster.report_failure(target, Instant::now());
      self.release().await;
   }

   async fn end_transaction(&mut self, commit: bool) -> Result<()> {
      self.in_transaction = false;
      let cluster = &self.cluster;
      let Some(bound) = self.bound.as_mut() else {
         return Err(Error::NoActiveTransaction);
      };
      let target = bound.target;
      let endpoint = cluster.endpoint(target);
      let result = if commit {
         endpoint.commit(&mut bound.conn).await
      } else {
         endpoint.rollback(&mut bound.conn).await
      };

      match result {
         Ok(()) => {
            debug!(endpoint = %target, commit, "Transaction finished");
            Ok(())
         }
         Err(err) => {
            warn!(endpoint = %target, commit, error = %err, "Failed to finish transaction");
            if err.is_transient() {
               cluster.report_failure(target, Instant::now());
            }
            self.release().await;
            Err(Error::from_endpoint(target, err))
         }
      }
   }

   /// Ask the primary where the write just committed on it landed.
   async fn capture_write_position(&mut self) {
      let Some(bound) = self.bound.as_mut().filter(|bound| bound.target.is_primary()) else {
         return;
      };
      let position = match self.cluster.primary().write_position(&mut bound.conn).await {
         Ok(position) => position,
         Err(err) => {
            warn!(error = %err, "Failed to read the primary's write position");
            None
         }
      };
      trace!(?position, "Recorded write position");
      self.tracker.record_write_position(position);
   }

   async fn release(&mut self) {
      if let Some(bound) = self.bound.take() {
         self.cluster.endpoint(bound.target).close(bound.conn).await;
      }
   }
}

impl<E: Endpoint> Drop for Session<E> {
   fn drop(&mut self) {
      if self.in_transaction {
         // The connection is dropped with us; the endpoint's connection type
         // must not return it to a pool with the transaction open.
         debug!(
            endpoint = ?self.bound_target(),
            "Dropping logical connection with an open transaction"
         );
      }
   }
}
