//! Routing decisions
//!
//! [`decide`] is a pure function: given what the caller asked for, the
//! session's transaction binding and its read constraint, it names the node
//! that serves the operation and why. Replica choice is delegated to the
//! selector the caller passes in (normally the failover handler).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consistency::ReadConstraint;
use crate::endpoint::{ReplicaId, RoutingTarget};

/// Whether an operation may change data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
   Read,
   Write,
}

/// Per-operation consistency override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
   /// Read-your-writes within the session; replicas allowed when safe.
   #[default]
   Session,
   /// Route like a write: primary only.
   Strong,
}

/// Why a target was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
   /// The operation writes.
   WriteOperation,
   /// The caller asked for strong consistency.
   StrongConsistency,
   /// The open transaction is already bound to this node.
   TransactionAffinity,
   /// The session has a write that is not committed yet.
   PendingWrite,
   /// Inside the freshness window and no replica could prove it caught up.
   ReplicaInconsistent,
   /// A plain read served by a replica.
   ReadOperation,
   /// Every replica is unhealthy or cooling down.
   NoReplicaAvailable,
   /// The first choice failed transiently and this is the retry.
   Failover,
}

impl Reason {
   pub fn as_str(self) -> &'static str {
      match self {
         Reason::WriteOperation => "WRITE_OPERATION",
         Reason::StrongConsistency => "STRONG_CONSISTENCY",
         Reason::TransactionAffinity => "TRANSACTION_AFFINITY",
         Reason::PendingWrite => "PENDING_WRITE",
         Reason::ReplicaInconsistent => "REPLICA_INCONSISTENT",
         Reason::ReadOperation => "READ_OPERATION",
         Reason::NoReplicaAvailable => "NO_REPLICA_AVAILABLE",
         Reason::Failover => "FAILOVER",
      }
   }
}

impl fmt::Display for Reason {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// Target plus the reason it was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
   pub target: RoutingTarget,
   pub reason: Reason,
}

impl RouteDecision {
   pub fn primary(reason: Reason) -> Self {
      Self {
         target: RoutingTarget::Primary,
         reason,
      }
   }

   pub fn replica(id: ReplicaId, reason: Reason) -> Self {
      Self {
         target: RoutingTarget::Replica(id),
         reason,
      }
   }

   pub fn runs_on_primary(&self) -> bool {
      self.target.is_primary()
   }
}

/// Everything [`decide`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest {
   pub kind: OperationKind,
   pub consistency: Consistency,
   /// Target of the open transaction, if one is open.
   pub transaction_target: Option<RoutingTarget>,
   pub read_constraint: ReadConstraint,
}

/// Pick the node for one operation.
///
/// `select_replica` receives the time since the write replicas must have
/// caught up with (`None` when unconstrained) and returns an eligible
/// replica, or `None` if the primary has to serve the read.
pub fn decide<F>(request: &RouteRequest, select_replica: F) -> RouteDecision
where
   F: FnOnce(Option<Duration>) -> Option<ReplicaId>,
{
   if request.kind == OperationKind::Write {
      return RouteDecision::primary(Reason::WriteOperation);
   }
   if request.consistency == Consistency::Strong {
      return RouteDecision::primary(Reason::StrongConsistency);
   }
   if let Some(target) = request.transaction_target {
      return RouteDecision {
         target,
         reason: Reason::TransactionAffinity,
      };
   }

   match request.read_constraint {
      ReadConstraint::Primary => RouteDecision::primary(Reason::PendingWrite),
      ReadConstraint::CaughtUp { since_write } => match select_replica(Some(since_write)) {
         Some(id) => RouteDecision::replica(id, Reason::ReadOperation),
         None => RouteDecision::primary(Reason::ReplicaInconsistent),
      },
      ReadConstraint::Unconstrained => match select_replica(None) {
         Some(id) => RouteDecision::replica(id, Reason::ReadOperation),
         None => RouteDecision::primary(Reason::NoReplicaAvailable),
      },
   }
}
