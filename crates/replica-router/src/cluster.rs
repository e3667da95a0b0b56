//! The set of physical endpoints logical connections are routed across

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::config::RouterConfig;
use crate::connection::LogicalConnection;
use crate::consistency::{AssumedPropagation, FreshnessPolicy, ReplicaProgress, WriteMark};
use crate::endpoint::{Endpoint, ReplicaId, RoutingTarget};
use crate::failover::FailoverHandler;
use crate::session::{NoopStateListener, StateListener};

/// A primary, its replicas in priority order, and the routing state they share.
///
/// ## Architecture
///
/// - **`primary`**: the only writable node and the fallback for every read
/// - **`replicas`**: read-only nodes, tried first to last
/// - **`failover`**: health filtering and the cooldown arena shared by all
///   logical connections of this cluster
///
/// ## Usage Pattern
///
/// ```text
/// 1. Build the cluster once from externally pooled endpoints
/// 2. connect() a LogicalConnection per unit of work
/// 3. Route reads/writes/transactions through the connection
/// 4. close() the connection (endpoints stay open)
/// ```
pub struct Cluster<E: Endpoint> {
   primary: E,
   replicas: Vec<E>,
   failover: FailoverHandler,
   freshness: Box<dyn FreshnessPolicy>,
   listener: Arc<dyn StateListener>,
   config: RouterConfig,
}

impl<E: Endpoint> Cluster<E> {
   pub fn builder(primary: E) -> ClusterBuilder<E> {
      ClusterBuilder {
         primary,
         replicas: Vec::new(),
         freshness: Box::new(AssumedPropagation),
         listener: Arc::new(NoopStateListener),
         config: RouterConfig::default(),
      }
   }

   /// Open a new logical connection. No physical connection is taken until
   /// the first operation.
   pub fn connect(self: &Arc<Self>) -> LogicalConnection<E> {
      LogicalConnection::new(Arc::clone(self))
   }

   pub fn primary(&self) -> &E {
      &self.primary
   }

   pub fn replicas(&self) -> &[E] {
      &self.replicas
   }

   pub fn config(&self) -> &RouterConfig {
      &self.config
   }

   pub fn failover(&self) -> &FailoverHandler {
      &self.failover
   }

   pub(crate) fn listener(&self) -> &dyn StateListener {
      self.listener.as_ref()
   }

   /// The endpoint behind `target`. Replica ids always come from this cluster.
   pub fn endpoint(&self, target: RoutingTarget) -> &E {
      match target {
         RoutingTarget::Primary => &self.primary,
         RoutingTarget::Replica(id) => self.replicas.get(id.index()).unwrap_or(&self.primary),
      }
   }

   /// Choose a replica for a read. `write` is set inside the freshness
   /// window; `exclude` lists targets that already failed this operation.
   pub(crate) fn select_replica(
      &self,
      now: Instant,
      write: Option<WriteMark>,
      exclude: &[RoutingTarget],
   ) -> Option<ReplicaId> {
      let candidates = self
         .replicas
         .iter()
         .enumerate()
         .map(|(index, endpoint)| (ReplicaId::new(index), endpoint));

      self
         .failover
         .select_replica(candidates, now, |id, endpoint| {
            if exclude.contains(&RoutingTarget::Replica(id)) {
               return false;
            }
            match write {
               Some(write) => {
                  let progress = ReplicaProgress {
                     lag: endpoint.lag(),
                     applied: endpoint.applied_position(),
                  };
                  self.freshness.is_caught_up(progress, write)
               }
               None => true,
            }
         })
         .replica()
   }

   /// Put a replica that failed transiently into cooldown. No-op for the primary.
   pub(crate) fn report_failure(&self, target: RoutingTarget, now: Instant) {
      if let RoutingTarget::Replica(id) = target {
         self
            .failover
            .report_failure(id, self.endpoint(target).name(), now);
      }
   }
}

impl<E: Endpoint> fmt::Debug for Cluster<E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Cluster")
         .field("primary", &self.primary.name())
         .field(
            "replicas",
            &self.replicas.iter().map(|r| r.name()).collect::<Vec<_>>(),
         )
         .field("freshness", &self.freshness)
         .field("config", &self.config)
         .finish_non_exhaustive()
   }
}

/// Builder for [`Cluster`].
pub struct ClusterBuilder<E: Endpoint> {
   primary: E,
   replicas: Vec<E>,
   freshness: Box<dyn FreshnessPolicy>,
   listener: Arc<dyn StateListener>,
   config: RouterConfig,
}

impl<E: Endpoint> ClusterBuilder<E> {
   /// Add a replica after the ones already added (lower priority).
   pub fn replica(mut self, endpoint: E) -> Self {
      self.replicas.push(endpoint);
      self
   }

   pub fn replicas(mut self, endpoints: impl IntoIterator<Item = E>) -> Self {
      self.replicas.extend(endpoints);
      self
   }

   pub fn config(mut self, config: RouterConfig) -> Self {
      self.config = config;
      self
   }

   /// How replicas prove they caught up with a recent write.
   pub fn freshness(mut self, policy: impl FreshnessPolicy + 'static) -> Self {
      self.freshness = Box::new(policy);
      self
   }

   /// Observer for logical connection state transitions.
   pub fn state_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
      self.listener = listener;
      self
   }

   pub fn build(self) -> Arc<Cluster<E>> {
      let failover = FailoverHandler::new(self.replicas.len(), self.config.cooldown);
      Arc::new(Cluster {
         primary: self.primary,
         replicas: self.replicas,
         failover,
         freshness: self.freshness,
         listener: self.listener,
         config: self.config,
      })
   }
}
