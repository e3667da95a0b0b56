//! Configuration for replica routing

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a read does after its replica failed transiently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaFailure {
   /// Retry once on the next eligible replica, or on the primary if none is
   /// left.
   #[default]
   FallBack,
   /// Return the replica's failure to the caller. The replica still goes
   /// into cooldown.
   Propagate,
}

/// Configuration for a [`Cluster`](crate::Cluster)
///
/// # Examples
///
/// ```
/// use replica_router::RouterConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = RouterConfig::default();
///
/// // Override just one field
/// let config = RouterConfig {
///     cooldown: Duration::from_secs(30),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
   /// How long after a write the replicas are assumed to be behind
   ///
   /// Reads within this window go to the primary unless a replica can prove
   /// it has caught up (see [`FreshnessPolicy`](crate::FreshnessPolicy)).
   ///
   /// Default: 100 milliseconds
   pub required_freshness: Duration,

   /// How long a replica is avoided after a transient failure
   ///
   /// The replica becomes selectable again on its own once this elapses.
   ///
   /// Default: 5 seconds
   pub cooldown: Duration,

   /// Whether a read retries elsewhere after a transient replica failure
   ///
   /// Default: [`ReplicaFailure::FallBack`]
   pub replica_failure: ReplicaFailure,
}

impl Default for RouterConfig {
   fn default() -> Self {
      Self {
         required_freshness: Duration::from_millis(100),
         cooldown: Duration::from_secs(5),
         replica_failure: ReplicaFailure::FallBack,
      }
   }
}
