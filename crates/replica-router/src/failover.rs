//! Replica selection with health checks and cooldowns
//!
//! Cooldowns are the only routing state shared between logical connections.
//! They live in a fixed arena of atomics indexed by replica, each holding the
//! offset (from the arena's epoch) after which the replica may be used again.
//! Entries expire on their own; nothing resets them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, ReplicaId, RoutingTarget};

/// Per-replica "available again after" stamps.
#[derive(Debug)]
pub struct Cooldowns {
   epoch: Instant,
   available_after: Box<[AtomicU64]>,
}

impl Cooldowns {
   pub fn new(replicas: usize) -> Self {
      Self {
         epoch: Instant::now(),
         available_after: (0..replicas).map(|_| AtomicU64::new(0)).collect(),
      }
   }

   fn offset(&self, at: Instant) -> u64 {
      let nanos = at.saturating_duration_since(self.epoch).as_nanos();
      u64::try_from(nanos).unwrap_or(u64::MAX)
   }

   /// Avoid `id` until `now + cooldown`. Never shortens a running cooldown.
   /// A cooldown past the end of the clock lasts forever.
   pub fn mark(&self, id: ReplicaId, now: Instant, cooldown: Duration) {
      if let Some(slot) = self.available_after.get(id.index()) {
         let until = now
            .checked_add(cooldown)
            .map_or(u64::MAX, |until| self.offset(until));
         slot.fetch_max(until, Ordering::AcqRel);
      }
   }

   pub fn is_cooling_down(&self, id: ReplicaId, now: Instant) -> bool {
      self
         .available_after
         .get(id.index())
         .is_some_and(|slot| self.offset(now) < slot.load(Ordering::Acquire))
   }

   /// When `id` becomes selectable again, if it is currently avoided.
   pub fn available_after(&self, id: ReplicaId, now: Instant) -> Option<Instant> {
      if !self.is_cooling_down(id, now) {
         return None;
      }
      let nanos = self.available_after[id.index()].load(Ordering::Acquire);
      self.epoch.checked_add(Duration::from_nanos(nanos))
   }
}

/// Picks replicas and penalizes the ones that fail.
#[derive(Debug)]
pub struct FailoverHandler {
   cooldowns: Cooldowns,
   cooldown: Duration,
}

impl FailoverHandler {
   pub fn new(replicas: usize, cooldown: Duration) -> Self {
      Self {
         cooldowns: Cooldowns::new(replicas),
         cooldown,
      }
   }

   pub fn cooldowns(&self) -> &Cooldowns {
      &self.cooldowns
   }

   /// First candidate, in priority order, that reports healthy, is not
   /// cooling down and passes `eligible`. Falls back to the primary.
   pub fn select_replica<'a, E, I, F>(
      &self,
      candidates: I,
      now: Instant,
      eligible: F,
   ) -> RoutingTarget
   where
      E: Endpoint,
      I: IntoIterator<Item = (ReplicaId, &'a E)>,
      F: Fn(ReplicaId, &E) -> bool,
   {
      for (id, endpoint) in candidates {
         if !endpoint.is_healthy() {
            debug!(replica = %id, endpoint = endpoint.name(), "Skipping unhealthy replica");
            continue;
         }
         if self.cooldowns.is_cooling_down(id, now) {
            debug!(replica = %id, endpoint = endpoint.name(), "Skipping replica in cooldown");
            continue;
         }
         if !eligible(id, endpoint) {
            continue;
         }
         return RoutingTarget::Replica(id);
      }
      RoutingTarget::Primary
   }

   /// A transient failure on `id`; keep sessions away from it for a while.
   pub fn report_failure(&self, id: ReplicaId, name: &str, now: Instant) {
      warn!(
         replica = %id,
         endpoint = name,
         cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX),
         "Replica failed transiently, avoiding it"
      );
      self.cooldowns.mark(id, now, self.cooldown);
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test(start_paused = true)]
   async fn test_cooldown_expires_by_itself() {
      let cooldowns = Cooldowns::new(2);
      let id = ReplicaId::new(1);

      cooldowns.mark(id, Instant::now(), Duration::from_secs(3));
      assert!(cooldowns.is_cooling_down(id, Instant::now()));
      assert!(!cooldowns.is_cooling_down(ReplicaId::new(0), Instant::now()));

      tokio::time::advance(Duration::from_secs(2)).await;
      assert!(cooldowns.is_cooling_down(id, Instant::now()));

      tokio::time::advance(Duration::from_secs(1)).await;
      assert!(!cooldowns.is_cooling_down(id, Instant::now()));
      assert_eq!(cooldowns.available_after(id, Instant::now()), None);
   }

   #[tokio::test(start_paused = true)]
   async fn test_shorter_mark_does_not_cut_cooldown() {
      let cooldowns = Cooldowns::new(1);
      let id = ReplicaId::new(0);
      let now = Instant::now();

      cooldowns.mark(id, now, Duration::from_secs(10));
      cooldowns.mark(id, now, Duration::from_secs(1));

      assert_eq!(
         cooldowns.available_after(id, now),
         Some(now + Duration::from_secs(10))
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_unbounded_cooldown_never_expires() {
      let handler = FailoverHandler::new(1, Duration::MAX);
      let id = ReplicaId::new(0);

      handler.report_failure(id, "replica-0", Instant::now());

      assert!(handler.cooldowns().is_cooling_down(id, Instant::now()));
      tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
      assert!(handler.cooldowns().is_cooling_down(id, Instant::now()));
   }

   #[test]
   fn test_unknown_replica_is_ignored() {
      let cooldowns = Cooldowns::new(1);
      let now = Instant::now();

      cooldowns.mark(ReplicaId::new(7), now, Duration::from_secs(1));
      assert!(!cooldowns.is_cooling_down(ReplicaId::new(7), now));
   }
}
