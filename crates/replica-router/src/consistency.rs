//! Read-your-writes bookkeeping for one logical connection
//!
//! The tracker remembers whether the session has written and when, and turns
//! that into a [`ReadConstraint`] the router applies to the next read. It does
//! no I/O and cannot fail.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::endpoint::WritePosition;

/// Write history of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyState {
   pending_write: bool,
   last_write: Option<Instant>,
   write_position: Option<WritePosition>,
   required_freshness: Duration,
}

impl ConsistencyState {
   /// True from a write until the enclosing transaction (or an explicit
   /// commit) ends.
   pub fn has_pending_write(&self) -> bool {
      self.pending_write
   }

   /// When the most recent write became visible to replication.
   pub fn last_write(&self) -> Option<Instant> {
      self.last_write
   }

   /// Primary position right after the most recent committed write, when
   /// the primary reported one.
   pub fn write_position(&self) -> Option<WritePosition> {
      self.write_position
   }

   pub fn required_freshness(&self) -> Duration {
      self.required_freshness
   }
}

/// What the next read may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConstraint {
   /// An uncommitted write is outstanding; only the primary can see it.
   Primary,
   /// A write landed `since_write` ago, inside the freshness window. Replicas
   /// need a freshness proof to serve the read.
   CaughtUp { since_write: Duration },
   /// Any healthy replica will do.
   Unconstrained,
}

impl ReadConstraint {
   /// Elapsed time since the write replicas must have caught up with.
   pub fn since_write(self) -> Option<Duration> {
      match self {
         ReadConstraint::CaughtUp { since_write } => Some(since_write),
         _ => None,
      }
   }

   /// Whether a read under this constraint has to use the primary, given
   /// whether any replica can prove it is fresh enough.
   pub fn requires_primary(self, replica_has_proof: bool) -> bool {
      match self {
         ReadConstraint::Primary => true,
         ReadConstraint::CaughtUp { .. } => !replica_has_proof,
         ReadConstraint::Unconstrained => false,
      }
   }
}

/// The write a replica has to have caught up with before serving a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMark {
   /// Time since the write became visible to replication.
   pub since_write: Duration,
   /// Primary position right after the write, if known.
   pub position: Option<WritePosition>,
}

/// Replication progress a replica reports about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaProgress {
   pub lag: Option<Duration>,
   pub applied: Option<WritePosition>,
}

/// Write stamp and position as they were when the open transaction began.
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
   last_write: Option<Instant>,
   write_position: Option<WritePosition>,
}

/// Tracks writes made through one logical connection.
#[derive(Debug, Clone)]
pub struct ConsistencyTracker {
   state: ConsistencyState,
   // Restored on rollback
   checkpoint: Option<Checkpoint>,
}

impl ConsistencyTracker {
   pub fn new(required_freshness: Duration) -> Self {
      Self {
         state: ConsistencyState {
            pending_write: false,
            last_write: None,
            write_position: None,
            required_freshness,
         },
         checkpoint: None,
      }
   }

   pub fn state(&self) -> &ConsistencyState {
      &self.state
   }

   /// A transaction started; remember what a rollback has to restore.
   pub fn record_transaction_start(&mut self) {
      self.checkpoint = Some(Checkpoint {
         last_write: self.state.last_write,
         write_position: self.state.write_position,
      });
   }

   /// A write completed. Its position is unknown until
   /// [`record_write_position`](Self::record_write_position).
   pub fn record_write(&mut self, now: Instant) {
      self.state.pending_write = true;
      self.state.last_write = Some(now);
      self.state.write_position = None;
   }

   /// The primary's position after the latest committed write. `None` when
   /// it could not be read, so replicas cannot prove freshness by position.
   pub fn record_write_position(&mut self, position: Option<WritePosition>) {
      self.state.write_position = position;
   }

   /// The application wrote through some other path and wants this session
   /// to read its own writes anyway. Survives a rollback of the current
   /// transaction.
   pub fn require_fresh_reads(&mut self, now: Instant) {
      self.record_write(now);
      if let Some(checkpoint) = self.checkpoint.as_mut() {
         checkpoint.last_write = Some(now);
         checkpoint.write_position = None;
      }
   }

   /// The transaction ended.
   ///
   /// A commit makes pending writes visible to replication at `now`, so the
   /// freshness window restarts there. A rollback discards them and puts the
   /// write stamp back where it was before the transaction.
   pub fn record_transaction_end(&mut self, committed: bool, now: Instant) {
      let checkpoint = self.checkpoint.take();
      if committed {
         if self.state.pending_write {
            self.state.last_write = Some(now);
         }
      } else if let Some(before) = checkpoint {
         self.state.last_write = before.last_write;
         self.state.write_position = before.write_position;
      }
      self.state.pending_write = false;
   }

   /// The transaction ended but commit or rollback failed, so its outcome is
   /// unknown. Pending writes stay pending until the next successful commit.
   pub fn record_transaction_unresolved(&mut self) {
      self.checkpoint = None;
   }

   pub fn read_constraint(&self, now: Instant) -> ReadConstraint {
      if self.state.pending_write {
         return ReadConstraint::Primary;
      }
      match self.state.last_write {
         Some(at) => {
            let since_write = now.saturating_duration_since(at);
            if since_write < self.state.required_freshness {
               ReadConstraint::CaughtUp { since_write }
            } else {
               ReadConstraint::Unconstrained
            }
         }
         None => ReadConstraint::Unconstrained,
      }
   }

   /// What a replica must have caught up with to serve the next read, or
   /// `None` outside the freshness window.
   pub fn write_mark(&self, now: Instant) -> Option<WriteMark> {
      self.read_constraint(now).since_write().map(|since_write| WriteMark {
         since_write,
         position: self.state.write_position,
      })
   }

   /// Whether the next read must go to the primary.
   pub fn requires_primary_read(&self, now: Instant, replica_has_proof: bool) -> bool {
      self.read_constraint(now).requires_primary(replica_has_proof)
   }
}

/// Decides whether a replica has provably caught up with a write.
///
/// Only consulted inside the freshness window; outside it every healthy
/// replica is assumed fresh.
pub trait FreshnessPolicy: Send + Sync + fmt::Debug {
   fn is_caught_up(&self, replica: ReplicaProgress, write: WriteMark) -> bool;
}

/// Never trusts a replica inside the freshness window.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumedPropagation;

impl FreshnessPolicy for AssumedPropagation {
   fn is_caught_up(&self, _replica: ReplicaProgress, _write: WriteMark) -> bool {
      false
   }
}

/// Trusts a replica whose reported lag is shorter than the time since the
/// write. Replicas that report nothing are not trusted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportedLag;

impl FreshnessPolicy for ReportedLag {
   fn is_caught_up(&self, replica: ReplicaProgress, write: WriteMark) -> bool {
      replica.lag.is_some_and(|lag| lag < write.since_write)
   }
}

/// Trusts a replica that has applied the primary's position of the write.
/// Nothing is trusted when either position is unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppliedPosition;

impl FreshnessPolicy for AppliedPosition {
   fn is_caught_up(&self, replica: ReplicaProgress, write: WriteMark) -> bool {
      match (replica.applied, write.position) {
         (Some(applied), Some(written)) => applied >= written,
         _ => false,
      }
   }
}
