//! Scriptable in-memory endpoints for routing tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use replica_router::{
   Cluster, Endpoint, EndpointError, FailureKind, RouterConfig, SessionState, StateListener,
   WritePosition,
};

/// Everything every endpoint did, in order, as `(endpoint, action)`.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<(String, String)>>>);

impl Journal {
   fn push(&self, endpoint: &str, action: impl Into<String>) {
      self
         .0
         .lock()
         .unwrap()
         .push((endpoint.to_string(), action.into()));
   }

   pub fn entries(&self) -> Vec<(String, String)> {
      self.0.lock().unwrap().clone()
   }

   /// Actions recorded for one endpoint.
   pub fn actions(&self, endpoint: &str) -> Vec<String> {
      self
         .entries()
         .into_iter()
         .filter(|(name, _)| name == endpoint)
         .map(|(_, action)| action)
         .collect()
   }

   /// Endpoints that executed `statement`, in order.
   pub fn executed_on(&self, statement: &str) -> Vec<String> {
      let wanted = format!("execute:{statement}");
      self
         .entries()
         .into_iter()
         .filter(|(_, action)| *action == wanted)
         .map(|(name, _)| name)
         .collect()
   }

   pub fn clear(&self) {
      self.0.lock().unwrap().clear();
   }
}

#[derive(Debug)]
pub struct MockConnection {
   pub id: usize,
}

pub struct MockEndpoint {
   name: String,
   journal: Journal,
   healthy: AtomicBool,
   lag: Mutex<Option<Duration>>,
   position: Mutex<Option<WritePosition>>,
   open_failures: Mutex<VecDeque<FailureKind>>,
   execute_failures: Mutex<VecDeque<FailureKind>>,
   commit_failures: Mutex<VecDeque<FailureKind>>,
   rollback_failures: Mutex<VecDeque<FailureKind>>,
   next_connection: AtomicUsize,
}

impl MockEndpoint {
   pub fn new(name: &str, journal: &Journal) -> Self {
      Self {
         name: name.to_string(),
         journal: journal.clone(),
         healthy: AtomicBool::new(true),
         lag: Mutex::new(None),
         position: Mutex::new(None),
         open_failures: Mutex::new(VecDeque::new()),
         execute_failures: Mutex::new(VecDeque::new()),
         commit_failures: Mutex::new(VecDeque::new()),
         rollback_failures: Mutex::new(VecDeque::new()),
         next_connection: AtomicUsize::new(0),
      }
   }

   pub fn set_healthy(&self, healthy: bool) {
      self.healthy.store(healthy, Ordering::SeqCst);
   }

   pub fn set_lag(&self, lag: Option<Duration>) {
      *self.lag.lock().unwrap() = lag;
   }

   /// On the primary, the write position reported after commits. On a
   /// replica, the position it has applied.
   pub fn set_position(&self, position: Option<u64>) {
      *self.position.lock().unwrap() = position.map(WritePosition::new);
   }

   pub fn fail_next_open(&self, kind: FailureKind) {
      self.open_failures.lock().unwrap().push_back(kind);
   }

   pub fn fail_next_execute(&self, kind: FailureKind) {
      self.execute_failures.lock().unwrap().push_back(kind);
   }

   pub fn fail_next_commit(&self, kind: FailureKind) {
      self.commit_failures.lock().unwrap().push_back(kind);
   }

   pub fn fail_next_rollback(&self, kind: FailureKind) {
      self.rollback_failures.lock().unwrap().push_back(kind);
   }

   pub fn opened(&self) -> usize {
      self.next_connection.load(Ordering::SeqCst)
   }

   fn scripted(queue: &Mutex<VecDeque<FailureKind>>, what: &str) -> Result<(), EndpointError> {
      match queue.lock().unwrap().pop_front() {
         None => Ok(()),
         Some(FailureKind::Transient) => Err(EndpointError::transient(io::Error::new(
            io::ErrorKind::ConnectionReset,
            format!("{what}: connection reset by peer"),
         ))),
         Some(FailureKind::NonTransient) => Err(EndpointError::non_transient(format!(
            "{what}: UNIQUE constraint failed: users.email"
         ))),
      }
   }
}

impl Endpoint for MockEndpoint {
   type Connection = MockConnection;
   type Statement = str;
   type Output = String;

   fn name(&self) -> &str {
      &self.name
   }

   async fn open(&self) -> Result<MockConnection, EndpointError> {
      Self::scripted(&self.open_failures, "open")?;
      let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
      self.journal.push(&self.name, "open");
      Ok(MockConnection { id })
   }

   async fn close(&self, _conn: MockConnection) {
      self.journal.push(&self.name, "close");
   }

   async fn begin(&self, _conn: &mut MockConnection) -> Result<(), EndpointError> {
      self.journal.push(&self.name, "begin");
      Ok(())
   }

   async fn commit(&self, _conn: &mut MockConnection) -> Result<(), EndpointError> {
      Self::scripted(&self.commit_failures, "commit")?;
      self.journal.push(&self.name, "commit");
      Ok(())
   }

   async fn rollback(&self, _conn: &mut MockConnection) -> Result<(), EndpointError> {
      Self::scripted(&self.rollback_failures, "rollback")?;
      self.journal.push(&self.name, "rollback");
      Ok(())
   }

   async fn execute(
      &self,
      _conn: &mut MockConnection,
      statement: &str,
   ) -> Result<String, EndpointError> {
      Self::scripted(&self.execute_failures, "execute")?;
      self.journal.push(&self.name, format!("execute:{statement}"));
      Ok(format!("{}:{statement}", self.name))
   }

   fn is_healthy(&self) -> bool {
      self.healthy.load(Ordering::SeqCst)
   }

   fn lag(&self) -> Option<Duration> {
      *self.lag.lock().unwrap()
   }

   async fn write_position(
      &self,
      _conn: &mut MockConnection,
   ) -> Result<Option<WritePosition>, EndpointError> {
      Ok(*self.position.lock().unwrap())
   }

   fn applied_position(&self) -> Option<WritePosition> {
      *self.position.lock().unwrap()
   }
}

/// Records every state transition it is told about.
#[derive(Default)]
pub struct RecordingListener(Mutex<Vec<(SessionState, SessionState)>>);

impl RecordingListener {
   pub fn transitions(&self) -> Vec<(SessionState, SessionState)> {
      self.0.lock().unwrap().clone()
   }
}

impl StateListener for RecordingListener {
   fn transition(&self, from: SessionState, to: SessionState) {
      self.0.lock().unwrap().push((from, to));
   }
}

pub const FRESHNESS: Duration = Duration::from_millis(100);
pub const COOLDOWN: Duration = Duration::from_secs(5);

pub fn test_config() -> RouterConfig {
   RouterConfig {
      required_freshness: FRESHNESS,
      cooldown: COOLDOWN,
      ..Default::default()
   }
}

pub struct TestCluster {
   pub cluster: Arc<Cluster<MockEndpoint>>,
   pub journal: Journal,
}

impl TestCluster {
   pub fn primary(&self) -> &MockEndpoint {
      self.cluster.primary()
   }

   pub fn replica(&self, index: usize) -> &MockEndpoint {
      &self.cluster.replicas()[index]
   }
}

/// A primary named `primary` and replicas named `replica-0`, `replica-1`, ...
pub fn setup_cluster(replicas: usize) -> TestCluster {
   let journal = Journal::default();
   let cluster = Cluster::builder(MockEndpoint::new("primary", &journal))
      .replicas((0..replicas).map(|i| MockEndpoint::new(&format!("replica-{i}"), &journal)))
      .config(test_config())
      .build();

   TestCluster { cluster, journal }
}
