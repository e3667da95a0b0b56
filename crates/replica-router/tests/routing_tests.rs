//! Routing and read-your-writes behaviour of logical connections.

mod common;

use std::time::Duration;

use common::{FRESHNESS, Journal, MockEndpoint, setup_cluster, test_config};
use replica_router::{
   AppliedPosition, Cluster, Consistency, OperationKind, Reason, ReplicaId, ReportedLag,
   RouteDecision, RoutingTarget, SessionState, WritePosition,
};

// ============================================================================
// Basic Routing
// ============================================================================

#[tokio::test]
async fn test_reads_go_to_first_replica() {
   let test = setup_cluster(2);
   let mut conn = test.cluster.connect();
   assert_eq!(conn.state(), SessionState::Unbound);

   let output = conn.read("SELECT 1").await.unwrap();

   assert_eq!(output, "replica-0:SELECT 1");
   assert_eq!(
      conn.last_decision(),
      Some(RouteDecision::replica(ReplicaId::new(0), Reason::ReadOperation))
   );
   assert_eq!(conn.state(), SessionState::BoundIdle);
   assert_eq!(
      conn.bound_target(),
      Some(RoutingTarget::Replica(ReplicaId::new(0)))
   );
}

#[tokio::test]
async fn test_writes_never_hit_replicas() {
   let test = setup_cluster(2);
   let mut conn = test.cluster.connect();

   for i in 0..3 {
      let statement = format!("INSERT INTO t VALUES ({i})");
      conn.write(&statement).await.unwrap();
      conn.commit().await.unwrap();
      assert_eq!(test.journal.executed_on(&statement), vec!["primary"]);
   }

   assert!(test.replica(0).opened() == 0 && test.replica(1).opened() == 0);
}

#[tokio::test]
async fn test_strong_read_goes_to_primary() {
   let test = setup_cluster(1);
   let mut conn = test.cluster.connect();

   let output = conn
      .execute("SELECT balance", OperationKind::Read, Consistency::Strong)
      .await
      .unwrap();

   assert_eq!(output, "primary:SELECT balance");
   assert_eq!(
      conn.last_decision().unwrap().reason,
      Reason::StrongConsistency
   );
   // A strong read is not a write
   assert!(!conn.consistency().has_pending_write());
}

#[tokio::test]
async fn test_no_replicas_configured_uses_primary() {
   let test = setup_cluster(0);
   let mut conn = test.cluster.connect();

   assert_eq!(conn.read("SELECT 1").await.unwrap(), "primary:SELECT 1");
   assert_eq!(
      conn.last_decision().unwrap(),
      RouteDecision::primary(Reason::NoReplicaAvailable)
   );
}

#[tokio::test]
async fn test_idle_connection_rebinds_between_operations() {
   let test = setup_cluster(1);
   let mut conn = test.cluster.connect();

   conn.read("SELECT 1").await.unwrap();
   conn.write("UPDATE t SET x = 1").await.unwrap();

   assert_eq!(
      test.journal.actions("replica-0"),
      vec!["open", "execute:SELECT 1", "close"]
   );
   assert_eq!(
      test.journal.actions("primary"),
      vec!["open", "execute:UPDATE t SET x = 1"]
   );
   assert_eq!(conn.bound_target(), Some(RoutingTarget::Primary));
}

#[tokio::test]
async fn test_connection_is_reused_while_target_is_unchanged() {
   let test = setup_cluster(1);
   let mut conn = test.cluster.connect();

   conn.read("SELECT 1").await.unwrap();
   conn.read("SELECT 2").await.unwrap();

   assert_eq!(test.replica(0).opened(), 1);
}

// ============================================================================
// Read-Your-Writes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_write_then_read_scenario() {
   let test = setup_cluster(1);
   let mut conn = test.cluster.connect();

   conn.write("INSERT INTO users (name) VALUES ('Alice')")
      .await
      .unwrap();
   assert!(conn.consistency().has_pending_write());

   // Pending write: the read must see it
   assert_eq!(
      conn.read("SELECT name FROM users").await.unwrap(),
      "primary:SELECT name FROM users"
   );
   assert_eq!(conn.last_decision().unwrap().reason, Reason::PendingWrite);

   conn.commit().await.unwrap();
   assert!(!conn.consistency().has_pending_write());

   // Committed, but replicas may not have caught up yet
   conn.read("SELECT name FROM users").await.unwrap();
   assert_eq!(
      conn.last_decision().unwrap(),
      RouteDecision::primary(Reason::ReplicaInconsistent)
   );

   tokio::time::advance(FRESHNESS).await;

   assert_eq!(
      conn.read("SELECT name FROM users").await.unwrap(),
      "replica-0:SELECT name FROM users"
   );
}

#[tokio::test(start_paused = true)]
async fn test_pending_write_outlives_freshness_window() {
   let test = setup_cluster(1);
   let mut conn = test.cluster.connect();

   conn.write("DELETE FROM sessions").await.unwrap();
   tokio::time::advance(FRESHNESS * 10).await;

   conn.read("SELECT count(*) FROM sessions").await.unwrap();
   assert!(conn.last_decision().unwrap().runs_on_primary());
}

#[tokio::test(start_paused = true)]
async fn test_rollback_discards_write_history() {
   let test = setup_cluster(1);
   let mut conn = test.cluster.connect();

   conn.begin_transaction().await.unwrap();
   conn.write("UPDATE accounts SET balance = 0").await.unwrap();
   conn.rollback().await.unwrap();

   assert_eq!(conn.consistency().last_write(), None);
   assert_eq!(
      conn.read("SELECT balance FROM accounts").await.unwrap(),
      "replica-0:SELECT balance FROM accounts"
   );
}

#[tokio::test(start_paused = true)]
async fn test_require_fresh_reads_hint() {
   let test = setup_cluster(1);
   let mut conn = test.cluster.connect();

   conn.require_fresh_reads().unwrap();
   conn.read("SELECT 1").await.unwrap();
   assert_eq!(conn.last_decision().unwrap().reason, Reason::PendingWrite);

   conn.commit().await.unwrap();
   tokio::time::advance(FRESHNESS).await;
   conn.read("SELECT 1").await.unwrap();
   assert!(!conn.last_decision().unwrap().runs_on_primary());
}

#[tokio::test(start_paused = true)]
async fn test_reported_lag_proves_freshness() {
   let journal = Journal::default();
   let lagging = MockEndpoint::new("lagging", &journal);
   let caught_up = MockEndpoint::new("caught-up", &journal);
   caught_up.set_lag(Some(Duration::from_millis(10)));

   let cluster = Cluster::builder(MockEndpoint::new("primary", &journal))
      .replica(lagging)
      .replica(caught_up)
      .config(test_config())
      .freshness(ReportedLag)
      .build();
   let mut conn = cluster.connect();

   conn.write("INSERT INTO t VALUES (1)").await.unwrap();
   conn.commit().await.unwrap();

   // Lag (10ms) is not below the time since the write yet
   tokio::time::advance(Duration::from_millis(5)).await;
   conn.read("SELECT 1").await.unwrap();
   assert!(conn.last_decision().unwrap().runs_on_primary());

   tokio::time::advance(Duration::from_millis(20)).await;
   assert_eq!(conn.read("SELECT 1").await.unwrap(), "caught-up:SELECT 1");
}

#[tokio::test(start_paused = true)]
async fn test_applied_position_proves_freshness() {
   let journal = Journal::default();
   let cluster = Cluster::builder(MockEndpoint::new("primary", &journal))
      .replica(MockEndpoint::new("replica-0", &journal))
      .config(test_config())
      .freshness(AppliedPosition)
      .build();
   let primary = cluster.primary();
   let replica = &cluster.replicas()[0];
   let mut conn = cluster.connect();

   primary.set_position(Some(42));
   replica.set_position(Some(41));
   conn.write("INSERT INTO t VALUES (1)").await.unwrap();
   conn.commit().await.unwrap();
   assert_eq!(
      conn.consistency().write_position(),
      Some(WritePosition::new(42))
   );

   conn.read("SELECT 1").await.unwrap();
   assert_eq!(
      conn.last_decision().unwrap().reason,
      Reason::ReplicaInconsistent
   );

   replica.set_position(Some(42));
   assert_eq!(conn.read("SELECT 2").await.unwrap(), "replica-0:SELECT 2");

   // A committed transaction records the position after its commit
   conn.begin_transaction().await.unwrap();
   conn.write("INSERT INTO t VALUES (2)").await.unwrap();
   primary.set_position(Some(50));
   conn.commit().await.unwrap();
   assert_eq!(
      conn.consistency().write_position(),
      Some(WritePosition::new(50))
   );
   conn.read("SELECT 3").await.unwrap();
   assert!(conn.last_decision().unwrap().runs_on_primary());
}

#[tokio::test]
async fn test_connections_track_writes_independently() {
   let test = setup_cluster(1);
   let mut writer = test.cluster.connect();
   let mut reader = test.cluster.connect();

   writer.write("INSERT INTO t VALUES (1)").await.unwrap();

   assert_eq!(reader.read("SELECT 1").await.unwrap(), "replica-0:SELECT 1");
   assert_eq!(writer.read("SELECT 1").await.unwrap(), "primary:SELECT 1");
}

#[tokio::test]
async fn test_connections_run_concurrently() {
   let test = setup_cluster(2);

   let handles: Vec<_> = (0..8)
      .map(|i| {
         let cluster = test.cluster.clone();
         tokio::spawn(async move {
            let mut conn = cluster.connect();
            let statement = format!("INSERT INTO t VALUES ({i})");
            conn.write(&statement).await.unwrap();
            let read = conn.read("SELECT 1").await.unwrap();
            conn.close().await.unwrap();
            read
         })
      })
      .collect();

   for handle in handles {
      assert_eq!(handle.await.unwrap(), "primary:SELECT 1");
   }
}
