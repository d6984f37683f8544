// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use carom::cluster::types::ClusterOptions;
use carom::cluster::Cluster;
use carom::connection::{
    Connection, ConnectionId, ConnectionSignal, QueryContext, QueryMode, QueryOutcome,
};
use carom::error::Error;
use carom::node::types::NodeConfig;

#[derive(Debug)]
pub struct DummyError(String);

impl DummyError {
    fn new(msg: &str) -> Self {
        DummyError(String::from(msg))
    }
}

impl fmt::Display for DummyError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl std::error::Error for DummyError {}

// Shared switches and counters that script the dummy driver's behavior
// from inside a test.
#[derive(Clone, Default)]
struct DriverScript {
    fail_connect: Arc<AtomicBool>,
    fail_probe: Arc<AtomicBool>,
    connect_count: Arc<AtomicUsize>,
    kill_count: Arc<AtomicUsize>,
    signals: Arc<Mutex<Vec<(ConnectionId, Sender<ConnectionSignal>)>>>,
}

impl DriverScript {
    fn connects(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    fn kills(&self) -> usize {
        self.kill_count.load(Ordering::SeqCst)
    }

    // The signal sender of the n-th connection ever constructed.
    fn signal(&self, n: usize) -> (ConnectionId, Sender<ConnectionSignal>) {
        let signals = self.signals.lock().unwrap();
        (signals[n].0, signals[n].1.clone())
    }
}

struct DummyConnection {
    id: ConnectionId,
    script: DriverScript,
    signal: Sender<ConnectionSignal>,
    connected: bool,
    killed: bool,
    in_transaction: bool,
}

fn dummy_factory(
    script: DriverScript,
) -> impl Fn(&NodeConfig, ConnectionId, Sender<ConnectionSignal>) -> DummyConnection + Send + Sync
{
    move |_config, id, signal| {
        script
            .signals
            .lock()
            .unwrap()
            .push((id, signal.clone()));
        DummyConnection {
            id,
            script: script.clone(),
            signal,
            connected: false,
            killed: false,
            in_transaction: false,
        }
    }
}

impl Connection for DummyConnection {
    type Error = DummyError;
    type Row = i64;
    type Description = String;

    fn connect(&mut self) -> Result<(), DummyError> {
        if self.script.fail_connect.load(Ordering::SeqCst) {
            return Err(DummyError::new("connection refused"));
        }
        self.script.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    fn query(&mut self, query: &QueryContext) -> Result<QueryOutcome<i64>, DummyError> {
        if query.sql == "SELECT 1;" && self.script.fail_probe.load(Ordering::SeqCst) {
            return Err(DummyError::new("probe refused"));
        }
        if query.sql.contains("INVALID") {
            return Err(DummyError::new("syntax error"));
        }
        match query.mode {
            QueryMode::Rows => Ok(QueryOutcome::Rows(vec![1])),
            QueryMode::Row => Ok(QueryOutcome::Row(Some(1))),
            QueryMode::Execute => Ok(QueryOutcome::Affected(1)),
        }
    }

    fn create_transaction(&mut self) -> Result<(), DummyError> {
        self.in_transaction = true;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DummyError> {
        self.in_transaction = false;
        Ok(())
    }

    fn describe(&mut self, databases: &[String]) -> Result<String, DummyError> {
        Ok(format!("describe:{}", databases.join(",")))
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.connected = false;
        self.script.kill_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.signal.send(ConnectionSignal::End {
            id: self.id,
            error: None,
        });
    }
}

fn node_config(pools: &[&str], max_connections: u32) -> NodeConfig {
    NodeConfig {
        pools: Some(pools.iter().map(|p| p.to_string()).collect()),
        max_connections: Some(max_connections),
        ..NodeConfig::default()
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn cluster_cold_start() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script.clone()));

    // add_node resolves on the node's first load announcement.
    cluster
        .add_node(node_config(&["read", "write"], 3))
        .expect("add_node");

    wait_for("pool to fill", || {
        cluster.node_stats().unwrap()[0].count == 3
    });

    let stats = cluster.node_stats().unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].count, 3);
    assert_eq!(stats[0].creating_count, 0);
    assert!(!stats[0].throttling);
    assert_eq!(stats[0].throttle_time, 10);
    assert_eq!(script.connects(), 3);
}

#[test]
fn bulk_reads_stay_under_the_cap() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script.clone()));
    cluster
        .add_node(node_config(&["read"], 10))
        .expect("add_node");

    let cluster = Arc::new(cluster);
    let done = Arc::new(AtomicBool::new(false));

    // Sample the counters while the load runs.
    let sampler_cluster = cluster.clone();
    let sampler_done = done.clone();
    let sampler = thread::spawn(move || {
        let mut max_seen = 0;
        while !sampler_done.load(Ordering::SeqCst) {
            for stats in sampler_cluster.node_stats().unwrap() {
                let total = stats.count + stats.creating_count;
                if total > max_seen {
                    max_seen = total;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        max_seen
    });

    let mut workers = Vec::new();
    for _ in 0..16 {
        let cluster = cluster.clone();
        workers.push(thread::spawn(move || {
            let mut ok = 0;
            for _ in 0..64 {
                let query = QueryContext::new("SELECT x FROM t;", QueryMode::Rows, "read");
                if cluster.query(&query).is_ok() {
                    ok += 1;
                }
            }
            ok
        }));
    }

    let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    done.store(true, Ordering::SeqCst);
    let max_seen = sampler.join().unwrap();

    assert_eq!(total, 16 * 64);
    assert!(max_seen <= 10, "saw {} connections", max_seen);
}

#[test]
fn failed_transactions_leave_the_node_usable() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script.clone()));
    cluster
        .add_node(node_config(&["write"], 5))
        .expect("add_node");

    for _ in 0..100 {
        let mut conn = cluster.get_connection("write").expect("claim");
        conn.create_transaction().expect("begin");
        let query = QueryContext::new("INVALID STATEMENT;", QueryMode::Execute, "write");
        let result = conn.query(&query);
        assert!(matches!(result, Err(Error::Query(_))));
        conn.rollback().expect("rollback");
    }

    wait_for("pool to settle", || {
        let stats = cluster.node_stats().unwrap();
        stats[0].count == 5 && stats[0].creating_count == 0
    });

    // Semantic statement errors trigger no recovery; the same
    // connections keep serving.
    assert_eq!(script.kills(), 0);
    let query = QueryContext::new("SELECT 2;", QueryMode::Row, "write");
    assert!(cluster.query(&query).is_ok());
}

#[test]
fn failed_probe_resets_the_node() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script.clone()));
    cluster
        .add_node(node_config(&["read"], 3))
        .expect("add_node");
    wait_for("pool to fill", || {
        cluster.node_stats().unwrap()[0].count == 3
    });

    // Break the probe, then have a connection complain. The node probes
    // its oldest connection, the probe fails, and everything is torn
    // down and rebuilt.
    script.fail_probe.store(true, Ordering::SeqCst);
    let (id, signal) = script.signal(0);
    signal
        .send(ConnectionSignal::ConnectivityProblem { id })
        .expect("signal");

    wait_for("old connections to be killed", || script.kills() >= 3);
    wait_for("pool to refill", || {
        let stats = cluster.node_stats().unwrap();
        stats[0].count == 3 && stats[0].creating_count == 0
    });

    assert!(script.connects() >= 6);

    // Ordinary statements still flow afterwards.
    let query = QueryContext::new("SELECT name FROM t;", QueryMode::Rows, "read");
    assert!(cluster.query(&query).is_ok());
}

#[test]
fn requests_expire_when_nothing_serves_the_pool() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> = Cluster::new(
        ClusterOptions {
            request_ttl: Some(50),
            log: None,
        },
        dummy_factory(script),
    );

    let start = Instant::now();
    let result = cluster.get_connection("read");
    let waited = start.elapsed();

    match result {
        Err(Error::RequestTimeout(ttl)) => assert_eq!(ttl, 50),
        other => panic!("expected RequestTimeout, got {:?}", other.map(|_| ())),
    }
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_secs(5));
}

#[test]
fn add_node_rejects_on_shutdown() {
    let script = DriverScript::default();
    script.fail_connect.store(true, Ordering::SeqCst);
    let cluster: Arc<Cluster<DummyConnection>> = Arc::new(Cluster::new(
        ClusterOptions::default(),
        dummy_factory(script.clone()),
    ));

    // The node can never open a connection, so add_node stays blocked
    // until the cluster goes away.
    let adder_cluster = cluster.clone();
    let adder = thread::spawn(move || adder_cluster.add_node(node_config(&["read"], 2)));

    thread::sleep(Duration::from_millis(100));
    cluster.end().expect("end");

    let result = adder.join().unwrap();
    assert!(matches!(result, Err(Error::Shutdown)));
}

#[test]
fn graceful_shutdown_aborts_pending_requests() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script.clone()));
    cluster
        .add_node(node_config(&["read"], 2))
        .expect("add_node");
    wait_for("pool to fill", || {
        cluster.node_stats().unwrap()[0].count == 2
    });

    let cluster = Arc::new(cluster);

    // Hold both connections so further claims queue up.
    let held1 = cluster.get_connection("read").expect("claim 1");
    let held2 = cluster.get_connection("read").expect("claim 2");

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let cluster = cluster.clone();
        waiters.push(thread::spawn(move || cluster.get_connection("read")));
    }

    // Let the waiters enqueue, then shut everything down.
    thread::sleep(Duration::from_millis(150));
    cluster.end().expect("end");
    assert!(cluster.end().is_ok());

    for waiter in waiters {
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::Shutdown)));
    }
    wait_for("connections to be killed", || script.kills() == 2);

    drop(held1);
    drop(held2);
}

#[test]
fn requests_are_served_in_fifo_order() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script));
    cluster
        .add_node(node_config(&["read"], 1))
        .expect("add_node");
    wait_for("pool to fill", || {
        cluster.node_stats().unwrap()[0].count == 1
    });

    let cluster = Arc::new(cluster);
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = cluster.get_connection("read").expect("claim");

    let first_cluster = cluster.clone();
    let first_order = order.clone();
    let first = thread::spawn(move || {
        let conn = first_cluster.get_connection("read").expect("first claim");
        first_order.lock().unwrap().push("first");
        thread::sleep(Duration::from_millis(50));
        drop(conn);
    });
    thread::sleep(Duration::from_millis(100));

    let second_cluster = cluster.clone();
    let second_order = order.clone();
    let second = thread::spawn(move || {
        let _conn = second_cluster.get_connection("read").expect("second claim");
        second_order.lock().unwrap().push("second");
    });
    thread::sleep(Duration::from_millis(100));

    drop(held);
    first.join().unwrap();
    second.join().unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn ended_connections_are_replenished() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script.clone()));
    cluster
        .add_node(node_config(&["read"], 2))
        .expect("add_node");
    wait_for("pool to fill", || {
        cluster.node_stats().unwrap()[0].count == 2
    });
    assert_eq!(script.connects(), 2);

    // The backend drops a connection; the node notices and replaces it.
    let (id, signal) = script.signal(0);
    signal
        .send(ConnectionSignal::End { id, error: None })
        .expect("signal");

    wait_for("replacement connection", || script.connects() >= 3);
    wait_for("pool back at capacity", || {
        cluster.node_stats().unwrap()[0].count == 2
    });
}

#[test]
fn describe_delegates_to_a_node() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script));
    cluster
        .add_node(node_config(&["read"], 1))
        .expect("add_node");

    let description = cluster
        .describe(&[String::from("accounts"), String::from("billing")])
        .expect("describe");
    assert_eq!(description, "describe:accounts,billing");
}

#[test]
fn describe_with_no_nodes_fails() {
    let script = DriverScript::default();
    let cluster: Cluster<DummyConnection> =
        Cluster::new(ClusterOptions::default(), dummy_factory(script));

    let result = cluster.describe(&[String::from("accounts")]);
    assert!(matches!(result, Err(Error::NoNodes)));
}
