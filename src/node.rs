// Copyright 2020 Joyent, Inc.

pub mod types;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, error, info, o, warn, Logger};

use crate::connection::{
    next_connection_id, Connection, ConnectionId, ConnectionSignal, PoolName, QueryContext,
    QueryMode,
};
use crate::error::Error;
use crate::node::types::{
    default_pools, next_node_id, ConnectionFactory, NodeConfig, NodeEvent, NodeId, NodeStats,
    DEFAULT_ERROR_CHECK_INTERVAL_MS, DEFAULT_ERROR_CHECK_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_THROTTLE_TIME_MS,
};

// Statement used to decide whether a backend is still alive.
const PROBE_SQL: &str = "SELECT 1;";

/// A single database host and its pool of connections.
///
/// A node eagerly opens its first connection on construction and then
/// keeps the pool filled up to `max_connections`, backing off after any
/// failed open, probing the backend when the driver reports trouble, and
/// rebuilding the pool from scratch when a probe fails. All lifecycle
/// state is owned by a worker thread; the handle only carries the task
/// channel and read-side mirrors of the counters.
pub struct Node<C: Connection> {
    id: NodeId,
    pools: Vec<PoolName>,
    composite_name: String,
    max_connections: u32,
    task_tx: Sender<NodeTask<C>>,
    shared: Arc<NodeShared>,
    worker: Option<thread::JoinHandle<()>>,
    log: Logger,
}

// Cross-thread mirrors of the worker-owned counters.
struct NodeShared {
    count: AtomicU32,
    creating: AtomicU32,
    throttling: AtomicBool,
    throttle_time: AtomicU64,
    ended: AtomicBool,
}

enum NodeTask<C: Connection> {
    Create,
    ThrottledCreate,
    ConnectDone {
        id: ConnectionId,
        epoch: u64,
        result: Result<(), <C as Connection>::Error>,
    },
    Signal(ConnectionSignal),
    ProbeDone {
        epoch: u64,
        result: Result<(), <C as Connection>::Error>,
    },
    ProbeTimeout {
        epoch: u64,
    },
    EmitLoad,
    End,
}

impl<C: Connection> Node<C> {
    /// Construct a node and immediately start filling its pool.
    pub fn new(
        config: NodeConfig,
        factory: ConnectionFactory<C>,
        events: Sender<NodeEvent<C>>,
        log: &Logger,
    ) -> Node<C> {
        let id = next_node_id();
        let pools = config
            .pools
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(default_pools);
        let composite_name = pools.join(",");
        let max_connections = config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let throttle_init = config.throttle_time.unwrap_or(DEFAULT_THROTTLE_TIME_MS);
        let error_check_interval = config
            .error_check_interval
            .unwrap_or(DEFAULT_ERROR_CHECK_INTERVAL_MS);
        let error_check_timeout = config
            .error_check_timeout
            .unwrap_or(DEFAULT_ERROR_CHECK_TIMEOUT_MS);
        let log = log.new(o!("node" => id.to_string(), "pools" => composite_name.clone()));

        let shared = Arc::new(NodeShared {
            count: AtomicU32::new(0),
            creating: AtomicU32::new(0),
            throttling: AtomicBool::new(true),
            throttle_time: AtomicU64::new(throttle_init),
            ended: AtomicBool::new(false),
        });

        let (task_tx, task_rx) = channel();
        let (sig_tx, sig_rx) = channel();

        // Fold driver signals into the worker's task queue.
        let sig_fwd = task_tx.clone();
        thread::spawn(move || {
            for sig in sig_rx.iter() {
                if sig_fwd.send(NodeTask::Signal(sig)).is_err() {
                    break;
                }
            }
        });

        let worker = NodeWorker {
            id,
            pools: pools.clone(),
            config,
            factory,
            events,
            task_tx: task_tx.clone(),
            sig_tx,
            max_connections,
            throttle_init,
            error_check_interval,
            error_check_timeout,
            shared: shared.clone(),
            timer: timer::Timer::new(),
            state: NodeState::new(throttle_init),
            log: log.clone(),
        };
        let handle = thread::spawn(move || worker.run(task_rx));

        // Eagerly start filling the pool.
        task_tx.send(NodeTask::Create).ok();

        Node {
            id,
            pools,
            composite_name,
            max_connections,
            task_tx,
            shared,
            worker: Some(handle),
            log,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn pools(&self) -> &[PoolName] {
        &self.pools
    }

    pub fn composite_name(&self) -> &str {
        &self.composite_name
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Open connections.
    pub fn count(&self) -> u32 {
        self.shared.count.load(Ordering::Relaxed)
    }

    /// Connections currently being opened.
    pub fn creating_count(&self) -> u32 {
        self.shared.creating.load(Ordering::Relaxed)
    }

    /// The share of the node's connection budget currently open, as a
    /// rounded percentage. A node with a smaller budget contributes
    /// proportionally fewer connections to the cluster, which biases
    /// dispatch toward larger nodes without an explicit weight.
    pub fn idle(&self) -> u32 {
        idle_percentage(self.count(), self.max_connections)
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            count: self.count(),
            creating_count: self.creating_count(),
            throttling: self.shared.throttling.load(Ordering::Relaxed),
            throttle_time: self.shared.throttle_time.load(Ordering::Relaxed),
            ended: self.is_ended(),
        }
    }

    /// End the node: kill every connection and stop creating new ones.
    /// Idempotent.
    pub fn end(&mut self) {
        if let Some(worker) = self.worker.take() {
            info!(self.log, "ending node");
            self.task_tx.send(NodeTask::End).ok();
            worker.join().ok();
        }
    }
}

impl<C: Connection> Drop for Node<C> {
    fn drop(&mut self) {
        self.end();
    }
}

fn idle_percentage(count: u32, max_connections: u32) -> u32 {
    if max_connections == 0 {
        return 0;
    }
    ((f64::from(count) / f64::from(max_connections)) * 100.0).round() as u32
}

fn next_throttle_time(throttle_time: u64) -> u64 {
    (throttle_time as f64 * 1.1).ceil() as u64
}

// Tear the connection down on its own thread. The connection lock is
// held for the duration of a statement, so a busy connection would
// otherwise stall the worker until its current query finishes.
fn kill_connection<C: Connection>(conn: Arc<Mutex<C>>) {
    thread::spawn(move || {
        conn.lock().unwrap().kill();
    });
}

struct ConnEntry<C> {
    id: ConnectionId,
    conn: Arc<Mutex<C>>,
}

struct NodeState<C> {
    // Open connections in creation order; the front is the oldest.
    connections: VecDeque<ConnEntry<C>>,
    connecting: HashMap<ConnectionId, Arc<Mutex<C>>>,
    // Bumped by a reset to disown open attempts still in flight.
    epoch: u64,
    throttling: bool,
    throttle_time: u64,
    throttle_pending: bool,
    ended: bool,
    error_checking: bool,
    probe_timed_out: bool,
    probe_epoch: u64,
    probe_guard: Option<timer::Guard>,
    last_error_check: Option<Instant>,
    load_emitted: bool,
}

impl<C> NodeState<C> {
    fn new(throttle_time: u64) -> Self {
        NodeState {
            connections: VecDeque::new(),
            connecting: HashMap::new(),
            epoch: 0,
            throttling: true,
            throttle_time,
            throttle_pending: false,
            ended: false,
            error_checking: false,
            probe_timed_out: false,
            probe_epoch: 0,
            probe_guard: None,
            last_error_check: None,
            load_emitted: false,
        }
    }
}

struct NodeWorker<C: Connection> {
    id: NodeId,
    pools: Vec<PoolName>,
    config: NodeConfig,
    factory: ConnectionFactory<C>,
    events: Sender<NodeEvent<C>>,
    task_tx: Sender<NodeTask<C>>,
    sig_tx: Sender<ConnectionSignal>,
    max_connections: u32,
    throttle_init: u64,
    error_check_interval: u64,
    error_check_timeout: u64,
    shared: Arc<NodeShared>,
    timer: timer::Timer,
    state: NodeState<C>,
    log: Logger,
}

impl<C: Connection> NodeWorker<C> {
    fn run(mut self, task_rx: Receiver<NodeTask<C>>) {
        debug!(self.log, "node worker started");
        while let Ok(task) = task_rx.recv() {
            if self.handle(task) {
                break;
            }
        }
        debug!(self.log, "node worker exiting");
    }

    // Apply one task. Returns true once the node has ended and the
    // worker should exit.
    fn handle(&mut self, task: NodeTask<C>) -> bool {
        let done = match task {
            NodeTask::Create => {
                self.create_connection();
                false
            }
            NodeTask::ThrottledCreate => {
                self.throttled_create();
                false
            }
            NodeTask::ConnectDone { id, epoch, result } => {
                self.connect_done(id, epoch, result);
                false
            }
            NodeTask::Signal(sig) => {
                self.signal(sig);
                false
            }
            NodeTask::ProbeDone { epoch, result } => {
                self.probe_done(epoch, result);
                false
            }
            NodeTask::ProbeTimeout { epoch } => {
                self.probe_timeout(epoch);
                false
            }
            NodeTask::EmitLoad => {
                self.events.send(NodeEvent::Load { node: self.id }).ok();
                false
            }
            NodeTask::End => {
                self.handle_end();
                true
            }
        };
        self.sync_shared();
        done
    }

    fn total(&self) -> u32 {
        self.state.connections.len() as u32 + self.state.connecting.len() as u32
    }

    fn create_connection(&mut self) {
        if self.state.ended {
            return;
        }
        if self.total() >= self.max_connections {
            return;
        }
        if self.state.throttling {
            // One attempt at a time while throttled; a scheduled attempt
            // that has not fired yet counts as the attempt in flight.
            if !self.state.connecting.is_empty() || self.state.throttle_pending {
                return;
            }
            self.state.throttle_time = next_throttle_time(self.state.throttle_time);
            debug!(
                self.log, "throttling connection create";
                "delay_ms" => self.state.throttle_time
            );
            self.state.throttle_pending = true;
            let tx = self.task_tx.clone();
            self.timer
                .schedule_with_delay(
                    chrono::Duration::milliseconds(self.state.throttle_time as i64),
                    move || {
                        tx.send(NodeTask::ThrottledCreate).ok();
                    },
                )
                .ignore();
        } else {
            self.execute_create();
            // Keep filling without waiting on the attempt in flight.
            self.task_tx.send(NodeTask::Create).ok();
        }
    }

    fn throttled_create(&mut self) {
        self.state.throttle_pending = false;
        if self.state.ended || self.total() >= self.max_connections {
            return;
        }
        self.execute_create();
    }

    fn execute_create(&mut self) {
        let id = next_connection_id();
        let conn = (self.factory)(&self.config, id, self.sig_tx.clone());
        let conn = Arc::new(Mutex::new(conn));
        self.state.connecting.insert(id, conn.clone());
        debug!(self.log, "opening connection"; "conn" => id.to_string());

        let epoch = self.state.epoch;
        let tx = self.task_tx.clone();
        thread::spawn(move || {
            let result = conn.lock().unwrap().connect();
            tx.send(NodeTask::ConnectDone { id, epoch, result }).ok();
        });
    }

    fn connect_done(
        &mut self,
        id: ConnectionId,
        epoch: u64,
        result: Result<(), <C as Connection>::Error>,
    ) {
        if epoch != self.state.epoch {
            // Disowned by a reset; the connection was already killed
            // along with the rest of its generation.
            debug!(self.log, "dropping stale connect result"; "conn" => id.to_string());
            return;
        }
        let conn = match self.state.connecting.remove(&id) {
            Some(conn) => conn,
            None => return,
        };
        match result {
            Ok(()) => {
                info!(self.log, "connection open"; "conn" => id.to_string());
                self.state.connections.push_back(ConnEntry {
                    id,
                    conn: conn.clone(),
                });
                self.state.throttling = false;
                self.state.throttle_time = self.throttle_init;
                self.events
                    .send(NodeEvent::Connected {
                        node: self.id,
                        id,
                        conn,
                    })
                    .ok();
                if !self.state.load_emitted {
                    self.state.load_emitted = true;
                    self.task_tx.send(NodeTask::EmitLoad).ok();
                }
                self.task_tx.send(NodeTask::Create).ok();
            }
            Err(e) => {
                self.state.throttling = true;
                if self.state.ended {
                    error!(
                        self.log, "connection open failed after node end";
                        "error" => %Error::OpenFailure(Box::new(e))
                    );
                    return;
                }
                warn!(self.log, "connection open failed"; "error" => %e);
                self.handle_connectivity_problem();
                self.task_tx.send(NodeTask::Create).ok();
            }
        }
    }

    fn signal(&mut self, sig: ConnectionSignal) {
        if self.state.ended {
            return;
        }
        match sig {
            ConnectionSignal::End { id, error } => {
                let pos = match self.state.connections.iter().position(|e| e.id == id) {
                    Some(pos) => pos,
                    None => return,
                };
                match error {
                    Some(err) => {
                        warn!(self.log, "connection ended"; "conn" => id.to_string(), "error" => err)
                    }
                    None => info!(self.log, "connection ended"; "conn" => id.to_string()),
                }
                self.state.connections.remove(pos);
                self.events
                    .send(NodeEvent::ConnectionEnded { node: self.id, id })
                    .ok();
                self.task_tx.send(NodeTask::Create).ok();
            }
            ConnectionSignal::ConnectivityProblem { id } => {
                warn!(
                    self.log, "driver reported a connectivity problem";
                    "conn" => id.to_string(),
                    "error" => %Error::Connectivity
                );
                self.handle_connectivity_problem();
            }
        }
    }

    fn handle_connectivity_problem(&mut self) {
        debug!(self.log, "handling connectivity problem"; "error" => %Error::Connectivity);
        if self.state.ended || self.state.error_checking {
            return;
        }
        if let Some(last) = self.state.last_error_check {
            if last.elapsed() <= Duration::from_millis(self.error_check_interval) {
                return;
            }
        }
        if self.state.connections.is_empty() {
            self.task_tx.send(NodeTask::Create).ok();
            return;
        }

        let (probe_id, conn) = match self.state.connections.front() {
            Some(entry) => (entry.id, entry.conn.clone()),
            None => return,
        };
        self.state.error_checking = true;
        self.state.probe_timed_out = false;
        self.state.last_error_check = Some(Instant::now());
        self.state.probe_epoch += 1;
        let epoch = self.state.probe_epoch;
        info!(self.log, "starting health probe"; "conn" => probe_id.to_string());

        let tx = self.task_tx.clone();
        let guard = self.timer.schedule_with_delay(
            chrono::Duration::milliseconds(self.error_check_timeout as i64),
            move || {
                tx.send(NodeTask::ProbeTimeout { epoch }).ok();
            },
        );
        self.state.probe_guard = Some(guard);

        let probe = QueryContext::new(PROBE_SQL, QueryMode::Row, self.pools[0].clone());
        let tx = self.task_tx.clone();
        thread::spawn(move || {
            let result = conn.lock().unwrap().query(&probe).map(|_| ());
            tx.send(NodeTask::ProbeDone { epoch, result }).ok();
        });
    }

    fn probe_timeout(&mut self, epoch: u64) {
        if epoch != self.state.probe_epoch
            || !self.state.error_checking
            || self.state.probe_timed_out
        {
            return;
        }
        self.state.probe_timed_out = true;
        warn!(
            self.log, "health probe missed its deadline";
            "error" => %Error::ProbeTimeout(self.error_check_timeout)
        );
        self.reset_node();
    }

    fn probe_done(&mut self, epoch: u64, result: Result<(), <C as Connection>::Error>) {
        if epoch != self.state.probe_epoch {
            return;
        }
        self.state.probe_guard.take();
        if self.state.probe_timed_out {
            // The deadline already reset the node; the late result only
            // closes out the probe.
            self.state.probe_timed_out = false;
            self.state.error_checking = false;
            return;
        }
        self.state.error_checking = false;
        match result {
            Ok(()) => debug!(self.log, "health probe succeeded"),
            Err(e) => {
                warn!(self.log, "health probe failed"; "error" => %e);
                self.reset_node();
            }
        }
    }

    // Kill everything and rebuild the pool from scratch.
    fn reset_node(&mut self) {
        info!(
            self.log, "resetting node";
            "open" => self.state.connections.len(),
            "opening" => self.state.connecting.len()
        );
        self.state.epoch += 1;
        for entry in self.state.connections.drain(..) {
            kill_connection(entry.conn);
            self.events
                .send(NodeEvent::ConnectionEnded {
                    node: self.id,
                    id: entry.id,
                })
                .ok();
        }
        for (_, conn) in self.state.connecting.drain() {
            kill_connection(conn);
        }
        self.state.throttling = true;
        self.state.throttle_time = self.throttle_init;
        self.task_tx.send(NodeTask::Create).ok();
    }

    fn handle_end(&mut self) {
        if self.state.ended {
            return;
        }
        self.state.ended = true;
        self.state.epoch += 1;
        info!(self.log, "node ended"; "open" => self.state.connections.len());
        for entry in self.state.connections.drain(..) {
            kill_connection(entry.conn);
            self.events
                .send(NodeEvent::ConnectionEnded {
                    node: self.id,
                    id: entry.id,
                })
                .ok();
        }
        for (_, conn) in self.state.connecting.drain() {
            kill_connection(conn);
        }
        self.state.probe_guard.take();
        self.events.send(NodeEvent::Ended { node: self.id }).ok();
    }

    fn sync_shared(&self) {
        self.shared
            .count
            .store(self.state.connections.len() as u32, Ordering::Relaxed);
        self.shared
            .creating
            .store(self.state.connecting.len() as u32, Ordering::Relaxed);
        self.shared
            .throttling
            .store(self.state.throttling, Ordering::Relaxed);
        self.shared
            .throttle_time
            .store(self.state.throttle_time, Ordering::Relaxed);
        self.shared.ended.store(self.state.ended, Ordering::Relaxed);
    }
}
