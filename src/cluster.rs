// Copyright 2020 Joyent, Inc.

pub mod types;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use slog::{debug, info, o, warn, Drain, Logger};

use crate::cluster::types::{ClusterOptions, ClusterTask, DEFAULT_REQUEST_TTL_MS};
use crate::connection::{
    Connection, ConnectionId, ConnectionSignal, PoolName, QueryContext, QueryOutcome,
};
use crate::error::Error;
use crate::node::types::{ConnectionFactory, NodeConfig, NodeEvent, NodeId, NodeStats};
use crate::node::Node;
use crate::request::ConnectionRequest;

/// The process-wide facade over a set of database hosts.
///
/// A cluster owns one [`Node`] per added host and a FIFO request queue
/// per pool name. Claiming a connection enqueues a request; whenever any
/// node announces an idle connection tagged with a pool the caller waits
/// on, the dispatcher hands the connection to the oldest live request.
/// Requests that outlive the cluster's request TTL are aborted.
pub struct Cluster<C: Connection> {
    task_tx: Sender<ClusterTask<C>>,
    workers: Mutex<Option<ClusterWorkers>>,
    log: Logger,
}

struct ClusterWorkers {
    dispatcher: thread::JoinHandle<()>,
    forwarder: thread::JoinHandle<()>,
}

impl<C: Connection> Cluster<C> {
    /// Construct a cluster around a driver connection factory. No
    /// network activity happens until a node is added.
    pub fn new<F>(options: ClusterOptions, factory: F) -> Cluster<C>
    where
        F: Fn(&NodeConfig, ConnectionId, Sender<ConnectionSignal>) -> C + Send + Sync + 'static,
    {
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let request_ttl = options.request_ttl.unwrap_or(DEFAULT_REQUEST_TTL_MS);
        let factory: ConnectionFactory<C> = Arc::new(factory);

        let (task_tx, task_rx) = channel();
        let (node_event_tx, node_event_rx) = channel();

        // Fold node events into the dispatcher's task queue.
        let fwd_tx = task_tx.clone();
        let forwarder = thread::spawn(move || {
            for ev in node_event_rx.iter() {
                if fwd_tx.send(ClusterTask::Node(ev)).is_err() {
                    break;
                }
            }
        });

        let dispatcher_log = log.clone();
        let dispatcher_tx = task_tx.clone();
        let dispatcher = thread::spawn(move || {
            Dispatcher::new(request_ttl, factory, node_event_tx, dispatcher_tx, dispatcher_log)
                .run(task_rx)
        });

        Cluster {
            task_tx,
            workers: Mutex::new(Some(ClusterWorkers {
                dispatcher,
                forwarder,
            })),
            log,
        }
    }

    /// Add a database host. Blocks until the node's first connection is
    /// open and it has announced itself ready, or fails if the node or
    /// the cluster ends first.
    pub fn add_node(&self, config: NodeConfig) -> Result<(), Error> {
        let (ack_tx, ack_rx) = channel();
        self.task_tx
            .send(ClusterTask::AddNode {
                config,
                ack: ack_tx,
            })
            .map_err(|_| Error::Shutdown)?;
        ack_rx.recv().map_err(|_| Error::Shutdown)?
    }

    /// Claim a connection from the named pool. The lease is exclusive;
    /// dropping the returned handle gives the connection back.
    pub fn get_connection(&self, pool: &str) -> Result<ClusterConnection<C>, Error> {
        let (tx, rx) = channel();
        let request = ConnectionRequest::new(pool, tx);
        self.task_tx
            .send(ClusterTask::Enqueue(request))
            .map_err(|_| Error::Shutdown)?;
        rx.recv().map_err(|_| Error::Shutdown)?
    }

    /// Claim a connection for `query.pool`, execute the statement,
    /// release the connection, and return the driver's result shape.
    pub fn query(&self, query: &QueryContext) -> Result<QueryOutcome<C::Row>, Error> {
        let mut conn = self.get_connection(&query.pool)?;
        conn.query(query)
    }

    /// Ask any live node to describe the named databases.
    pub fn describe(&self, databases: &[String]) -> Result<C::Description, Error> {
        let (ack_tx, ack_rx) = channel();
        self.task_tx
            .send(ClusterTask::DescribeTarget { ack: ack_tx })
            .map_err(|_| Error::Shutdown)?;
        let pool = ack_rx
            .recv()
            .map_err(|_| Error::Shutdown)?
            .ok_or(Error::NoNodes)?;
        let mut conn = self.get_connection(&pool)?;
        conn.describe(databases)
    }

    /// A stats snapshot for every node in the cluster.
    pub fn node_stats(&self) -> Result<Vec<NodeStats>, Error> {
        let (ack_tx, ack_rx) = channel();
        self.task_tx
            .send(ClusterTask::Stats { ack: ack_tx })
            .map_err(|_| Error::Shutdown)?;
        ack_rx.recv().map_err(|_| Error::Shutdown)
    }

    /// End every node, abort every pending request with
    /// [`Error::Shutdown`], and join the worker threads. Idempotent.
    pub fn end(&self) -> Result<(), Error> {
        let workers = match self.workers.lock().unwrap().take() {
            Some(workers) => workers,
            None => return Ok(()),
        };
        info!(self.log, "ending cluster");
        let (ack_tx, ack_rx) = channel();
        if self
            .task_tx
            .send(ClusterTask::Stop { ack: ack_tx })
            .is_ok()
        {
            let _ = ack_rx.recv();
        }
        let _ = workers.dispatcher.join();
        let _ = workers.forwarder.join();
        Ok(())
    }
}

impl<C: Connection> Drop for Cluster<C> {
    fn drop(&mut self) {
        let _ = self.end();
    }
}

/// An exclusive lease on one connection.
///
/// The statement operations forward to the driver; semantic statement
/// errors surface as [`Error::Query`] and are never retried. Dropping
/// the lease returns the connection to the cluster's idle sets (or
/// discards it, if its node reset or ended in the meantime).
pub struct ClusterConnection<C: Connection> {
    id: ConnectionId,
    node: NodeId,
    pool: PoolName,
    conn: Arc<Mutex<C>>,
    release: Option<Sender<ClusterTask<C>>>,
}

impl<C: Connection> ClusterConnection<C> {
    fn new(
        id: ConnectionId,
        node: NodeId,
        pool: PoolName,
        conn: Arc<Mutex<C>>,
        release: Sender<ClusterTask<C>>,
    ) -> Self {
        ClusterConnection {
            id,
            node,
            pool,
            conn,
            release: Some(release),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The pool this lease was claimed from.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn query(&mut self, query: &QueryContext) -> Result<QueryOutcome<C::Row>, Error> {
        self.conn
            .lock()
            .unwrap()
            .query(query)
            .map_err(|e| Error::Query(Box::new(e)))
    }

    pub fn create_transaction(&mut self) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .create_transaction()
            .map_err(|e| Error::Query(Box::new(e)))
    }

    pub fn rollback(&mut self) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .rollback()
            .map_err(|e| Error::Query(Box::new(e)))
    }

    pub fn describe(&mut self, databases: &[String]) -> Result<C::Description, Error> {
        self.conn
            .lock()
            .unwrap()
            .describe(databases)
            .map_err(|e| Error::Query(Box::new(e)))
    }

    // Reclaim the connection without triggering the drop-time release.
    fn into_inner(mut self) -> Arc<Mutex<C>> {
        self.release = None;
        self.conn.clone()
    }
}

impl<C: Connection> Drop for ClusterConnection<C> {
    fn drop(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(ClusterTask::Release {
                id: self.id,
                conn: self.conn.clone(),
            });
        }
    }
}

// The dispatcher owns every queue, idle set, and node handle. It runs on
// its own thread and applies tasks serially, so none of this state needs
// a lock.
struct Dispatcher<C: Connection> {
    request_ttl: u64,
    factory: ConnectionFactory<C>,
    node_event_tx: Sender<NodeEvent<C>>,
    task_tx: Sender<ClusterTask<C>>,
    nodes: HashMap<NodeId, Node<C>>,
    load_waiters: HashMap<NodeId, Sender<Result<(), Error>>>,
    queues: HashMap<PoolName, VecDeque<ConnectionRequest<ClusterConnection<C>>>>,
    idle: HashMap<ConnectionId, Arc<Mutex<C>>>,
    idle_order: HashMap<PoolName, VecDeque<ConnectionId>>,
    conn_nodes: HashMap<ConnectionId, NodeId>,
    leased: HashSet<ConnectionId>,
    retired: HashSet<ConnectionId>,
    timer: timer::Timer,
    log: Logger,
}

impl<C: Connection> Dispatcher<C> {
    fn new(
        request_ttl: u64,
        factory: ConnectionFactory<C>,
        node_event_tx: Sender<NodeEvent<C>>,
        task_tx: Sender<ClusterTask<C>>,
        log: Logger,
    ) -> Self {
        Dispatcher {
            request_ttl,
            factory,
            node_event_tx,
            task_tx,
            nodes: HashMap::new(),
            load_waiters: HashMap::new(),
            queues: HashMap::new(),
            idle: HashMap::new(),
            idle_order: HashMap::new(),
            conn_nodes: HashMap::new(),
            leased: HashSet::new(),
            retired: HashSet::new(),
            timer: timer::Timer::new(),
            log,
        }
    }

    fn run(mut self, task_rx: Receiver<ClusterTask<C>>) {
        debug!(self.log, "dispatcher started");
        while let Ok(task) = task_rx.recv() {
            match task {
                ClusterTask::AddNode { config, ack } => self.add_node(config, ack),
                ClusterTask::Node(ev) => self.node_event(ev),
                ClusterTask::Enqueue(request) => self.enqueue(request),
                ClusterTask::Release { id, conn } => self.release(id, conn),
                ClusterTask::Sweep { pool } => self.sweep_queue(&pool),
                ClusterTask::Stats { ack } => {
                    let stats: Vec<NodeStats> = self.nodes.values().map(|n| n.stats()).collect();
                    ack.send(stats).ok();
                }
                ClusterTask::DescribeTarget { ack } => {
                    let pool = self
                        .nodes
                        .values()
                        .find(|n| !n.is_ended())
                        .and_then(|n| n.pools().first().cloned());
                    ack.send(pool).ok();
                }
                ClusterTask::Stop { ack } => {
                    self.stop();
                    ack.send(()).ok();
                    break;
                }
            }
        }
        debug!(self.log, "dispatcher exiting");
    }

    // Nodes are constructed here, on the dispatcher thread, so that no
    // node event can arrive ahead of the node's registration.
    fn add_node(&mut self, config: NodeConfig, ack: Sender<Result<(), Error>>) {
        let node = Node::new(
            config,
            self.factory.clone(),
            self.node_event_tx.clone(),
            &self.log,
        );
        info!(
            self.log, "added node";
            "node" => node.id().to_string(),
            "pools" => node.composite_name().to_string()
        );
        self.load_waiters.insert(node.id(), ack);
        self.nodes.insert(node.id(), node);
    }

    fn node_event(&mut self, ev: NodeEvent<C>) {
        match ev {
            NodeEvent::Connected { node, id, conn } => {
                self.conn_nodes.insert(id, node);
                self.dispatch_connection(node, id, conn);
            }
            NodeEvent::ConnectionEnded { node: _, id } => {
                self.conn_nodes.remove(&id);
                if self.idle.remove(&id).is_some() {
                    // Stale ids left in the per-pool orders are skipped
                    // lazily at claim time.
                } else if self.leased.remove(&id) {
                    self.retired.insert(id);
                }
            }
            NodeEvent::Load { node } => {
                if let Some(ack) = self.load_waiters.remove(&node) {
                    ack.send(Ok(())).ok();
                }
            }
            NodeEvent::Ended { node } => {
                if let Some(ack) = self.load_waiters.remove(&node) {
                    ack.send(Err(Error::NodeEnded)).ok();
                }
            }
        }
    }

    // Offer a connection to the queues of every pool its node serves,
    // oldest request first, dropping expired requests along the way. If
    // nobody is waiting the connection is recorded as idle under each of
    // its pools.
    fn dispatch_connection(&mut self, node: NodeId, id: ConnectionId, conn: Arc<Mutex<C>>) {
        let pools: Vec<PoolName> = match self.nodes.get(&node) {
            Some(n) if !n.is_ended() => n.pools().to_vec(),
            _ => return,
        };
        let mut conn = conn;
        for pool in &pools {
            loop {
                let mut request = match self.queues.get_mut(pool).and_then(|q| q.pop_front()) {
                    Some(request) => request,
                    None => break,
                };
                if request.answered() {
                    continue;
                }
                if request.is_expired(self.request_ttl) {
                    debug!(
                        self.log, "dropping expired request";
                        "request" => request.id().to_string()
                    );
                    request.abort(Error::RequestTimeout(self.request_ttl));
                    continue;
                }
                self.leased.insert(id);
                let lease =
                    ClusterConnection::new(id, node, pool.clone(), conn.clone(), self.task_tx.clone());
                match request.execute(lease) {
                    None => return,
                    Some(lease) => {
                        // The requester went away before delivery.
                        self.leased.remove(&id);
                        conn = lease.into_inner();
                    }
                }
            }
        }
        self.idle.insert(id, conn);
        for pool in &pools {
            self.idle_order.entry(pool.clone()).or_default().push_back(id);
        }
    }

    fn enqueue(&mut self, mut request: ConnectionRequest<ClusterConnection<C>>) {
        let pool = request.pool().to_string();
        self.sweep_queue(&pool);

        // Serve from the idle set when possible.
        loop {
            let id = match self.idle_order.get_mut(&pool).and_then(|q| q.pop_front()) {
                Some(id) => id,
                None => break,
            };
            let conn = match self.idle.remove(&id) {
                Some(conn) => conn,
                None => continue,
            };
            let node = match self.conn_nodes.get(&id) {
                Some(node) => *node,
                None => continue,
            };
            self.leased.insert(id);
            let lease = ClusterConnection::new(id, node, pool.clone(), conn, self.task_tx.clone());
            match request.execute(lease) {
                None => return,
                Some(lease) => {
                    // The requester is already gone; put the connection
                    // back where it was.
                    self.leased.remove(&id);
                    self.idle.insert(id, lease.into_inner());
                    self.idle_order
                        .entry(pool.clone())
                        .or_default()
                        .push_front(id);
                    return;
                }
            }
        }

        // No idle connection: park the request and arrange its expiry so
        // it rejects even when no connection traffic occurs.
        debug!(
            self.log, "queued request";
            "pool" => pool.as_str(),
            "request" => request.id().to_string()
        );
        let tx = self.task_tx.clone();
        let sweep_pool = pool.clone();
        self.timer
            .schedule_with_delay(
                chrono::Duration::milliseconds(self.request_ttl as i64 + 5),
                move || {
                    tx.send(ClusterTask::Sweep {
                        pool: sweep_pool.clone(),
                    })
                    .ok();
                },
            )
            .ignore();
        self.queues.entry(pool).or_default().push_back(request);
    }

    fn release(&mut self, id: ConnectionId, conn: Arc<Mutex<C>>) {
        self.leased.remove(&id);
        if self.retired.remove(&id) {
            // Its node reset or ended while the lease was out; the
            // connection has already been killed.
            debug!(self.log, "dropping retired connection"; "conn" => id.to_string());
            return;
        }
        let node = match self.conn_nodes.get(&id) {
            Some(node) => *node,
            None => return,
        };
        self.dispatch_connection(node, id, conn);
    }

    fn sweep_queue(&mut self, pool: &str) {
        let ttl = self.request_ttl;
        let log = self.log.clone();
        if let Some(queue) = self.queues.get_mut(pool) {
            queue.retain_mut(|request| {
                if request.answered() {
                    return false;
                }
                if request.is_expired(ttl) {
                    debug!(
                        log, "aborting expired request";
                        "request" => request.id().to_string()
                    );
                    request.abort(Error::RequestTimeout(ttl));
                    return false;
                }
                true
            });
        }
    }

    fn stop(&mut self) {
        info!(
            self.log, "stopping cluster";
            "nodes" => self.nodes.len(),
            "idle" => self.idle.len()
        );
        let mut aborted = 0;
        for queue in self.queues.values_mut() {
            for request in queue.iter_mut() {
                request.abort(Error::Shutdown);
                aborted += 1;
            }
        }
        self.queues.clear();
        if aborted > 0 {
            warn!(self.log, "aborted pending requests"; "count" => aborted);
        }
        for (_, ack) in self.load_waiters.drain() {
            ack.send(Err(Error::Shutdown)).ok();
        }
        for node in self.nodes.values_mut() {
            node.end();
        }
        self.idle.clear();
        self.idle_order.clear();
        self.leased.clear();
        self.retired.clear();
    }
}
