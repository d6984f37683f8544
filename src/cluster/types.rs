// Copyright 2020 Joyent, Inc.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use slog::Logger;

use crate::cluster::ClusterConnection;
use crate::connection::{Connection, ConnectionId, PoolName};
use crate::error::Error;
use crate::node::types::{NodeConfig, NodeEvent, NodeStats};
use crate::request::ConnectionRequest;

/// Default time in milliseconds a queued connection request may wait
/// before it is aborted.
pub const DEFAULT_REQUEST_TTL_MS: u64 = 10_000;

/// The configuration options for a cluster. This is required to
/// instantiate a new cluster.
#[derive(Debug, Default)]
pub struct ClusterOptions {
    /// An optional time in milliseconds a queued connection request may
    /// wait before it is aborted. If not specified the default is 10000.
    pub request_ttl: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

// The dispatcher's work items. Everything that touches the queues, the
// idle sets, or the node registry arrives through this protocol and is
// applied serially by the dispatcher thread.
#[doc(hidden)]
pub enum ClusterTask<C: Connection> {
    AddNode {
        config: NodeConfig,
        ack: Sender<Result<(), Error>>,
    },
    Node(NodeEvent<C>),
    Enqueue(ConnectionRequest<ClusterConnection<C>>),
    Release {
        id: ConnectionId,
        conn: Arc<Mutex<C>>,
    },
    Sweep {
        pool: PoolName,
    },
    Stats {
        ack: Sender<Vec<NodeStats>>,
    },
    DescribeTarget {
        ack: Sender<Option<PoolName>>,
    },
    Stop {
        ack: Sender<()>,
    },
}
