// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use derive_more::{Display, From, Into};

use crate::connection::{Connection, ConnectionId, ConnectionSignal, PoolName};

/// Default per-node connection cap.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;
/// Default initial throttle backoff in milliseconds.
pub const DEFAULT_THROTTLE_TIME_MS: u64 = 10;
/// Default minimum milliseconds between health probes.
pub const DEFAULT_ERROR_CHECK_INTERVAL_MS: u64 = 30_000;
/// Default health probe deadline in milliseconds.
pub const DEFAULT_ERROR_CHECK_TIMEOUT_MS: u64 = 30_000;

/// The pools a node serves when its configuration names none.
pub fn default_pools() -> Vec<PoolName> {
    vec!["read".into(), "write".into(), "master".into()]
}

/// A process-unique identifier for a node.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct NodeId(u64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_node_id() -> NodeId {
    NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
}

/// The function a cluster uses to construct driver connections. It
/// receives the owning node's configuration, the new connection's id,
/// and the sender the driver uses for out-of-band signals.
pub type ConnectionFactory<C> =
    Arc<dyn Fn(&NodeConfig, ConnectionId, Sender<ConnectionSignal>) -> C + Send + Sync>;

/// The configuration for a single database host. Credential fields are
/// passed through to the driver untouched; the tuning fields fall back
/// to the crate defaults when unset.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    /// The pool names this node serves. Default `read`, `write`,
    /// `master`.
    pub pools: Option<Vec<PoolName>>,
    /// Upper bound on open plus opening connections. Default 50.
    pub max_connections: Option<u32>,
    /// Initial throttle backoff in milliseconds. Default 10.
    pub throttle_time: Option<u64>,
    /// Minimum milliseconds between health probes. Default 30000.
    pub error_check_interval: Option<u64>,
    /// Health probe deadline in milliseconds. Default 30000.
    pub error_check_timeout: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: String::from("localhost"),
            port: 5432,
            user: None,
            pass: None,
            database: None,
            schema: None,
            pools: None,
            max_connections: None,
            throttle_time: None,
            error_check_interval: None,
            error_check_timeout: None,
        }
    }
}

/// A point-in-time snapshot of a node's lifecycle counters.
#[derive(Clone, Copy, Debug)]
pub struct NodeStats {
    /// Open connections.
    pub count: u32,
    /// Connections currently being opened.
    pub creating_count: u32,
    /// Whether creation is in backed-off, one-at-a-time mode.
    pub throttling: bool,
    /// The current throttle backoff in milliseconds.
    pub throttle_time: u64,
    /// Whether the node has ended.
    pub ended: bool,
}

/// Notifications a node sends to its owning cluster.
pub enum NodeEvent<C: Connection> {
    /// A connection opened successfully and is ready for dispatch.
    Connected {
        node: NodeId,
        id: ConnectionId,
        conn: Arc<Mutex<C>>,
    },
    /// A connection is gone; the cluster must drop its references.
    ConnectionEnded { node: NodeId, id: ConnectionId },
    /// Sent once, on the turn after the node's first successful
    /// connection.
    Load { node: NodeId },
    /// Sent once when the node ends.
    Ended { node: NodeId },
}
