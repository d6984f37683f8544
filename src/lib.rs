// Copyright 2020 Joyent, Inc.

//! A database cluster connection manager
//!
//! Carom fronts one or more database hosts ("nodes"), maintains a pool
//! of live connections per node segregated by role ("read", "write",
//! ...), dispatches incoming connection requests to an appropriate idle
//! connection, and transparently recovers from host failures by tearing
//! down and rebuilding per-node pools. It manages connections; the
//! connections themselves come from a pluggable driver.
//!
//! ## Nodes and pools
//!
//! A [`Node`](node/struct.Node.html) is a per-host state machine. It
//! eagerly opens its first connection, then keeps its pool filled up to
//! `max_connections`. A failed open puts the node into a throttled mode
//! where a single attempt at a time is retried under a growing backoff;
//! any success resets the backoff and resumes concurrent filling. When
//! the driver reports a connectivity problem the node probes its oldest
//! connection with a trivial statement; a failed or timed-out probe
//! kills every connection on the node and rebuilds the pool from
//! scratch.
//!
//! Every node serves a set of pool names such as `read` and `write`. A
//! connection request names one pool and is satisfied by any connection
//! whose node serves that pool. Because a node with a smaller connection
//! budget surfaces proportionally fewer idle connections, traffic biases
//! toward larger nodes without any explicit weighting.
//!
//! ## Connections
//!
//! A *connection* is not necessarily a bare TCP socket. It can be
//! anything that provides a logical session to a database, as long as it
//! implements the [`Connection`](connection/trait.Connection.html)
//! trait: open, execute statements, begin and roll back transactions,
//! and tear down. The driver signals its node out-of-band over a typed
//! channel when a connection ends or looks unhealthy.
//!
//! Users hand the cluster a factory with the shape
//! ```rust,ignore
//! Fn(&NodeConfig, ConnectionId, Sender<ConnectionSignal>) -> C + Send + Sync
//! where C: Connection
//! ```
//! which captures whatever application-level configuration is needed to
//! construct (but not yet open) a connection to a host.
//!
//! ## Dispatch
//!
//! The [`Cluster`](cluster/struct.Cluster.html) owns a FIFO queue of
//! pending requests per pool name. Whenever a connection opens or a
//! lease is returned, the oldest live request on any pool the supplying
//! node serves receives the connection; requests that wait longer than
//! the cluster's request TTL are aborted. With nobody waiting, the
//! connection parks in a per-pool idle set.
//!
//! ## Example
//!
//! ```rust,ignore
//! use carom::cluster::types::ClusterOptions;
//! use carom::cluster::Cluster;
//! use carom::connection::{QueryContext, QueryMode};
//! use carom::node::types::NodeConfig;
//!
//! let cluster = Cluster::new(ClusterOptions::default(), my_driver_factory);
//!
//! cluster.add_node(NodeConfig {
//!     host: "10.0.0.1".into(),
//!     pools: Some(vec!["read".into(), "write".into()]),
//!     max_connections: Some(16),
//!     ..NodeConfig::default()
//! })?;
//!
//! let rows = cluster.query(&QueryContext::new(
//!     "SELECT name FROM users;",
//!     QueryMode::Rows,
//!     "read",
//! ))?;
//! ```

#![allow(missing_docs)]

pub mod cluster;
pub mod connection;
pub mod error;
pub mod node;
pub mod request;
