// Copyright 2020 Joyent, Inc.

use thiserror::Error;

/// A driver-originated error carried as the source of a wrapping kind.
/// Driver implementations choose their own concrete error types, so the
/// manager boxes them at the boundary.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error kinds surfaced by the cluster connection manager.
///
/// Callers should match on the variant. The rendered messages are for
/// humans and logs and carry no stability guarantee.
#[derive(Debug, Error)]
pub enum Error {
    /// A connection open was refused or failed. Open failures are
    /// normally absorbed by the owning node's throttle-and-retry cycle
    /// and only reach a log or caller once the node has ended.
    #[error("failed to open connection: {0}")]
    OpenFailure(#[source] DriverError),

    /// The driver reported a connectivity problem, or an open failed in
    /// a way that casts doubt on the backend. Recovery is local to the
    /// owning node (a health probe, then possibly a reset); this kind
    /// is informational.
    #[error("connectivity problem")]
    Connectivity,

    /// A health probe missed its deadline. Recovery is a node reset;
    /// this kind is informational.
    #[error("health probe timed out after {0} ms")]
    ProbeTimeout(u64),

    /// A statement failed. Semantic query errors pass through to the
    /// requester unchanged and are never retried.
    #[error("query failed: {0}")]
    Query(#[source] DriverError),

    /// A queued connection request waited longer than the cluster's
    /// request TTL.
    #[error("connection request timed out after {0} ms")]
    RequestTimeout(u64),

    /// The node ended before it became usable.
    #[error("node has ended")]
    NodeEnded,

    /// No node is registered with the cluster.
    #[error("cluster has no nodes")]
    NoNodes,

    /// The cluster is shutting down; everything pending is aborted with
    /// this kind.
    #[error("cluster is shutting down")]
    Shutdown,
}
