// Copyright 2020 Joyent, Inc.

use std::error;
use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::{Display, From, Into};

/// The name of a role tag such as `read` or `write`. A connection
/// request is satisfied only by a connection whose node serves that
/// role. This is a type alias for String.
pub type PoolName = String;

/// A process-unique identifier for a single connection.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// The shape a statement's result should be returned in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryMode {
    /// All matching rows.
    Rows,
    /// The first matching row, if any.
    Row,
    /// No rows, only the affected-row count.
    Execute,
}

/// A statement to execute along with its result shape and the pool it
/// should be routed to.
#[derive(Clone, Debug)]
pub struct QueryContext {
    pub sql: String,
    pub mode: QueryMode,
    pub pool: PoolName,
}

impl QueryContext {
    pub fn new<S, P>(sql: S, mode: QueryMode, pool: P) -> Self
    where
        S: Into<String>,
        P: Into<PoolName>,
    {
        QueryContext {
            sql: sql.into(),
            mode,
            pool: pool.into(),
        }
    }
}

/// The result of a statement, shaped according to the requested
/// [`QueryMode`].
#[derive(Clone, Debug)]
pub enum QueryOutcome<R> {
    Rows(Vec<R>),
    Row(Option<R>),
    Affected(u64),
}

/// Out-of-band notifications a driver sends to the node that owns the
/// connection. The sender half of the signal channel is handed to the
/// driver when the connection is constructed.
#[derive(Clone, Debug)]
pub enum ConnectionSignal {
    /// The connection is gone and will accept no further work. A driver
    /// sends this exactly once per connection.
    End {
        id: ConnectionId,
        error: Option<String>,
    },
    /// The driver suspects the backend is unhealthy. May be sent any
    /// number of times before `End`; the node decides whether to probe.
    ConnectivityProblem { id: ConnectionId },
}

/// The driver contract.
///
/// The `Connection` trait defines the interface a database driver must
/// implement in order to be managed by a [`Cluster`](crate::cluster::Cluster).
/// A connection need not be a bare TCP socket; it can be any logical
/// session to a backend, as long as it can be opened, queried, and torn
/// down through this interface.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by the fallible driver operations. Each
    /// implementation chooses a concrete type appropriate to its
    /// backend; the only constraints are those needed to carry the
    /// error across threads and into a boxed source.
    type Error: error::Error + Send + Sync + 'static;
    /// One row of a result set.
    type Row: Send + 'static;
    /// The driver's schema description shape.
    type Description: Send + 'static;

    /// Open the session to the backend. Rejection here feeds the owning
    /// node's throttle cycle.
    fn connect(&mut self) -> Result<(), Self::Error>;

    /// Execute a statement. A rejection is a statement-level error and
    /// does not by itself mark the connection unhealthy; the driver
    /// signals `ConnectivityProblem` separately when it suspects the
    /// transport.
    fn query(&mut self, query: &QueryContext) -> Result<QueryOutcome<Self::Row>, Self::Error>;

    /// Begin a transaction on this connection.
    fn create_transaction(&mut self) -> Result<(), Self::Error>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<(), Self::Error>;

    /// Describe the named databases.
    fn describe(&mut self, databases: &[String]) -> Result<Self::Description, Self::Error>;

    /// Tear the connection down as soon as possible: immediately when
    /// idle, after the current statement when busy, and honoring an open
    /// transaction. The driver sends `ConnectionSignal::End` once the
    /// teardown completes.
    fn kill(&mut self);
}
