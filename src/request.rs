// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use derive_more::{Display, From, Into};

use crate::connection::PoolName;
use crate::error::Error;

/// A process-unique identifier for a pending connection request.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct RequestId(u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

/// A pending, one-shot claim on a connection from a named pool.
///
/// Exactly one of [`execute`](ConnectionRequest::execute) and
/// [`abort`](ConnectionRequest::abort) delivers to the requester; once a
/// request is answered every further call is a no-op. The requester
/// holds the receiving half of the channel and blocks on it.
pub struct ConnectionRequest<T> {
    id: RequestId,
    pool: PoolName,
    created: Instant,
    answered: bool,
    tx: Sender<Result<T, Error>>,
}

impl<T> ConnectionRequest<T> {
    pub fn new<P: Into<PoolName>>(pool: P, tx: Sender<Result<T, Error>>) -> Self {
        ConnectionRequest {
            id: next_request_id(),
            pool: pool.into(),
            created: Instant::now(),
            answered: false,
            tx,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn answered(&self) -> bool {
        self.answered
    }

    /// Hand the requester its connection. Returns the value back if the
    /// request was already answered or the requester has gone away, so
    /// the caller can put it back into circulation.
    pub fn execute(&mut self, value: T) -> Option<T> {
        if self.answered {
            return Some(value);
        }
        self.answered = true;
        match self.tx.send(Ok(value)) {
            Ok(()) => None,
            Err(e) => match e.0 {
                Ok(v) => Some(v),
                Err(_) => None,
            },
        }
    }

    /// Reject the requester. A no-op once the request is answered.
    pub fn abort(&mut self, err: Error) {
        if self.answered {
            return;
        }
        self.answered = true;
        let _ = self.tx.send(Err(err));
    }

    /// Whether the request has been waiting longer than `ttl_ms`.
    pub fn is_expired(&self, ttl_ms: u64) -> bool {
        self.created.elapsed() > Duration::from_millis(ttl_ms)
    }
}
