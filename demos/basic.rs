// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use slog::{info, o, Drain, Logger};

use carom::cluster::types::ClusterOptions;
use carom::cluster::Cluster;
use carom::connection::{
    Connection, ConnectionId, ConnectionSignal, QueryContext, QueryMode, QueryOutcome,
};
use carom::node::types::NodeConfig;

#[derive(Debug)]
pub struct DemoError(String);

impl fmt::Display for DemoError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl std::error::Error for DemoError {}

// An in-memory stand-in for a real driver: every host accepts
// connections and answers every statement with one row.
struct DemoConnection {
    host: String,
    connected: bool,
    _signal: Sender<ConnectionSignal>,
}

impl Connection for DemoConnection {
    type Error = DemoError;
    type Row = String;
    type Description = String;

    fn connect(&mut self) -> Result<(), DemoError> {
        self.connected = true;
        Ok(())
    }

    fn query(&mut self, query: &QueryContext) -> Result<QueryOutcome<String>, DemoError> {
        let row = format!("{} answered by {}", query.sql, self.host);
        match query.mode {
            QueryMode::Rows => Ok(QueryOutcome::Rows(vec![row])),
            QueryMode::Row => Ok(QueryOutcome::Row(Some(row))),
            QueryMode::Execute => Ok(QueryOutcome::Affected(1)),
        }
    }

    fn create_transaction(&mut self) -> Result<(), DemoError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DemoError> {
        Ok(())
    }

    fn describe(&mut self, databases: &[String]) -> Result<String, DemoError> {
        Ok(format!("{}: {}", self.host, databases.join(",")))
    }

    fn kill(&mut self) {
        self.connected = false;
    }
}

fn demo_connection(
    config: &NodeConfig,
    _id: ConnectionId,
    signal: Sender<ConnectionSignal>,
) -> DemoConnection {
    DemoConnection {
        host: format!("{}:{}", config.host, config.port),
        connected: false,
        _signal: signal,
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let cluster = Cluster::new(
        ClusterOptions {
            request_ttl: Some(1000),
            log: Some(log.clone()),
        },
        demo_connection,
    );

    cluster
        .add_node(NodeConfig {
            host: String::from("10.0.0.1"),
            port: 5432,
            pools: Some(vec![String::from("read"), String::from("write")]),
            max_connections: Some(4),
            ..NodeConfig::default()
        })
        .expect("add primary");

    cluster
        .add_node(NodeConfig {
            host: String::from("10.0.0.2"),
            port: 5432,
            pools: Some(vec![String::from("read")]),
            max_connections: Some(8),
            ..NodeConfig::default()
        })
        .expect("add replica");

    for i in 0..5 {
        let query = QueryContext::new(
            format!("SELECT {} AS n;", i),
            QueryMode::Row,
            "read",
        );
        match cluster.query(&query) {
            Ok(QueryOutcome::Row(Some(row))) => info!(log, "row"; "value" => row),
            Ok(_) => info!(log, "no row"),
            Err(e) => info!(log, "query failed"; "error" => e.to_string()),
        }
    }

    for stats in cluster.node_stats().expect("stats") {
        info!(
            log, "node stats";
            "count" => stats.count,
            "creating" => stats.creating_count,
            "throttling" => stats.throttling
        );
    }

    cluster.end().expect("end");
}
