//! Helper functions for integration tests

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hostwatch::config::{HostTarget, LinkConfig};
use hostwatch::connection::ConnectionHandle;
use hostwatch::store::MetricsStore;
use hostwatch::transport::AgentEnd;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

pub const AUTH_OK: &str = r#"{"type":"auth","status":"success"}"#;
pub const AUTH_REJECTED: &str = r#"{"type":"auth","error":"Invalid password"}"#;

pub fn create_test_host(id: &str, port: u16) -> HostTarget {
    HostTarget::new(id, "127.0.0.1", port, "s3cret")
}

pub fn create_test_config() -> LinkConfig {
    LinkConfig {
        reconnect_delay_secs: 5,
        ..LinkConfig::default()
    }
}

/// Snapshot payload as sent by the agent
pub fn create_metrics_json(timestamp: i64, cpu_usage: f64) -> Value {
    json!({
        "timestamp": timestamp,
        "cpu": {"usage_percent": cpu_usage, "load_avg_1m": 0.5, "load_avg_5m": 0.4, "load_avg_15m": 0.3, "cores": 4},
        "memory": {"total": 8000, "used": 2000, "free": 6000, "available": 5500, "buffers": 100, "cached": 400},
        "disk": {
            "total": 1000, "used": 400, "free": 600, "percent": 40.0,
            "mountpoint": {"/": {"total": 1000, "used": 400, "free": 600, "percent": 40.0}}
        },
        "processes": {"total": 210, "running": 3},
        "system": {"uptime": 86400, "hostname": "test-host", "kernel": "6.1.0", "architecture": "amd64"},
        "network": {"bytes_sent": 1024, "bytes_received": 2048}
    })
}

pub fn metrics_frame(timestamp: i64, cpu_usage: f64) -> String {
    json!({"type": "metrics", "data": create_metrics_json(timestamp, cpu_usage)}).to_string()
}

/// History response with `(timestamp, cpu, memory, disk)` points
pub fn history_frame(range: &str, points: &[(i64, f64, f64, f64)]) -> String {
    let points: Vec<Value> = points
        .iter()
        .map(|(timestamp, cpu, memory, disk)| {
            json!({"timestamp": timestamp, "cpu": cpu, "memory": memory, "disk": disk})
        })
        .collect();
    json!({"type": "history", "range": range, "points": points}).to_string()
}

pub async fn next_agent(accepted: &mut mpsc::UnboundedReceiver<AgentEnd>) -> AgentEnd {
    tokio::time::timeout(Duration::from_secs(30), accepted.recv())
        .await
        .expect("no connection attempt")
        .expect("connector dropped")
}

/// Next frame written by the connection, parsed as JSON
pub async fn next_frame(agent: &mut AgentEnd) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(30), agent.recv())
        .await
        .expect("no frame from connection")
        .expect("transport closed");
    serde_json::from_str(&frame).unwrap()
}

/// Accept a connection attempt and complete the handshake
pub async fn accept_authenticated(accepted: &mut mpsc::UnboundedReceiver<AgentEnd>) -> AgentEnd {
    let mut agent = next_agent(accepted).await;
    assert_eq!(next_frame(&mut agent).await["type"], "auth");
    agent.send(AUTH_OK);
    agent
}

/// Poll the store until the online flag of `host_id` equals `online`
pub async fn wait_for_online(store: &MetricsStore, host_id: &str, online: bool) {
    for _ in 0..500 {
        if store.is_online(host_id).await == online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{host_id} never became {}", if online { "online" } else { "offline" });
}

/// Poll the store until a snapshot with `timestamp` is stored for `host_id`
pub async fn wait_for_snapshot(store: &MetricsStore, host_id: &str, timestamp: i64) {
    for _ in 0..500 {
        if store
            .get_snapshot(host_id)
            .await
            .is_some_and(|snapshot| snapshot.timestamp == timestamp)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{host_id} never stored snapshot {timestamp}");
}

/// Wait until the connection has scheduled its `attempt`-th reconnect
pub async fn wait_for_attempt(connection: &ConnectionHandle, attempt: u32) {
    let mut status = connection.watch_status();
    tokio::time::timeout(
        Duration::from_secs(30),
        status.wait_for(|status| status.reconnect_attempt == attempt),
    )
    .await
    .expect("reconnect never scheduled")
    .expect("connection actor stopped");
}

/// Agent reachable over a real WebSocket on localhost
pub struct MockAgentServer {
    pub port: u16,
    sockets: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl MockAgentServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, sockets) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(socket) = accept_async(stream).await
                    && tx.send(socket).is_err()
                {
                    break;
                }
            }
        });

        Self { port, sockets }
    }

    pub async fn accept(&mut self) -> WebSocketStream<TcpStream> {
        tokio::time::timeout(Duration::from_secs(10), self.sockets.recv())
            .await
            .expect("no WebSocket connection")
            .expect("server stopped")
    }
}

pub async fn ws_recv(socket: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("no WebSocket message")
            .expect("WebSocket closed")
            .unwrap();

        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

pub async fn ws_send(socket: &mut WebSocketStream<TcpStream>, frame: String) {
    socket.send(Message::Text(frame)).await.unwrap();
}
