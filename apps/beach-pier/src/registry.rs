use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, Uri};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Generate a new connection token
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Immutable copy of the inbound request, captured once at connection start
/// and forwarded verbatim to the backend with every notification.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl RequestSnapshot {
    pub fn capture(uri: &Uri, headers: &HeaderMap) -> Self {
        let url = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| uri.path().to_owned());

        let mut header_map: HashMap<String, String> = HashMap::new();
        for (name, value) in headers {
            // Non-UTF-8 header values cannot be represented in the JSON
            // notification body and are skipped.
            let Ok(value) = value.to_str() else { continue };
            header_map
                .entry(name.as_str().to_owned())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_owned());
        }

        Self {
            url,
            headers: header_map,
        }
    }
}

/// An event pushed by the backend, either directly onto an open stream or as
/// part of the accept decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub data: String,
}

/// A dispatch payload queued while the connection is not yet writable.
#[derive(Debug)]
pub struct PendingItem {
    pub event: Option<PushEvent>,
    pub close: bool,
}

/// Mutable per-connection state. Every read or write goes through the
/// record's mutex so buffer appends and the ready-flip-plus-drain can never
/// interleave for the same token.
pub struct ConnState {
    /// One-way transition to `true` once the backend accepts and the stream
    /// framing has been written.
    pub ready: bool,
    /// One-way transition to `true`; set by the transport-close signal or by
    /// a refused backend decision. Once set, `ready` never becomes `true`.
    pub disconnected: bool,
    /// Dispatch payloads awaiting the drain, in arrival order.
    pub buffer: Vec<PendingItem>,
    /// Sender half of the response body channel. Taken exactly once at
    /// teardown; `None` means the connection is gone.
    pub sender: Option<UnboundedSender<Bytes>>,
    /// Keep-alive task, present iff the connection is ready and registered.
    pub heartbeat: Option<JoinHandle<()>>,
    /// Task watching for the client to drop the transport.
    pub watcher: Option<JoinHandle<()>>,
}

/// One registered connection: immutable identity plus the locked state.
pub struct Connection {
    pub token: String,
    pub snapshot: Arc<RequestSnapshot>,
    state: Mutex<ConnState>,
}

impl Connection {
    pub fn new(token: String, snapshot: RequestSnapshot, sender: UnboundedSender<Bytes>) -> Self {
        Self {
            token,
            snapshot: Arc::new(snapshot),
            state: Mutex::new(ConnState {
                ready: false,
                disconnected: false,
                buffer: Vec::new(),
                sender: Some(sender),
                heartbeat: None,
                watcher: None,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock()
    }
}

/// Sole source of truth for which connections still exist. Entries are
/// removed only by explicit lifecycle transitions, never by timeout or
/// capacity pressure.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, connection: Arc<Connection>) {
        self.connections
            .insert(connection.token.clone(), connection);
    }

    pub fn get(&self, token: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(token)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, token: &str) -> bool {
        self.connections.remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connection(token: &str) -> Arc<Connection> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let snapshot = RequestSnapshot {
            url: "/events".to_string(),
            headers: HashMap::new(),
        };
        Arc::new(Connection::new(token.to_string(), snapshot, tx))
    }

    #[test]
    fn token_generation_is_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36); // UUID v4 format
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let registry = ConnectionRegistry::new();
        registry.put(connection("tok-1"));

        assert!(registry.get("tok-1").is_some());
        assert!(registry.get("tok-2").is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("tok-1"));
        assert!(!registry.remove("tok-1"));
        assert!(registry.get("tok-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn at_most_one_record_per_token() {
        let registry = ConnectionRegistry::new();
        registry.put(connection("tok-1"));
        registry.put(connection("tok-1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_captures_path_query_and_headers() {
        let uri: Uri = "http://pier.local/feed/alerts?cursor=42".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", "acme".parse().unwrap());
        headers.append("accept", "text/event-stream".parse().unwrap());

        let snapshot = RequestSnapshot::capture(&uri, &headers);
        assert_eq!(snapshot.url, "/feed/alerts?cursor=42");
        assert_eq!(snapshot.headers["x-tenant"], "acme");
        assert_eq!(snapshot.headers["accept"], "text/event-stream");
    }

    #[test]
    fn snapshot_joins_repeated_headers() {
        let uri: Uri = "/feed".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.append("x-trace", "a".parse().unwrap());
        headers.append("x-trace", "b".parse().unwrap());

        let snapshot = RequestSnapshot::capture(&uri, &headers);
        assert_eq!(snapshot.headers["x-trace"], "a, b");
    }
}
