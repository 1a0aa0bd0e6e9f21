use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::encoder;
use crate::handlers::PierState;
use crate::notifier::{ConnectOutcome, DisconnectReason, InitialDirective};
use crate::registry::{ConnState, Connection, ConnectionRegistry, PendingItem, PushEvent};

/// How the establishment of a connection ended, reported back to the inbound
/// request handler.
#[derive(Debug)]
pub enum EstablishVerdict {
    /// Stream opened; the handler should return the event-stream response.
    Open,
    /// Backend refused (or was unreachable); respond with this status.
    Refuse(u16),
    /// The client went away while the backend was deciding. Nobody is
    /// listening for the response.
    Gone,
}

#[derive(Debug)]
pub enum DispatchStatus {
    Ok,
    Buffered,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Ok => "ok",
            DispatchStatus::Buffered => "buffered",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid dispatch payload: {0}")]
    Validation(String),
    #[error("unknown or already-closed token")]
    NotFound,
    #[error("stream write failed")]
    Write,
}

/// Drive a pending connection to its outcome. Runs as its own task so that a
/// client disconnect can never cancel the in-flight connect notification —
/// the disconnect is a signal the accept path checks, not a cancellation.
pub async fn establish(
    state: PierState,
    conn: Arc<Connection>,
    verdict: oneshot::Sender<EstablishVerdict>,
) {
    let outcome = state.notifier.notify_connect(&conn.token, &conn.snapshot).await;

    let result = match outcome {
        ConnectOutcome::Accepted { status, initial } => {
            debug!(token = %conn.token, status, "opening stream");
            open_stream(&state, &conn, initial)
        }
        ConnectOutcome::Rejected(status) => {
            refuse(&state, &conn, "rejected");
            EstablishVerdict::Refuse(status)
        }
        ConnectOutcome::TimedOut => {
            refuse(&state, &conn, "backend_timeout");
            EstablishVerdict::Refuse(504)
        }
        ConnectOutcome::Unreachable => {
            refuse(&state, &conn, "backend_unreachable");
            EstablishVerdict::Refuse(503)
        }
    };

    // The handler may itself be gone already; that is fine.
    let _ = verdict.send(result);
}

/// Flip the connection to ready and replay everything the backend pushed
/// while it was pending: the accept payload's own item first, then the
/// buffer in arrival order. Holding the record lock across the whole drain
/// is what keeps late dispatch calls ordered strictly after the buffer.
fn open_stream(
    state: &PierState,
    conn: &Arc<Connection>,
    initial: Option<InitialDirective>,
) -> EstablishVerdict {
    let mut st = conn.lock();

    let client_gone = st.disconnected || st.sender.as_ref().map_or(true, |tx| tx.is_closed());
    if client_gone {
        // The client hung up while the backend was deciding. The backend
        // never saw this connection live, so tear down without notifying.
        teardown_locked(&state.registry, &conn.token, &mut st);
        debug!(token = %conn.token, "client left during the pending window; aborting silently");
        return EstablishVerdict::Gone;
    }

    let Some(sender) = st.sender.clone() else {
        teardown_locked(&state.registry, &conn.token, &mut st);
        return EstablishVerdict::Gone;
    };

    st.ready = true;
    let _ = sender.send(encoder::encode_comment("ok"));

    if let Some(directive) = initial {
        match apply_item(&sender, directive.event.as_ref(), directive.close) {
            ItemOutcome::Continue => {}
            ItemOutcome::CloseRequested => {
                discard_pending(&conn.token, &mut st);
                close_locked(state, conn, &mut st, DisconnectReason::ServerClosed);
                return EstablishVerdict::Open;
            }
            ItemOutcome::WriteFailed => {
                close_locked(state, conn, &mut st, DisconnectReason::Error);
                return EstablishVerdict::Open;
            }
        }
    }

    let pending = std::mem::take(&mut st.buffer);
    let drained = pending.len();
    let mut items = pending.into_iter();
    while let Some(item) = items.next() {
        match apply_item(&sender, item.event.as_ref(), item.close) {
            ItemOutcome::Continue => {}
            ItemOutcome::CloseRequested => {
                let dropped = items.count();
                if dropped > 0 {
                    debug!(token = %conn.token, dropped, "discarding buffered items behind a close");
                }
                close_locked(state, conn, &mut st, DisconnectReason::ServerClosed);
                return EstablishVerdict::Open;
            }
            ItemOutcome::WriteFailed => {
                close_locked(state, conn, &mut st, DisconnectReason::Error);
                return EstablishVerdict::Open;
            }
        }
    }

    if drained > 0 {
        debug!(token = %conn.token, drained, "drained buffered items");
    }

    st.heartbeat = Some(spawn_heartbeat(state.clone(), conn.token.clone()));

    counter!("beach_pier_connections_opened_total", 1);
    gauge!(
        "beach_pier_connections_active",
        state.registry.len() as f64
    );
    info!(token = %conn.token, "stream open");
    EstablishVerdict::Open
}

/// The backend refused the connection (or never answered). Remove the record
/// and discard whatever was buffered; no disconnect notification is sent for
/// a connection that was never live.
fn refuse(state: &PierState, conn: &Connection, reason_label: &'static str) {
    let mut st = conn.lock();
    discard_pending(&conn.token, &mut st);
    teardown_locked(&state.registry, &conn.token, &mut st);
    drop(st);
    counter!("beach_pier_connections_refused_total", 1, "reason" => reason_label);
}

/// Apply one pushed item to an open stream: write the event if there is
/// one, then report whether the item asks for closure. Shared between the
/// direct dispatch path, the drain and the accept decision's own payload.
enum ItemOutcome {
    Continue,
    CloseRequested,
    WriteFailed,
}

fn apply_item(
    sender: &UnboundedSender<Bytes>,
    event: Option<&PushEvent>,
    close: bool,
) -> ItemOutcome {
    if let Some(event) = event {
        if sender
            .send(encoder::encode_event(event.name.as_deref(), &event.data))
            .is_err()
        {
            return ItemOutcome::WriteFailed;
        }
    }
    if close {
        ItemOutcome::CloseRequested
    } else {
        ItemOutcome::Continue
    }
}

/// Push an event into a connection and/or close it, on behalf of the
/// backend. Buffers while the connection is pending; writes directly once it
/// is ready. Synchronous: the whole operation is one critical section on the
/// record.
pub fn dispatch_event(
    state: &PierState,
    token: &str,
    event: Option<PushEvent>,
    close: bool,
) -> Result<DispatchStatus, DispatchError> {
    let Some(conn) = state.registry.get(token) else {
        return Err(DispatchError::NotFound);
    };
    let mut st = conn.lock();

    // The registry lookup can race a concurrent teardown; a record without a
    // sender is already gone.
    let Some(sender) = st.sender.clone() else {
        return Err(DispatchError::NotFound);
    };

    if !st.ready {
        st.buffer.push(PendingItem { event, close });
        debug!(token = %token, buffered = st.buffer.len(), "buffered dispatch for pending connection");
        return Ok(DispatchStatus::Buffered);
    }

    match apply_item(&sender, event.as_ref(), close) {
        ItemOutcome::Continue => Ok(DispatchStatus::Ok),
        ItemOutcome::CloseRequested => {
            close_locked(state, &conn, &mut st, DisconnectReason::ServerClosed);
            Ok(DispatchStatus::Ok)
        }
        ItemOutcome::WriteFailed => {
            warn!(token = %token, "stream write failed; tearing the connection down");
            close_locked(state, &conn, &mut st, DisconnectReason::Error);
            Err(DispatchError::Write)
        }
    }
}

/// One shared teardown for every path that ends a live connection: direct
/// dispatch, drain, write failure and the transport-close signal.
pub(crate) fn close_locked(
    state: &PierState,
    conn: &Connection,
    st: &mut ConnState,
    reason: DisconnectReason,
) {
    let was_ready = st.ready;
    if !teardown_locked(&state.registry, &conn.token, st) {
        return;
    }

    if was_ready {
        counter!("beach_pier_connections_closed_total", 1, "reason" => reason.as_str());
        gauge!(
            "beach_pier_connections_active",
            state.registry.len() as f64
        );
        state
            .notifier
            .notify_disconnect(&conn.token, reason, &conn.snapshot);
        info!(token = %conn.token, reason = reason.as_str(), "stream closed");
    }
}

/// Unregister the record and stop its tasks. Returns false if the record was
/// already torn down, which makes every close path idempotent. Runs under
/// the record lock so removal and timer cancellation are one atomic step.
fn teardown_locked(registry: &ConnectionRegistry, token: &str, st: &mut ConnState) -> bool {
    if st.sender.is_none() && st.disconnected {
        return false;
    }
    st.sender = None;
    st.disconnected = true;
    st.buffer.clear();
    if let Some(handle) = st.heartbeat.take() {
        handle.abort();
    }
    if let Some(handle) = st.watcher.take() {
        handle.abort();
    }
    registry.remove(token);
    true
}

fn discard_pending(token: &str, st: &mut ConnState) {
    if !st.buffer.is_empty() {
        debug!(token = %token, discarded = st.buffer.len(), "discarding buffered items");
        st.buffer.clear();
    }
}

/// Watch for the client dropping the transport. The receiver half of the
/// stream channel is owned by the response body; once it is dropped the
/// sender reports closed. Ready connections get the full close procedure,
/// pending ones are removed silently (the refusal or accept path will
/// short-circuit on `disconnected`).
pub fn spawn_close_watcher(
    state: PierState,
    conn: Arc<Connection>,
    sender: UnboundedSender<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sender.closed().await;
        drop(sender);

        let mut st = conn.lock();
        if st.ready {
            close_locked(&state, &conn, &mut st, DisconnectReason::ClientClosed);
        } else if !st.disconnected {
            teardown_locked(&state.registry, &conn.token, &mut st);
            debug!(token = %conn.token, "client disconnected before the backend decision");
        }
    })
}

/// Periodic keep-alive comment. The timer never tears a connection down —
/// the transport-close signal is the authoritative trigger — so a failed
/// write here is only logged.
fn spawn_heartbeat(state: PierState, token: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.heartbeat_interval);
        // The first tick completes immediately; the stream was just opened.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(conn) = state.registry.get(&token) else {
                break;
            };
            let sender = conn.lock().sender.clone();
            let Some(sender) = sender else {
                break;
            };
            if sender.send(encoder::encode_comment("keep-alive")).is_err() {
                debug!(token = %token, "keep-alive write failed");
            }
        }
    })
}
