use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::registry::{PushEvent, RequestSnapshot};

/// Why a live connection was torn down; forwarded to the backend in the
/// disconnect notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    ServerClosed,
    Error,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::ServerClosed => "server_closed",
            DisconnectReason::Error => "error",
        }
    }
}

/// Optional payload the backend may attach to a 2xx connect response. Applied
/// to the stream ahead of anything buffered during the connect call.
#[derive(Debug, Default, Deserialize)]
pub struct InitialDirective {
    #[serde(default)]
    pub event: Option<PushEvent>,
    #[serde(default)]
    pub close: bool,
}

/// Result of the connect notification. All four variants are expected,
/// handled outcomes, not errors.
#[derive(Debug)]
pub enum ConnectOutcome {
    Accepted {
        status: u16,
        initial: Option<InitialDirective>,
    },
    Rejected(u16),
    TimedOut,
    Unreachable,
}

#[derive(Serialize)]
struct BackendNotice<'a> {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    token: &'a str,
    request: &'a RequestSnapshot,
}

/// Best-effort HTTP client for the backend notification calls. Never
/// retries; the connect call is the only one whose outcome anyone waits for.
#[derive(Clone)]
pub struct BackendNotifier {
    client: reqwest::Client,
    target: String,
    connect_timeout: Duration,
}

impl BackendNotifier {
    pub fn new(client: reqwest::Client, target: String, connect_timeout: Duration) -> Self {
        Self {
            client,
            target,
            connect_timeout,
        }
    }

    /// Tell the backend a client wants to connect and wait (bounded) for its
    /// decision. A 2xx is an accept and may carry an initial directive; any
    /// other status is a reject carrying that status.
    pub async fn notify_connect(&self, token: &str, request: &RequestSnapshot) -> ConnectOutcome {
        let notice = BackendNotice {
            action: "connect",
            reason: None,
            token,
            request,
        };
        let send = self.client.post(&self.target).json(&notice).send();

        let response = match timeout(self.connect_timeout, send).await {
            Err(_) => {
                warn!(token = %token, "connect notification timed out");
                return ConnectOutcome::TimedOut;
            }
            Ok(Err(err)) if err.is_timeout() => {
                warn!(token = %token, "connect notification timed out");
                return ConnectOutcome::TimedOut;
            }
            Ok(Err(err)) => {
                warn!(token = %token, error = %err, "backend unreachable for connect notification");
                return ConnectOutcome::Unreachable;
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            // An empty or non-JSON body simply means no initial directive.
            let initial = response.json::<InitialDirective>().await.ok();
            debug!(token = %token, status = status.as_u16(), "backend accepted connection");
            ConnectOutcome::Accepted {
                status: status.as_u16(),
                initial,
            }
        } else {
            debug!(token = %token, status = status.as_u16(), "backend rejected connection");
            ConnectOutcome::Rejected(status.as_u16())
        }
    }

    /// Fire-and-forget disconnect notification. Failures are logged and
    /// swallowed; nothing upstream ever observes them.
    pub fn notify_disconnect(
        &self,
        token: &str,
        reason: DisconnectReason,
        request: &Arc<RequestSnapshot>,
    ) {
        let client = self.client.clone();
        let target = self.target.clone();
        let token = token.to_owned();
        let request = Arc::clone(request);
        tokio::spawn(async move {
            let notice = BackendNotice {
                action: "disconnect",
                reason: Some(reason.as_str()),
                token: &token,
                request: &request,
            };
            match client.post(&target).json(&notice).send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(
                        token = %token,
                        status = response.status().as_u16(),
                        "backend returned an error for disconnect notification"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(token = %token, error = %err, "failed to deliver disconnect notification");
                }
            }
        });
    }
}
