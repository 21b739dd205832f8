// src/delivery/transport.rs
//! Network egress
//!
//! Two primitives are exposed to the queue:
//! - `send`: an awaited HTTP POST carrying a bearer token
//! - `send_beacon`: connectionless fire-and-forget, no custom headers,
//!   used for every unload-class trigger

use crate::utils::errors::{AgentError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Egress mode for a flush or immediate send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressMode {
    /// Asynchronous POST, response awaited for logging only
    Normal,

    /// Beacon, no delivery confirmation
    BestEffort,
}

/// Reason a flush fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    SizeThreshold,
    Interval,
    VisibilityHidden,
    Unload,
    Manual,
}

impl FlushTrigger {
    /// Unload-class triggers always use the beacon.
    pub fn egress_mode(self) -> EgressMode {
        match self {
            FlushTrigger::VisibilityHidden | FlushTrigger::Unload => EgressMode::BestEffort,
            FlushTrigger::SizeThreshold | FlushTrigger::Interval | FlushTrigger::Manual => {
                EgressMode::Normal
            }
        }
    }
}

/// Normal-mode request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub body: Bytes,
    pub bearer: Option<String>,
}

/// Network primitives used by the delivery queue
pub trait Transport: Send + Sync {
    /// Build a POST. The request is only guaranteed to go out once the
    /// returned future is polled; it resolves with the response status.
    fn send(&self, request: OutboundRequest) -> BoxFuture<'static, Result<u16>>;

    /// Queue a beacon. Returns `false` when the primitive is unavailable or
    /// rejected the payload.
    fn send_beacon(&self, url: &str, body: Bytes) -> bool;
}

/// Default transport over the hyper legacy client
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: OutboundRequest) -> BoxFuture<'static, Result<u16>> {
        let client = self.client.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let mut builder = Request::builder()
                .method(Method::POST)
                .uri(&request.url)
                .header(CONTENT_TYPE, "application/json");

            if let Some(token) = &request.bearer {
                builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
            }

            let req = builder.body(Full::new(request.body)).map_err(|e| {
                AgentError::Transport(format!("Request build error: {}", e))
            })?;

            let response = tokio::time::timeout(timeout, client.request(req))
                .await
                .map_err(|_| AgentError::Transport(format!("Timed out after {:?}", timeout)))?
                .map_err(|e| AgentError::Transport(format!("Request failed: {}", e)))?;

            let status = response.status();

            // Drain so the connection can be reused
            let _ = response.into_body().collect().await;

            if status.is_success() {
                Ok(status.as_u16())
            } else {
                Err(AgentError::Transport(format!(
                    "Collector responded with {}",
                    status
                )))
            }
        })
    }

    fn send_beacon(&self, url: &str, body: Bytes) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("Beacon unavailable: no runtime");
            return false;
        };

        let req = match Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(Full::new(body))
        {
            Ok(req) => req,
            Err(e) => {
                debug!("Beacon rejected: {}", e);
                return false;
            }
        };

        let client = self.client.clone();
        handle.spawn(async move {
            if let Err(e) = client.request(req).await {
                trace!("Beacon lost: {}", e);
            }
        });

        true
    }
}

/// Request observed by a [`CapturingTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentRequest {
    pub mode: EgressMode,
    pub url: String,
    pub body: Value,
    pub bearer: Option<String>,
}

impl SentRequest {
    pub fn path_is(&self, path: &str) -> bool {
        self.url.ends_with(path)
    }
}

/// In-memory transport that records every send
///
/// Used by host-side tests and dry runs. Normal sends resolve with the
/// configured status; beacons succeed unless disabled.
pub struct CapturingTransport {
    sent: Mutex<Vec<SentRequest>>,
    status: AtomicU16,
    beacon_available: AtomicBool,
}

impl CapturingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            status: AtomicU16::new(200),
            beacon_available: AtomicBool::new(true),
        }
    }

    pub fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn set_beacon_available(&self, available: bool) {
        self.beacon_available.store(available, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<SentRequest> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn count_for(&self, path: &str) -> usize {
        self.sent.lock().iter().filter(|r| r.path_is(path)).count()
    }

    fn record(&self, mode: EgressMode, url: &str, body: &[u8], bearer: Option<String>) {
        let body = serde_json::from_slice(body).unwrap_or(Value::Null);
        self.sent.lock().push(SentRequest {
            mode,
            url: url.to_string(),
            body,
            bearer,
        });
    }
}

impl Default for CapturingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for CapturingTransport {
    fn send(&self, request: OutboundRequest) -> BoxFuture<'static, Result<u16>> {
        self.record(
            EgressMode::Normal,
            &request.url,
            &request.body,
            request.bearer.clone(),
        );

        let status = self.status.load(Ordering::SeqCst);
        Box::pin(async move {
            if (200..300).contains(&status) {
                Ok(status)
            } else {
                Err(AgentError::Transport(format!(
                    "Collector responded with {}",
                    status
                )))
            }
        })
    }

    fn send_beacon(&self, url: &str, body: Bytes) -> bool {
        if !self.beacon_available.load(Ordering::SeqCst) {
            return false;
        }
        self.record(EgressMode::BestEffort, url, &body, None);
        true
    }
}
