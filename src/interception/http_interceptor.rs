// src/interception/http_interceptor.rs
//! Network interception adapter
//!
//! Wraps the host's request primitive once at startup. Every call goes
//! through unchanged; on completion a `network` payload describing the call
//! is handed to the agent. Calls to the agent's own collector and to ignored
//! hosts are passed through without a report.

use crate::agent::Ingest;
use crate::delivery::batch::ItemKind;
use crate::interception::ignore_list::IgnoreList;
use crate::utils::errors::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::trace;

/// Configuration for network interception
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Produce network payloads
    pub enabled: bool,

    /// Host patterns never reported (`host` or `*.suffix`)
    pub ignore_hosts: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore_hosts: Vec::new(),
        }
    }
}

/// Outgoing request as seen by the host primitive
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl NetworkRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct NetworkResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl NetworkResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The host's own request function
pub trait NetworkPrimitive: Send + Sync {
    fn fetch(&self, request: NetworkRequest) -> BoxFuture<'static, Result<NetworkResponse>>;
}

/// Reporting wrapper around a [`NetworkPrimitive`]
pub struct InterceptingPrimitive<P> {
    inner: P,
    sink: Arc<dyn Ingest>,
    enabled: bool,
    api: Option<Uri>,
    ignore: IgnoreList,
}

impl<P: NetworkPrimitive> InterceptingPrimitive<P> {
    pub fn new(inner: P, sink: Arc<dyn Ingest>, config: &InterceptorConfig, api_url: &str) -> Self {
        Self {
            inner,
            sink,
            enabled: config.enabled,
            api: api_url.parse::<Uri>().ok().filter(|uri| uri.authority().is_some()),
            ignore: IgnoreList::from_patterns(&config.ignore_hosts),
        }
    }

    pub fn ignore_list(&self) -> &IgnoreList {
        &self.ignore
    }

    pub fn into_inner(self) -> P {
        self.inner
    }

    fn should_report(&self, url: &str) -> bool {
        if !self.enabled {
            return false;
        }

        let Ok(uri) = url.parse::<Uri>() else {
            return true;
        };
        if self.is_own_traffic(&uri) {
            return false;
        }

        match uri.host() {
            Some(host) => !self.ignore.matches(host),
            None => true,
        }
    }

    /// Same scheme and authority as the collector, under its base path
    fn is_own_traffic(&self, uri: &Uri) -> bool {
        let Some(api) = &self.api else {
            return false;
        };
        if uri.scheme() != api.scheme() || uri.authority() != api.authority() {
            return false;
        }

        let base = api.path().trim_end_matches('/');
        let path = uri.path();
        base.is_empty()
            || path == base
            || path
                .strip_prefix(base)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl<P: NetworkPrimitive> NetworkPrimitive for InterceptingPrimitive<P> {
    fn fetch(&self, request: NetworkRequest) -> BoxFuture<'static, Result<NetworkResponse>> {
        if !self.should_report(&request.url) {
            trace!("Passing through unreported request to {}", request.url);
            return self.inner.fetch(request);
        }

        let method = request.method.clone();
        let url = request.url.clone();
        let sink = Arc::clone(&self.sink);
        let started = Instant::now();
        let pending = self.inner.fetch(request);

        Box::pin(async move {
            let result = pending.await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let payload = match &result {
                Ok(response) => json!({
                    "method": method,
                    "url": url,
                    "status": response.status,
                    "durationMs": duration_ms,
                    "ok": response.is_success(),
                    "error": Value::Null,
                }),
                Err(e) => json!({
                    "method": method,
                    "url": url,
                    "status": Value::Null,
                    "durationMs": duration_ms,
                    "ok": false,
                    "error": e.to_string(),
                }),
            };

            sink.ingest(ItemKind::Network, payload);
            result
        })
    }
}
