//! The dispatcher: admission, replica selection, throttling, and the
//! reverse-proxy forward itself.
//!
//! Per-request flow: extract the tenant group key → acquire a group slot →
//! round-robin a replica → wait on its rate gate → round-robin a node →
//! forward → inspect the response for an overload signal → stream the
//! response back. The group slot is an RAII permit, so it is returned on
//! every exit path, including the client hanging up mid-stream.

use crate::cluster::{Cluster, Node, Replica};
use crate::config::Config;
use crate::error::{GatewayError, StartupError};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::BytesMut;
use dashmap::DashMap;
use futures::StreamExt;
use shardgate_admission::{AdmissionPermit, GroupLimiter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

#[cfg(feature = "metrics")]
use metrics::counter;

/// Upper bound on how much of an upstream body is buffered when checking
/// for the slow-down phrase. Bodies past this are truncated; the phrase is
/// only matched against the prefix.
const MAX_INSPECT_BODY: usize = 1024 * 1024;

/// Headers that describe the connection rather than the message; a proxy
/// must not forward them because the transport re-frames each hop.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Process-wide dispatcher state shared by every in-flight request.
#[derive(Debug)]
pub struct Gateway {
    /// The grouping header, lowercased for lookups.
    header_name: HeaderName,
    /// The grouping header as configured, for diagnostics.
    header_label: String,
    max_concurrent: usize,
    max_queue: usize,
    queue_timeout: Duration,
    slowdown_code: Option<StatusCode>,
    slowdown_error: Option<String>,
    user_agent: Option<HeaderValue>,
    cluster: Cluster,
    groups: DashMap<String, Arc<GroupLimiter>>,
    client: reqwest::Client,
}

impl Gateway {
    /// Builds the dispatcher from a validated configuration.
    pub fn new(config: &Config) -> Result<Self, StartupError> {
        let cluster = Cluster::from_config(config)?;

        let header_name = HeaderName::from_bytes(config.header_name.as_bytes()).map_err(|_| {
            StartupError::InvalidHeaderName {
                name: config.header_name.clone(),
            }
        })?;

        let slowdown_code = if config.slowdown_code > 0 {
            Some(StatusCode::from_u16(config.slowdown_code).map_err(|_| {
                StartupError::InvalidSlowdownCode {
                    code: config.slowdown_code,
                }
            })?)
        } else {
            None
        };

        let user_agent = if config.user_agent.is_empty() {
            None
        } else {
            Some(HeaderValue::from_str(&config.user_agent).map_err(|_| {
                StartupError::InvalidUserAgent {
                    value: config.user_agent.clone(),
                }
            })?)
        };

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.proxy_timeout)
            // Upstream redirects belong to the client, not the proxy.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(StartupError::HttpClient)?;

        Ok(Self {
            header_name,
            header_label: config.header_name.clone(),
            max_concurrent: config.effective_max_concurrent(),
            max_queue: config.effective_max_queue(),
            queue_timeout: config.queue_timeout,
            slowdown_code,
            slowdown_error: (!config.slowdown_error.is_empty())
                .then(|| config.slowdown_error.clone()),
            user_agent,
            cluster,
            groups: DashMap::new(),
            client,
        })
    }

    /// The replica registry, mainly for tests and startup logging.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    async fn handle(&self, req: Request) -> Result<Response, GatewayError> {
        let started = Instant::now();

        let group = match req
            .headers()
            .get(&self.header_name)
            .and_then(|value| value.to_str().ok())
        {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => {
                tracing::debug!(header = %self.header_label, "rejecting request without grouping header");
                return Err(GatewayError::MissingGroupKey(self.header_label.clone()));
            }
        };

        #[cfg(feature = "metrics")]
        counter!("gateway_requests_total", "group" => group.clone()).increment(1);

        let limiter = self.group_limiter(&group);
        let permit = limiter.acquire().await?;

        let replica = self.cluster.next_replica().ok_or(GatewayError::NoReplicas)?;
        replica.wait().await;
        let node = replica.next_node();

        tracing::debug!(
            group = %group,
            replica = %replica.name(),
            node = %node.address(),
            "forwarding request"
        );

        let response = self.forward(req, &group, &replica, &node, permit).await?;

        tracing::debug!(
            group = %group,
            node = %node.address(),
            status = response.status().as_u16(),
            elapsed = ?started.elapsed(),
            "request complete"
        );
        Ok(response)
    }

    /// Looks up the tenant's limiter, creating it on first use.
    ///
    /// Steady-state hits take the read path; creation goes through the map
    /// entry so concurrent first requests for one tenant all end up sharing
    /// the single instance that won.
    fn group_limiter(&self, group: &str) -> Arc<GroupLimiter> {
        if let Some(existing) = self.groups.get(group) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.groups
                .entry(group.to_string())
                .or_insert_with(|| Arc::new(self.build_group_limiter(group)))
                .value(),
        )
    }

    fn build_group_limiter(&self, group: &str) -> GroupLimiter {
        let rejected_group = group.to_string();
        let timed_out_group = group.to_string();
        GroupLimiter::builder()
            .max_concurrent(self.max_concurrent)
            .max_queue(self.max_queue)
            .queue_timeout(self.queue_timeout)
            .name(group)
            .on_queue_rejected(move |max_queue| {
                tracing::warn!(group = %rejected_group, max_queue, "queue full, rejecting request");
            })
            .on_queue_timed_out(move |waited| {
                tracing::warn!(group = %timed_out_group, ?waited, "gave up waiting for a slot");
            })
            .build()
    }

    async fn forward(
        &self,
        req: Request,
        group: &str,
        replica: &Arc<Replica>,
        node: &Arc<Node>,
        permit: AdmissionPermit,
    ) -> Result<Response, GatewayError> {
        let (parts, body) = req.into_parts();

        let mut url = node.url().clone();
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());

        // Whether the inbound request carries a body worth streaming.
        let wants_body = parts.headers.contains_key(header::TRANSFER_ENCODING)
            || parts
                .headers
                .get(header::CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .is_some_and(|len| len > 0);

        let mut headers = parts.headers;
        headers.remove(&self.header_name);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        strip_hop_by_hop(&mut headers);
        if let Some(agent) = &self.user_agent {
            headers.insert(header::USER_AGENT, agent.clone());
        }

        let mut outbound = self.client.request(parts.method, url).headers(headers);
        if wants_body {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outbound
            .send()
            .await
            .map_err(|err| self.map_upstream_error(group, node, err))?;

        let status = upstream.status();
        if self.slowdown_code.is_some_and(|code| status == code) {
            replica.slow_down();
            return Ok(stream_response(upstream, permit));
        }

        if let Some(phrase) = &self.slowdown_error {
            if status.as_u16() >= 500 {
                return Ok(self
                    .inspect_and_respond(upstream, group, replica, node, phrase, permit)
                    .await);
            }
        }

        Ok(stream_response(upstream, permit))
    }

    /// Buffers up to [`MAX_INSPECT_BODY`] of the upstream body, triggers
    /// slow-down when the configured phrase appears in the captured prefix,
    /// and forwards the captured bytes to the client either way.
    async fn inspect_and_respond(
        &self,
        upstream: reqwest::Response,
        group: &str,
        replica: &Arc<Replica>,
        node: &Arc<Node>,
        phrase: &str,
        permit: AdmissionPermit,
    ) -> Response {
        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut captured = BytesMut::new();
        let mut read_failed = false;
        let mut stream = upstream.bytes_stream();
        while captured.len() < MAX_INSPECT_BODY {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    let room = MAX_INSPECT_BODY - captured.len();
                    captured.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                Some(Err(err)) => {
                    tracing::warn!(
                        group = %group,
                        node = %node.address(),
                        error = %err,
                        "failed to read upstream body for slow-down inspection"
                    );
                    read_failed = true;
                    break;
                }
                None => break,
            }
        }
        // Anything past the cap is discarded with the stream.
        drop(stream);

        let body = captured.freeze();
        if !read_failed && contains_phrase(&body, phrase.as_bytes()) {
            replica.slow_down();
        }

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        drop(permit);
        response
    }

    fn map_upstream_error(
        &self,
        group: &str,
        node: &Arc<Node>,
        err: reqwest::Error,
    ) -> GatewayError {
        let target = node.address().to_string();
        if err.is_timeout() {
            tracing::warn!(group = %group, node = %target, "upstream request timed out");
            GatewayError::UpstreamTimeout {
                node: target,
                source: err,
            }
        } else if err.is_body() {
            tracing::debug!(group = %group, node = %target, "client went away while forwarding");
            GatewayError::ClientGone {
                node: target,
                source: err,
            }
        } else {
            tracing::warn!(group = %group, node = %target, error = %err, "upstream transport error");
            GatewayError::UpstreamTransport {
                node: target,
                source: err,
            }
        }
    }
}

/// Forwards an upstream response without buffering. The admission permit
/// rides inside the body stream so the tenant's slot stays held until the
/// response finishes (or the client goes away and the stream is dropped).
fn stream_response(upstream: reqwest::Response, permit: AdmissionPermit) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let body_stream = upstream.bytes_stream().map(move |chunk| {
        let _ = &permit;
        chunk
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn contains_phrase(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Builds the proxy router: every method on every path goes through
/// [`dispatch`], with request tracing layered on top.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn dispatch(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    match gateway.handle(req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn gateway(yaml: &str) -> Gateway {
        let mut config = Config::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        Gateway::new(&config).unwrap()
    }

    #[test]
    fn builds_from_a_valid_config() {
        let gateway = gateway(
            r#"
listen_addr: ":8080"
header_name: "X-Tenant"
replicas: [{name: r1}]
nodes: [{replica: r1, address: "a:9000"}]
"#,
        );
        assert_eq!(gateway.cluster().replicas().len(), 1);
        assert_eq!(gateway.header_label, "X-Tenant");
        assert_eq!(gateway.max_concurrent, 1);
    }

    #[test]
    fn group_limiters_are_created_once_per_tenant() {
        let gateway = gateway(
            r#"
listen_addr: ":8080"
header_name: "X-Tenant"
max_concurrent: 2
replicas: [{name: r1}]
nodes: [{replica: r1, address: "a:9000"}]
"#,
        );

        let first = gateway.group_limiter("a");
        let again = gateway.group_limiter("a");
        let other = gateway.group_limiter("b");

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.max_concurrent(), 2);
    }

    #[test]
    fn rejects_an_invalid_slowdown_code() {
        let mut config = Config::from_yaml(
            r#"
listen_addr: ":8080"
header_name: "X-Tenant"
slowdown_code: 42
replicas: [{name: r1}]
nodes: [{replica: r1, address: "a:9000"}]
"#,
        )
        .unwrap();
        config.validate().unwrap();
        let err = Gateway::new(&config).unwrap_err();
        assert!(matches!(err, StartupError::InvalidSlowdownCode { code: 42 }));
    }

    #[test]
    fn phrase_matching_is_a_plain_substring_search() {
        assert!(contains_phrase(b"Code: 202. Too many simultaneous queries for user", b"Too many simultaneous queries"));
        assert!(!contains_phrase(b"all good", b"Too many"));
        assert!(contains_phrase(b"anything", b""));
        assert!(!contains_phrase(b"a", b"ab"));
    }
}
