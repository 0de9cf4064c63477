//! Error types for the dispatcher and process startup.

use crate::cluster::ClusterError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shardgate_admission::AdmissionError;

/// Non-standard status nginx popularized for "client closed the request".
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Errors constructing the gateway at startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("invalid header_name {name:?}")]
    InvalidHeaderName { name: String },
    #[error("invalid slowdown_code {code}")]
    InvalidSlowdownCode { code: u16 },
    #[error("invalid user_agent {value:?}")]
    InvalidUserAgent { value: String },
    #[error("failed to build the upstream HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// Everything that can end a request with a proxy-emitted status.
///
/// The dispatcher recovers all of these locally: each maps to exactly one
/// status code and one log line, and nothing is retried or escalated.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The grouping header is absent or empty. The 400 body names the
    /// header so callers can fix their client.
    #[error("Missing header: {0}")]
    MissingGroupKey(String),
    /// Admission control turned the request away.
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    /// The replica list was empty at dispatch time. Construction forbids
    /// this; the branch is defensive.
    #[error("no available backend replicas")]
    NoReplicas,
    /// The backend did not answer within the proxy timeout.
    #[error("upstream {node} timed out")]
    UpstreamTimeout {
        node: String,
        #[source]
        source: reqwest::Error,
    },
    /// The client went away while its request was being forwarded.
    #[error("client closed request while forwarding to {node}")]
    ClientGone {
        node: String,
        #[source]
        source: reqwest::Error,
    },
    /// Any other transport failure talking to the backend.
    #[error("upstream {node} transport error")]
    UpstreamTransport {
        node: String,
        #[source]
        source: reqwest::Error,
    },
}

impl GatewayError {
    /// The status code this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingGroupKey(_) => StatusCode::BAD_REQUEST,
            Self::Admission(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NoReplicas => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ClientGone { .. } => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).expect("499 is a valid status code")
            }
            Self::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
