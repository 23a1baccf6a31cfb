//! Leader forwarding
//!
//! Mutating requests must be applied by the leader replica. A follower
//! relays such a request to the leader verbatim and hands the leader's raw
//! response back to its caller.
//!
//! A relayed request carries [`FORWARDED_HEADER`]. A replica that receives a
//! marked request while not leading refuses it instead of relaying again, so
//! two replicas that each believe the other leads cannot bounce a request
//! forever.

mod election;

pub use election::{LeaderElection, StaticElection};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{MetaError, Result};

/// Marks a request already relayed by a follower
pub const FORWARDED_HEADER: &str = "x-meta-forwarded";

/// Headers that describe one hop and are never relayed
const HOP_BY_HOP: &[&str] = &["connection", "transfer-encoding", "host", "content-length"];

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub method: Method,
    /// Path plus query string, e.g. `/api/v1/route`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Outcome of [`ForwardClient::decide`]
#[derive(Debug)]
pub enum ForwardDecision {
    /// This replica leads: handle the request here
    Local,
    /// The leader's response, to be returned as is
    Forwarded(RelayResponse),
}

/// Sends a request to a given replica
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn relay(&self, addr: &str, req: RelayRequest) -> Result<RelayResponse>;
}

/// Relay over HTTP
pub struct HttpRelay {
    http_client: reqwest::Client,
}

impl HttpRelay {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| MetaError::Internal(format!("build http client: {}", e)))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl RelayTransport for HttpRelay {
    async fn relay(&self, addr: &str, req: RelayRequest) -> Result<RelayResponse> {
        let url = format!("http://{}{}", addr, req.path_and_query);

        let resp = self
            .http_client
            .request(req.method, &url)
            .headers(req.headers)
            .body(req.body)
            .send()
            .await
            .map_err(|e| MetaError::ForwardToLeader(format!("{}: {}", url, e)))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| MetaError::ForwardToLeader(format!("read {}: {}", url, e)))?;

        Ok(RelayResponse {
            status,
            headers,
            body,
        })
    }
}

/// Forward client
pub struct ForwardClient {
    election: Arc<dyn LeaderElection>,
    transport: Arc<dyn RelayTransport>,
}

impl ForwardClient {
    pub fn new(election: Arc<dyn LeaderElection>, transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            election,
            transport,
        }
    }

    pub fn election(&self) -> &Arc<dyn LeaderElection> {
        &self.election
    }

    /// Handle locally, or relay to the leader and return its response
    pub async fn decide(&self, req: &RelayRequest) -> Result<ForwardDecision> {
        if self.election.is_leader().await {
            return Ok(ForwardDecision::Local);
        }

        if req.headers.contains_key(FORWARDED_HEADER) {
            warn!(
                "Refusing to relay {} {} a second time",
                req.method, req.path_and_query
            );
            return Err(MetaError::ForwardToLeader(
                "request was already forwarded and this replica is not the leader".into(),
            ));
        }

        let leader = self
            .election
            .current_leader_addr()
            .await
            .ok_or_else(|| MetaError::ForwardToLeader("leader unknown".into()))?;

        let mut relayed = req.clone();
        strip_hop_by_hop(&mut relayed.headers);
        relayed
            .headers
            .insert(FORWARDED_HEADER, HeaderValue::from_static("1"));

        debug!(
            "Forwarding {} {} to leader {}",
            req.method, req.path_and_query, leader
        );
        let mut resp = self.transport.relay(&leader, relayed).await?;
        strip_hop_by_hop(&mut resp.headers);

        Ok(ForwardDecision::Forwarded(resp))
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRelay {
        seen: Mutex<Vec<(String, RelayRequest)>>,
    }

    #[async_trait]
    impl RelayTransport for RecordingRelay {
        async fn relay(&self, addr: &str, req: RelayRequest) -> Result<RelayResponse> {
            self.seen.lock().push((addr.to_string(), req));
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Ok(RelayResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from_static(b"{\"status\":\"success\"}"),
            })
        }
    }

    fn request() -> RelayRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("follower:8080"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("2"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        RelayRequest {
            method: Method::POST,
            path_and_query: "/api/v1/route".into(),
            headers,
            body: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn test_leader_handles_locally() {
        let relay = Arc::new(RecordingRelay::default());
        let client = ForwardClient::new(
            Arc::new(StaticElection::new("a:1".into(), None)),
            relay.clone(),
        );

        assert!(matches!(
            client.decide(&request()).await.unwrap(),
            ForwardDecision::Local
        ));
        assert!(relay.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_follower_relays_and_strips_hop_headers() {
        let relay = Arc::new(RecordingRelay::default());
        let client = ForwardClient::new(
            Arc::new(StaticElection::new("a:1".into(), Some("b:1".into()))),
            relay.clone(),
        );

        let ForwardDecision::Forwarded(resp) = client.decide(&request()).await.unwrap() else {
            panic!("expected forwarded response");
        };
        assert_eq!(resp.body, Bytes::from_static(b"{\"status\":\"success\"}"));
        assert!(resp.headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(resp.headers.get(header::CONTENT_TYPE).is_some());

        let seen = relay.seen.lock();
        let (addr, sent) = &seen[0];
        assert_eq!(addr, "b:1");
        assert_eq!(sent.body, Bytes::from_static(b"{}"));
        assert!(sent.headers.get(header::HOST).is_none());
        assert!(sent.headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(sent.headers.get("x-trace").unwrap(), "abc");
        assert!(sent.headers.contains_key(FORWARDED_HEADER));
    }

    #[tokio::test]
    async fn test_forwarded_request_is_not_relayed_again() {
        let relay = Arc::new(RecordingRelay::default());
        let client = ForwardClient::new(
            Arc::new(StaticElection::new("a:1".into(), Some("b:1".into()))),
            relay.clone(),
        );

        let mut req = request();
        req.headers
            .insert(FORWARDED_HEADER, HeaderValue::from_static("1"));
        assert!(matches!(
            client.decide(&req).await,
            Err(MetaError::ForwardToLeader(_))
        ));
        assert!(relay.seen.lock().is_empty());
    }
}
