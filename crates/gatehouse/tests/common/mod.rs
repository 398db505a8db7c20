//! In-process cluster driven through the HTTP router of any member.

#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode, header},
};
use gatehouse::attestation::{AttestationVerifier, EndorsedQuoteVerifier, QuoteEndorser};
use gatehouse::config::AppConfig;
use gatehouse::consensus::{ClusterOptions, Consensus, InMemoryCluster};
use gatehouse::governance::{ConsortiumMember, GovernanceAction};
use gatehouse::routes::create_router;
use gatehouse::state::AppState;
use portcullis_common::constants::headers::{X_MEMBER_ID, X_MEMBER_SIGNATURE};
use portcullis_common::{CodeDigest, MemberQuotes, NodeId};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub struct TestCluster {
    pub cluster: InMemoryCluster,
    pub founder: NodeId,
    pub endorser: QuoteEndorser,
    pub operator: ConsortiumMember,
    pub config: AppConfig,
}

impl TestCluster {
    pub async fn start(options: ClusterOptions, founding: CodeDigest) -> Self {
        let endorser = QuoteEndorser::generate("lab");
        let operator = ConsortiumMember::generate("operator");

        let mut config = AppConfig::default();
        config
            .attestation
            .endorsers
            .insert(endorser.id().to_string(), endorser.public_key_b64());
        config
            .governance
            .members
            .insert(operator.id().to_string(), operator.public_key_b64());
        config.admission.retry_initial_backoff_ms = 10;
        config.admission.retry_max_backoff_ms = 50;

        let (cluster, founder) = InMemoryCluster::bootstrap(options, "node-0:8080", founding);
        cluster
            .replica(founder)
            .unwrap()
            .wait_applied(cluster.commit_index(), Duration::from_secs(2))
            .await
            .unwrap();

        Self {
            cluster,
            founder,
            endorser,
            operator,
            config,
        }
    }

    pub fn router(&self, via: NodeId) -> Router {
        let state = AppState::new(self.config.clone(), via, Arc::new(self.cluster.clone())).unwrap();
        create_router(state)
    }

    pub async fn get(&self, via: NodeId, path: &str) -> Response {
        let request = Request::get(path).body(Body::empty()).unwrap();
        send(self.router(via), request).await
    }

    /// Join `address` running `code`, with valid evidence for it
    pub async fn join(&self, via: NodeId, address: &str, code: CodeDigest) -> Response {
        let evidence = self.endorser.endorse(code, address).unwrap();
        let body = json!({
            "address": address,
            "code_digest": code,
            "evidence": evidence,
        });
        self.post(via, "/node/join", body, HeaderMap::new()).await
    }

    /// Join and return the new node's id
    pub async fn admit(&self, via: NodeId, address: &str, code: CodeDigest) -> NodeId {
        let response = self.join(via, address, code).await;
        assert_eq!(response.status, StatusCode::OK, "join failed: {}", response.body);
        node_id(&response.body["node_id"])
    }

    /// Signed governance call by the consortium operator
    pub async fn govern(&self, via: NodeId, action: GovernanceAction, digest: CodeDigest) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(X_MEMBER_ID, self.operator.id().parse().unwrap());
        headers.insert(
            X_MEMBER_SIGNATURE,
            self.operator.sign(action, &digest).parse().unwrap(),
        );
        self.post(via, &format!("/gov/code/{action}"), json!({ "digest": digest }), headers)
            .await
    }

    pub async fn post(&self, via: NodeId, path: &str, body: Value, headers: HeaderMap) -> Response {
        let mut request = Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        request.headers_mut().extend(headers);
        send(self.router(via), request).await
    }

    pub async fn leader(&self, via: NodeId) -> NodeId {
        let response = self.get(via, "/node/leader").await;
        assert_eq!(response.status, StatusCode::OK, "no leader: {}", response.body);
        node_id(&response.body["leader"])
    }

    /// `(digest, status)` pairs as listed by `via`
    pub async fn versions(&self, via: NodeId) -> Vec<(String, String)> {
        let response = self.get(via, "/node/code").await;
        assert_eq!(response.status, StatusCode::OK);
        response.body["versions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| {
                (
                    entry["digest"].as_str().unwrap().to_string(),
                    entry["status"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    /// Re-verify the stored evidence of every member listed by `via`.
    /// Returns how many members carried evidence.
    pub async fn verify_quotes(&self, via: NodeId) -> usize {
        let response = self.get(via, "/node/quotes").await;
        assert_eq!(response.status, StatusCode::OK);
        let quotes: MemberQuotes = serde_json::from_value(response.body).unwrap();

        let verifier = EndorsedQuoteVerifier::new(
            &self.config.attestation.endorsers,
            self.config.attestation.max_evidence_age_secs,
            self.config.attestation.clock_skew_secs,
        )
        .unwrap();

        let mut verified = 0;
        for quote in &quotes.quotes {
            let Some(evidence) = &quote.evidence else {
                assert_eq!(quote.node_id, self.founder, "member {} has no evidence", quote.node_id);
                continue;
            };
            let checked = verifier.verify(evidence).unwrap();
            assert_eq!(checked.measurement, quote.code_digest);
            assert_eq!(checked.report_data, quote.address);
            verified += 1;
        }
        verified
    }

    /// Wait until every live member has applied the current commit index
    pub async fn settle(&self) {
        let target = self.cluster.commit_index();
        for node in self.cluster.live_members() {
            self.cluster
                .replica(node)
                .unwrap()
                .wait_applied(target, Duration::from_secs(2))
                .await
                .unwrap();
        }
    }
}

pub fn node_id(value: &Value) -> NodeId {
    NodeId::new(value.as_u64().unwrap())
}

async fn send(router: Router, request: Request<Body>) -> Response {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };

    Response {
        status,
        headers,
        body,
    }
}
