//! Moving a cluster from one code release to another over the HTTP surface.

mod common;

use axum::http::StatusCode;
use common::{TestCluster, node_id};
use gatehouse::consensus::ClusterOptions;
use gatehouse::governance::GovernanceAction;
use portcullis_common::CodeDigest;
use portcullis_common::constants::headers::{X_COMMIT_INDEX, X_TERM};

#[tokio::test]
async fn test_code_update_retires_old_release() {
    let a1 = CodeDigest::measure(b"release-a1");
    let b2 = CodeDigest::measure(b"release-b2");
    let net = TestCluster::start(ClusterOptions::default(), a1).await;
    let founder = net.founder;

    // Founding code is trusted from the start
    assert_eq!(
        net.versions(founder).await,
        vec![(a1.to_hex(), "ACCEPTED".to_string())]
    );

    let mut a1_nodes = vec![founder];
    for i in 1..3 {
        a1_nodes.push(net.admit(founder, &format!("a1-node-{i}:8080"), a1).await);
    }
    // Non-leader members accept joins too
    a1_nodes.push(net.admit(a1_nodes[1], "a1-node-3:8080", a1).await);
    net.settle().await;
    assert_eq!(net.verify_quotes(founder).await, 3);

    // Unknown code is refused
    let refused = net.join(founder, "b2-node-0:8080", b2).await;
    assert_eq!(refused.status, StatusCode::FORBIDDEN);
    assert_eq!(refused.body["error"], "CodeIdNotFound");
    assert_eq!(refused.body["digest"], b2.to_hex());
    assert_eq!(refused.body["retryable"], false);

    // Consortium accepts the new release
    let leader = net.leader(founder).await;
    let accepted = net.govern(leader, GovernanceAction::Accept, b2).await;
    assert_eq!(accepted.status, StatusCode::OK, "{}", accepted.body);
    assert_eq!(accepted.body["status"], "ACCEPTED");
    assert!(accepted.headers.contains_key(X_COMMIT_INDEX));
    assert!(accepted.headers.contains_key(X_TERM));

    let mut expected = vec![
        (a1.to_hex(), "ACCEPTED".to_string()),
        (b2.to_hex(), "ACCEPTED".to_string()),
    ];
    expected.sort();
    assert_eq!(net.versions(leader).await, expected);

    // More new-release nodes than old ones
    let mut b2_nodes = Vec::new();
    for i in 0..=a1_nodes.len() {
        b2_nodes.push(net.admit(founder, &format!("b2-node-{i}:8080"), b2).await);
    }
    net.settle().await;

    // Take every old-release node down
    for node in &a1_nodes {
        assert!(net.cluster.stop_node(*node));
    }

    let new_leader = net.leader(b2_nodes[0]).await;
    assert!(b2_nodes.contains(&new_leader));
    let members = net.get(b2_nodes[0], "/node/members").await.body;
    let leader_entry = members
        .as_array()
        .unwrap()
        .iter()
        .find(|m| node_id(&m["node_id"]) == new_leader)
        .unwrap()
        .clone();
    assert_eq!(leader_entry["code_digest"], b2.to_hex());
    assert_eq!(leader_entry["role"], "leader");

    // A fresh node joins through the new leadership, then retires the old release
    let new_node = net.admit(b2_nodes[0], "b2-node-new:8080", b2).await;
    net.settle().await;

    let retired = net.govern(new_node, GovernanceAction::Retire, a1).await;
    assert_eq!(retired.status, StatusCode::OK, "{}", retired.body);
    assert_eq!(retired.body["status"], "RETIRED");

    let mut expected = vec![
        (a1.to_hex(), "RETIRED".to_string()),
        (b2.to_hex(), "ACCEPTED".to_string()),
    ];
    expected.sort();
    assert_eq!(net.versions(new_node).await, expected);

    // Old release can no longer join
    let refused = net.join(new_node, "a1-node-late:8080", a1).await;
    assert_eq!(refused.status, StatusCode::FORBIDDEN);
    assert_eq!(refused.body["error"], "CodeIdRetired");
    assert_eq!(refused.body["status"], "RETIRED");

    // The cluster keeps working on the new release
    let late = net.join(new_node, "b2-node-late:8080", b2).await;
    assert_eq!(late.status, StatusCode::OK, "{}", late.body);
    assert_eq!(late.body["applied_index"], late.body["commit_index"]);

    let again = net.govern(new_node, GovernanceAction::Retire, a1).await;
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(again.body["error"], "AlreadyRetired");

    // Evidence of every member, old release included, still checks out
    net.settle().await;
    let evidenced = a1_nodes.len() - 1 + b2_nodes.len() + 2;
    assert_eq!(net.verify_quotes(new_node).await, evidenced);
}

#[tokio::test]
async fn test_members_keep_running_after_their_code_is_retired() {
    let a1 = CodeDigest::measure(b"release-a1");
    let b2 = CodeDigest::measure(b"release-b2");
    let net = TestCluster::start(ClusterOptions::default(), a1).await;

    let a1_node = net.admit(net.founder, "a1-node-1:8080", a1).await;
    assert_eq!(
        net.govern(net.founder, GovernanceAction::Accept, b2).await.status,
        StatusCode::OK
    );
    assert_eq!(
        net.govern(net.founder, GovernanceAction::Retire, a1).await.status,
        StatusCode::OK
    );
    net.settle().await;

    // Retirement does not evict running members
    assert!(net.cluster.is_live(a1_node));
    let members = net.get(a1_node, "/node/members").await.body;
    assert_eq!(members.as_array().unwrap().len(), 2);

    // Retired digests are never accepted again
    let reaccept = net.govern(net.founder, GovernanceAction::Accept, a1).await;
    assert_eq!(reaccept.status, StatusCode::FORBIDDEN);
    assert_eq!(reaccept.body["error"], "CodeIdRetired");

    // They still serve reads and forward writes
    let admitted = net.join(a1_node, "b2-node-0:8080", b2).await;
    assert_eq!(admitted.status, StatusCode::OK, "{}", admitted.body);
}

#[tokio::test]
async fn test_restarted_node_rejoins_on_new_release() {
    let a1 = CodeDigest::measure(b"release-a1");
    let b2 = CodeDigest::measure(b"release-b2");
    let net = TestCluster::start(ClusterOptions::default(), a1).await;

    let upgraded = net.admit(net.founder, "node-1:8080", a1).await;
    net.admit(net.founder, "node-2:8080", a1).await;
    assert_eq!(
        net.govern(net.founder, GovernanceAction::Accept, b2).await.status,
        StatusCode::OK
    );

    // Same address, new code: the record is replaced, not reported as joined on a1
    net.cluster.stop_node(upgraded);
    let rejoined = net.join(net.founder, "node-1:8080", b2).await;
    assert_eq!(rejoined.status, StatusCode::OK, "{}", rejoined.body);
    let replacement = node_id(&rejoined.body["node_id"]);
    assert_ne!(replacement, upgraded);

    net.settle().await;
    let members = net.get(net.founder, "/node/members").await.body;
    let at_address: Vec<_> = members
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["address"] == "node-1:8080")
        .collect();
    assert_eq!(at_address.len(), 1);
    assert_eq!(at_address[0]["code_digest"], b2.to_hex());
    assert_eq!(net.verify_quotes(net.founder).await, 2);
}
