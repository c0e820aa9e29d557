//! End-to-end admission tests: firewall and budget policy through the full
//! pipeline.

use std::sync::Arc;

use gpu_governor::config::{Config, NodeDecl, RouterConfig};
use gpu_governor::error::GovernorError;
use gpu_governor::firewall::request::{CapacityRequest, Intent};
use gpu_governor::governor::Governor;
use gpu_governor::router::node::Heartbeat;

fn config() -> Config {
    let mut config = Config::default();
    config.router = RouterConfig {
        nodes: vec![NodeDecl {
            name: "oomllama".to_string(),
            address: "oomllama:11434".to_string(),
            capacity_mb: 12000,
            capabilities: vec!["heavy".to_string()],
            warm_resources: Vec::new(),
        }],
        ..Default::default()
    };
    config
}

async fn governor() -> Arc<Governor> {
    let g = Arc::new(Governor::new(Arc::new(config())));
    g.heartbeat(
        "oomllama",
        &Heartbeat {
            capacity_used_mb: 0,
            active_tasks: 0,
            warm_resources: None,
            latency_ms: None,
        },
    )
    .await;
    g
}

fn request(intent: Intent, resource: &str, actor: &str, capacity_mb: u64) -> CapacityRequest {
    CapacityRequest {
        intent,
        resource: resource.to_string(),
        actor: actor.to_string(),
        capacity_mb,
        estimated_duration_secs: 30.0,
        parent_token: None,
    }
}

#[tokio::test]
async fn test_miner_binary_blocked_and_actor_cooled_down() {
    let g = governor().await;

    let err = g
        .admit(request(Intent::Inference, "xmrig-cuda", "mallory", 500))
        .await
        .unwrap_err();
    let GovernorError::PolicyDenied { reason, .. } = err else {
        panic!("expected PolicyDenied");
    };
    assert!(reason.contains("xmrig"));

    // The cooldown outlives the offending request: a harmless follow-up from
    // the same actor is still refused, with the remaining time in the reason.
    let err = g
        .admit(request(Intent::Inference, "phi3:security", "mallory", 500))
        .await
        .unwrap_err();
    let GovernorError::PolicyDenied { reason, remediation } = err else {
        panic!("expected PolicyDenied");
    };
    assert!(reason.contains("blocked for another"));
    assert!(remediation.contains("cooldown"));

    // Other actors are unaffected.
    assert!(g
        .admit(request(Intent::Inference, "phi3:security", "alice", 500))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_declared_crypto_intent_never_runs() {
    let g = governor().await;
    let err = g
        .admit(request(Intent::Crypto, "totally-legit", "miner", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, GovernorError::PolicyDenied { .. }));

    let dash = g.dashboard().await;
    assert_eq!(dash.firewall.denied_requests, 1);
    assert_eq!(dash.chain.token_count, 0);
}

#[tokio::test]
async fn test_quota_exhaustion_and_reset() {
    let g = governor().await;
    // Quota fits one 3500 MB x 30 s grant, not two.
    g.register_actor("metered", 150_000.0, 10_000.0, 5, 1.0).await;

    assert!(g
        .admit(request(Intent::Inference, "phi3:security", "metered", 3500))
        .await
        .is_ok());

    let err = g
        .admit(request(Intent::Inference, "phi3:security", "metered", 3500))
        .await
        .unwrap_err();
    let GovernorError::PolicyDenied { reason, remediation } = err else {
        panic!("expected PolicyDenied");
    };
    assert!(reason.contains("quota insufficient"));
    assert!(remediation.contains("budget reset"));

    // A period reset restores the quota.
    let archived = g.reset_budgets().await;
    assert_eq!(archived.total_requests, 1);
    assert!(g
        .admit(request(Intent::Inference, "phi3:security", "metered", 3500))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_low_trust_grant_is_narrowed() {
    let g = governor().await;
    g.set_trust("intern", 0.1).await;

    let grant = g
        .admit(request(Intent::Inference, "phi3:security", "intern", 6000))
        .await
        .unwrap();
    assert_eq!(grant.granted_capacity_mb, 2000);
    assert_eq!(grant.granted_duration_secs, 30.0);

    // Raising trust lifts the narrowing.
    g.set_trust("intern", 0.9).await;
    let grant = g
        .admit(request(Intent::Inference, "phi3:security", "intern", 6000))
        .await
        .unwrap();
    assert_eq!(grant.granted_capacity_mb, 6000);
}

#[tokio::test]
async fn test_rate_limited_actor_denied_then_counted() {
    let g = governor().await;
    for _ in 0..10 {
        g.admit(request(Intent::Embedding, "phi3:security", "chatty", 100))
            .await
            .unwrap();
    }
    let err = g
        .admit(request(Intent::Embedding, "phi3:security", "chatty", 100))
        .await
        .unwrap_err();
    let GovernorError::PolicyDenied { reason, .. } = err else {
        panic!("expected PolicyDenied");
    };
    assert!(reason.contains("rate limit"));

    let dash = g.dashboard().await;
    assert_eq!(dash.firewall.total_requests, 11);
    assert_eq!(dash.firewall.denied_requests, 1);
}

#[tokio::test]
async fn test_every_grant_is_recorded_in_the_chain() {
    let g = governor().await;
    for i in 0..5 {
        g.admit(request(
            Intent::Inference,
            &format!("model-{i}"),
            "brain_api",
            1000,
        ))
        .await
        .unwrap();
    }

    assert!(g.verify_chain().await.is_ok());
    let dash = g.dashboard().await;
    assert_eq!(dash.chain.token_count, 5);
    assert_eq!(dash.chain.tokens_by_intent.get("inference"), Some(&5));
}
