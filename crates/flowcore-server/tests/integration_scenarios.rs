//! Server-level scenarios layered on top of the executor tests in
//! `flowcore-core`: request parsing, rate-limit resolution, and cron
//! schedule matching, the parts of the system that only exist once the
//! core is wired into an HTTP surface.

use std::collections::BTreeMap;

use flowcore_core::collab::{RateLimitContext, RateLimitPolicy};
use flowcore_server::collab::rate_limit::RateLimitResolver;
use flowcore_workflow::config::{ParamType, RateLimitRef};

#[tokio::test]
async fn rate_limit_resolver_prefers_named_pool_over_inline() {
    let mut pools = BTreeMap::new();
    pools.insert(
        "shared".to_string(),
        RateLimitPolicy {
            key: "shared".to_string(),
            requests_per_second: 0.0,
            burst: 1,
        },
    );
    let resolver = RateLimitResolver::new(pools);

    let limit = RateLimitRef {
        pool: Some("shared".to_string()),
        requests_per_second: Some(1000.0),
        burst: Some(1000),
    };
    let ctx = RateLimitContext::default();

    let first = resolver.check(&[limit.clone()], "wf:/x:1.2.3.4", &ctx).await.unwrap();
    assert!(first.allowed);
    let second = resolver.check(&[limit], "wf:/x:1.2.3.4", &ctx).await.unwrap();
    assert!(!second.allowed, "named pool's tiny burst should win over the inline hint");
}

#[tokio::test]
async fn rate_limit_resolver_falls_back_to_inline_policy_for_unknown_pool() {
    let resolver = RateLimitResolver::new(BTreeMap::new());
    let limit = RateLimitRef {
        pool: Some("does-not-exist".to_string()),
        requests_per_second: Some(0.0),
        burst: Some(1),
    };
    let ctx = RateLimitContext::default();

    let first = resolver.check(&[limit.clone()], "wf:/y:9.9.9.9", &ctx).await.unwrap();
    assert!(first.allowed);
    let second = resolver.check(&[limit], "wf:/y:9.9.9.9", &ctx).await.unwrap();
    assert!(!second.allowed);
}

#[test]
fn param_type_round_trips_through_serde() {
    // Guards against a silent rename of the wire-format variants the
    // HTTP param coercion in `router.rs` depends on.
    let json = serde_json::json!("int[]");
    let parsed: ParamType = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, ParamType::IntArray);
}
