//! Resolves a trigger's `RateLimitRef` list (named pool or inline
//! policy) against the loaded pool table and the in-memory token-bucket
//! limiter the core already provides, denying a request if any one of
//! the trigger's limits is exceeded.

use std::collections::BTreeMap;

use flowcore_core::collab::{RateLimitContext, RateLimitDecision, RateLimitPolicy, RateLimiter};
use flowcore_workflow::config::RateLimitRef;

pub struct RateLimitResolver {
    pools: BTreeMap<String, RateLimitPolicy>,
    limiter: flowcore_core::collab::TokenBucketRateLimiter,
}

impl RateLimitResolver {
    pub fn new(pools: BTreeMap<String, RateLimitPolicy>) -> Self {
        RateLimitResolver {
            pools,
            limiter: flowcore_core::collab::TokenBucketRateLimiter::new(),
        }
    }

    /// Checks every limit a trigger declares, short-circuiting on the
    /// first denial. `key_prefix` scopes the bucket to this trigger plus
    /// the requesting IP, so two different routes sharing a named pool
    /// still get independent buckets per caller.
    pub async fn check(
        &self,
        limits: &[RateLimitRef],
        key_prefix: &str,
        ctx: &RateLimitContext,
    ) -> Result<RateLimitDecision, flowcore_core::collab::CollabError> {
        for limit in limits {
            let policy = self.resolve(limit, key_prefix);
            let decision = self.limiter.check(&policy, ctx).await?;
            if !decision.allowed {
                return Ok(decision);
            }
        }
        Ok(RateLimitDecision {
            allowed: true,
            retry_after_sec: 0,
        })
    }

    fn resolve(&self, limit: &RateLimitRef, key_prefix: &str) -> RateLimitPolicy {
        if let Some(pool_name) = &limit.pool {
            if let Some(pool) = self.pools.get(pool_name) {
                return RateLimitPolicy {
                    key: format!("{key_prefix}:pool:{pool_name}"),
                    requests_per_second: pool.requests_per_second,
                    burst: pool.burst,
                };
            }
        }
        RateLimitPolicy {
            key: format!("{key_prefix}:inline"),
            requests_per_second: limit.requests_per_second.unwrap_or(1.0),
            burst: limit.burst.unwrap_or(1),
        }
    }
}
