//! Shared application state, mirroring the teacher's
//! `AppState{config, http_client}` shape generalized to this system's
//! collaborator set: a config handle, the assembled `Collaborators`
//! the core's executor needs, an optional trigger-response cache, and
//! the rate-limit resolver built from the loaded pool table.

use std::sync::Arc;

use flowcore_core::collab::TriggerCache;
use flowcore_core::exec::Collaborators;

use crate::collab::rate_limit::RateLimitResolver;
use crate::config::Config;

pub struct Inner {
    pub config: Config,
    pub collab: Collaborators,
    pub trigger_cache: Option<Arc<dyn TriggerCache>>,
    pub rate_limits: RateLimitResolver,
}

#[derive(Clone)]
pub struct AppState(pub Arc<Inner>);

impl AppState {
    pub fn new(
        config: Config,
        collab: Collaborators,
        trigger_cache: Option<Arc<dyn TriggerCache>>,
        rate_limits: RateLimitResolver,
    ) -> Self {
        AppState(Arc::new(Inner {
            config,
            collab,
            trigger_cache,
            rate_limits,
        }))
    }
}

impl std::ops::Deref for AppState {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.0
    }
}
