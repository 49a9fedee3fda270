//! Built-in handlers so a fresh install answers something.
//!
//! Real deployments register their own handlers on the [`CommandRouter`] before starting
//! the pipeline; these are small and self-contained.

mod busy;
mod echo;
mod recall;

pub use busy::BusyResponder;
pub use echo::Echo;
pub use recall::RecallCache;

use crate::config::HandlersConfig;
use crate::router::{CommandRouter, WILDCARD};
use std::sync::Arc;

/// Register `echo`, the busy auto-responder, and unsent-message recall.
pub fn register_builtin(router: &mut CommandRouter, config: &HandlersConfig) {
    router.register(&["echo"], Arc::new(Echo));
    router.register(&[WILDCARD], Arc::new(BusyResponder::new(&config.busy_message)));
    let recall = Arc::new(RecallCache::default());
    router.register(&[WILDCARD], recall.clone());
    router.register_unsent(recall);
}
