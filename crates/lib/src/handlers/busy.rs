use crate::events::HandlerResult;
use crate::router::{CommandHandler, HandlerRequest};
use async_trait::async_trait;

/// KV key that switches the auto-responder on.
pub const BUSY_KEY: &str = "busy";

/// Wildcard handler: while the `busy` KV flag is set, answer direct messages from others.
pub struct BusyResponder {
    message: String,
}

impl BusyResponder {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl CommandHandler for BusyResponder {
    async fn handle(&self, request: HandlerRequest) -> anyhow::Result<HandlerResult> {
        let meta = request.meta();
        if meta.is_group_chat || meta.is_self || !request.kv.flag(BUSY_KEY).await {
            return Ok(HandlerResult::None);
        }
        Ok(HandlerResult::Text(self.message.clone()))
    }
}
