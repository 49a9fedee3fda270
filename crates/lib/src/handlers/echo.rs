use crate::events::HandlerResult;
use crate::router::{CommandHandler, HandlerRequest};
use async_trait::async_trait;

/// `!echo <text>`: reply with the text as written.
pub struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, request: HandlerRequest) -> anyhow::Result<HandlerResult> {
        Ok(HandlerResult::Text(request.raw_body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventMeta, InboundEvent, OutboundEvent};
    use crate::router::CommandRouter;
    use std::sync::Arc;

    #[tokio::test]
    async fn echoes_raw_body() {
        let mut router = CommandRouter::default();
        router.register(&["echo"], Arc::new(Echo));
        let event = InboundEvent::message(EventMeta::new("c", "u"), "m", "!echo  spaced   out");
        assert_eq!(
            router.dispatch(event).await,
            vec![OutboundEvent::text("c", "spaced   out")]
        );
        let empty = InboundEvent::message(EventMeta::new("c", "u"), "m", "!echo");
        assert!(router.dispatch(empty).await.is_empty());
    }
}
