use crate::events::{HandlerResult, InboundEvent};
use crate::router::{CommandHandler, HandlerRequest, UNSENT_COMMAND, WILDCARD};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

const DEFAULT_CAPACITY: usize = 20;

struct Remembered {
    conversation_id: String,
    message_id: String,
    text: String,
    attachment_urls: Vec<String>,
}

/// Remembers recent direct messages from others (as a passive wildcard observer) and,
/// registered as the unsent handler, replays a message when its sender deletes it.
/// Messages are keyed by conversation and message id; ids are only unique per chat.
pub struct RecallCache {
    capacity: usize,
    messages: Mutex<VecDeque<Remembered>>,
}

impl Default for RecallCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RecallCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    async fn remember(&self, request: &HandlerRequest) {
        let InboundEvent::NewMessage {
            meta,
            message_id,
            attachments,
            ..
        } = &*request.event
        else {
            return;
        };
        if meta.is_self || meta.is_group_chat {
            return;
        }
        let attachment_urls = attachments
            .resolve_all()
            .await
            .into_iter()
            .filter_map(|a| a.url().map(str::to_string))
            .collect();
        let text = request.args.first().cloned().unwrap_or_default();
        let mut messages = self.messages.lock().await;
        messages.push_back(Remembered {
            conversation_id: meta.conversation_id.clone(),
            message_id: message_id.clone(),
            text,
            attachment_urls,
        });
        while messages.len() > self.capacity {
            messages.pop_front();
        }
    }

    async fn recall(&self, request: &HandlerRequest) -> HandlerResult {
        let InboundEvent::Unsent {
            meta, message_id, ..
        } = &*request.event
        else {
            return HandlerResult::None;
        };
        if meta.is_group_chat {
            return HandlerResult::None;
        }
        let mut messages = self.messages.lock().await;
        let Some(pos) = messages
            .iter()
            .position(|m| m.conversation_id == meta.conversation_id && &m.message_id == message_id)
        else {
            return HandlerResult::None;
        };
        let Some(found) = messages.remove(pos) else {
            return HandlerResult::None;
        };
        let mut text = format!("Deleted content\n{}", found.text);
        for url in &found.attachment_urls {
            text.push('\n');
            text.push_str(url);
        }
        HandlerResult::Text(text)
    }
}

#[async_trait]
impl CommandHandler for RecallCache {
    async fn handle(&self, request: HandlerRequest) -> anyhow::Result<HandlerResult> {
        match request.command_name.as_str() {
            WILDCARD => {
                self.remember(&request).await;
                Ok(HandlerResult::None)
            }
            UNSENT_COMMAND => Ok(self.recall(&request).await),
            _ => Ok(HandlerResult::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::{AttachmentRef, AttachmentResolver};
    use crate::events::{EventMeta, OutboundEvent};
    use crate::router::CommandRouter;
    use std::sync::Arc;

    fn router(cache: Arc<RecallCache>) -> CommandRouter {
        let mut router = CommandRouter::default();
        router.register(&[WILDCARD], cache.clone());
        router.register_unsent(cache);
        router
    }

    fn unsent(conversation: &str, message_id: &str) -> InboundEvent {
        InboundEvent::Unsent {
            meta: EventMeta::new(conversation, "u"),
            message_id: message_id.into(),
        }
    }

    #[tokio::test]
    async fn replays_deleted_message_once() {
        let cache = Arc::new(RecallCache::default());
        let router = router(cache.clone());
        let event = InboundEvent::NewMessage {
            meta: EventMeta::new("c", "u"),
            message_id: "m1".into(),
            text: "oops".into(),
            attachments: Arc::new(AttachmentResolver::without_lookup(vec![AttachmentRef {
                source_id: "f1".into(),
                preview_url: Some("https://preview/f1".into()),
            }])),
        };
        assert!(router.dispatch(event).await.is_empty());
        assert_eq!(cache.len().await, 1);

        assert_eq!(
            router.dispatch(unsent("c", "m1")).await,
            vec![OutboundEvent::text("c", "Deleted content\noops\nhttps://preview/f1")]
        );
        assert!(router.dispatch(unsent("c", "m1")).await.is_empty());
    }

    #[tokio::test]
    async fn keeps_only_recent_messages() {
        let cache = Arc::new(RecallCache::with_capacity(2));
        let router = router(cache.clone());
        for n in 0..3 {
            let event = InboundEvent::message(EventMeta::new("c", "u"), format!("m{}", n), "text");
            router.dispatch(event).await;
        }
        assert_eq!(cache.len().await, 2);
        assert!(router.dispatch(unsent("c", "m0")).await.is_empty());
        assert_eq!(router.dispatch(unsent("c", "m2")).await.len(), 1);
    }

    #[tokio::test]
    async fn unsent_in_other_conversation_replays_nothing() {
        let cache = Arc::new(RecallCache::default());
        let router = router(cache.clone());
        let event = InboundEvent::message(EventMeta::new("chat-a", "u"), "5", "secret for a");
        router.dispatch(event).await;

        assert!(router.dispatch(unsent("chat-b", "5")).await.is_empty());
        assert_eq!(cache.len().await, 1);
        assert_eq!(
            router.dispatch(unsent("chat-a", "5")).await,
            vec![OutboundEvent::text("chat-a", "Deleted content\nsecret for a")]
        );
    }

    #[tokio::test]
    async fn skips_own_messages() {
        let cache = Arc::new(RecallCache::default());
        let router = router(cache.clone());
        let mut meta = EventMeta::new("c", "me");
        meta.is_self = true;
        router.dispatch(InboundEvent::message(meta, "m1", "mine")).await;
        assert_eq!(cache.len().await, 0);
    }
}
