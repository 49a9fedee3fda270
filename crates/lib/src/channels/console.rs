//! Console transport: stdin lines become inbound messages, deliveries are printed to stdout.
//!
//! Used when no Telegram token is configured. A line of the form `@conv text` posts into
//! conversation `conv`; other lines go to the `console` conversation. Within a conversation,
//! `~unsent <message id>` reports a deletion and `~typing` / `~stopped` report typing state.

use crate::channels::capability::{ChannelCapability, DeliveryChannel, DeliveryError};
use crate::events::{EventMeta, InboundEvent, Payload};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DEFAULT_CONVERSATION: &str = "console";
const CONSOLE_SENDER: &str = "console-user";

pub struct ConsoleTransport {
    running: AtomicBool,
    next_message_id: AtomicU64,
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Read stdin until EOF or stop, forwarding each non-empty line.
    pub fn start_inbound(self: Arc<Self>, inbound_tx: mpsc::Sender<InboundEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while self.running.load(Ordering::SeqCst) {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("console: reading stdin failed: {}", e);
                        break;
                    }
                };
                let Some(event) = self.parse_line(&line) else {
                    continue;
                };
                if inbound_tx.send(event).await.is_err() {
                    break;
                }
            }
            log::debug!("console: input loop stopped");
        })
    }

    fn parse_line(&self, line: &str) -> Option<InboundEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (conversation, text) = match line.strip_prefix('@') {
            Some(rest) => {
                let (conv, text) = rest.split_once(char::is_whitespace)?;
                (conv, text.trim_start())
            }
            None => (DEFAULT_CONVERSATION, line),
        };
        let meta = EventMeta::new(conversation, CONSOLE_SENDER);
        let unsent = text
            .strip_prefix("~unsent")
            .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace));
        if let Some(rest) = unsent {
            let message_id = rest.trim();
            if message_id.is_empty() {
                return None;
            }
            return Some(InboundEvent::Unsent {
                meta,
                message_id: message_id.to_string(),
            });
        }
        match text {
            "~typing" => return Some(InboundEvent::Typing { meta, typing: true }),
            "~stopped" => return Some(InboundEvent::Typing { meta, typing: false }),
            _ => {}
        }
        Some(InboundEvent::message(meta, self.next_id(conversation), text))
    }

    fn next_id(&self, conversation: &str) -> String {
        let message_id = format!("console-{}", self.next_message_id.fetch_add(1, Ordering::SeqCst));
        log::info!("console: message {} in {}", message_id, conversation);
        message_id
    }
}

#[async_trait]
impl ChannelCapability for ConsoleTransport {
    fn id(&self) -> &str {
        "console"
    }

    async fn open(&self, conversation_id: &str) -> Result<Box<dyn DeliveryChannel>, DeliveryError> {
        Ok(Box::new(ConsoleChannel {
            conversation_id: conversation_id.to_string(),
        }))
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct ConsoleChannel {
    conversation_id: String,
}

#[async_trait]
impl DeliveryChannel for ConsoleChannel {
    fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    async fn repoint(&mut self, conversation_id: &str) -> Result<(), DeliveryError> {
        self.conversation_id = conversation_id.to_string();
        Ok(())
    }

    async fn send(&mut self, payload: &Payload) -> Result<(), DeliveryError> {
        let mut out = format!("[{}] {}\n", self.conversation_id, payload.text());
        for file in payload.attachments() {
            out.push_str(&format!("[{}] + {}\n", self.conversation_id, file.path.display()));
        }
        let mut stdout = tokio::io::stdout();
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_map_to_conversations() {
        let console = ConsoleTransport::new();
        let event = console.parse_line("@room-7 !echo hello").unwrap();
        assert_eq!(event.conversation_id(), "room-7");
        let InboundEvent::NewMessage { text, .. } = &event else {
            panic!("expected new message");
        };
        assert_eq!(text, "!echo hello");

        let event = console.parse_line("plain words").unwrap();
        assert_eq!(event.conversation_id(), "console");
        assert!(console.parse_line("   ").is_none());
        assert!(console.parse_line("@lonely").is_none());
    }

    #[test]
    fn control_lines_map_to_unsent_and_typing() {
        let console = ConsoleTransport::new();
        let event = console.parse_line("@room-7 ~unsent console-3").unwrap();
        let InboundEvent::Unsent { meta, message_id } = &event else {
            panic!("expected unsent");
        };
        assert_eq!(meta.conversation_id, "room-7");
        assert_eq!(message_id, "console-3");

        assert!(matches!(
            console.parse_line("~typing"),
            Some(InboundEvent::Typing { typing: true, .. })
        ));
        assert!(matches!(
            console.parse_line("@room-7 ~stopped"),
            Some(InboundEvent::Typing { typing: false, .. })
        ));
        assert!(console.parse_line("~unsent   ").is_none());
    }

    #[tokio::test]
    async fn console_unsent_replays_remembered_message() {
        use crate::events::OutboundEvent;
        use crate::handlers::RecallCache;
        use crate::router::{CommandRouter, WILDCARD};

        let recall = Arc::new(RecallCache::default());
        let mut router = CommandRouter::default();
        router.register(&[WILDCARD], recall.clone());
        router.register_unsent(recall);

        let console = ConsoleTransport::new();
        router.dispatch(console.parse_line("@dm hello there").unwrap()).await;
        let replies = router
            .dispatch(console.parse_line("@dm ~unsent console-1").unwrap())
            .await;
        assert_eq!(replies, vec![OutboundEvent::text("dm", "Deleted content\nhello there")]);
    }
}
