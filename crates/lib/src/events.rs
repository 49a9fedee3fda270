//! Conversational events flowing through the pipeline.
//!
//! Inbound events arrive from a transport, are dispatched by the router, and produce
//! outbound events that the output stage delivers through the channel pool.

use crate::attachments::AttachmentResolver;
use std::path::PathBuf;
use std::sync::Arc;

/// Fields shared by every inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMeta {
    pub conversation_id: String,
    pub sender_id: String,
    /// True when the operator's own account produced the event.
    pub is_self: bool,
    pub is_group_chat: bool,
}

impl EventMeta {
    pub fn new(conversation_id: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            is_self: false,
            is_group_chat: false,
        }
    }
}

/// A unit of incoming conversational activity.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    NewMessage {
        meta: EventMeta,
        message_id: String,
        text: String,
        /// Lazily resolved attachments of this message; shared by every handler invocation.
        attachments: Arc<AttachmentResolver>,
    },
    Typing {
        meta: EventMeta,
        typing: bool,
    },
    Unsent {
        meta: EventMeta,
        /// Id of the deleted message.
        message_id: String,
    },
}

impl InboundEvent {
    /// New text message without attachments.
    pub fn message(meta: EventMeta, message_id: impl Into<String>, text: impl Into<String>) -> Self {
        InboundEvent::NewMessage {
            meta,
            message_id: message_id.into(),
            text: text.into(),
            attachments: Arc::new(AttachmentResolver::empty()),
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            InboundEvent::NewMessage { meta, .. }
            | InboundEvent::Typing { meta, .. }
            | InboundEvent::Unsent { meta, .. } => meta,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.meta().conversation_id
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage { .. } => "new_message",
            InboundEvent::Typing { .. } => "typing",
            InboundEvent::Unsent { .. } => "unsent",
        }
    }
}

/// Command parsed from a message: name, whitespace-split arguments, and the untouched remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command_name: String,
    pub arguments: Vec<String>,
    pub raw_body: String,
}

/// File sent along with a structured result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePath {
    pub path: PathBuf,
    /// Remove the file once the output stage has attempted delivery.
    pub delete_after_use: bool,
}

impl FilePath {
    pub fn keep(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delete_after_use: false,
        }
    }

    pub fn temporary(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delete_after_use: true,
        }
    }
}

/// What one handler invocation produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandlerResult {
    /// No action.
    #[default]
    None,
    /// Reply in the originating conversation.
    Text(String),
    /// Send text and files to an explicitly named conversation. An empty recipient
    /// falls back to the originating conversation.
    Structured {
        text: String,
        attachments: Vec<FilePath>,
        recipient_conversation_id: String,
    },
}

impl HandlerResult {
    /// True when there is nothing to deliver.
    pub fn is_empty(&self) -> bool {
        match self {
            HandlerResult::None => true,
            HandlerResult::Text(text) => text.is_empty(),
            HandlerResult::Structured {
                text, attachments, ..
            } => text.is_empty() && attachments.is_empty(),
        }
    }

    /// Map to an outbound event; `origin` is the inbound conversation. Empty results map to None.
    pub fn into_outbound(self, origin: &str) -> Option<OutboundEvent> {
        if self.is_empty() {
            return None;
        }
        match self {
            HandlerResult::None => None,
            HandlerResult::Text(text) => Some(OutboundEvent::text(origin, text)),
            HandlerResult::Structured {
                text,
                attachments,
                recipient_conversation_id,
            } => {
                let target = if recipient_conversation_id.trim().is_empty() {
                    origin.to_string()
                } else {
                    recipient_conversation_id
                };
                Some(OutboundEvent {
                    target_conversation_id: target,
                    payload: Payload::Structured { text, attachments },
                })
            }
        }
    }
}

impl From<String> for HandlerResult {
    fn from(text: String) -> Self {
        HandlerResult::Text(text)
    }
}

impl From<&str> for HandlerResult {
    fn from(text: &str) -> Self {
        HandlerResult::Text(text.to_string())
    }
}

impl From<Option<String>> for HandlerResult {
    fn from(text: Option<String>) -> Self {
        text.map(HandlerResult::Text).unwrap_or_default()
    }
}

/// Content delivered into a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Structured {
        text: String,
        attachments: Vec<FilePath>,
    },
}

impl Payload {
    pub fn text(&self) -> &str {
        match self {
            Payload::Text(text) | Payload::Structured { text, .. } => text,
        }
    }

    pub fn attachments(&self) -> &[FilePath] {
        match self {
            Payload::Text(_) => &[],
            Payload::Structured { attachments, .. } => attachments,
        }
    }
}

/// A unit of content to deliver. The target is always resolved before enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub target_conversation_id: String,
    pub payload: Payload,
}

impl OutboundEvent {
    pub fn text(target: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            target_conversation_id: target.into(),
            payload: Payload::Text(text.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_result_targets_origin() {
        let out = HandlerResult::from("hi").into_outbound("conv-1").unwrap();
        assert_eq!(out, OutboundEvent::text("conv-1", "hi"));
    }

    #[test]
    fn empty_results_are_dropped() {
        assert!(HandlerResult::None.into_outbound("c").is_none());
        assert!(HandlerResult::Text(String::new()).into_outbound("c").is_none());
        assert!(HandlerResult::from(None).into_outbound("c").is_none());
    }

    #[test]
    fn structured_result_uses_recipient_or_falls_back() {
        let explicit = HandlerResult::Structured {
            text: "report".into(),
            attachments: vec![FilePath::temporary("/tmp/a.png")],
            recipient_conversation_id: "other".into(),
        };
        let out = explicit.into_outbound("origin").unwrap();
        assert_eq!(out.target_conversation_id, "other");
        assert_eq!(out.payload.attachments().len(), 1);
        assert!(out.payload.attachments()[0].delete_after_use);

        let implicit = HandlerResult::Structured {
            text: "report".into(),
            attachments: Vec::new(),
            recipient_conversation_id: " ".into(),
        };
        assert_eq!(
            implicit.into_outbound("origin").unwrap().target_conversation_id,
            "origin"
        );
    }

    #[test]
    fn event_accessors() {
        let ev = InboundEvent::Unsent {
            meta: EventMeta::new("c", "u"),
            message_id: "m".into(),
        };
        assert_eq!(ev.kind(), "unsent");
        assert_eq!(ev.conversation_id(), "c");
    }
}
