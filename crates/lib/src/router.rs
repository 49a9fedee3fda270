//! Command router: parse inbound text, fan out to registered handlers, collect replies.
//!
//! Grammar: `<prefix><name> [args...]` where name is `[A-Za-z0-9_]+` followed by
//! whitespace or end of text. Anything else goes to the wildcard command `*` with the
//! whole text as its only argument. A command name maps to any number of handlers; all
//! of them run concurrently and a failing handler never affects its siblings.
//!
//! Typing and unsent events each have one optional handler slot (no fan-out, no wildcard).
//! The registry is filled before traffic starts and is read-only afterwards.

use crate::channels::ChannelCapability;
use crate::events::{EventMeta, HandlerResult, InboundEvent, OutboundEvent, ParsedCommand};
use crate::kv::KvStore;
use crate::queue::panic_message;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Fallback command name; also where passive per-message observers register.
pub const WILDCARD: &str = "*";
pub const TYPING_COMMAND: &str = "typing";
pub const UNSENT_COMMAND: &str = "unsent";
pub const DEFAULT_PREFIX: char = '!';

/// Everything a handler gets for one invocation.
#[derive(Clone)]
pub struct HandlerRequest {
    pub command_name: String,
    pub args: Vec<String>,
    pub raw_body: String,
    pub event: Arc<InboundEvent>,
    pub kv: Arc<KvStore>,
    /// Transport, for handlers that deliver out of band.
    pub capability: Option<Arc<dyn ChannelCapability>>,
}

impl HandlerRequest {
    pub fn meta(&self) -> &EventMeta {
        self.event.meta()
    }
}

/// Business logic bound to one or more command names.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, request: HandlerRequest) -> anyhow::Result<HandlerResult>;
}

/// Adapter so plain async closures can be registered.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerResult>> + Send,
{
    async fn handle(&self, request: HandlerRequest) -> anyhow::Result<HandlerResult> {
        (self.0)(request).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerResult>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Parse `text` as a command. None when it does not match the grammar.
pub fn parse_command(text: &str, prefix: char) -> Option<ParsedCommand> {
    let rest = text.strip_prefix(prefix)?;
    let name_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    if name_len == 0 {
        return None;
    }
    let (name, remainder) = rest.split_at(name_len);
    if !remainder.is_empty() && !remainder.starts_with(char::is_whitespace) {
        return None;
    }
    let raw_body = remainder.trim_start();
    Some(ParsedCommand {
        command_name: name.to_string(),
        arguments: raw_body.split_whitespace().map(str::to_string).collect(),
        raw_body: raw_body.to_string(),
    })
}

fn wildcard_command(text: &str) -> ParsedCommand {
    ParsedCommand {
        command_name: WILDCARD.to_string(),
        arguments: vec![text.to_string()],
        raw_body: text.to_string(),
    }
}

pub struct CommandRouter {
    prefix: char,
    handlers: HashMap<String, Vec<Arc<dyn CommandHandler>>>,
    typing_handler: Option<Arc<dyn CommandHandler>>,
    unsent_handler: Option<Arc<dyn CommandHandler>>,
    kv: Arc<KvStore>,
    capability: Option<Arc<dyn ChannelCapability>>,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl CommandRouter {
    pub fn new(prefix: char) -> Self {
        Self {
            prefix,
            handlers: HashMap::new(),
            typing_handler: None,
            unsent_handler: None,
            kv: Arc::new(KvStore::new()),
            capability: None,
        }
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    /// Append `handler` to every listed command name.
    pub fn register(&mut self, commands: &[&str], handler: Arc<dyn CommandHandler>) {
        for cmd in commands {
            self.handlers
                .entry((*cmd).to_string())
                .or_default()
                .push(handler.clone());
        }
    }

    /// Set the typing handler, replacing any previous one.
    pub fn register_typing(&mut self, handler: Arc<dyn CommandHandler>) {
        self.typing_handler = Some(handler);
    }

    /// Set the unsent handler, replacing any previous one.
    pub fn register_unsent(&mut self, handler: Arc<dyn CommandHandler>) {
        self.unsent_handler = Some(handler);
    }

    pub fn set_kv(&mut self, kv: Arc<KvStore>) {
        self.kv = kv;
    }

    pub fn kv(&self) -> Arc<KvStore> {
        self.kv.clone()
    }

    pub fn set_capability(&mut self, capability: Arc<dyn ChannelCapability>) {
        self.capability = Some(capability);
    }

    pub fn has_handlers(&self, command: &str) -> bool {
        self.handlers.get(command).is_some_and(|h| !h.is_empty())
    }

    /// Turn one inbound event into zero or more outbound events. Order is unspecified.
    pub async fn dispatch(&self, event: InboundEvent) -> Vec<OutboundEvent> {
        let event = Arc::new(event);
        let origin = event.conversation_id().to_string();
        match &*event {
            InboundEvent::NewMessage { text, .. } => {
                let parsed = parse_command(text, self.prefix)
                    .filter(|p| self.has_handlers(&p.command_name))
                    .or_else(|| self.has_handlers(WILDCARD).then(|| wildcard_command(text)));
                let Some(parsed) = parsed else {
                    log::debug!("router: no handler for message in {}", origin);
                    return Vec::new();
                };
                let handlers = self
                    .handlers
                    .get(&parsed.command_name)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                log::debug!(
                    "router: dispatching '{}' to {} handler(s)",
                    parsed.command_name,
                    handlers.len()
                );
                let invocations = handlers.iter().map(|handler| {
                    let request = self.request(&parsed, event.clone());
                    invoke(handler.clone(), request)
                });
                join_all(invocations)
                    .await
                    .into_iter()
                    .flatten()
                    .filter_map(|result| result.into_outbound(&origin))
                    .collect()
            }
            InboundEvent::Typing { .. } => {
                self.dispatch_single(self.typing_handler.as_ref(), TYPING_COMMAND, event.clone(), &origin)
                    .await
            }
            InboundEvent::Unsent { .. } => {
                self.dispatch_single(self.unsent_handler.as_ref(), UNSENT_COMMAND, event.clone(), &origin)
                    .await
            }
        }
    }

    async fn dispatch_single(
        &self,
        handler: Option<&Arc<dyn CommandHandler>>,
        command: &str,
        event: Arc<InboundEvent>,
        origin: &str,
    ) -> Vec<OutboundEvent> {
        let Some(handler) = handler else {
            return Vec::new();
        };
        let parsed = ParsedCommand {
            command_name: command.to_string(),
            arguments: Vec::new(),
            raw_body: String::new(),
        };
        let request = self.request(&parsed, event);
        invoke(handler.clone(), request)
            .await
            .and_then(|result| result.into_outbound(origin))
            .into_iter()
            .collect()
    }

    fn request(&self, parsed: &ParsedCommand, event: Arc<InboundEvent>) -> HandlerRequest {
        HandlerRequest {
            command_name: parsed.command_name.clone(),
            args: parsed.arguments.clone(),
            raw_body: parsed.raw_body.clone(),
            event,
            kv: self.kv.clone(),
            capability: self.capability.clone(),
        }
    }
}

/// Run one handler, isolating errors and panics. None when the handler failed.
async fn invoke(handler: Arc<dyn CommandHandler>, request: HandlerRequest) -> Option<HandlerResult> {
    let command = request.command_name.clone();
    match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
        Ok(Ok(result)) => Some(result),
        Ok(Err(e)) => {
            log::warn!("router: handler for '{}' failed: {:#}", command, e);
            None
        }
        Err(panic) => {
            log::warn!(
                "router: handler for '{}' panicked: {}",
                command,
                panic_message(panic.as_ref())
            );
            None
        }
    }
}
