//! Gateway: process wiring plus the webhook/KV push server.
//!
//! The webhook server is the only network surface; it writes the shared KV store and
//! feeds the output queue directly.

mod protocol;
mod server;
mod webhook;

pub use protocol::SendRequest;
pub use server::run_gateway;
pub use webhook::{serve_webhook, webhook_router, WebhookState};
