//! Courier core library: event model, task queues, command router, delivery channel pool,
//! lazy attachments, and the gateway that wires them to a transport.

pub mod attachments;
pub mod channels;
pub mod config;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod init;
pub mod kv;
pub mod pipeline;
pub mod queue;
pub mod router;
