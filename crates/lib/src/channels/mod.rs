//! Delivery channels and transports.
//!
//! Transports implement [`ChannelCapability`]; the [`ChannelPool`] keeps a bounded set of
//! their channels alive and reuses them across deliveries. Transports may also produce
//! inbound events for the ingestion queue.

mod capability;
mod console;
mod pool;
mod telegram;

pub use capability::{ChannelCapability, DeliveryChannel, DeliveryError};
pub use console::{ConsoleChannel, ConsoleTransport};
pub use pool::{ChannelPool, PoolError};
pub use telegram::{TelegramChannel, TelegramTransport, TelegramUpdate};
