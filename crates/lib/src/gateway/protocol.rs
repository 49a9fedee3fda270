//! Webhook wire types.

use serde::{Deserialize, Serialize};

/// Body of `POST /send`: deliver `message` to a conversation, bypassing the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Target conversation. `to` is accepted as an alias.
    #[serde(alias = "to")]
    pub target_conversation_id: String,
    pub message: String,
}

/// Plain-text response bodies.
pub const BODY_FORBIDDEN: &str = "Forbidden";
pub const BODY_INVALID_OPERATION: &str = "Invalid operation";
pub const BODY_MALFORMED: &str = "Malformed body";
pub const BODY_METHOD_NOT_ALLOWED: &str = "Method Not Allowed";
pub const BODY_UPDATED: &str = "Updated keys";
pub const BODY_RECEIVED: &str = "Received";
