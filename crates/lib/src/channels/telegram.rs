//! Telegram transport: long-poll getUpdates for inbound events, sendMessage for delivery.
//! Attachments of a structured payload follow the text, one sendDocument upload each.

use crate::attachments::{AttachmentLookup, AttachmentRef, AttachmentResolver};
use crate::channels::capability::{ChannelCapability, DeliveryChannel, DeliveryError};
use crate::events::{EventMeta, FilePath, InboundEvent, Payload};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Vec<TelegramPhotoSize>,
    #[serde(default)]
    pub document: Option<TelegramFileRef>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
}

#[derive(Debug, Deserialize)]
pub struct TelegramFileRef {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_path: Option<String>,
}

/// Bot API client shared by the transport, its channels, and the attachment lookup.
#[derive(Clone)]
struct BotApi {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl BotApi {
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, DeliveryError> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        Self::parse_response(method, res).await
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        method: &str,
        res: reqwest::Response,
    ) -> Result<T, DeliveryError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(DeliveryError::Api(format!("{} failed: {} {}", method, status, body)));
        }
        let data: ApiResponse<T> = res.json().await?;
        match (data.ok, data.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(DeliveryError::Api(format!(
                "{} returned ok: false ({})",
                method,
                data.description.unwrap_or_default()
            ))),
        }
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        self.call::<serde_json::Value>("sendMessage", body).await?;
        Ok(())
    }

    /// Upload a local file as a document.
    async fn send_document(&self, chat_id: &str, file: &FilePath) -> Result<(), DeliveryError> {
        let bytes = tokio::fs::read(&file.path).await?;
        let file_name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
        let res = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        Self::parse_response::<serde_json::Value>("sendDocument", res).await?;
        Ok(())
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), DeliveryError> {
        let mut body = serde_json::json!({ "timeout": LONG_POLL_TIMEOUT });
        if let Some(off) = offset {
            body["offset"] = serde_json::Value::from(off);
        }
        let updates: Vec<TelegramUpdate> = self.call("getUpdates", body).await?;
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }
}

/// Telegram transport: opens channels for chats and long-polls for inbound messages.
pub struct TelegramTransport {
    id: String,
    api: BotApi,
    running: AtomicBool,
}

impl TelegramTransport {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(token, telegram_api_base())
    }

    /// Transport against a custom Bot API endpoint (tests, local bot API servers).
    pub fn with_api_base(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: "telegram".to_string(),
            api: BotApi {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                token: token.into(),
                client: reqwest::Client::new(),
            },
            running: AtomicBool::new(false),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the getUpdates long-poll loop and forward events. Returns a handle to await on shutdown.
    pub fn start_inbound(self: Arc<Self>, inbound_tx: mpsc::Sender<InboundEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbound_tx).await;
        })
    }

    /// Map an update to an inbound event. Updates without a message are skipped.
    fn inbound_event(&self, update: TelegramUpdate) -> Option<InboundEvent> {
        let msg = update.message?;
        let text = msg.text.or(msg.caption).unwrap_or_default();
        let mut refs = Vec::new();
        if let Some(photo) = msg.photo.iter().max_by_key(|p| p.width) {
            refs.push(AttachmentRef::new(photo.file_id.clone()));
        }
        if let Some(doc) = msg.document {
            refs.push(AttachmentRef::new(doc.file_id));
        }
        if text.is_empty() && refs.is_empty() {
            return None;
        }
        let lookup: Arc<dyn AttachmentLookup> = Arc::new(TelegramFileLookup {
            api: self.api.clone(),
        });
        let (sender_id, is_bot) = msg
            .from
            .map(|u| (u.id.to_string(), u.is_bot))
            .unwrap_or_default();
        Some(InboundEvent::NewMessage {
            meta: EventMeta {
                conversation_id: msg.chat.id.to_string(),
                sender_id,
                is_self: is_bot,
                is_group_chat: msg.chat.kind != "private",
            },
            message_id: msg.message_id.to_string(),
            text,
            attachments: Arc::new(AttachmentResolver::new(refs, lookup)),
        })
    }
}

async fn run_get_updates_loop(transport: Arc<TelegramTransport>, inbound_tx: mpsc::Sender<InboundEvent>) {
    let mut offset: Option<i64> = None;
    while transport.running() {
        match transport.api.get_updates(offset).await {
            Ok((updates, next)) => {
                offset = next.or(offset);
                for u in updates {
                    let Some(event) = transport.inbound_event(u) else {
                        continue;
                    };
                    if inbound_tx.send(event).await.is_err() {
                        log::debug!("telegram: inbound channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram: getUpdates loop stopped");
}

#[async_trait]
impl ChannelCapability for TelegramTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self, conversation_id: &str) -> Result<Box<dyn DeliveryChannel>, DeliveryError> {
        Ok(Box::new(TelegramChannel {
            api: self.api.clone(),
            chat_id: conversation_id.to_string(),
        }))
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Delivery channel for one Telegram chat.
pub struct TelegramChannel {
    api: BotApi,
    chat_id: String,
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    fn conversation_id(&self) -> &str {
        &self.chat_id
    }

    async fn repoint(&mut self, conversation_id: &str) -> Result<(), DeliveryError> {
        self.chat_id = conversation_id.to_string();
        Ok(())
    }

    async fn send(&mut self, payload: &Payload) -> Result<(), DeliveryError> {
        if !payload.text().is_empty() {
            self.api.send_message(&self.chat_id, payload.text()).await?;
        }
        for file in payload.attachments() {
            log::debug!("telegram: uploading {} to {}", file.path.display(), self.chat_id);
            self.api.send_document(&self.chat_id, file).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Resolves a file_id to a download URL via getFile.
struct TelegramFileLookup {
    api: BotApi,
}

#[async_trait]
impl AttachmentLookup for TelegramFileLookup {
    async fn resolve(&self, attachment: &AttachmentRef) -> anyhow::Result<Option<String>> {
        let body = serde_json::json!({ "file_id": attachment.source_id });
        let file: TelegramFile = self.api.call("getFile", body).await?;
        Ok(file.file_path.map(|path| {
            format!("{}/file/bot{}/{}", self.api.base_url, self.api.token, path)
        }))
    }
}

/// Resolve Telegram bot API base URL (TELEGRAM_API_BASE env overrides the public endpoint).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: serde_json::Value) -> TelegramUpdate {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn private_text_message_maps_to_new_message() {
        let transport = TelegramTransport::with_api_base("t", "http://localhost:1");
        let event = transport
            .inbound_event(update(serde_json::json!({
                "update_id": 7,
                "message": {
                    "message_id": 11,
                    "chat": { "id": 42, "type": "private" },
                    "from": { "id": 5, "is_bot": false },
                    "text": "!echo hi"
                }
            })))
            .unwrap();
        let InboundEvent::NewMessage {
            meta,
            message_id,
            text,
            attachments,
        } = event
        else {
            panic!("expected new message");
        };
        assert_eq!(meta.conversation_id, "42");
        assert_eq!(meta.sender_id, "5");
        assert!(!meta.is_group_chat);
        assert!(!meta.is_self);
        assert_eq!(message_id, "11");
        assert_eq!(text, "!echo hi");
        assert!(attachments.is_empty());
    }

    #[test]
    fn photo_caption_in_group_maps_attachment() {
        let transport = TelegramTransport::with_api_base("t", "http://localhost:1");
        let event = transport
            .inbound_event(update(serde_json::json!({
                "update_id": 8,
                "message": {
                    "message_id": 12,
                    "chat": { "id": -100, "type": "supergroup" },
                    "caption": "look",
                    "photo": [
                        { "file_id": "small", "width": 90 },
                        { "file_id": "large", "width": 800 }
                    ]
                }
            })))
            .unwrap();
        let InboundEvent::NewMessage {
            meta,
            text,
            attachments,
            ..
        } = event
        else {
            panic!("expected new message");
        };
        assert!(meta.is_group_chat);
        assert_eq!(text, "look");
        assert_eq!(attachments.refs()[0].source_id, "large");
    }

    #[test]
    fn update_without_message_is_skipped() {
        let transport = TelegramTransport::with_api_base("t", "http://localhost:1");
        assert!(transport
            .inbound_event(update(serde_json::json!({ "update_id": 9 })))
            .is_none());
    }

    type Calls = Arc<std::sync::Mutex<Vec<(String, String)>>>;

    /// Local Bot API stand-in: records (method, body) and answers ok.
    async fn bot_api() -> (String, Calls) {
        use axum::extract::{Path, State};
        use axum::routing::post;

        async fn record(
            State(calls): State<Calls>,
            Path((_bot, method)): Path<(String, String)>,
            body: axum::body::Bytes,
        ) -> &'static str {
            calls
                .lock()
                .unwrap()
                .push((method, String::from_utf8_lossy(&body).into_owned()));
            r#"{"ok":true,"result":{}}"#
        }

        let calls: Calls = Arc::default();
        let app = axum::Router::new()
            .route("/:bot/:method", post(record))
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (base, calls)
    }

    #[tokio::test]
    async fn structured_payload_uploads_attachments_after_text() {
        let (base, calls) = bot_api().await;
        let path = std::env::temp_dir().join(format!("courier-doc-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"report-bytes").unwrap();

        let transport = TelegramTransport::with_api_base("t", base);
        let mut channel = transport.open("42").await.unwrap();
        channel
            .send(&Payload::Structured {
                text: "weekly".into(),
                attachments: vec![FilePath::keep(path.clone())],
            })
            .await
            .unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "sendMessage");
        assert!(calls[0].1.contains("weekly"));
        assert_eq!(calls[1].0, "sendDocument");
        assert!(calls[1].1.contains("report-bytes"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn missing_attachment_fails_delivery() {
        let (base, calls) = bot_api().await;
        let transport = TelegramTransport::with_api_base("t", base);
        let mut channel = transport.open("42").await.unwrap();
        let missing = std::env::temp_dir().join(format!("courier-gone-{}", uuid::Uuid::new_v4()));
        let err = channel
            .send(&Payload::Structured {
                text: String::new(),
                attachments: vec![FilePath::keep(missing)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Io(_)));
        assert!(calls.lock().unwrap().is_empty());
    }
}
