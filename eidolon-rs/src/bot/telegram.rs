//! Telegram Bot API transport (long polling)

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::commands::{BotHandler, Sender};
use crate::error::{EidolonError, Result};

/// Seconds Telegram holds a `getUpdates` call open
const POLL_TIMEOUT_SECS: u64 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Telegram rejects longer messages
const MAX_MESSAGE_CHARS: usize = 4096;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, sender: &Sender, text: &str) -> String;
}

#[async_trait]
impl MessageHandler for BotHandler {
    async fn handle(&self, sender: &Sender, text: &str) -> String {
        BotHandler::handle(self, sender, text).await
    }
}

#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<TelegramUser>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub username: Option<String>,
}

pub struct TelegramBot {
    client: reqwest::Client,
    base_url: String,
    handler: Arc<dyn MessageHandler>,
}

impl TelegramBot {
    pub fn new(api_url: &str, token: &str, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
            handler,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let reply: ApiReply<T> = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        match (reply.ok, reply.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(EidolonError::ExternalProcess(format!(
                "telegram {} failed: {}",
                method,
                reply.description.unwrap_or_else(|| "no description".to_string())
            ))),
        }
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let _: serde_json::Value = self
                .call("sendMessage", json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        Ok(())
    }

    /// Handle one update; returns the next offset
    pub async fn process(&self, update: Update) -> i64 {
        let next = update.update_id + 1;

        let Some(message) = update.message else {
            return next;
        };
        let (Some(from), Some(text)) = (message.from, message.text) else {
            return next;
        };
        if from.is_bot {
            return next;
        }

        let sender = Sender {
            telegram_id: from.id,
            username: from.username.unwrap_or_default(),
        };
        debug!("Message from {} ({})", sender.username, sender.telegram_id);

        let reply = self.handler.handle(&sender, &text).await;
        if let Err(e) = self.send_message(message.chat.id, &reply).await {
            error!("Failed to reply to chat {}: {}", message.chat.id, e);
        }

        next
    }

    /// Poll until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Telegram bot started");
        let mut offset = 0;

        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                updates = self.get_updates(offset) => updates,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(self.process(update).await);
                    }
                }
                Err(e) => {
                    warn!("Telegram polling failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!("Telegram bot stopped");
    }
}

/// Split on line boundaries into chunks of at most `max` characters
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let mut line = line;
        loop {
            let len = line.chars().count();
            if current_len + len <= max {
                current.push_str(line);
                current_len += len;
                break;
            }
            if current_len > 0 {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
                continue;
            }
            // A single line longer than `max`
            let cut = line.char_indices().nth(max).map(|(i, _)| i).unwrap_or(line.len());
            chunks.push(line[..cut].to_string());
            line = &line[cut..];
        }
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::Value;
    use tokio::sync::Mutex;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, sender: &Sender, text: &str) -> String {
            format!("{}:{}", sender.username, text)
        }
    }

    #[derive(Default)]
    struct FakeTelegram {
        sent: Mutex<Vec<Value>>,
    }

    async fn fake_updates() -> Json<Value> {
        Json(json!({
            "ok": true,
            "result": [
                {"update_id": 7, "message": {"chat": {"id": 1}, "from": {"id": 42, "is_bot": false, "username": "alice"}, "text": "/status"}},
                {"update_id": 8, "message": {"chat": {"id": 2}, "from": {"id": 9, "is_bot": true}, "text": "spam"}},
                {"update_id": 9}
            ]
        }))
    }

    async fn fake_send(State(fake): State<Arc<FakeTelegram>>, Json(body): Json<Value>) -> Json<Value> {
        fake.sent.lock().await.push(body);
        Json(json!({"ok": true, "result": {"message_id": 1}}))
    }

    async fn spawn_fake() -> (String, Arc<FakeTelegram>) {
        let fake = Arc::new(FakeTelegram::default());
        let app = Router::new()
            .route("/bottoken/getUpdates", post(fake_updates))
            .route("/bottoken/sendMessage", post(fake_send))
            .with_state(fake.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (format!("http://{}", addr), fake)
    }

    #[tokio::test]
    async fn test_poll_and_reply() {
        let (url, fake) = spawn_fake().await;
        let bot = TelegramBot::new(&url, "token", Arc::new(Echo)).unwrap();

        let updates = bot.get_updates(0).await.unwrap();
        assert_eq!(updates.len(), 3);

        let mut offset = 0;
        for update in updates {
            offset = bot.process(update).await;
        }
        assert_eq!(offset, 10);

        let sent = fake.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["chat_id"], 1);
        assert_eq!(sent[0]["text"], "alice:/status");
    }

    #[tokio::test]
    async fn test_api_error_reported() {
        let app = Router::new().route(
            "/bottoken/getUpdates",
            post(|| async { Json(json!({"ok": false, "description": "Unauthorized"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let bot = TelegramBot::new(&format!("http://{}", addr), "token", Arc::new(Echo)).unwrap();
        let err = bot.get_updates(0).await.unwrap_err();
        assert!(err.to_string().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let bot = Arc::new(TelegramBot::new("http://127.0.0.1:1", "token", Arc::new(Echo)).unwrap());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bot.run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_split_message() {
        assert_eq!(split_message("short", 10), vec!["short".to_string()]);
        assert_eq!(split_message("", 10), vec![String::new()]);

        let chunks = split_message("aaaa\nbbbb\ncc", 6);
        assert_eq!(chunks, vec!["aaaa\n", "bbbb\n", "cc"]);

        let chunks = split_message("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }
}
