use crate::traits::Transport;
use crate::types::{
    BotIdentity, ButtonPress, ChatId, ChatKind, ChatRef, Delivery, InboundEvent, InboundMessage,
    InlineKeyboard, MessageId, MessageRef, OutboundMessage, ReplyMarkup, Sender, ThreadId, UserId,
};
use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","callback_query"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;
/// Bot API limits, counted in UTF-16 code units.
const TELEGRAM_MAX_TEXT_LEN: usize = 4096;
const TELEGRAM_MAX_TOPIC_NAME_LEN: usize = 128;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    poll_timeout_secs: u64,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let token = bot_token.trim();
        if token.is_empty() {
            return Err(anyhow::anyhow!("telegram bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: token.to_string(),
            poll_timeout_secs: TELEGRAM_DEFAULT_POLL_TIMEOUT_SECS,
        })
    }

    /// Long-poll timeout for `getUpdates`; clamped below the HTTP client timeout.
    pub fn with_poll_timeout_secs(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = secs.clamp(1, 50);
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T> {
        let url = self.api_url(method)?;
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|error| {
                anyhow::anyhow!("telegram {method} request failed: {}", error.without_url())
            })?;
        let status = response.status();
        let envelope = response
            .json::<TelegramEnvelope<T>>()
            .await
            .map_err(|error| error.without_url())
            .with_context(|| {
                format!("telegram {method} returned unreadable body (status={status})")
            })?;
        if !envelope.ok {
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} code={:?} description={}",
                envelope.error_code,
                envelope.description.as_deref().unwrap_or("<none>")
            ));
        }
        envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {method} returned ok without result"))
    }
}

#[async_trait::async_trait]
impl Transport for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn identity(&self) -> Result<BotIdentity> {
        let me: TelegramUser = self.call("getMe", &json!({})).await?;
        Ok(BotIdentity {
            id: UserId::new(me.id),
            username: me.username,
        })
    }

    async fn send(&self, chat_id: ChatId, message: OutboundMessage) -> Result<Delivery> {
        let mut body = json!({
            "chat_id": chat_id.get(),
            "text": truncate_utf16(&message.text, TELEGRAM_MAX_TEXT_LEN),
        });
        if let Some(thread_id) = message.thread_id {
            body["message_thread_id"] = json!(thread_id.get());
        }
        if let Some(markup) = &message.markup {
            body["reply_markup"] = reply_markup_json(markup);
        }
        let sent: TelegramMessage = self.call("sendMessage", &body).await?;
        let chat = sent.chat.map(|chat| chat.id).unwrap_or(chat_id.get());
        let message_id = sent
            .message_id
            .ok_or_else(|| anyhow::anyhow!("telegram sendMessage returned no message_id"))?;
        Ok(Delivery {
            message: MessageRef {
                chat_id: ChatId::new(chat),
                message_id: MessageId::new(message_id),
            },
        })
    }

    async fn edit_text(
        &self,
        target: MessageRef,
        text: &str,
        buttons: Option<InlineKeyboard>,
    ) -> Result<()> {
        let mut body = json!({
            "chat_id": target.chat_id.get(),
            "message_id": target.message_id.get(),
            "text": truncate_utf16(text, TELEGRAM_MAX_TEXT_LEN),
        });
        if let Some(buttons) = buttons.filter(|buttons| !buttons.is_empty()) {
            body["reply_markup"] = inline_keyboard_json(&buttons);
        }
        // Returns the edited Message, or `true` for inline messages.
        let _: Value = self.call("editMessageText", &body).await?;
        Ok(())
    }

    async fn edit_buttons(
        &self,
        target: MessageRef,
        buttons: Option<InlineKeyboard>,
    ) -> Result<()> {
        let mut body = json!({
            "chat_id": target.chat_id.get(),
            "message_id": target.message_id.get(),
        });
        if let Some(buttons) = buttons.filter(|buttons| !buttons.is_empty()) {
            body["reply_markup"] = inline_keyboard_json(&buttons);
        }
        let _: Value = self.call("editMessageReplyMarkup", &body).await?;
        Ok(())
    }

    async fn create_thread(&self, group: ChatId, title: &str) -> Result<ThreadId> {
        let name = truncate_utf16(title.trim(), TELEGRAM_MAX_TOPIC_NAME_LEN);
        if name.is_empty() {
            return Err(anyhow::anyhow!("topic name is empty"));
        }
        let topic: TelegramForumTopic = self
            .call(
                "createForumTopic",
                &json!({ "chat_id": group.get(), "name": name }),
            )
            .await?;
        if topic.message_thread_id == 0 {
            return Err(anyhow::anyhow!("telegram createForumTopic returned thread id 0"));
        }
        Ok(ThreadId::new(topic.message_thread_id))
    }

    async fn answer_button(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    async fn can_manage_threads(&self, group: ChatId) -> Result<bool> {
        let me = self.identity().await?;
        let member: TelegramChatMember = self
            .call(
                "getChatMember",
                &json!({ "chat_id": group.get(), "user_id": me.id.get() }),
            )
            .await?;
        Ok(member.status == "creator" || member.can_manage_topics.unwrap_or(false))
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;
        let timeout = self.poll_timeout_secs.to_string();

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", timeout.as_str()),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        error = %error.without_url(),
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {}>", error.without_url())
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramEnvelope<Vec<TelegramUpdate>>>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        error = %error.without_url(),
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                for event in build_inbound_events(&update) {
                    tx.send(event)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn truncate_utf16(text: &str, limit: usize) -> String {
    let mut used = 0;
    let mut out = String::with_capacity(text.len().min(limit * 4));
    for ch in text.chars() {
        used += ch.len_utf16();
        if used > limit {
            break;
        }
        out.push(ch);
    }
    out
}

fn inline_keyboard_json(keyboard: &InlineKeyboard) -> Value {
    let rows: Vec<Vec<Value>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| json!({ "text": button.text, "callback_data": button.payload }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

fn reply_markup_json(markup: &ReplyMarkup) -> Value {
    match markup {
        ReplyMarkup::Inline(keyboard) => inline_keyboard_json(keyboard),
        ReplyMarkup::Menu(rows) => {
            let rows: Vec<Vec<Value>> = rows
                .iter()
                .map(|row| row.iter().map(|label| json!({ "text": label })).collect())
                .collect();
            json!({ "keyboard": rows, "resize_keyboard": true })
        }
    }
}

fn build_inbound_events(update: &TelegramUpdate) -> Vec<InboundEvent> {
    let mut inbound = Vec::new();
    if let Some(message) = build_message_inbound(update.message.as_ref()) {
        inbound.push(InboundEvent::Message(message));
    }
    if let Some(press) = build_button_inbound(update.callback_query.as_ref()) {
        inbound.push(InboundEvent::ButtonPress(press));
    }
    inbound
}

fn build_message_inbound(message: Option<&TelegramMessage>) -> Option<InboundMessage> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    let from = message.from.as_ref()?;
    let message_id = message.message_id?;
    let text = extract_message_text(message)?;

    Some(InboundMessage {
        message_id: MessageId::new(message_id),
        chat: ChatRef {
            id: ChatId::new(chat.id),
            kind: ChatKind::parse(&chat.r#type),
        },
        sender: from.to_sender(),
        thread_id: message
            .message_thread_id
            .filter(|id| *id != 0)
            .map(ThreadId::new),
        text,
        is_service: message.is_service(),
        received_at: Utc::now(),
    })
}

fn build_button_inbound(query: Option<&TelegramCallbackQuery>) -> Option<ButtonPress> {
    let query = query?;
    let message = query.message.as_ref().and_then(|message| {
        Some(MessageRef {
            chat_id: ChatId::new(message.chat.as_ref()?.id),
            message_id: MessageId::new(message.message_id?),
        })
    });
    Some(ButtonPress {
        callback_id: query.id.clone(),
        sender: query.from.to_sender(),
        payload: query.data.clone().unwrap_or_default(),
        message,
    })
}

fn extract_message_text(message: &TelegramMessage) -> Option<String> {
    [message.text.as_deref(), message.caption.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    message_thread_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    forum_topic_created: Option<Value>,
    #[serde(default)]
    forum_topic_edited: Option<Value>,
    #[serde(default)]
    forum_topic_closed: Option<Value>,
    #[serde(default)]
    forum_topic_reopened: Option<Value>,
    #[serde(default)]
    new_chat_members: Vec<Value>,
    #[serde(default)]
    left_chat_member: Option<Value>,
    #[serde(default)]
    new_chat_title: Option<String>,
    #[serde(default)]
    pinned_message: Option<Value>,
}

impl TelegramMessage {
    fn is_service(&self) -> bool {
        self.forum_topic_created.is_some()
            || self.forum_topic_edited.is_some()
            || self.forum_topic_closed.is_some()
            || self.forum_topic_reopened.is_some()
            || !self.new_chat_members.is_empty()
            || self.left_chat_member.is_some()
            || self.new_chat_title.is_some()
            || self.pinned_message.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramUser {
    fn to_sender(&self) -> Sender {
        Sender {
            id: UserId::new(self.id),
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct TelegramForumTopic {
    message_thread_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramChatMember {
    status: String,
    #[serde(default)]
    can_manage_topics: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InlineButton;

    fn user(id: i64) -> TelegramUser {
        TelegramUser {
            id,
            first_name: "Ann".to_string(),
            last_name: None,
            username: Some("ann".to_string()),
        }
    }

    fn chat(id: i64, kind: &str) -> TelegramChat {
        TelegramChat {
            id,
            r#type: kind.to_string(),
        }
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn message_text_prefers_text_then_caption_and_drops_media_only() {
        let mut message = TelegramMessage {
            text: Some(" printer broken ".to_string()),
            caption: Some("caption".to_string()),
            ..TelegramMessage::default()
        };
        assert_eq!(
            extract_message_text(&message).as_deref(),
            Some("printer broken"),
            "text should win when present"
        );

        message.text = None;
        assert_eq!(extract_message_text(&message).as_deref(), Some("caption"));

        message.caption = Some("   ".to_string());
        assert_eq!(extract_message_text(&message), None);
    }

    #[test]
    fn topic_message_carries_thread_and_service_flag() {
        let update = TelegramUpdate {
            update_id: 5,
            message: Some(TelegramMessage {
                message_id: Some(77),
                message_thread_id: Some(42),
                from: Some(user(9)),
                chat: Some(chat(-100123, "supergroup")),
                text: Some("on it".to_string()),
                pinned_message: Some(json!({"message_id": 1})),
                ..TelegramMessage::default()
            }),
            callback_query: None,
        };

        let events = build_inbound_events(&update);
        assert_eq!(events.len(), 1);
        let InboundEvent::Message(message) = &events[0] else {
            panic!("expected a message event");
        };
        assert_eq!(message.thread_id, Some(ThreadId::new(42)));
        assert_eq!(message.chat.kind, ChatKind::Supergroup);
        assert_eq!(message.sender.id, UserId::new(9));
        assert!(message.is_service);
        assert!(!message.is_private());
    }

    #[test]
    fn messages_without_sender_or_text_are_skipped() {
        let anonymous = TelegramMessage {
            message_id: Some(1),
            chat: Some(chat(1, "private")),
            text: Some("hi".to_string()),
            ..TelegramMessage::default()
        };
        assert!(build_message_inbound(Some(&anonymous)).is_none());

        let topic_created = TelegramMessage {
            message_id: Some(2),
            from: Some(user(1)),
            chat: Some(chat(-100, "supergroup")),
            forum_topic_created: Some(json!({"name": "Ticket #1"})),
            ..TelegramMessage::default()
        };
        assert!(build_message_inbound(Some(&topic_created)).is_none());
    }

    #[test]
    fn callback_query_becomes_button_press_with_message_ref() {
        let update = TelegramUpdate {
            update_id: 6,
            message: None,
            callback_query: Some(TelegramCallbackQuery {
                id: "cb-1".to_string(),
                from: user(3),
                message: Some(TelegramMessage {
                    message_id: Some(500),
                    chat: Some(chat(-100, "supergroup")),
                    ..TelegramMessage::default()
                }),
                data: Some("\u{c}take:7".to_string()),
            }),
        };

        let events = build_inbound_events(&update);
        let InboundEvent::ButtonPress(press) = &events[0] else {
            panic!("expected a button press");
        };
        assert_eq!(press.callback_id, "cb-1");
        assert_eq!(press.payload, "\u{c}take:7");
        assert_eq!(
            press.message,
            Some(MessageRef {
                chat_id: ChatId::new(-100),
                message_id: MessageId::new(500),
            })
        );
    }

    #[test]
    fn update_envelope_parses_bot_api_json() {
        let raw = r#"{"ok":true,"result":[{"update_id":10,"message":{"message_id":1,
            "from":{"id":5,"is_bot":false,"first_name":"Ann"},
            "chat":{"id":5,"type":"private"},"date":0,"text":"hello"}}]}"#;
        let parsed: TelegramEnvelope<Vec<TelegramUpdate>> =
            serde_json::from_str(raw).expect("parse envelope");
        let updates = parsed.result.expect("result");
        assert_eq!(updates.len(), 1);
        let events = build_inbound_events(&updates[0]);
        let InboundEvent::Message(message) = &events[0] else {
            panic!("expected a message event");
        };
        assert!(message.is_private());
        assert_eq!(message.text, "hello");

        let failed: TelegramEnvelope<Value> = serde_json::from_str(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )
        .expect("parse error envelope");
        assert!(!failed.ok);
        assert_eq!(failed.error_code, Some(400));
        assert!(failed.result.is_none());
    }

    #[test]
    fn markup_serializes_to_bot_api_shape() {
        let keyboard = InlineKeyboard::new(vec![vec![
            InlineButton::new("Take", "take:7"),
            InlineButton::new("Close", "close:7"),
        ]]);
        assert_eq!(
            inline_keyboard_json(&keyboard),
            json!({"inline_keyboard": [[
                {"text": "Take", "callback_data": "take:7"},
                {"text": "Close", "callback_data": "close:7"}
            ]]})
        );

        let menu = ReplyMarkup::Menu(vec![vec!["New ticket".to_string()]]);
        assert_eq!(
            reply_markup_json(&menu),
            json!({"keyboard": [[{"text": "New ticket"}]], "resize_keyboard": true})
        );
    }

    #[test]
    fn truncation_respects_utf16_limit() {
        assert_eq!(truncate_utf16("abcdef", 4), "abcd");
        // Each emoji is two UTF-16 units.
        assert_eq!(truncate_utf16("🟢🟢🟢", 5), "🟢🟢");
        assert_eq!(truncate_utf16("short", 128), "short");
    }
}
