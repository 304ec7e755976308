use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(ChatId);
id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(ThreadId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "private" => Self::Private,
            "group" => Self::Group,
            "channel" => Self::Channel,
            _ => Self::Supergroup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRef {
    pub id: ChatId,
    pub kind: ChatKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl Sender {
    /// Short handle used in persisted rows: the username when set, otherwise the first name.
    pub fn handle(&self) -> String {
        match self.username.as_deref().map(str::trim) {
            Some(username) if !username.is_empty() => username.to_string(),
            _ => self.first_name.clone(),
        }
    }

    pub fn full_name(&self) -> String {
        match self.last_name.as_deref().map(str::trim) {
            Some(last) if !last.is_empty() => format!("{} {last}", self.first_name),
            _ => self.first_name.clone(),
        }
    }
}

/// Addresses a message that was already delivered, for later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub chat: ChatRef,
    pub sender: Sender,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    pub text: String,
    #[serde(default)]
    pub is_service: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn is_private(&self) -> bool {
        self.chat.kind == ChatKind::Private
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonPress {
    /// Opaque id used to acknowledge the press.
    pub callback_id: String,
    pub sender: Sender,
    pub payload: String,
    /// The message carrying the pressed button, when the platform still knows it.
    #[serde(default)]
    pub message: Option<MessageRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(InboundMessage),
    ButtonPress(ButtonPress),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub payload: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn new(rows: Vec<Vec<InlineButton>>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMarkup {
    /// Buttons attached to the message itself.
    Inline(InlineKeyboard),
    /// Persistent reply keyboard; each label is sent back as plain text when pressed.
    Menu(Vec<Vec<String>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    #[serde(default)]
    pub markup: Option<ReplyMarkup>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            thread_id: None,
            markup: None,
        }
    }

    pub fn in_thread(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_markup(mut self, markup: ReplyMarkup) -> Self {
        self.markup = Some(markup);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub message: MessageRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(username: Option<&str>, last_name: Option<&str>) -> Sender {
        Sender {
            id: UserId::new(1),
            username: username.map(str::to_string),
            first_name: "Ann".to_string(),
            last_name: last_name.map(str::to_string),
        }
    }

    #[test]
    fn handle_prefers_username_and_falls_back_to_first_name() {
        assert_eq!(sender(Some("ann_k"), None).handle(), "ann_k");
        assert_eq!(sender(Some("  "), None).handle(), "Ann");
        assert_eq!(sender(None, None).handle(), "Ann");
    }

    #[test]
    fn full_name_skips_blank_last_name() {
        assert_eq!(sender(None, Some("Kim")).full_name(), "Ann Kim");
        assert_eq!(sender(None, Some("")).full_name(), "Ann");
    }

    #[test]
    fn chat_kind_parses_platform_names() {
        assert_eq!(ChatKind::parse("private"), ChatKind::Private);
        assert_eq!(ChatKind::parse("supergroup"), ChatKind::Supergroup);
        assert_eq!(ChatKind::parse("group"), ChatKind::Group);
    }
}
