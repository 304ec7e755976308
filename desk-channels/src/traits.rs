use crate::types::{
    BotIdentity, ChatId, Delivery, InboundEvent, InlineKeyboard, MessageRef, OutboundMessage,
    ThreadId,
};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique platform identifier: "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving events. Push to tx for each inbound message or button press.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Resolve the account the bot runs as. Fails when the credential is rejected.
    async fn identity(&self) -> Result<BotIdentity>;

    /// Deliver a text message to a chat, optionally inside a discussion thread.
    async fn send(&self, chat_id: ChatId, message: OutboundMessage) -> Result<Delivery>;

    /// Replace the text of a delivered message. `buttons = None` removes its inline keyboard.
    async fn edit_text(
        &self,
        target: MessageRef,
        text: &str,
        buttons: Option<InlineKeyboard>,
    ) -> Result<()>;

    /// Replace only the inline keyboard of a delivered message.
    async fn edit_buttons(&self, target: MessageRef, buttons: Option<InlineKeyboard>)
    -> Result<()>;

    /// Open a new discussion thread in a group and return its identifier.
    async fn create_thread(&self, group: ChatId, title: &str) -> Result<ThreadId>;

    /// Acknowledge a button press, optionally showing a short notice to the presser.
    async fn answer_button(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    /// Whether the bot may create and manage discussion threads in `group`.
    async fn can_manage_threads(&self, _group: ChatId) -> Result<bool> {
        Err(anyhow::anyhow!(
            "thread permission checks are not supported by this channel"
        ))
    }
}
