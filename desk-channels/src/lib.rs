//! Transport adapters for the support desk.
//!
//! Adapters are pure I/O: they convert platform updates into `InboundEvent`s and
//! carry outbound sends, edits, thread creation and button acknowledgements.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::Transport;
pub use types::{
    BotIdentity, ButtonPress, ChatId, ChatKind, ChatRef, Delivery, InboundEvent, InboundMessage,
    InlineButton, InlineKeyboard, MessageId, MessageRef, OutboundMessage, ReplyMarkup, Sender,
    ThreadId, UserId,
};
