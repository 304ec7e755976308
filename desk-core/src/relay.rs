//! Relay engine: routes inbound private messages, staff-thread messages and button
//! presses to ticket creation, history appends, forwards and status transitions.
//!
//! Store writes come first; notifications afterwards are best-effort and never undo
//! what was already recorded.

use crate::binder::ThreadBinder;
use crate::error::{DeskError, Result};
use crate::lifecycle::{Admission, TicketLifecycle, Transition, UserSlot};
use crate::model::{
    NewTicket, NewTicketMessage, Origin, Ticket, TicketAction, TicketId, TicketMessage,
    TicketStatus,
};
use crate::payload::{ButtonAction, PayloadError};
use crate::render;
use crate::store::TicketStore;
use desk_channels::{
    ButtonPress, ChatId, Delivery, InboundMessage, MessageRef, OutboundMessage, ReplyMarkup,
    ThreadId, Transport, UserId,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub staff_group: ChatId,
    /// Invite link to the staff group, shown to users.
    pub staff_group_link: Option<String>,
    /// Account the bot runs as; its own group messages are never relayed.
    pub bot_user: UserId,
    pub ticket_list_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    MyTickets,
    /// `/history` lists tickets; `/history <id>` shows one ticket's conversation.
    History(Option<TicketId>),
}

/// Where a private message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Recorded,
    /// The ticket was closed before the message could be attached; nothing was written.
    TicketClosed,
}

pub struct RelayEngine {
    cfg: RelayConfig,
    store: Arc<dyn TicketStore>,
    lifecycle: TicketLifecycle,
    binder: ThreadBinder,
    transport: Arc<dyn Transport>,
}

/// Private chats share their identifier with the user.
fn user_chat(user: UserId) -> ChatId {
    ChatId::new(user.get())
}

impl RelayEngine {
    pub fn new(
        cfg: RelayConfig,
        store: Arc<dyn TicketStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            lifecycle: TicketLifecycle::new(store.clone()),
            binder: ThreadBinder::new(store.clone()),
            cfg,
            store,
            transport,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %message.sender.id, command = ?command))]
    pub async fn on_command(&self, command: Command, message: &InboundMessage) -> Result<()> {
        let chat = message.chat.id;
        match command {
            Command::Start => {
                let welcome = OutboundMessage::text(render::welcome()).with_markup(render::menu_markup());
                self.send(chat, welcome).await?;
                Ok(())
            }
            Command::Help => {
                let help = render::help(self.cfg.staff_group_link.as_deref());
                self.send(chat, OutboundMessage::text(help)).await?;
                Ok(())
            }
            Command::MyTickets | Command::History(None) => {
                self.show_ticket_list(message.sender.id, chat).await
            }
            Command::History(Some(id)) => match self.ticket_detail(message.sender.id, id).await {
                Ok((ticket, history)) => {
                    let (text, keyboard) = render::ticket_detail(&ticket, &history);
                    let detail = OutboundMessage::text(text).with_markup(ReplyMarkup::Inline(keyboard));
                    self.send(chat, detail).await?;
                    Ok(())
                }
                Err(DeskError::NotOwner { .. } | DeskError::TicketNotFound(_)) => {
                    // Same answer for both so ticket ids of other users are not probeable.
                    self.notify(chat, format!("Ticket #{id} not found among your tickets."))
                        .await;
                    Ok(())
                }
                Err(error) => {
                    self.notify(chat, render::request_failed()).await;
                    Err(error)
                }
            },
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %message.sender.id))]
    pub async fn on_private_text(&self, message: &InboundMessage) -> Result<()> {
        match message.text.trim() {
            render::MENU_NEW_TICKET => return self.prompt_new_ticket(message).await,
            render::MENU_CLOSE_TICKET => return self.close_by_user(message).await,
            render::MENU_MY_TICKETS => {
                return self.show_ticket_list(message.sender.id, message.chat.id).await;
            }
            _ => {}
        }

        // Held across check, create and forward so a follow-up message never sees a
        // half-created ticket.
        let slot = self.lifecycle.claim_user(message.sender.id).await;
        loop {
            let active = match self.lifecycle.active_ticket(&slot).await {
                Ok(active) => active,
                Err(error) => {
                    self.notify(message.chat.id, render::request_failed()).await;
                    return Err(error);
                }
            };
            let placement = match active {
                None => self.open_ticket(&slot, message).await?,
                Some(ticket) => self.append_user_message(ticket.id, message).await?,
            };
            // A closed ticket no longer counts as active, so the next pass opens a new one.
            if placement == Placement::Recorded {
                return Ok(());
            }
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(chat_id = %message.chat.id, thread_id = ?message.thread_id)
    )]
    pub async fn on_group_message(&self, message: &InboundMessage) -> Result<()> {
        if message.chat.id != self.cfg.staff_group
            || message.sender.id == self.cfg.bot_user
            || message.is_service
        {
            return Ok(());
        }
        let Some(thread) = message.thread_id else {
            return Ok(());
        };
        let Some(ticket_id) = self.binder.resolve(thread).await? else {
            tracing::debug!(thread_id = %thread, "no ticket bound to thread; dropping message");
            return Ok(());
        };
        let Some(ticket) = self.store.ticket(ticket_id).await? else {
            tracing::warn!(ticket_id = %ticket_id, thread_id = %thread, "bound ticket missing");
            return Ok(());
        };

        self.record(&ticket, message, Origin::Staff).await;
        let reply = OutboundMessage::text(render::staff_reply(&ticket, &message.text));
        self.send(user_chat(ticket.user_id), reply).await?;
        tracing::info!(ticket_id = %ticket.id, "staff reply relayed to user");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %press.sender.id))]
    pub async fn on_button_press(&self, press: &ButtonPress) -> Result<()> {
        let action = match ButtonAction::parse(&press.payload) {
            Ok(action) => action,
            Err(PayloadError::UnknownTag(tag)) => {
                tracing::debug!(%tag, "ignoring unknown button");
                self.ack(press, None).await;
                return Ok(());
            }
            Err(error @ PayloadError::BadTicketId(_)) => {
                tracing::warn!(%error, "rejecting button press");
                self.ack(press, Some(&render::request_failed())).await;
                return Ok(());
            }
        };

        match action {
            ButtonAction::Staff(action, id) => self.on_staff_action(press, action, id).await,
            ButtonAction::View(id) => self.on_view(press, id).await,
            ButtonAction::List => {
                self.ack(press, None).await;
                self.show_ticket_list(press.sender.id, user_chat(press.sender.id))
                    .await
            }
            ButtonAction::Menu => {
                self.ack(press, None).await;
                let menu = OutboundMessage::text(render::menu_prompt()).with_markup(render::menu_markup());
                self.send(user_chat(press.sender.id), menu).await?;
                Ok(())
            }
        }
    }

    /// A ticket and its conversation, released only to the ticket's owner.
    pub async fn ticket_detail(
        &self,
        user: UserId,
        id: TicketId,
    ) -> Result<(Ticket, Vec<TicketMessage>)> {
        let ticket = self
            .store
            .ticket(id)
            .await?
            .ok_or(DeskError::TicketNotFound(id))?;
        if ticket.user_id != user {
            return Err(DeskError::NotOwner { ticket: id, user });
        }
        let history = self.store.ticket_history(id).await?;
        Ok((ticket, history))
    }

    pub async fn user_tickets(&self, user: UserId) -> Result<Vec<Ticket>> {
        self.store
            .user_tickets(user, Some(self.cfg.ticket_list_limit))
            .await
    }

    async fn open_ticket(&self, slot: &UserSlot, message: &InboundMessage) -> Result<Placement> {
        let chat = message.chat.id;
        let draft = NewTicket {
            user_id: message.sender.id,
            user_handle: message.sender.handle(),
            title: render::ticket_title(&message.sender),
            last_message: message.text.clone(),
            created_at: message.received_at,
        };
        let ticket = match self.lifecycle.open_ticket(slot, draft).await {
            Ok(Admission::Created(ticket)) => ticket,
            Ok(Admission::Existing(ticket)) => {
                return self.append_user_message(ticket.id, message).await;
            }
            Err(error) => {
                self.notify(chat, render::request_failed()).await;
                return Err(error);
            }
        };
        self.record(&ticket, message, Origin::User).await;

        let thread = match self.open_thread(&ticket).await {
            Ok(thread) => thread,
            Err(error) => {
                // The ticket stays open; staff can pick it up by hand.
                tracing::warn!(ticket_id = %ticket.id, %error, "could not open discussion thread");
                self.notify(
                    chat,
                    render::thread_unavailable(&ticket, self.cfg.staff_group_link.as_deref()),
                )
                .await;
                return Ok(Placement::Recorded);
            }
        };
        self.announce(&ticket, thread, &message.text).await;

        let confirmation =
            OutboundMessage::text(render::ticket_created(&ticket, self.cfg.staff_group_link.as_deref()))
                .with_markup(render::menu_markup());
        self.send(chat, confirmation).await?;
        Ok(Placement::Recorded)
    }

    async fn open_thread(&self, ticket: &Ticket) -> Result<ThreadId> {
        let thread = self
            .transport
            .create_thread(self.cfg.staff_group, &render::topic_name(ticket))
            .await
            .map_err(DeskError::transport)?;
        self.binder.bind(ticket.id, thread).await?;
        Ok(thread)
    }

    /// Post the staff card with its status buttons into a fresh thread.
    async fn announce(&self, ticket: &Ticket, thread: ThreadId, opening_message: &str) {
        let mut card =
            OutboundMessage::text(render::staff_card(ticket, opening_message)).in_thread(thread);
        if let Some(buttons) = render::staff_buttons(ticket) {
            card = card.with_markup(ReplyMarkup::Inline(buttons));
        }
        match self.transport.send(self.cfg.staff_group, card).await {
            Ok(delivery) => {
                if let Err(error) = self
                    .store
                    .set_card_message(ticket.id, delivery.message.message_id)
                    .await
                {
                    tracing::warn!(ticket_id = %ticket.id, %error, "could not record staff card");
                }
            }
            Err(error) => {
                tracing::warn!(ticket_id = %ticket.id, %error, "staff card delivery failed");
            }
        }
    }

    /// Append a follow-up to a ticket the user slot found active. Callers hold the
    /// user slot; the ticket slot taken here keeps a close from landing mid-append.
    async fn append_user_message(
        &self,
        id: TicketId,
        message: &InboundMessage,
    ) -> Result<Placement> {
        let chat = message.chat.id;
        let _ticket_slot = self.lifecycle.claim_ticket(id).await;
        let ticket = match self.store.ticket(id).await {
            Ok(Some(ticket)) if ticket.status != TicketStatus::Closed => ticket,
            Ok(_) => {
                tracing::info!(ticket_id = %id, "ticket closed before the message landed");
                return Ok(Placement::TicketClosed);
            }
            Err(error) => {
                self.notify(chat, render::request_failed()).await;
                return Err(error);
            }
        };
        if let Err(error) = self.store.update_last_message(ticket.id, &message.text).await {
            self.notify(chat, render::request_failed()).await;
            return Err(error);
        }
        self.record(&ticket, message, Origin::User).await;

        let Some(thread) = ticket.thread_id else {
            tracing::warn!(ticket_id = %ticket.id, "ticket has no bound thread; cannot forward");
            self.notify(chat, render::delivery_failed()).await;
            return Ok(Placement::Recorded);
        };
        let forward = OutboundMessage::text(render::forwarded_to_thread(
            &ticket,
            &message.sender,
            &message.text,
        ))
        .in_thread(thread);
        if let Err(error) = self.send(self.cfg.staff_group, forward).await {
            self.notify(chat, render::delivery_failed()).await;
            return Err(error);
        }
        self.send(chat, OutboundMessage::text(render::message_added(&ticket)))
            .await?;
        Ok(Placement::Recorded)
    }

    async fn prompt_new_ticket(&self, message: &InboundMessage) -> Result<()> {
        let text = match self.store.active_ticket_for_user(message.sender.id).await {
            Ok(Some(active)) => render::already_active(&active),
            Ok(None) => render::describe_problem(),
            Err(error) => {
                self.notify(message.chat.id, render::request_failed()).await;
                return Err(error);
            }
        };
        self.send(message.chat.id, OutboundMessage::text(text)).await?;
        Ok(())
    }

    async fn close_by_user(&self, message: &InboundMessage) -> Result<()> {
        let chat = message.chat.id;
        let user_slot = self.lifecycle.claim_user(message.sender.id).await;
        let active = match self.lifecycle.active_ticket(&user_slot).await {
            Ok(active) => active,
            Err(error) => {
                self.notify(chat, render::request_failed()).await;
                return Err(error);
            }
        };
        let Some(active) = active else {
            self.send(chat, OutboundMessage::text(render::nothing_to_close()))
                .await?;
            return Ok(());
        };

        let ticket_slot = self.lifecycle.claim_ticket(active.id).await;
        let transition = match self.lifecycle.apply(&ticket_slot, TicketAction::Close).await {
            Ok(transition) => transition,
            Err(error) => {
                self.notify(chat, render::request_failed()).await;
                return Err(error);
            }
        };
        let ticket = match transition {
            Transition::Applied { ticket, .. } => ticket,
            Transition::Unchanged(ticket) => {
                self.send(chat, OutboundMessage::text(render::already_closed(&ticket)))
                    .await?;
                return Ok(());
            }
        };

        if let Some(thread) = ticket.thread_id {
            let notice = OutboundMessage::text(render::closed_by_user_notice(
                &ticket,
                &message.sender,
                message.received_at,
            ))
            .in_thread(thread);
            if let Err(error) = self.send(self.cfg.staff_group, notice).await {
                tracing::warn!(ticket_id = %ticket.id, %error, "close notice to staff failed");
            }
        }
        if let Some(card) = ticket.card_message_id {
            let card = MessageRef {
                chat_id: self.cfg.staff_group,
                message_id: card,
            };
            self.rerender_card(&ticket, card).await;
        }
        drop(ticket_slot);

        let confirmation = OutboundMessage::text(render::closed_by_user_confirmation(&ticket))
            .with_markup(render::menu_markup());
        self.send(chat, confirmation).await?;
        Ok(())
    }

    async fn on_staff_action(
        &self,
        press: &ButtonPress,
        action: TicketAction,
        id: TicketId,
    ) -> Result<()> {
        let Some(card) = press
            .message
            .filter(|card| card.chat_id == self.cfg.staff_group)
        else {
            tracing::warn!(ticket_id = %id, ?action, "staff action pressed outside the staff group");
            self.ack(press, Some(&render::request_failed())).await;
            return Ok(());
        };

        // Held across the transition and its staff-side effects so concurrent presses
        // on one ticket observe each other's outcome.
        let slot = self.lifecycle.claim_ticket(id).await;
        let transition = match self.lifecycle.apply(&slot, action).await {
            Ok(transition) => transition,
            Err(DeskError::TicketNotFound(_)) => {
                self.ack(press, Some("Ticket not found")).await;
                return Ok(());
            }
            Err(error) => {
                self.ack(press, Some(&render::request_failed())).await;
                return Err(error);
            }
        };

        let applied = matches!(transition, Transition::Applied { .. });
        if applied {
            let ticket = transition.ticket();
            self.notify(user_chat(ticket.user_id), render::owner_notice(ticket))
                .await;
            self.rerender_card(ticket, card).await;
        }
        drop(slot);

        self.ack(press, Some(&render::staff_ack(applied, transition.ticket())))
            .await;
        Ok(())
    }

    async fn on_view(&self, press: &ButtonPress, id: TicketId) -> Result<()> {
        match self.ticket_detail(press.sender.id, id).await {
            Ok((ticket, history)) => {
                let (text, keyboard) = render::ticket_detail(&ticket, &history);
                let detail = OutboundMessage::text(text).with_markup(ReplyMarkup::Inline(keyboard));
                if let Err(error) = self.send(user_chat(press.sender.id), detail).await {
                    self.ack(press, Some("Could not send the ticket history")).await;
                    return Err(error);
                }
                self.ack(press, None).await;
                Ok(())
            }
            Err(DeskError::NotOwner { ticket, user }) => {
                tracing::warn!(ticket_id = %ticket, user_id = %user, "detail view denied");
                self.ack(press, Some("This is not your ticket")).await;
                Ok(())
            }
            Err(DeskError::TicketNotFound(_)) => {
                self.ack(press, Some("Ticket not found")).await;
                Ok(())
            }
            Err(error) => {
                self.ack(press, Some(&render::request_failed())).await;
                Err(error)
            }
        }
    }

    async fn show_ticket_list(&self, user: UserId, chat: ChatId) -> Result<()> {
        let tickets = match self.user_tickets(user).await {
            Ok(tickets) => tickets,
            Err(error) => {
                self.notify(chat, render::request_failed()).await;
                return Err(error);
            }
        };
        let message = if tickets.is_empty() {
            OutboundMessage::text(render::no_tickets())
        } else {
            let (text, keyboard) = render::ticket_list(&tickets);
            OutboundMessage::text(text).with_markup(ReplyMarkup::Inline(keyboard))
        };
        self.send(chat, message).await?;
        Ok(())
    }

    /// Rewrite the staff card from current ticket state.
    async fn rerender_card(&self, ticket: &Ticket, card: MessageRef) {
        let opening = self.opening_message(ticket).await;
        let text = render::staff_card(ticket, &opening);
        let buttons = render::staff_buttons(ticket);
        if let Err(error) = self.transport.edit_text(card, &text, buttons.clone()).await {
            tracing::warn!(ticket_id = %ticket.id, %error, "card edit failed; updating buttons only");
            if let Err(error) = self.transport.edit_buttons(card, buttons).await {
                tracing::warn!(ticket_id = %ticket.id, %error, "card buttons edit failed");
            }
        }
    }

    async fn opening_message(&self, ticket: &Ticket) -> String {
        match self.store.ticket_history(ticket.id).await {
            Ok(history) => history
                .into_iter()
                .find(|message| message.origin == Origin::User)
                .map(|message| message.text)
                .unwrap_or_else(|| ticket.last_message.clone()),
            Err(error) => {
                tracing::warn!(ticket_id = %ticket.id, %error, "history unavailable for card");
                ticket.last_message.clone()
            }
        }
    }

    async fn record(&self, ticket: &Ticket, message: &InboundMessage, origin: Origin) {
        let row = NewTicketMessage {
            ticket_id: ticket.id,
            origin_message_id: message.message_id,
            sender_id: message.sender.id,
            sender_handle: message.sender.handle(),
            text: message.text.clone(),
            created_at: message.received_at,
            origin,
        };
        if let Err(error) = self.store.append_message(&row).await {
            tracing::warn!(ticket_id = %ticket.id, ?origin, %error, "could not record message");
        }
    }

    async fn send(&self, chat: ChatId, message: OutboundMessage) -> Result<Delivery> {
        self.transport
            .send(chat, message)
            .await
            .map_err(DeskError::transport)
    }

    async fn notify(&self, chat: ChatId, text: String) {
        if let Err(error) = self.send(chat, OutboundMessage::text(text)).await {
            tracing::warn!(chat_id = %chat, %error, "notice delivery failed");
        }
    }

    async fn ack(&self, press: &ButtonPress, text: Option<&str>) {
        if let Err(error) = self.transport.answer_button(&press.callback_id, text).await {
            tracing::debug!(%error, "button acknowledgement failed");
        }
    }
}
