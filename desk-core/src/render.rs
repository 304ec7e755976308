//! User- and staff-facing texts and keyboards.
//!
//! Everything that depends on ticket state is rendered from a `Ticket` value, so a
//! re-render after a transition always matches what the store holds.

use crate::model::{Origin, Ticket, TicketAction, TicketMessage, TicketStatus};
use crate::payload::ButtonAction;
use chrono::{DateTime, Utc};
use desk_channels::{InlineButton, InlineKeyboard, ReplyMarkup, Sender};

pub const MENU_NEW_TICKET: &str = "🆕 New ticket";
pub const MENU_CLOSE_TICKET: &str = "✖️ Close ticket";
pub const MENU_MY_TICKETS: &str = "📋 My tickets";

const BUTTON_TAKE: &str = "✅ Take";
const BUTTON_CLOSE: &str = "❌ Close";
const BUTTON_BACK_TO_MENU: &str = "← Back";
const BUTTON_BACK_TO_LIST: &str = "← Back to list";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn status_emoji(status: TicketStatus) -> &'static str {
    match status {
        TicketStatus::Open => "🟢",
        TicketStatus::InProgress => "🟡",
        TicketStatus::Closed => "🔴",
    }
}

pub fn status_label(status: TicketStatus) -> String {
    let name = match status {
        TicketStatus::Open => "Open",
        TicketStatus::InProgress => "In progress",
        TicketStatus::Closed => "Closed",
    };
    format!("{} {name}", status_emoji(status))
}

pub fn menu_markup() -> ReplyMarkup {
    ReplyMarkup::Menu(vec![
        vec![MENU_NEW_TICKET.to_string()],
        vec![MENU_CLOSE_TICKET.to_string()],
        vec![MENU_MY_TICKETS.to_string()],
    ])
}

pub fn welcome() -> String {
    "🛠️ Welcome to support!\n\n\
     Describe your problem in a message to open a ticket, or look through your previous tickets."
        .to_string()
}

pub fn menu_prompt() -> String {
    "Choose an action:".to_string()
}

pub fn help(group_link: Option<&str>) -> String {
    let mut text = String::from(
        "ℹ️ How this works:\n\n\
         1. Send a message describing your problem to open a ticket\n\
         2. A discussion thread is opened for it in the support group\n\
         3. Your follow-up messages are added to the same ticket\n\
         4. Staff replies arrive here, in this chat",
    );
    if let Some(link) = group_link {
        text.push_str(&format!("\n\nSupport group: {link}"));
    }
    text
}

pub fn ticket_title(sender: &Sender) -> String {
    format!("Request from {}", sender.first_name.trim())
}

pub fn topic_name(ticket: &Ticket) -> String {
    format!("Ticket #{}: {}", ticket.id, ticket.title)
}

/// Staff card announcing a ticket inside its thread.
pub fn staff_card(ticket: &Ticket, opening_message: &str) -> String {
    format!(
        "🚨 Ticket #{}\n\n\
         📌 {}\n\
         👤 User: {}\n\
         🆔 ID: {}\n\n\
         📝 Message:\n{}\n\n\
         🕒 Created: {}\n\
         🔗 Status: {}",
        ticket.id,
        ticket.title,
        ticket.user_handle,
        ticket.user_id,
        opening_message,
        format_timestamp(ticket.created_at),
        status_label(ticket.status),
    )
}

/// Buttons offered on the staff card for the ticket's current status.
pub fn staff_buttons(ticket: &Ticket) -> Option<InlineKeyboard> {
    let buttons: Vec<InlineButton> = [
        (TicketAction::Take, BUTTON_TAKE),
        (TicketAction::Close, BUTTON_CLOSE),
    ]
    .into_iter()
    .filter(|(action, _)| ticket.status.next(*action).is_some())
    .map(|(action, label)| InlineButton::new(label, ButtonAction::Staff(action, ticket.id).encode()))
    .collect();
    if buttons.is_empty() {
        return None;
    }
    Some(InlineKeyboard::new(vec![buttons]))
}

pub fn forwarded_to_thread(ticket: &Ticket, sender: &Sender, text: &str) -> String {
    format!(
        "📨 New message on ticket #{}\n\n\
         👤 From: {} ({})\n\
         🆔 ID: {}\n\n\
         📝 Message:\n{}",
        ticket.id,
        sender.full_name(),
        sender.handle(),
        sender.id,
        text,
    )
}

pub fn staff_reply(ticket: &Ticket, text: &str) -> String {
    format!("📨 Reply on ticket #{}:\n\n{}", ticket.id, text)
}

pub fn ticket_created(ticket: &Ticket, group_link: Option<&str>) -> String {
    let mut text = format!("✅ Ticket #{} created!\n\n", ticket.id);
    match group_link {
        Some(link) => text.push_str(&format!("Staff will answer in the support group:\n{link}\n\n")),
        None => text.push_str("Staff replies will arrive in this chat.\n\n"),
    }
    text.push_str("All your follow-up messages will be added to this ticket.");
    text
}

pub fn thread_unavailable(ticket: &Ticket, group_link: Option<&str>) -> String {
    let mut text = format!(
        "⚠️ Ticket #{} was saved, but a discussion thread could not be opened for it.",
        ticket.id
    );
    if let Some(link) = group_link {
        text.push_str(&format!("\nPlease contact support directly: {link}"));
    }
    text
}

pub fn message_added(ticket: &Ticket) -> String {
    format!("✅ Your message was added to ticket #{}", ticket.id)
}

pub fn delivery_failed() -> String {
    "❌ Could not deliver your message to support. Please try again later.".to_string()
}

pub fn request_failed() -> String {
    "❌ Something went wrong while processing your request.".to_string()
}

pub fn already_active(ticket: &Ticket) -> String {
    format!(
        "❌ You already have an active ticket #{}\n\n\
         Please wait for a reply from support or close the current ticket.",
        ticket.id
    )
}

pub fn describe_problem() -> String {
    "Send a message describing your problem to open a new ticket.".to_string()
}

pub fn nothing_to_close() -> String {
    "You have no active tickets to close.".to_string()
}

pub fn already_closed(ticket: &Ticket) -> String {
    format!("Ticket #{} is already closed.", ticket.id)
}

pub fn closed_by_user_confirmation(ticket: &Ticket) -> String {
    format!("✅ Ticket #{} closed.", ticket.id)
}

pub fn closed_by_user_notice(ticket: &Ticket, sender: &Sender, at: DateTime<Utc>) -> String {
    format!(
        "⚠️ Ticket #{} was closed by the user\n\n\
         👤 User: {}\n\
         🕒 Closed at: {}",
        ticket.id,
        sender.handle(),
        format_timestamp(at),
    )
}

/// Notice sent to the ticket owner after a staff transition.
pub fn owner_notice(ticket: &Ticket) -> String {
    match ticket.status {
        TicketStatus::InProgress => format!("✅ Your ticket #{} has been taken into work!", ticket.id),
        TicketStatus::Closed => format!(
            "✔️ Your ticket #{} has been closed. Thank you for contacting us!",
            ticket.id
        ),
        TicketStatus::Open => format!("Your ticket #{} is open.", ticket.id),
    }
}

/// Short acknowledgement shown to staff on the pressed button.
pub fn staff_ack(transition_applied: bool, ticket: &Ticket) -> String {
    match (transition_applied, ticket.status) {
        (true, TicketStatus::InProgress) => "Ticket taken into work".to_string(),
        (true, TicketStatus::Closed) => "Ticket closed".to_string(),
        (_, status) => format!("Ticket is already {}", status_label(status)),
    }
}

pub fn no_tickets() -> String {
    "You have no tickets yet.".to_string()
}

pub fn ticket_list(tickets: &[Ticket]) -> (String, InlineKeyboard) {
    let mut rows: Vec<Vec<InlineButton>> = tickets
        .iter()
        .map(|ticket| {
            vec![InlineButton::new(
                format!(
                    "#{} {} - {} {}",
                    ticket.id,
                    ticket.title,
                    status_emoji(ticket.status),
                    ticket.created_at.format("%Y-%m-%d"),
                ),
                ButtonAction::View(ticket.id).encode(),
            )]
        })
        .collect();
    rows.push(vec![InlineButton::new(
        BUTTON_BACK_TO_MENU,
        ButtonAction::Menu.encode(),
    )]);
    ("📋 Your recent tickets:".to_string(), InlineKeyboard::new(rows))
}

pub fn ticket_detail(ticket: &Ticket, history: &[TicketMessage]) -> (String, InlineKeyboard) {
    let mut text = format!(
        "📋 Ticket #{}\n\n\
         📌 Subject: {}\n\
         🕒 Created: {}\n\
         🔍 Status: {}\n\n\
         --- Conversation ---\n\n",
        ticket.id,
        ticket.title,
        format_timestamp(ticket.created_at),
        status_label(ticket.status),
    );
    for message in history {
        let sender = match message.origin {
            Origin::User => "You".to_string(),
            Origin::Staff => format!("Support ({})", message.sender_handle),
        };
        text.push_str(&format!(
            "💬 {sender} [{}]:\n{}\n\n",
            format_timestamp(message.created_at),
            message.text
        ));
    }
    let keyboard = InlineKeyboard::new(vec![vec![InlineButton::new(
        BUTTON_BACK_TO_LIST,
        ButtonAction::List.encode(),
    )]]);
    (text.trim_end().to_string(), keyboard)
}
