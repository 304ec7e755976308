//! Inbound dispatcher: the transport feeds a single queue, each event is handled on
//! its own task, bounded by a semaphore.

use crate::commands;
use anyhow::Result;
use desk_channels::InboundEvent;
use desk_core::RelayEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Gateway {
    relay: Arc<RelayEngine>,
    bot_username: Option<String>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
}

impl Gateway {
    pub fn new(
        relay: Arc<RelayEngine>,
        bot_username: Option<String>,
        max_in_flight: usize,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            relay,
            bot_username,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                tracing::info!("inbound queue closed");
                break;
            };

            let permit = self.permits.clone().acquire_owned().await?;
            let gateway = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = gateway.dispatch(event).await {
                    tracing::warn!(error = %e, "inbound handler failed");
                }
            });
        }
        self.drain().await;
        Ok(())
    }

    /// Wait for in-flight handlers so their store writes complete before exit.
    async fn drain(&self) {
        let all = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        match tokio::time::timeout(DRAIN_TIMEOUT, self.permits.acquire_many(all)).await {
            Ok(Ok(_)) => tracing::debug!("in-flight handlers drained"),
            Ok(Err(e)) => tracing::warn!(error = %e, "handler semaphore closed"),
            Err(_) => tracing::warn!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "timed out waiting for in-flight handlers"
            ),
        }
    }

    async fn dispatch(&self, event: InboundEvent) -> desk_core::Result<()> {
        match event {
            InboundEvent::ButtonPress(press) => self.relay.on_button_press(&press).await,
            InboundEvent::Message(message) if message.is_private() => {
                if !commands::is_command(&message.text) {
                    return self.relay.on_private_text(&message).await;
                }
                match commands::parse_command(&message.text, self.bot_username.as_deref()) {
                    Some(command) => self.relay.on_command(command, &message).await,
                    None => {
                        tracing::debug!(user_id = %message.sender.id, "ignoring unknown command");
                        Ok(())
                    }
                }
            }
            InboundEvent::Message(message) => {
                // Commands typed in the staff group are for bots, not for users.
                if commands::is_command(&message.text) {
                    return Ok(());
                }
                self.relay.on_group_message(&message).await
            }
        }
    }
}
