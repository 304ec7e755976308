//! deskbot runtime: wires the store, the Telegram transport, the relay engine, the
//! gateway and the retention sweeper.

use crate::config::DeskbotConfig;
use crate::gateway::Gateway;
use anyhow::Result;
use desk_channels::{ChatId, TelegramAdapter, Transport};
use desk_core::{RelayConfig, RelayEngine, SqliteStore, TicketStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_CAPACITY: usize = 1024;

fn open_store(cfg: &DeskbotConfig) -> Result<Arc<dyn TicketStore>> {
    let path = cfg.storage.database_path.trim();
    let store = SqliteStore::open(path)
        .map_err(|e| anyhow::anyhow!("open database {path}: {e}"))?;
    tracing::info!(database_path = %path, "store opened");
    Ok(Arc::new(store))
}

fn build_adapter(cfg: &DeskbotConfig) -> Result<Arc<TelegramAdapter>> {
    Ok(Arc::new(
        TelegramAdapter::new(&cfg.telegram.bot_token)?
            .with_poll_timeout_secs(cfg.telegram.poll_timeout_secs),
    ))
}

/// Warn-only: the bot keeps running without topic rights, ticket creation will report
/// failures to users.
async fn check_group_access(transport: &dyn Transport, group: ChatId) -> bool {
    match transport.can_manage_threads(group).await {
        Ok(true) => {
            tracing::info!(group_id = %group, "bot can manage topics in the staff group");
            true
        }
        Ok(false) => {
            tracing::warn!(
                group_id = %group,
                "bot cannot manage topics in the staff group; make it an admin with topic rights"
            );
            false
        }
        Err(error) => {
            tracing::warn!(group_id = %group, error = %format!("{error:#}"), "staff group access check failed");
            false
        }
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = DeskbotConfig::load_with_path(config_path).await?;
    cfg.validate()?;
    tracing::info!(
        config_path = %path.display(),
        group_id = cfg.support.group_id,
        database_path = %cfg.storage.database_path,
        retention_cap = cfg.storage.retention_cap,
        "config ok"
    );

    let store = open_store(&cfg)?;
    let history_rows = store
        .count_messages()
        .await
        .map_err(|e| anyhow::anyhow!("query database: {e}"))?;
    tracing::info!(history_rows, "store ok");

    let adapter = build_adapter(&cfg)?;
    let identity = adapter
        .identity()
        .await
        .map_err(|e| anyhow::anyhow!("telegram credential check failed: {e:#}"))?;
    tracing::info!(bot_id = %identity.id, bot_username = ?identity.username, "telegram ok");

    if check_group_access(adapter.as_ref(), ChatId::new(cfg.support.group_id)).await {
        tracing::info!("doctor ok");
    } else {
        tracing::warn!("doctor finished with warnings");
    }
    Ok(())
}

pub async fn sweep(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = DeskbotConfig::load_with_path(config_path).await?;
    cfg.validate_storage()?;
    let store = open_store(&cfg)?;
    let removed = desk_core::sweep_once(store.as_ref(), cfg.storage.retention_cap)
        .await
        .map_err(|e| anyhow::anyhow!("retention sweep: {e}"))?;
    tracing::info!(
        config_path = %path.display(),
        removed,
        retention_cap = cfg.storage.retention_cap,
        "sweep finished"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = DeskbotConfig::load_with_path(config_path).await?;
    cfg.validate()?;
    let group = ChatId::new(cfg.support.group_id);
    tracing::info!(
        config_path = %cfg_path.display(),
        group_id = %group,
        group_link_configured = cfg.group_link().is_some(),
        database_path = %cfg.storage.database_path,
        retention_cap = cfg.storage.retention_cap,
        sweep_interval_secs = cfg.storage.sweep_interval_secs,
        max_in_flight = cfg.runtime.max_in_flight,
        poll_timeout_secs = cfg.telegram.poll_timeout_secs,
        "deskbot starting"
    );

    let store = open_store(&cfg)?;
    let adapter = build_adapter(&cfg)?;
    let identity = adapter
        .identity()
        .await
        .map_err(|e| anyhow::anyhow!("telegram credential rejected: {e:#}"))?;
    tracing::info!(bot_id = %identity.id, bot_username = ?identity.username, "bot identity resolved");
    check_group_access(adapter.as_ref(), group).await;

    let transport: Arc<dyn Transport> = adapter;
    let relay = Arc::new(RelayEngine::new(
        RelayConfig {
            staff_group: group,
            staff_group_link: cfg.group_link(),
            bot_user: identity.id,
            ticket_list_limit: cfg.support.ticket_list_limit,
        },
        store.clone(),
        transport.clone(),
    ));

    let shutdown = CancellationToken::new();
    let sweeper_handle = tokio::spawn(desk_core::run_sweeper(
        store.clone(),
        cfg.storage.retention_cap,
        Duration::from_secs(cfg.storage.sweep_interval_secs),
        shutdown.child_token(),
    ));

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let gateway = Arc::new(Gateway::new(
        relay,
        identity.username.clone(),
        cfg.runtime.max_in_flight,
        inbound_rx,
    ));
    let gateway_handle = gateway.start(shutdown.child_token());
    transport.start(inbound_tx).await?;
    tracing::info!(channel = transport.channel_id(), "deskbot serving");

    shutdown_signal(shutdown.clone()).await;

    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    if let Err(e) = sweeper_handle.await {
        tracing::error!(error = %e, "sweeper task join failed during shutdown");
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
