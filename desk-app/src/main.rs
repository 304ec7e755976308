//! deskbot: support-ticket relay between private chats and staff forum threads.

mod commands;
mod config;
mod gateway;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "deskbot", version, about = "Support-ticket relay bot for Telegram forum groups")]
struct Cli {
    /// Path to the TOML config file (default: ./deskbot.toml).
    #[arg(long, global = true, env = "DESKBOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the bot (default).
    Serve,
    /// Validate config, database access, bot credentials and staff group rights.
    Doctor,
    /// Run one retention pass over the message history and exit.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loaded before tracing so RUST_LOG and DESKBOT_LOG_FORMAT may come from it.
    let dotenv = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();
    if let Some(error) = dotenv_problem(&dotenv) {
        tracing::warn!(%error, "ignoring unreadable .env file");
    }

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Sweep => server::sweep(cli.config).await,
    }
}

/// A missing .env is normal; anything else (bad syntax, unreadable file) is reported.
fn dotenv_problem(result: &dotenvy::Result<PathBuf>) -> Option<&dotenvy::Error> {
    match result {
        Err(error) if !error.not_found() => Some(error),
        _ => None,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,deskbot=debug,desk_app=debug,desk_core=debug,desk_channels=debug")
    });
    let log_format = std::env::var("DESKBOT_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported DESKBOT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dotenv_is_silent() {
        let missing: dotenvy::Result<PathBuf> = Err(dotenvy::Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no .env",
        )));
        assert!(dotenv_problem(&missing).is_none());
        assert!(dotenv_problem(&Ok(PathBuf::from(".env"))).is_none());
    }

    #[test]
    fn malformed_dotenv_is_reported() {
        let malformed: dotenvy::Result<PathBuf> =
            Err(dotenvy::Error::LineParse("TELEGRAM_BOT_TOKEN='abc".to_string(), 19));
        assert!(matches!(
            dotenv_problem(&malformed),
            Some(dotenvy::Error::LineParse(..))
        ));

        let unreadable: dotenvy::Result<PathBuf> = Err(dotenvy::Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        )));
        assert!(dotenv_problem(&unreadable).is_some());
    }
}
