pub mod api;
pub mod backoff;
pub mod clarification;
pub mod commands;
pub mod connection;
pub mod event_log;
pub mod loop_events;
pub mod protocol;
pub mod settings;
pub mod state;
pub mod status;
pub mod terminal;
pub mod transport;

#[cfg(test)]
mod tests;

pub use api::{BackendClient, PipelineOutcome};
pub use backoff::ReconnectPolicy;
pub use clarification::{ClarificationSession, ClarificationTracker};
pub use connection::{ConnectionManager, StatusSink};
pub use settings::{ClientSettings, SettingsStore};
pub use state::{PipelineSnapshot, PipelineStore};
pub use status::PipelineStatus;

use commands::AppContext;
use std::sync::Arc;
use terminal::Input;
use tokio::io::{AsyncBufReadExt, BufReader};

fn load_settings() -> SettingsStore {
    let loaded = SettingsStore::default_path().and_then(SettingsStore::load);
    let store = match loaded {
        Ok(store) => store,
        Err(e) => {
            log::warn!("Failed to load settings, using defaults: {}", e);
            SettingsStore::in_memory(ClientSettings::default())
        }
    };
    store.with_env_override()
}

/// Print store changes until the store goes away.
async fn print_changes(store: PipelineStore) {
    let mut rx = store.subscribe();
    let mut rendered = terminal::Rendered::of(&rx.borrow_and_update());
    while rx.changed().await.is_ok() {
        // The borrow holds the store's read lock; release it before awaiting.
        let next = rx.borrow_and_update();
        for line in terminal::describe_changes(&rendered, &next) {
            println!("{}", line);
        }
        rendered = terminal::Rendered::of(&next);
    }
}

/// Handle one input line. Returns false when the user asked to quit.
async fn handle_input(ctx: &AppContext, input: Input) -> bool {
    let result = match input {
        Input::Quit => return false,
        Input::Empty => Ok(()),
        Input::Help => {
            println!("{}", terminal::HELP);
            Ok(())
        }
        Input::Unknown(line) => {
            println!("Unknown command '{}'. Type :help for commands.", line);
            Ok(())
        }
        Input::ShowStatus => {
            for line in terminal::describe_snapshot(&ctx.store.snapshot()) {
                println!("{}", line);
            }
            Ok(())
        }
        Input::Reset => {
            ctx.store.reset();
            Ok(())
        }
        Input::SetUrl(url) => commands::config::set_server_url(ctx, &url).map(|_| ()),
        Input::Health => commands::pipeline::check_health(ctx).await.map(|report| {
            println!(
                "server {}: {} ({} status listeners)",
                ctx.backend().base_url(),
                report.status,
                report
                    .ws_connections
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".to_string())
            );
        }),
        Input::Text(text) if ctx.store.live_clarification().is_some() => {
            commands::pipeline::answer_clarification(ctx, &text)
                .await
                .map(|_| ())
        }
        Input::Text(text) => commands::pipeline::submit_text(ctx, &text).await.map(|_| ()),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
    }
    true
}

async fn run_terminal(ctx: AppContext, manager: Arc<ConnectionManager>) {
    let url_settings = ctx.settings.clone();
    let provider: connection::UrlProvider = Arc::new(move || url_settings.server_url());
    let sink: Arc<dyn StatusSink> = Arc::new(ctx.store.clone());

    if let Err(e) = manager.start(provider, sink) {
        log::error!("Failed to start status channel: {}", e);
        return;
    }

    let printer = tokio::spawn(print_changes(ctx.store.clone()));

    println!("Server: {}", ctx.settings.server_url());
    println!("{}", terminal::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_input(&ctx, terminal::parse_input(&line)).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    printer.abort();
}

pub fn run() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return;
        }
    };

    let settings = load_settings();
    let store = PipelineStore::new();
    let manager = Arc::new(ConnectionManager::websocket(settings.reconnect_policy()));

    let ctx = match AppContext::from_settings(store, settings) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("Failed to create HTTP client: {}", e);
            return;
        }
    };

    runtime.block_on(run_terminal(ctx, manager));
    log::info!("Shutting down");
}
