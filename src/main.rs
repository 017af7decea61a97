use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;

use blockwatch::commands::{self, CommandContext};
use blockwatch::config::Config;
use blockwatch::gateway::events::{event, opcode};
use blockwatch::gateway::{GatewayClient, GatewayConfig};
use blockwatch::rest::RestClient;
use blockwatch::state::StateStore;
use blockwatch::watcher::Watcher;

#[derive(Parser)]
#[command(about = "Discord bot that keeps Minecraft server status messages up to date")]
struct Cli {
    /// Path to the JSON configuration file
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blockwatch=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    print_banner(&config);

    let store = Arc::new(StateStore::load(config.state_path.clone()));
    let rest = Arc::new(RestClient::new(
        config.api_base_url.clone(),
        config.bot_token.clone(),
    ));
    let watcher = Watcher::new(
        Arc::clone(&rest),
        Arc::clone(&store),
        Duration::from_secs(config.update_interval_secs),
        Duration::from_secs(config.status_timeout_secs),
    );

    // Resume the previous gateway session if one was persisted.
    let client = GatewayClient::new(
        GatewayConfig {
            url: config.gateway_url.clone(),
            token: config.bot_token.clone(),
            intents: config.intents,
        },
        store.session(),
    );
    let gateway_task = client.start();

    if let Err(e) = client.ready().await {
        tracing::error!("gateway never became ready: {e}");
        std::process::exit(1);
    }
    tracing::info!("gateway ready, session {:?}", client.session().id);

    // Persist the session snapshot on every dispatch frame so a restart
    // can resume where it left off.
    let session_store = Arc::clone(&store);
    let session_client = client.clone();
    client.subscribe_opcodes(vec![opcode::DISPATCH], move |_| {
        let session = session_client.session();
        session_store.update(|state| {
            state.session = session.clone();
        });
    });
    store.update(|state| {
        state.session = client.session();
    });

    watcher.resume_all();

    let ctx = Arc::new(CommandContext {
        rest,
        store: Arc::clone(&store),
        watcher,
        status_timeout: Duration::from_secs(config.status_timeout_secs),
    });
    client.subscribe_events(vec![event::MESSAGE_CREATE.to_string()], move |frame| {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            commands::handle_message(ctx, frame.data).await;
        });
    });

    shutdown_signal().await;
    tracing::info!("shutting down");
    client.shutdown();
    let _ = gateway_task.await;
    store.save();
}

fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");

    eprintln!();
    eprintln!("  \x1b[1;36mblockwatch\x1b[0m \x1b[2mv{version}\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mgateway\x1b[0m      {}", config.gateway_url);
    eprintln!("  \x1b[2mapi\x1b[0m          {}", config.api_base_url);
    eprintln!("  \x1b[2mstate\x1b[0m        {}", config.state_path.display());
    eprintln!(
        "  \x1b[2mupdate every\x1b[0m {}s",
        config.update_interval_secs
    );
    eprintln!();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
