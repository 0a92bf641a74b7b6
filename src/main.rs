//! CLI for relaymq
//!
//! Subcommands:
//! - `server`: run the WebSocket server and the redelivery sweeper
//! - `client`: run a smoke client (subscribe, push with acknowledgment, receive)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relaymq::broker::Broker;
use relaymq::config::load_config;
use relaymq::connector::MqClient;
use relaymq::persistence::Persistence;
use relaymq::transport::websocket::start_websocket_server;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "relaymq")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Run the smoke client (connects, subscribes, pushes, receives)
    Client {
        /// WebSocket server URL, defaults to `client.url` from the configuration
        #[arg(long)]
        url: Option<String>,
        /// Queue used for the round trip
        #[arg(long, default_value = "smoke")]
        queue: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {e}");
        }
    }
    relaymq::utils::logging::init_from_env();

    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {}", e);
            }
        }
        Command::Client { url, queue } => {
            if let Err(e) = run_client(url, &queue).await {
                error!("Client failed: {}", e);
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let addr = config.server.address();

    let mut broker = Broker::new().with_default_options(config.queue.clone());
    if config.broker.persistent {
        let persistence = Persistence::new(&config.server.data_dir)?;
        broker = broker.with_persistence(persistence);
    }
    let broker = Arc::new(broker);

    let restored = broker.load_persistent_queues()?;
    if restored > 0 {
        info!(restored, "persistent queues restored");
    }

    let sweeper = broker.start_retry_loop(config.broker.sweep_interval());

    tokio::select! {
        result = start_websocket_server(&addr, broker.clone()) => {
            match result {
                Ok(()) => error!("WebSocket server exited unexpectedly."),
                Err(e) => error!("WebSocket server failed: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.shutdown();
    if let Err(e) = sweeper.await {
        warn!("Redelivery sweeper ended abnormally: {e}");
    }
    Ok(())
}

async fn run_client(url: Option<String>, queue: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let url = url.unwrap_or(config.client.url.clone());
    let mut options = config.client.to_options();
    options.auto_acknowledge = true;

    let (client, mut incoming) = MqClient::connect(&url, options).await?;
    info!(id = ?client.id(), "connected to {url}");

    client.subscribe(queue).await?;
    client.push(queue, "Hello from relaymq", true).await?;
    info!(queue, "push acknowledged");

    match tokio::time::timeout(Duration::from_secs(5), incoming.recv()).await {
        Ok(Some(message)) => println!("Incoming: {}", message.content_str().unwrap_or("<binary>")),
        Ok(None) => warn!("connection closed before a message arrived"),
        Err(_) => warn!("no message received within 5s"),
    }

    client.unsubscribe(queue).await?;
    client.disconnect();
    Ok(())
}
