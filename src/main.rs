//! CLI for popsub-consumer
//!
//! Subcommands:
//! - `consume`: subscribe to a popsub server and print every message received
//! - `demo`: run the same consumer against an in-process broker (useful for
//!   smoke tests without a server)

use std::process::ExitCode;

use clap::Parser;
use popsub_consumer::broker::{MemoryBroker, Message};
use popsub_consumer::config::{Settings, load_config};
use popsub_consumer::consumer::{Consumer, ConsumerConfig};
use popsub_consumer::dispatch::{HandlerError, Verdict};
use popsub_consumer::transport::{Credentials, WebSocketClient};
use popsub_consumer::utils::error::Result;
use popsub_consumer::utils::logging;
use popsub_consumer::utils::signal::wait_for_shutdown_signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "popsub-consumer")]
enum Command {
    /// Subscribe to a popsub server and print every message received
    Consume {
        /// Broker address (overrides `broker.address`)
        #[arg(long)]
        address: Option<String>,
        /// Topic to subscribe to, repeatable (overrides `consumer.topics`)
        #[arg(long = "topic")]
        topics: Vec<String>,
    },
    /// Run the consumer against an in-process broker
    Demo {
        /// Number of messages to publish
        #[arg(long, default_value_t = 3)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Consume { address, topics } => consume(&settings, address, topics).await,
        Command::Demo { count } => demo(&settings, count).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.as_label(), "{e}");
            ExitCode::FAILURE
        }
    }
}

async fn print_message(message: Message) -> std::result::Result<Verdict, HandlerError> {
    println!("Received message: {}", message.payload_str());
    Ok(Verdict::Ack)
}

async fn consume(settings: &Settings, address: Option<String>, topics: Vec<String>) -> Result<()> {
    let mut config = ConsumerConfig::from(settings);
    if let Some(address) = address {
        config.address = address;
    }
    if !topics.is_empty() {
        config.topics = topics;
    }

    let client = WebSocketClient::new(Credentials::from(&settings.broker));
    let consumer = Consumer::new(client, config);
    consumer.connect().await?;
    consumer.run(print_message).await?;
    info!("Waiting for messages. Press Ctrl-C to stop.");

    tokio::select! {
        res = wait_for_shutdown_signal() => {
            if let Err(e) = res {
                warn!("Failed to listen for shutdown signals: {e}");
            }
            info!("Shutdown signal received.");
        }
        _ = consumer.closed() => {}
    }

    consumer.shutdown().await;
    Ok(())
}

async fn demo(settings: &Settings, count: usize) -> Result<()> {
    let broker = MemoryBroker::new();
    let mut config = ConsumerConfig::from(settings);
    config.address = "memory://demo".to_string();
    let topic = config
        .topics
        .first()
        .cloned()
        .unwrap_or_else(|| "News".to_string());

    let consumer = Consumer::new(broker.clone(), config);
    consumer.connect().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .run(move |message: Message| {
            let tx = tx.clone();
            async move {
                println!("Received message: {}", message.payload_str());
                let _ = tx.send(());
                Ok::<_, HandlerError>(Verdict::Ack)
            }
        })
        .await?;

    for n in 1..=count {
        broker.publish(&topic, format!("demo message {n}"));
    }

    let handled = async {
        for _ in 0..count {
            if rx.recv().await.is_none() {
                break;
            }
        }
    };
    tokio::select! {
        _ = handled => info!(count, "All demo messages handled."),
        res = wait_for_shutdown_signal() => {
            if let Err(e) = res {
                warn!("Failed to listen for shutdown signals: {e}");
            }
            info!("Shutdown signal received.");
        }
    }

    consumer.shutdown().await;
    info!(
        acknowledged = broker.acknowledged().len(),
        unacknowledged = consumer.tracker().len(),
        "Demo finished."
    );
    Ok(())
}
