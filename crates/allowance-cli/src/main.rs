//! Allowance CLI - drive the session and transaction layer from a terminal.
//!
//! Useful for checking a backend end to end: fetch a session token, issue an
//! authenticated call, or follow a payment until it settles.

use allowance_core::{
    ApiStatusSource, ClientConfig, PushFeed, PushListener, RequestSpec, ResilientApiClient,
    TrackerOutcome, Transaction, TransactionStatusTracker,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "allowance")]
#[command(about = "Resilient client for the Allowance API")]
struct Args {
    /// Base URL of the API
    #[arg(long, env = "ALLOWANCE_API_URL", default_value = "http://127.0.0.1:8000")]
    base_url: String,

    /// Path that issues session tokens
    #[arg(long)]
    token_path: Option<String>,

    /// Path that reports transaction status
    #[arg(long)]
    status_path: Option<String>,

    /// Attempts per request, including the first
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a session token and print its lifetime
    Token,

    /// Issue one authenticated request and print the response body
    Call {
        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Request path, e.g. /api/ads
        path: String,

        /// JSON body for write requests
        #[arg(long)]
        body: Option<String>,
    },

    /// Follow a payment until it settles or the countdown runs out
    Track {
        /// Transaction id returned by the payment processor
        transaction_id: String,

        /// Amount in minor currency units
        #[arg(long, default_value = "0")]
        amount: u64,

        /// Counterparty shown next to the progress
        #[arg(long, default_value = "")]
        counterparty: String,

        /// Websocket URL of the payment push channel
        #[arg(long)]
        push_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let mut config = ClientConfig::new(&args.base_url);
    if let Some(path) = args.token_path {
        config = config.with_token_path(path);
    }
    if let Some(path) = args.status_path {
        config = config.with_status_path(path);
    }
    if let Some(attempts) = args.max_attempts {
        config = config.with_max_attempts(attempts);
    }

    let client = Arc::new(ResilientApiClient::new(config).context("invalid client configuration")?);

    let result = tokio::select! {
        result = run(client.clone(), args.command) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    };

    client.shutdown();
    result
}

async fn run(client: Arc<ResilientApiClient>, command: Command) -> Result<()> {
    match command {
        Command::Token => {
            let token = client.session().get_token(false).await?;
            println!("token valid for {:?}", token.remaining());
        }
        Command::Call { method, path, body } => {
            let body = body
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--body must be valid JSON")?;
            let spec = match (method.to_ascii_uppercase().as_str(), body) {
                ("GET", _) => RequestSpec::get(path),
                ("DELETE", _) => RequestSpec::delete(path),
                ("POST", body) => RequestSpec::post(path, body.unwrap_or_default()),
                ("PUT", body) => RequestSpec::put(path, body.unwrap_or_default()),
                ("PATCH", body) => RequestSpec::patch(path, body.unwrap_or_default()),
                (other, _) => bail!("unsupported method {}", other),
            };

            match client.call(&spec).await {
                Ok(response) => println!("{}", serde_json::to_string_pretty(&response.body)?),
                Err(e) => {
                    warn!("Request failed: {}", e);
                    bail!(e.user_message());
                }
            }
        }
        Command::Track {
            transaction_id,
            amount,
            counterparty,
            push_url,
        } => {
            track(client, Transaction::new(transaction_id, amount, counterparty), push_url).await?;
        }
    }
    Ok(())
}

async fn track(
    client: Arc<ResilientApiClient>,
    transaction: Transaction,
    push_url: Option<String>,
) -> Result<()> {
    let feed = Arc::new(PushFeed::default());
    let listener = push_url.map(|url| PushListener::new(url, feed.clone()));
    let listener_cancel = listener.as_ref().map(PushListener::cancellation);

    let mut builder =
        TransactionStatusTracker::builder(transaction, Arc::new(ApiStatusSource::new(client)))
            .on_complete(|ok| info!("Payment finished, success = {}", ok));
    if let Some(listener) = listener {
        builder = builder.push_events(feed.subscribe());
        listener.spawn();
    }
    let tracker = builder.start();

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let outcome = loop {
        tokio::select! {
            outcome = tracker.wait() => break outcome,
            _ = ticker.tick() => {
                let progress = tracker.progress();
                println!(
                    "{:>10} {:>3}% {:>4}s left",
                    progress.step.label(),
                    (progress.fraction() * 100.0).round() as u32,
                    progress.remaining.as_secs()
                );
            }
        }
    };

    if let Some(cancel) = listener_cancel {
        cancel.cancel();
    }

    match outcome {
        Some(TrackerOutcome::Succeeded) => {
            println!("payment confirmed");
            Ok(())
        }
        Some(other) => bail!(other.reason().unwrap_or("payment did not complete").to_string()),
        None => bail!("tracking stopped"),
    }
}
