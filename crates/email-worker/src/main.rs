//! Email worker binary entry point.
//!
//! Usage: email-worker [--host <host>] [--queue <name>] [--log-format json]

use anyhow::Context;
use clap::Parser;
use email_worker::logging::{self, LogConfig, LogFormat};
use email_worker::{SimulatedMailer, Worker, WorkerConfig};
use tokio::sync::watch;
use tracing::{error, info};

/// Email worker: sends order-confirmation emails for tasks queued in RabbitMQ.
#[derive(Parser, Debug)]
#[command(name = "email-worker")]
#[command(about = "Consumes order-confirmation tasks from RabbitMQ")]
struct Args {
    /// Broker host name.
    #[arg(long, env = "RABBIT_HOSTNAME")]
    host: Option<String>,

    /// Queue to consume from. Must already exist.
    #[arg(long, env = "EMAIL_WORKER_QUEUE")]
    queue: Option<String>,

    /// The only producer identity whose messages are processed.
    #[arg(long, env = "EMAIL_WORKER_SENDER")]
    authorized_sender: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(LogConfig {
        default_level: args.log_level.clone(),
        format: args.log_format,
        ..Default::default()
    });

    let mut config = WorkerConfig::from_env().context("failed to load configuration")?;

    // CLI flags win over the environment
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(queue) = args.queue {
        config.queue = queue;
    }
    if let Some(sender) = args.authorized_sender {
        config.authorized_sender = sender;
    }

    info!(
        endpoint = %config.redacted_endpoint(),
        queue = %config.queue,
        consumer_tag = %config.consumer_tag,
        authorized_sender = %config.authorized_sender,
        "Configuration loaded"
    );

    let mailer = SimulatedMailer::from_config(&config);
    let worker = Worker::connect(config, mailer)
        .await
        .context("failed to start worker")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        // Dropping the sender without firing never triggers shutdown
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received shutdown signal, stopping...");
        let _ = shutdown_tx.send(true);
    });

    let stats = worker.run(shutdown_rx).await?;
    info!(handled = stats.total(), "Worker exited");

    Ok(())
}
