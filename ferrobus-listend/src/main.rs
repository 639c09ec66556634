//! Bus listener daemon.
//!
//! Installs a shared-memory broker under the configured name, creates one
//! subscriber, and forwards every received message as a text line to the
//! listener callback. Stops on SIGINT/SIGTERM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ferrobus::{BrokerType, BusQueue, MessageBroker};
use tracing::{debug, info};

const POP_WAIT: Duration = Duration::from_millis(100);

/// Callback invoked for every message that renders to a non-empty line.
type ListenCallback = dyn Fn(u64, &str, &str) + Send + Sync;

#[derive(Parser)]
#[command(name = "ferrobus-listend")]
#[command(about = "Bridge a shared-memory bus broker to a text listener")]
#[command(version)]
struct Cli {
    /// Shared-memory broker name to install
    #[arg(long, default_value = "SharedMemoryBroker")]
    name: String,

    /// Text prepended to every listener line
    #[arg(long, default_value = "BUS >")]
    pre_text: String,

    /// Listener log level; messages render empty above level 1 and are
    /// skipped
    #[arg(long, default_value_t = 0)]
    log_level: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn listen_to_console(timestamp_ns: u64, pre_text: &str, text: &str) {
    let when = chrono::DateTime::from_timestamp_nanos(timestamp_ns as i64);
    println!("{} {pre_text} {text}", when.format("%Y-%m-%d %H:%M:%S%.3f"));
}

fn listen_loop(cli: &Cli, callback: &ListenCallback, stop: &AtomicBool) {
    let mut broker = ferrobus::create_broker(BrokerType::SharedMemory);
    broker.set_name(&cli.name);
    broker.start();
    info!(name = %cli.name, "Shared memory broker installed");

    let subscriber = broker.create_subscriber();
    subscriber.start();

    while !stop.load(Ordering::Relaxed) {
        if let Some(message) = subscriber.pop_wait(POP_WAIT) {
            let text = message.to_text(cli.log_level);
            if !text.is_empty() {
                callback(message.timestamp(), &cli.pre_text, &text);
            }
        }
    }

    subscriber.stop();
    broker.stop();
    debug!("Listener loop stopped");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    let worker = std::thread::spawn(move || {
        listen_loop(&cli, &listen_to_console, &worker_stop);
    });

    wait_for_shutdown().await;
    info!("Stopping");

    stop.store(true, Ordering::Relaxed);
    let _ = worker.join();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::error!("Failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
