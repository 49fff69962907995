//! Development harness for the forwarding bridge
//!
//! Runs the adapter against the in-memory downstream and a set of simulated
//! upstream clients that only send within their announced credit.
//!
//! Usage:
//!   bridge_dev --clients 4 --messages 500
//!   bridge_dev --config config/bridge.toml --drop-downstream-after 200

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use telemetry_bridge::{
    flow_control_address, BridgeConfig, BusMessage, BusNotifier, ForwardingAdapter, LocalBus,
    MemoryConnection, MemoryReceiver, MemorySenderFactory, TelemetryMessage, UpstreamNotice,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bridge_dev")]
#[command(about = "Telemetry bridge development harness")]
#[command(version)]
struct Args {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Number of simulated upstream clients
    #[arg(long, default_value_t = 3)]
    clients: usize,

    /// Messages each client sends
    #[arg(long, default_value_t = 200)]
    messages: usize,

    /// Simulate downstream connection loss after this many milliseconds
    #[arg(long)]
    drop_downstream_after: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => BridgeConfig::from_file(path).map_err(|e| {
            error!("Failed to load configuration: {}", e);
            e
        })?,
        None => {
            let mut config = BridgeConfig::default();
            config.apply_env_overrides();
            config.validate().map_err(|e| anyhow!(e))?;
            config
        }
    };

    info!(
        "Starting {} with {} clients x {} messages (window {})",
        config.bridge.name, args.clients, args.messages, config.downstream.window
    );

    let bus = Arc::new(LocalBus::new());
    let connection = MemoryConnection::new("memory-downstream", config.downstream.window)?;
    let incoming = connection
        .incoming()
        .ok_or_else(|| anyhow!("downstream receivers already taken"))?;

    let adapter = ForwardingAdapter::new(
        config.bridge.clone(),
        Arc::new(MemorySenderFactory::new(connection.clone())),
        Arc::new(BusNotifier::new(bus.clone())),
    );
    adapter.set_downstream_connection(connection.clone());

    let consumers = tokio::spawn(run_downstream(incoming));

    if let Some(after_ms) = args.drop_downstream_after {
        let adapter = adapter.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(after_ms)).await;
            warn!("Simulating downstream connection loss");
            connection.close();
            adapter.on_downstream_connection_lost();
        });
    }

    let mut clients = JoinSet::new();
    for index in 0..args.clients {
        let client_id = format!("client-{}", index);
        let connection_id = format!("upstream-{}", index % 2);
        let target = format!("telemetry/tenant-{}", index % 2);
        let fc_address = flow_control_address(&config.bridge.flow_control_prefix, &client_id);

        // Subscribe before attaching so the initial credit is not missed
        let notices = bus.subscribe(&fc_address);
        if let Err(e) = adapter.attach(
            &connection_id,
            &client_id,
            &target,
            &config.bridge.flow_control_prefix,
        ) {
            warn!("Attach of {} failed: {}", client_id, e);
            bus.unsubscribe(&fc_address);
            continue;
        }

        let client = SimulatedClient {
            adapter: adapter.clone(),
            connection_id,
            client_id,
            messages: args.messages,
        };
        clients.spawn(client.run(notices));
    }

    let mut total_sent = 0;
    while let Some(result) = clients.join_next().await {
        match result {
            Ok(sent) => total_sent += sent,
            Err(e) => error!("Client task failed: {}", e),
        }
    }

    // Let lanes close their senders before the consumers are counted
    tokio::time::sleep(Duration::from_millis(50)).await;
    adapter.on_downstream_connection_lost();
    let received = consumers.await?;

    let snapshot = adapter.metrics_snapshot();
    info!("Upstream sent {} messages, downstream received {}", total_sent, received);
    info!(
        "Attaches: {} ({} failed), links closed: {}",
        snapshot.attach_attempts, snapshot.attach_failures, snapshot.links_closed
    );
    info!(
        "Forwarded: {}, dropped: {}, flow-control notices: {} ({} drain), error notices: {}, notify failures: {}",
        snapshot.messages_forwarded,
        snapshot.messages_dropped,
        snapshot.flow_control_sent,
        snapshot.drain_requests,
        snapshot.error_notices_sent,
        snapshot.notify_failures
    );

    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    if args.json_logs {
        tracing_subscriber::fmt().json().with_max_level(log_level).init();
    } else {
        tracing_subscriber::fmt().with_max_level(log_level).init();
    }

    Ok(())
}

/// Upstream client that honours announced credit and acknowledges drains
struct SimulatedClient {
    adapter: ForwardingAdapter,
    connection_id: String,
    client_id: String,
    messages: usize,
}

impl SimulatedClient {
    async fn run(self, mut notices: mpsc::UnboundedReceiver<BusMessage>) -> usize {
        let mut credit = 0u32;
        let mut sent = 0usize;

        'outer: while sent < self.messages {
            while let Ok(notice) = notices.try_recv() {
                if !self.apply(notice, &mut credit) {
                    break 'outer;
                }
            }

            if credit == 0 {
                match notices.recv().await {
                    Some(notice) => {
                        if !self.apply(notice, &mut credit) {
                            break;
                        }
                    }
                    None => break,
                }
                continue;
            }

            let message = TelemetryMessage::new(format!("reading {}", sent))
                .with_device_id(format!("{}-device", self.client_id));
            if let Err(e) = self.adapter.process_telemetry(message, &self.client_id) {
                if e.is_connection_error() {
                    info!("{} stopping, downstream gone: {}", self.client_id, e);
                } else {
                    warn!("{} could not send: {}", self.client_id, e);
                }
                break;
            }
            credit -= 1;
            sent += 1;

            if sent % 16 == 0 {
                tokio::task::yield_now().await;
            }
        }

        info!("{} finished after {} messages", self.client_id, sent);
        self.adapter.detach(&self.connection_id, &self.client_id);
        sent
    }

    /// Apply one notice; `false` when the link must close
    fn apply(&self, mut notice: BusMessage, credit: &mut u32) -> bool {
        let keep_going = match UpstreamNotice::from_json(&notice.payload) {
            Ok(UpstreamNotice::FlowControl(flow)) => {
                debug!(
                    "{} granted {} credits (drain {})",
                    self.client_id, flow.credits, flow.drain
                );
                *credit = flow.credits;
                true
            }
            Ok(UpstreamNotice::Error(err)) => {
                warn!(
                    "{} told to close link (close-link {})",
                    self.client_id, err.link_must_close
                );
                !err.link_must_close
            }
            Err(e) => {
                warn!("{} received undecodable notice: {}", self.client_id, e);
                true
            }
        };
        notice.ack();
        keep_going
    }
}

/// Consume every downstream link, asking each for a drain halfway through
async fn run_downstream(mut incoming: mpsc::UnboundedReceiver<MemoryReceiver>) -> usize {
    let mut links = JoinSet::new();

    while let Some(receiver) = tokio::select! {
        receiver = incoming.recv() => receiver,
        _ = tokio::time::sleep(Duration::from_secs(2)) => None,
    } {
        links.spawn(consume(receiver));
    }

    let mut received = 0;
    while let Some(result) = links.join_next().await {
        match result {
            Ok(count) => received += count,
            Err(e) => error!("Downstream consumer failed: {}", e),
        }
    }
    received
}

async fn consume(mut receiver: MemoryReceiver) -> usize {
    let mut count = 0;
    while let Some(_message) = receiver.recv().await {
        count += 1;
        if count == 50 {
            receiver.request_drain();
        } else if count == 60 {
            receiver.clear_drain();
        }
        if count % 8 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    debug!("Downstream link {} consumed {} messages", receiver.address(), count);
    count
}
