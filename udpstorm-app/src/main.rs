use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use udpstorm::metrics::MetricsExporter;
use udpstorm::{AdmissionReceiver, ReceiverConfig, UdpBatchSocket};

/// Batched UDP receiver with client admission control.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to listen on.
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Datagrams per receive call.
    #[arg(long, default_value_t = 64)]
    batch: usize,

    /// Loopback TCP port for /metrics (0 disables it).
    #[arg(long, default_value_t = 9100)]
    metrics_port: u16,

    /// Maximum number of distinct clients served.
    #[arg(long, default_value_t = 1024)]
    max_clients: usize,

    /// Send served datagrams back to their source.
    #[arg(long)]
    echo: bool,

    /// Set SO_REUSEPORT so several receivers can share the port.
    #[arg(long)]
    reuseport: bool,

    /// Print a stats line every second (default).
    #[arg(long, overrides_with = "quiet")]
    verbose: bool,

    /// Only print warnings and errors.
    #[arg(long, overrides_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn config(&self) -> ReceiverConfig {
        ReceiverConfig {
            port: self.port,
            batch: self.batch.max(1),
            echo: self.echo,
            reuse_port: self.reuseport,
            verbose: self.verbose || !self.quiet,
            metrics_port: self.metrics_port,
            max_clients: self.max_clients,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = args.config();
    udpstorm::init_logging(config.verbose);

    let socket = UdpBatchSocket::new(config.batch).context("Failed to create UDP socket")?;
    let mut receiver = AdmissionReceiver::new(socket, config.clone())
        .with_context(|| format!("Failed to set up receiver on port {}", config.port))?;

    let metrics = if config.metrics_port != 0 {
        let exporter = MetricsExporter::bind(config.metrics_port, receiver.counters())
            .await
            .with_context(|| format!("Failed to bind metrics port {}", config.metrics_port))?
            .with_rate(receiver.rate_gauge());
        Some(tokio::spawn(exporter.serve()))
    } else {
        None
    };

    let token = receiver.cancel_token();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, token.flag())
            .with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }

    receiver.start().context("Failed to spawn receive worker")?;
    info!(
        "[udpstorm] listening on udp/{} batch={} echo={} max_clients={}",
        config.port, config.batch, config.echo, config.max_clients
    );

    while !token.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    receiver.stop();
    if let Some(task) = metrics {
        task.abort();
    }

    let snap = receiver.counters().snapshot();
    if snap.received == 0 {
        warn!("[udpstorm] no datagrams received");
    }
    info!("[udpstorm] final {snap}");

    Ok(())
}
