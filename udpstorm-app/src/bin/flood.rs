use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use udpstorm::{PacedSender, SenderConfig, UdpBatchSocket};

/// Paced UDP traffic generator.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Destination host.
    #[arg(long, default_value = "127.0.0.1")]
    server: String,

    /// Destination UDP port.
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Target packets per second.
    #[arg(long, default_value_t = 10_000)]
    pps: u64,

    /// How long to send for.
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Datagram size in bytes (at least the 20-byte header).
    #[arg(long, default_value_t = 64)]
    payload: usize,

    /// Datagrams per send call.
    #[arg(long, default_value_t = 64)]
    batch: usize,

    /// Tag shown in log lines.
    #[arg(long, default_value_t = 0)]
    id: u32,

    /// Print a stats line every second.
    #[arg(long)]
    verbose: bool,
}

impl From<Args> for SenderConfig {
    fn from(args: Args) -> Self {
        SenderConfig {
            dest: args.server,
            port: args.port,
            rate_pps: args.pps.max(1),
            duration: Duration::from_secs(args.seconds),
            payload_len: args.payload,
            batch: args.batch.max(1),
            id: args.id,
            verbose: args.verbose,
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let config = SenderConfig::from(Args::parse());
    udpstorm::init_logging(config.verbose);

    let socket = UdpBatchSocket::new(config.batch).context("Failed to create UDP socket")?;
    let target = format!("{}:{}", config.dest, config.port);
    let mut sender = PacedSender::new(socket, config.clone())
        .with_context(|| format!("Failed to connect to {target}"))?;

    let token = sender.cancel_token();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, token.flag())
            .with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }

    info!(
        "[flood {}] sending to {target} at {} pps for {:?}",
        config.id, config.rate_pps, config.duration
    );
    sender.start().context("Failed to spawn send worker")?;
    sender.join();

    info!(
        "[flood {}] done sent={} tx_bytes={}",
        config.id,
        sender.sent(),
        sender.tx_bytes()
    );
    Ok(())
}
