//! Prometheus-style text exposition of [`Counters`] over loopback HTTP.

use std::fmt::Write as _;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::counters::Counters;

/// Render every counter with its `# HELP` / `# TYPE` preamble.
pub fn render(counters: &Counters, rate_pps: Option<u64>) -> String {
    let snap = counters.snapshot();
    let mut out = String::with_capacity(768);

    let mut metric = |name: &str, help: &str, kind: &str, value: u64| {
        // Writing to a String cannot fail.
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
        );
    };

    metric(
        "udp_packets_received_total",
        "Total UDP packets received",
        "counter",
        snap.received,
    );
    metric(
        "udp_packets_sent_total",
        "Total UDP packets sent",
        "counter",
        snap.sent,
    );
    metric(
        "udp_unique_clients",
        "Unique client count",
        "gauge",
        snap.unique_clients as u64,
    );
    metric(
        "udp_rx_bytes_total",
        "Total received bytes",
        "counter",
        snap.rx_bytes,
    );
    metric(
        "udp_tx_bytes_total",
        "Total sent bytes",
        "counter",
        snap.tx_bytes,
    );
    if let Some(rate) = rate_pps {
        metric(
            "udp_receive_rate_pps",
            "Packets received during the last full second",
            "gauge",
            rate,
        );
    }
    out
}

/// Loopback-only `/metrics` endpoint. Every connection gets one response,
/// whatever it asked for, and is then closed.
pub struct MetricsExporter {
    listener: TcpListener,
    counters: Arc<Counters>,
    rate: Option<Arc<AtomicU64>>,
}

impl MetricsExporter {
    /// Bind `127.0.0.1:port`. Port 0 picks an ephemeral port; callers that
    /// treat 0 as "disabled" must not call this.
    pub async fn bind(port: u16, counters: Arc<Counters>) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        Ok(Self {
            listener,
            counters,
            rate: None,
        })
    }

    /// Also expose the receiver's one-second rate gauge.
    pub fn with_rate(mut self, rate: Arc<AtomicU64>) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped or aborted.
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("[metrics] serving on http://{addr}/metrics");
        }
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("[metrics] accept failed: {e}");
                    continue;
                }
            };
            let body = render(
                &self.counters,
                self.rate.as_ref().map(|r| r.load(Ordering::Relaxed)),
            );
            tokio::spawn(async move {
                if let Err(e) = respond(stream, body).await {
                    debug!("[metrics] {peer}: {e}");
                }
            });
        }
    }
}

async fn respond(mut stream: TcpStream, body: String) -> io::Result<()> {
    // The request is read only to drain it; its content is not inspected.
    let mut req = [0u8; 1024];
    let _ = stream.read(&mut req).await?;

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await
}
