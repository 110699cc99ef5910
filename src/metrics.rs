// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Event apply path --------
pub static EVENTS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_applied_total", "upstream events applied (label: action)"),
        &["action"],
    )
    .unwrap()
});

pub static EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_dropped_total", "upstream events dropped (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static ORDERS_TRACKED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("orders_tracked", "orders held by the ledger").unwrap());

pub static POSITIONS_TRACKED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("positions_tracked", "positions held by the ledger").unwrap());

pub static OFFLINE_BUFFERED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("offline_buffered", "online order events parked until offline complete").unwrap()
});

// -------- Risk evaluation --------
pub static RISK_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("risk_ticks_total", "evaluation ticks").unwrap());

// Tick duration, dispatch -> all users done (milliseconds)
pub static TICK_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("risk_tick_latency_ms", "Evaluation tick latency (ms)")
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
    )
    .unwrap()
});

pub static REPORTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("reports_total", "user reports emitted").unwrap());

pub static SCRIPT_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("script_calls_total", "external call() invocations (label: outcome)"),
        &["outcome"],
    )
    .unwrap()
});

pub static PORTFOLIO_PANICS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("portfolio_eval_panics_total", "portfolio evaluations aborted by a panic").unwrap()
});

pub static PORTFOLIO_LOAD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("portfolio_load_failures_total", "portfolio sections rejected at load").unwrap()
});

pub static PORTFOLIOS_LOADED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("portfolios_loaded", "portfolios loaded per user (label: user)"),
        &["user"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(EVENTS_APPLIED.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(ORDERS_TRACKED.clone())),
        REGISTRY.register(Box::new(POSITIONS_TRACKED.clone())),
        REGISTRY.register(Box::new(OFFLINE_BUFFERED.clone())),
        REGISTRY.register(Box::new(RISK_TICKS.clone())),
        REGISTRY.register(Box::new(TICK_LATENCY.clone())),
        REGISTRY.register(Box::new(REPORTS.clone())),
        REGISTRY.register(Box::new(SCRIPT_CALLS.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_PANICS.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_LOAD_FAILURES.clone())),
        REGISTRY.register(Box::new(PORTFOLIOS_LOADED.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!(%addr, "metrics listening on / and /metrics");
    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(error = %e, "metrics accept error"),
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_encoded() {
        init();
        EVENTS_APPLIED.with_label_values(&["md"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("events_applied_total"));
    }
}
