//! Health counters and the Prometheus endpoint
//!
//! Counters and gauges are published through the `metrics` macros; the
//! Prometheus exporter serves them as text on the configured address.
//! `avg_sync_latency_seconds` is an exponentially weighted moving average
//! updated on every successful apply.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ::metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{ErrorKind, Result, SyncError};
use crate::types::Direction;

pub const SYNC_SUCCESS_TOTAL: &str = "sync_success_total";
pub const SYNC_FAILURE_TOTAL: &str = "sync_failure_total";
pub const SYNC_SKIP_TOTAL: &str = "sync_skip_total";
pub const QUEUE_DEPTH: &str = "queue_depth";
pub const POLL_OVERRUNS_TOTAL: &str = "poll_overruns_total";
pub const LEDGER_ENTRIES: &str = "ledger_entries";
pub const AVG_SYNC_LATENCY_SECONDS: &str = "avg_sync_latency_seconds";
pub const PAIR_PAUSED: &str = "pair_paused";

/// EWMA smoothing factor for the latency gauge
const LATENCY_ALPHA: f64 = 0.2;

static LATENCY_EWMA_BITS: AtomicU64 = AtomicU64::new(0);

/// Install the Prometheus recorder serving text format on `addr`
pub fn install(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| SyncError::Config(format!("invalid metrics_addr '{}': {}", addr, e)))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| SyncError::Fatal(format!("cannot start metrics endpoint: {}", e)))?;
    Ok(())
}

/// Count one applied write and fold its latency into the average
pub fn record_success(direction: Direction, latency: Duration) {
    counter!(SYNC_SUCCESS_TOTAL, "direction" => direction.as_str()).increment(1);

    let sample = latency.as_secs_f64();
    let mut current = LATENCY_EWMA_BITS.load(Ordering::Relaxed);
    loop {
        let previous = f64::from_bits(current);
        let next = if previous == 0.0 {
            sample
        } else {
            previous + LATENCY_ALPHA * (sample - previous)
        };
        match LATENCY_EWMA_BITS.compare_exchange_weak(
            current,
            next.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                gauge!(AVG_SYNC_LATENCY_SECONDS).set(next);
                break;
            }
            Err(actual) => current = actual,
        }
    }
}

pub fn record_failure(direction: Direction, kind: ErrorKind) {
    counter!(
        SYNC_FAILURE_TOTAL,
        "direction" => direction.as_str(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

pub fn record_skip(reason: &'static str) {
    counter!(SYNC_SKIP_TOTAL, "reason" => reason).increment(1);
}

pub fn set_queue_depth(depth: u64) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}

pub fn record_poll_overrun() {
    counter!(POLL_OVERRUNS_TOTAL).increment(1);
}

pub fn set_ledger_entries(entries: usize) {
    gauge!(LEDGER_ENTRIES).set(entries as f64);
}

pub fn set_pair_paused(pair: &str, paused: bool) {
    gauge!(PAIR_PAUSED, "pair" => pair.to_string()).set(if paused { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ewma_converges() {
        LATENCY_EWMA_BITS.store(0, Ordering::Relaxed);
        for _ in 0..50 {
            record_success(Direction::SheetToDb, Duration::from_secs(2));
        }
        let avg = f64::from_bits(LATENCY_EWMA_BITS.load(Ordering::Relaxed));
        assert!((avg - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_invalid_metrics_addr_rejected() {
        assert!(install("not-an-addr").is_err());
    }
}
