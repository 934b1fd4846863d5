//! Transport metrics and observability.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Simple counter
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    fn inc(&self, by: u64) {
        self.value.fetch_add(by, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Simple histogram for call round-trip tracking
struct Histogram {
    buckets: Mutex<Vec<(f64, u64)>>, // (upper_bound_ms, count)
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        // 0-10ms, 10-50ms, 50-100ms, 100-500ms, 500ms-1s, 1s+
        let buckets = vec![
            (10.0, 0),
            (50.0, 0),
            (100.0, 0),
            (500.0, 0),
            (1000.0, 0),
            (f64::INFINITY, 0),
        ];
        Self {
            buckets: Mutex::new(buckets),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn record(&self, value: Duration) {
        let millis = value.as_secs_f64() * 1000.0;
        self.sum.fetch_add(value.as_millis() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut buckets = self.buckets.lock();
        for (upper_bound, count) in buckets.iter_mut() {
            if millis <= *upper_bound {
                *count += 1;
                break;
            }
        }
    }

    fn get(&self) -> (u64, u64, Vec<(f64, u64)>) {
        let buckets = self.buckets.lock().clone();
        (
            self.sum.load(Ordering::Relaxed),
            self.count.load(Ordering::Relaxed),
            buckets,
        )
    }

    fn reset(&self) {
        let mut buckets = self.buckets.lock();
        for (_, count) in buckets.iter_mut() {
            *count = 0;
        }
        self.sum.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportMetricsSnapshot {
    pub envelopes_sent: u64,
    pub envelopes_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub call_timeouts: u64,
    pub calls_completed: u64,
}

/// Transport metrics tracker
pub struct TransportMetrics {
    prefix: String,
    envelopes_sent: Counter,
    envelopes_received: Counter,
    bytes_sent: Counter,
    bytes_received: Counter,
    send_failures: Counter,
    call_timeouts: Counter,
    call_rtt: Histogram,
}

impl TransportMetrics {
    /// Create new metrics with prefix
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            envelopes_sent: Counter::new(),
            envelopes_received: Counter::new(),
            bytes_sent: Counter::new(),
            bytes_received: Counter::new(),
            send_failures: Counter::new(),
            call_timeouts: Counter::new(),
            call_rtt: Histogram::new(),
        }
    }

    /// Record one envelope sent, `bytes` being its encoded size
    pub fn record_send(&self, bytes: usize) {
        self.envelopes_sent.inc(1);
        self.bytes_sent.inc(bytes as u64);
    }

    /// Record one envelope received
    pub fn record_recv(&self, bytes: usize) {
        self.envelopes_received.inc(1);
        self.bytes_received.inc(bytes as u64);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.inc(1);
    }

    /// Record a call that ran out of time
    pub fn record_timeout(&self) {
        self.call_timeouts.inc(1);
    }

    /// Record the round trip of a completed call
    pub fn record_rtt(&self, rtt: Duration) {
        self.call_rtt.record(rtt);
    }

    pub fn snapshot(&self) -> TransportMetricsSnapshot {
        let (_, calls_completed, _) = self.call_rtt.get();
        TransportMetricsSnapshot {
            envelopes_sent: self.envelopes_sent.get(),
            envelopes_received: self.envelopes_received.get(),
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            send_failures: self.send_failures.get(),
            call_timeouts: self.call_timeouts.get(),
            calls_completed,
        }
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        let prefix = &self.prefix;

        let counters = [
            ("envelopes_sent_total", "Total envelopes sent", &self.envelopes_sent),
            ("envelopes_received_total", "Total envelopes received", &self.envelopes_received),
            ("bytes_sent_total", "Total encoded bytes sent", &self.bytes_sent),
            ("bytes_received_total", "Total encoded bytes received", &self.bytes_received),
            ("send_failures_total", "Total failed sends", &self.send_failures),
            ("call_timeouts_total", "Total calls without a response in time", &self.call_timeouts),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
            output.push_str(&format!("# TYPE {}_{} counter\n", prefix, name));
            output.push_str(&format!("{}_{} {}\n", prefix, name, counter.get()));
        }

        let (sum, count, buckets) = self.call_rtt.get();
        if count > 0 {
            output.push_str(&format!(
                "# HELP {}_call_rtt_milliseconds Call round-trip time in milliseconds\n",
                prefix
            ));
            output.push_str(&format!(
                "# TYPE {}_call_rtt_milliseconds histogram\n",
                prefix
            ));
            let mut cumulative = 0;
            for (upper_bound, bucket) in buckets {
                cumulative += bucket;
                let le = if upper_bound.is_infinite() {
                    "+Inf".to_string()
                } else {
                    format!("{}", upper_bound)
                };
                output.push_str(&format!(
                    "{}_call_rtt_milliseconds_bucket{{le=\"{}\"}} {}\n",
                    prefix, le, cumulative
                ));
            }
            output.push_str(&format!("{}_call_rtt_milliseconds_sum {}\n", prefix, sum));
            output.push_str(&format!("{}_call_rtt_milliseconds_count {}\n", prefix, count));
        }

        output
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.envelopes_sent.reset();
        self.envelopes_received.reset();
        self.bytes_sent.reset();
        self.bytes_received.reset();
        self.send_failures.reset();
        self.call_timeouts.reset();
        self.call_rtt.reset();
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new("rse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = TransportMetrics::new("test");
        metrics.record_send(100);
        metrics.record_recv(200);
        metrics.record_send_failure();
        metrics.record_timeout();

        let prom = metrics.export_prometheus();
        assert!(prom.contains("test_envelopes_sent_total 1"));
        assert!(prom.contains("test_bytes_sent_total 100"));
        assert!(prom.contains("test_bytes_received_total 200"));
        assert!(prom.contains("test_send_failures_total 1"));
        assert!(prom.contains("test_call_timeouts_total 1"));
    }

    #[test]
    fn test_rtt_recording() {
        let metrics = TransportMetrics::new("test");
        metrics.record_rtt(Duration::from_millis(5));
        metrics.record_rtt(Duration::from_millis(200));

        let prom = metrics.export_prometheus();
        assert!(prom.contains("test_call_rtt_milliseconds_count 2"));
        assert!(prom.contains("test_call_rtt_milliseconds_bucket{le=\"10\"} 1"));
        assert!(prom.contains("test_call_rtt_milliseconds_bucket{le=\"+Inf\"} 2"));
        assert_eq!(metrics.snapshot().calls_completed, 2);

        metrics.reset();
        assert_eq!(metrics.snapshot(), TransportMetricsSnapshot::default());
    }
}
