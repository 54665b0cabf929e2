use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// What one worker measured during one data-plane session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Messages a fan-out sender discarded because a peer queue was full
    pub messages_dropped: u64,
    pub bytes_transferred: u64,
    pub elapsed_seconds: f64,
}

impl SessionMetrics {
    /// Metrics of a worker that took no part in a case
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn throughput_bps(&self) -> f64 {
        throughput_bps(self.bytes_transferred, self.elapsed_seconds)
    }
}

/// Bits per second for `bytes` moved in `elapsed_seconds`; 0 when nothing elapsed
pub fn throughput_bps(bytes: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds > 0.0 {
        bytes as f64 * 8.0 / elapsed_seconds
    } else {
        0.0
    }
}

/// Counts messages and bytes for one session, timed from the moment the
/// worker processed START.
pub struct ThroughputCalculator {
    start_time: Instant,
    last_activity: Option<Instant>,
    message_count: u64,
    byte_count: u64,
    dropped_count: u64,
}

impl ThroughputCalculator {
    pub fn new(start_time: Instant) -> Self {
        Self {
            start_time,
            last_activity: None,
            message_count: 0,
            byte_count: 0,
            dropped_count: 0,
        }
    }

    /// Record a message moved through the data plane
    pub fn record_message(&mut self, message_size: usize) {
        self.message_count += 1;
        self.byte_count += message_size as u64;
        self.last_activity = Some(Instant::now());
    }

    pub fn record_drop(&mut self) {
        self.dropped_count += 1;
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Time from start to the last recorded message, or to now if none arrived
    fn active_duration(&self) -> Duration {
        let end = self.last_activity.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.start_time)
    }

    /// Metrics for a sender; elapsed runs until the writers drained
    pub fn sender_metrics(&self) -> SessionMetrics {
        SessionMetrics {
            messages_sent: self.message_count,
            messages_received: 0,
            messages_dropped: self.dropped_count,
            bytes_transferred: self.byte_count,
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }

    /// Metrics for a receiver; elapsed ends at the last message received
    pub fn receiver_metrics(&self) -> SessionMetrics {
        SessionMetrics {
            messages_sent: 0,
            messages_received: self.message_count,
            messages_dropped: self.dropped_count,
            bytes_transferred: self.byte_count,
            elapsed_seconds: self.active_duration().as_secs_f64(),
        }
    }
}

/// Combined receive side of a pair
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceiveTotals {
    pub messages_received: u64,
    /// Messages the receivers' own queues discarded
    pub messages_dropped: u64,
    pub bytes_transferred: u64,
    /// Longest receiver session; the pair's bytes moved within this window
    pub elapsed_seconds: f64,
}

impl ReceiveTotals {
    pub fn aggregate<'a>(metrics: impl IntoIterator<Item = &'a SessionMetrics>) -> Self {
        metrics
            .into_iter()
            .fold(ReceiveTotals::default(), |mut totals, m| {
                totals.messages_received += m.messages_received;
                totals.messages_dropped += m.messages_dropped;
                totals.bytes_transferred += m.bytes_transferred;
                totals.elapsed_seconds = totals.elapsed_seconds.max(m.elapsed_seconds);
                totals
            })
    }

    pub fn throughput_bps(&self) -> f64 {
        throughput_bps(self.bytes_transferred, self.elapsed_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_calculator() {
        let mut calculator = ThroughputCalculator::new(Instant::now());

        calculator.record_message(1024);
        calculator.record_message(2048);
        calculator.record_drop();

        let metrics = calculator.receiver_metrics();
        assert_eq!(metrics.messages_received, 2);
        assert_eq!(metrics.bytes_transferred, 3072);
        assert_eq!(metrics.messages_dropped, 1);
        assert!(metrics.elapsed_seconds >= 0.0);

        let sent = calculator.sender_metrics();
        assert_eq!(sent.messages_sent, 2);
        assert_eq!(sent.messages_received, 0);
    }

    #[test]
    fn test_throughput_is_bits_per_second() {
        assert_eq!(throughput_bps(1000, 2.0), 4000.0);
        assert_eq!(throughput_bps(1000, 0.0), 0.0);
    }

    #[test]
    fn test_receive_totals_use_longest_session() {
        let a = SessionMetrics {
            messages_received: 10,
            bytes_transferred: 640,
            elapsed_seconds: 0.5,
            ..Default::default()
        };
        let b = SessionMetrics {
            messages_received: 6,
            messages_dropped: 4,
            bytes_transferred: 384,
            elapsed_seconds: 2.0,
            ..Default::default()
        };

        let totals = ReceiveTotals::aggregate([&a, &b]);
        assert_eq!(totals.messages_received, 16);
        assert_eq!(totals.messages_dropped, 4);
        assert_eq!(totals.bytes_transferred, 1024);
        assert_eq!(totals.elapsed_seconds, 2.0);
        assert_eq!(totals.throughput_bps(), 1024.0 * 8.0 / 2.0);
    }
}
