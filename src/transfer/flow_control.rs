//! Windowed flow control with TCP-like congestion avoidance (4.6.4).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::TransferConfig;

const RTT_SAMPLE_CAP: usize = 20;

/// Semaphore-style chunk admission window with slow-start/congestion-
/// avoidance growth, adaptive chunk sizing, and an RTT sample ring.
pub struct FlowController {
    window: f64,
    min_window: usize,
    max_window: usize,
    ssthresh: f64,
    in_flight: usize,
    send_times: std::collections::HashMap<usize, Instant>,
    rtt_samples: VecDeque<Duration>,
    bandwidth_samples: VecDeque<f64>,
    chunk_size: usize,
    min_chunk_size: usize,
    max_chunk_size: usize,
}

impl FlowController {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            window: config.initial_window as f64,
            min_window: config.min_window,
            max_window: config.max_window,
            ssthresh: config.max_window as f64,
            in_flight: 0,
            send_times: std::collections::HashMap::new(),
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLE_CAP),
            bandwidth_samples: VecDeque::new(),
            chunk_size: config.default_chunk_size,
            min_chunk_size: config.min_chunk_size,
            max_chunk_size: config.max_chunk_size,
        }
    }

    pub fn window(&self) -> usize {
        self.window.round() as usize
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// True if another chunk may be admitted without exceeding the window.
    pub fn can_admit(&self) -> bool {
        self.in_flight < self.window()
    }

    /// Record that `index` was sent, occupying one window slot.
    pub fn on_send(&mut self, index: usize) {
        self.in_flight += 1;
        self.send_times.insert(index, Instant::now());
    }

    /// Record an ACK for `index`: updates RTT/bandwidth samples, releases
    /// the slot, and grows the window per slow-start or congestion
    /// avoidance depending on whether `window < ssthresh`.
    pub fn on_ack(&mut self, index: usize, bytes_acked: usize) {
        let Some(sent_at) = self.send_times.remove(&index) else { return };
        self.in_flight = self.in_flight.saturating_sub(1);

        let rtt = sent_at.elapsed();
        if self.rtt_samples.len() == RTT_SAMPLE_CAP {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);

        if self.window < self.ssthresh {
            self.window += 1.0;
        } else {
            self.window += 1.0 / self.window;
        }
        self.window = self.window.clamp(self.min_window as f64, self.max_window as f64);

        let mean_rtt = self.mean_rtt();
        if mean_rtt > Duration::ZERO {
            let bandwidth = bytes_acked as f64 / mean_rtt.as_secs_f64();
            self.bandwidth_samples.push_back(bandwidth);
            self.adapt_chunk_size();
        }
    }

    /// Congestion signal (e.g. a loss or a fatal error on a chunk):
    /// `ssthresh <- max(window/2, min_window)`, `window <- ssthresh`.
    pub fn on_congestion_signal(&mut self) {
        self.ssthresh = (self.window / 2.0).max(self.min_window as f64);
        self.window = self.ssthresh;
    }

    pub fn mean_rtt(&self) -> Duration {
        if self.rtt_samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.rtt_samples.iter().sum();
        total / self.rtt_samples.len() as u32
    }

    /// Once at least 3 bandwidth samples exist, migrate chunk size toward
    /// `BDP/10` (clamped to bounds) in 1 KiB steps.
    fn adapt_chunk_size(&mut self) {
        if self.bandwidth_samples.len() < 3 {
            return;
        }
        let mean_bandwidth: f64 = self.bandwidth_samples.iter().sum::<f64>() / self.bandwidth_samples.len() as f64;
        let bdp = mean_bandwidth * self.mean_rtt().as_secs_f64();
        let target = ((bdp / 10.0) as usize).clamp(self.min_chunk_size, self.max_chunk_size);

        const STEP: usize = 1024;
        if target > self.chunk_size {
            self.chunk_size = (self.chunk_size + STEP).min(target).min(self.max_chunk_size);
        } else if target < self.chunk_size {
            self.chunk_size = self.chunk_size.saturating_sub(STEP).max(target).max(self.min_chunk_size);
        }
    }

    /// Clear in-flight state, window, and samples, restoring slow-start.
    pub fn reset(&mut self, config: &TransferConfig) {
        self.window = config.initial_window as f64;
        self.ssthresh = config.max_window as f64;
        self.in_flight = 0;
        self.send_times.clear();
        self.rtt_samples.clear();
        self.bandwidth_samples.clear();
        self.chunk_size = config.default_chunk_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransferConfig {
        TransferConfig {
            default_chunk_size: 16 * 1024,
            min_chunk_size: 4 * 1024,
            max_chunk_size: 64 * 1024,
            initial_window: 4,
            min_window: 1,
            max_window: 64,
            rtt_samples: 20,
            ecc_data_block_size: 223,
            ecc_symbols: 10,
        }
    }

    #[test]
    fn window_starts_at_initial_and_admits_until_full() {
        let fc = FlowController::new(&config());
        assert_eq!(fc.window(), 4);
        assert!(fc.can_admit());
    }

    #[test]
    fn slow_start_grows_window_by_one_per_ack() {
        let mut fc = FlowController::new(&config());
        fc.on_send(0);
        fc.on_ack(0, 1024);
        assert_eq!(fc.window(), 5);
    }

    #[test]
    fn congestion_signal_halves_window_and_sets_ssthresh() {
        let mut fc = FlowController::new(&config());
        for i in 0..10 {
            fc.on_send(i);
            fc.on_ack(i, 1024);
        }
        let window_before = fc.window.max(fc.min_window as f64);
        fc.on_congestion_signal();
        assert_eq!(fc.window, (window_before / 2.0).max(fc.min_window as f64));
    }

    #[test]
    fn window_never_exceeds_configured_bounds() {
        let mut fc = FlowController::new(&config());
        for i in 0..200 {
            fc.on_send(i);
            fc.on_ack(i, 1024);
        }
        assert!(fc.window() <= 64);
    }

    #[test]
    fn reset_restores_slow_start_defaults() {
        let cfg = config();
        let mut fc = FlowController::new(&cfg);
        for i in 0..10 {
            fc.on_send(i);
            fc.on_ack(i, 1024);
        }
        fc.reset(&cfg);
        assert_eq!(fc.window(), cfg.initial_window);
        assert_eq!(fc.chunk_size(), cfg.default_chunk_size);
    }
}
