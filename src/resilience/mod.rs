//! Peer resilience: scoring, reconnection scheduling, blacklisting (component 4.7).

mod backoff;

pub use backoff::next_delay;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::ResilienceConfig;

const RTT_SAMPLE_CAP: usize = 20;

#[derive(Debug, Clone)]
pub struct PeerScore {
    pub connection_attempts: u32,
    pub connection_successes: u32,
    pub transfer_attempts: u32,
    pub transfer_successes: u32,
    rtt_samples: VecDeque<f64>,
    pub last_seen: Instant,
    pub first_seen: Instant,
}

impl PeerScore {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            connection_attempts: 0,
            connection_successes: 0,
            transfer_attempts: 0,
            transfer_successes: 0,
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLE_CAP),
            last_seen: now,
            first_seen: now,
        }
    }

    pub fn connection_success_rate(&self) -> f64 {
        rate(self.connection_successes, self.connection_attempts)
    }

    pub fn transfer_success_rate(&self) -> f64 {
        rate(self.transfer_successes, self.transfer_attempts)
    }

    pub fn mean_rtt_ms(&self) -> f64 {
        if self.rtt_samples.is_empty() {
            0.0
        } else {
            self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64
        }
    }

    fn latency_score(&self) -> f64 {
        (1.0 - self.mean_rtt_ms() / 1000.0).max(0.0)
    }

    fn uptime_ratio(&self) -> f64 {
        let lifetime = self.last_seen.duration_since(self.first_seen).as_secs_f64().max(1.0);
        let since_last_seen = self.last_seen.elapsed().as_secs_f64();
        (1.0 - since_last_seen / lifetime).clamp(0.0, 1.0)
    }

    /// `0.3*conn + 0.3*xfer + 0.2*latency + 0.2*uptime`, clamped to [0, 1].
    pub fn overall(&self) -> f64 {
        let score = 0.3 * self.connection_success_rate()
            + 0.3 * self.transfer_success_rate()
            + 0.2 * self.latency_score()
            + 0.2 * self.uptime_ratio();
        score.clamp(0.0, 1.0)
    }

    fn record_rtt(&mut self, rtt_ms: f64) {
        if self.rtt_samples.len() == RTT_SAMPLE_CAP {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt_ms);
    }

    fn should_blacklist(&self) -> bool {
        (self.connection_attempts >= 10 && self.connection_success_rate() < 0.1)
            || (self.transfer_attempts >= 5 && self.transfer_success_rate() < 0.2)
            || (self.last_seen.elapsed() > Duration::from_secs(86_400))
    }
}

fn rate(successes: u32, attempts: u32) -> f64 {
    if attempts == 0 {
        1.0
    } else {
        successes as f64 / attempts as f64
    }
}

#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub peer_id: String,
    pub entered_at: Instant,
}

struct ReconnectTask {
    peer_id: String,
    attempt: u32,
    not_before: Instant,
}

/// Tracks per-peer scores, schedules jittered-exponential-backoff
/// reconnection attempts, and enforces blacklist entry/expiry. A background
/// janitor prunes completed tasks and expired blacklist entries.
pub struct ResilienceController {
    config: ResilienceConfig,
    scores: RwLock<HashMap<String, PeerScore>>,
    blacklist: RwLock<HashMap<String, BlacklistEntry>>,
    queue: RwLock<VecDeque<ReconnectTask>>,
}

impl ResilienceController {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            scores: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashMap::new()),
            queue: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn record_connection_attempt(&self, peer_id: &str, success: bool) {
        let mut scores = self.scores.write().await;
        let score = scores.entry(peer_id.to_string()).or_insert_with(PeerScore::new);
        score.connection_attempts += 1;
        if success {
            score.connection_successes += 1;
        }
        score.last_seen = Instant::now();
        let blacklisted = score.should_blacklist();
        drop(scores);
        if blacklisted {
            self.blacklist_peer(peer_id).await;
        }
    }

    pub async fn record_transfer_attempt(&self, peer_id: &str, success: bool) {
        let mut scores = self.scores.write().await;
        let score = scores.entry(peer_id.to_string()).or_insert_with(PeerScore::new);
        score.transfer_attempts += 1;
        if success {
            score.transfer_successes += 1;
        }
        let blacklisted = score.should_blacklist();
        drop(scores);
        if blacklisted {
            self.blacklist_peer(peer_id).await;
        }
    }

    pub async fn record_rtt(&self, peer_id: &str, rtt: Duration) {
        let mut scores = self.scores.write().await;
        let score = scores.entry(peer_id.to_string()).or_insert_with(PeerScore::new);
        score.record_rtt(rtt.as_secs_f64() * 1000.0);
        score.last_seen = Instant::now();
    }

    pub async fn score_of(&self, peer_id: &str) -> Option<PeerScore> {
        self.scores.read().await.get(peer_id).cloned()
    }

    async fn blacklist_peer(&self, peer_id: &str) {
        let mut blacklist = self.blacklist.write().await;
        if !blacklist.contains_key(peer_id) {
            tracing::info!(peer_id, "blacklisting peer");
            blacklist.insert(peer_id.to_string(), BlacklistEntry { peer_id: peer_id.to_string(), entered_at: Instant::now() });
        }
    }

    pub async fn is_blacklisted(&self, peer_id: &str) -> bool {
        self.blacklist.read().await.contains_key(peer_id)
    }

    /// Schedule a reconnection attempt unless the peer is blacklisted or its
    /// score is below `min_score_for_retry`, returning the delay before the
    /// attempt should fire. `attempt` is 1-based.
    pub async fn schedule_reconnect(&self, peer_id: &str, attempt: u32) -> Option<Duration> {
        if self.is_blacklisted(peer_id).await {
            return None;
        }
        if attempt > self.config.max_attempts {
            return None;
        }
        if let Some(score) = self.score_of(peer_id).await {
            if score.overall() < self.config.min_score_for_retry {
                return None;
            }
        }

        let delay = next_delay(&self.config, attempt);
        self.queue.write().await.push_back(ReconnectTask {
            peer_id: peer_id.to_string(),
            attempt,
            not_before: Instant::now() + delay,
        });
        Some(delay)
    }

    /// Drain reconnection tasks whose delay has elapsed, returning their
    /// peer-ids in scheduling order.
    pub async fn due_reconnects(&self) -> Vec<String> {
        let now = Instant::now();
        let mut queue = self.queue.write().await;
        let mut due = Vec::new();
        let mut remaining = VecDeque::with_capacity(queue.len());
        for task in queue.drain(..) {
            if task.not_before <= now {
                due.push(task.peer_id);
            } else {
                remaining.push_back(task);
            }
        }
        *queue = remaining;
        due
    }

    /// Prune expired blacklist entries (age > `blacklist_duration`). Run on
    /// the configured janitor cadence.
    pub async fn run_janitor_once(&self) {
        let cutoff = self.config.blacklist_duration;
        let mut blacklist = self.blacklist.write().await;
        let expired: Vec<String> = blacklist
            .iter()
            .filter(|(_, entry)| entry.entered_at.elapsed() > cutoff)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in &expired {
            tracing::info!(peer_id, "blacklist entry expired");
            blacklist.remove(peer_id);
        }
    }

    /// Spawn the background janitor loop at the configured cadence. Returns
    /// a handle whose drop does not stop the task; callers wanting a clean
    /// stop should wrap this in their own cancellation mechanism (the
    /// orchestrator uses a `tokio::sync::watch<bool>`).
    pub fn spawn_janitor(self: std::sync::Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.janitor_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.run_janitor_once().await,
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            max_attempts: 10,
            jitter: false,
            min_score_for_retry: 0.1,
            blacklist_duration: Duration::from_secs(86_400),
            janitor_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn score_rates_default_to_one_with_no_attempts() {
        let controller = ResilienceController::new(config());
        controller.record_rtt("peer-a", Duration::from_millis(10)).await;
        let score = controller.score_of("peer-a").await.unwrap();
        assert_eq!(score.connection_success_rate(), 1.0);
        assert_eq!(score.transfer_success_rate(), 1.0);
    }

    #[tokio::test]
    async fn blacklists_after_repeated_connection_failure() {
        let controller = ResilienceController::new(config());
        for _ in 0..10 {
            controller.record_connection_attempt("peer-a", false).await;
        }
        assert!(controller.is_blacklisted("peer-a").await);
    }

    #[tokio::test]
    async fn blacklisted_peer_is_not_scheduled() {
        let controller = ResilienceController::new(config());
        for _ in 0..10 {
            controller.record_connection_attempt("peer-a", false).await;
        }
        assert!(controller.schedule_reconnect("peer-a", 1).await.is_none());
    }

    #[tokio::test]
    async fn healthy_peer_is_scheduled_and_becomes_due() {
        let controller = ResilienceController::new(config());
        controller.record_connection_attempt("peer-a", true).await;
        let delay = controller.schedule_reconnect("peer-a", 1).await;
        assert!(delay.is_some());
        tokio::time::sleep(delay.unwrap() + Duration::from_millis(5)).await;
        assert_eq!(controller.due_reconnects().await, vec!["peer-a".to_string()]);
    }
}
