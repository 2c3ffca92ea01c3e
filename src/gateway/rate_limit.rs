//! Connection-level rate limiting.
//!
//! Three independent sliding windows: new connections per client IP, RPC
//! calls per connection, and authentication failures per IP with an
//! exponential lockout. Windows are plain timestamp lists pruned on every
//! query; per-peer cardinality is low enough that nothing fancier pays for
//! itself. All operations are O(window length).
//!
//! Every public check has an `_at(now)` twin so tests drive the clock
//! explicitly instead of sleeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Tunable limits. Defaults match the gateway's shipped configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// New connections per IP inside `connection_window`.
    pub max_connections: u32,
    pub connection_window: Duration,
    /// RPC calls per connection inside `rpc_window`.
    pub max_rpc_calls: u32,
    pub rpc_window: Duration,
    /// Auth failures per IP inside `auth_window` before lockout.
    pub max_auth_failures: u32,
    pub auth_window: Duration,
    /// Janitor sweep period.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connection_window: Duration::from_secs(60),
            max_rpc_calls: 100,
            rpc_window: Duration::from_secs(1),
            max_auth_failures: 5,
            auth_window: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Denied { retry_after_ms: u64 },
}

impl LimitDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, LimitDecision::Allowed)
    }
}

/// Maximum lockout backoff multiplier.
const MAX_BACKOFF_MULTIPLIER: u32 = 32;

#[derive(Debug, Default)]
struct AuthRecord {
    failures: Vec<Instant>,
    lockout_until: Option<Instant>,
    backoff_multiplier: u32,
}

/// Sliding-window limiter shared by the whole gateway.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    connections: Mutex<HashMap<String, Vec<Instant>>>,
    rpc_calls: Mutex<HashMap<String, Vec<Instant>>>,
    auth: Mutex<HashMap<String, AuthRecord>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            rpc_calls: Mutex::new(HashMap::new()),
            auth: Mutex::new(HashMap::new()),
        }
    }

    // ── connections ─────────────────────────────────────────────

    /// Check and record one new connection attempt from `ip`.
    pub fn check_connection(&self, ip: &str) -> LimitDecision {
        self.check_connection_at(ip, Instant::now())
    }

    pub fn check_connection_at(&self, ip: &str, now: Instant) -> LimitDecision {
        let mut map = lock(&self.connections);
        let window = self.config.connection_window;
        let entry = map.entry(ip.to_owned()).or_default();
        prune(entry, now, window);

        if entry.len() >= self.config.max_connections as usize {
            // Denied attempts are not recorded, so retry_after is exactly
            // when the oldest recorded timestamp leaves the window.
            let retry_after_ms = retry_after(entry, now, window);
            return LimitDecision::Denied { retry_after_ms };
        }
        entry.push(now);
        LimitDecision::Allowed
    }

    // ── RPC calls ───────────────────────────────────────────────

    /// Check and record one RPC call on `connection_id`.
    pub fn check_rpc_call(&self, connection_id: &str) -> LimitDecision {
        self.check_rpc_call_at(connection_id, Instant::now())
    }

    pub fn check_rpc_call_at(&self, connection_id: &str, now: Instant) -> LimitDecision {
        let mut map = lock(&self.rpc_calls);
        let window = self.config.rpc_window;
        let entry = map.entry(connection_id.to_owned()).or_default();
        prune(entry, now, window);

        if entry.len() >= self.config.max_rpc_calls as usize {
            let retry_after_ms = retry_after(entry, now, window);
            return LimitDecision::Denied { retry_after_ms };
        }
        entry.push(now);
        LimitDecision::Allowed
    }

    /// Drop per-connection RPC state on teardown.
    pub fn remove_connection(&self, connection_id: &str) {
        lock(&self.rpc_calls).remove(connection_id);
    }

    // ── auth failures & lockout ─────────────────────────────────

    /// Allowed unless `ip` is inside an active lockout window.
    pub fn check_auth_attempt(&self, ip: &str) -> LimitDecision {
        self.check_auth_attempt_at(ip, Instant::now())
    }

    pub fn check_auth_attempt_at(&self, ip: &str, now: Instant) -> LimitDecision {
        let map = lock(&self.auth);
        let Some(record) = map.get(ip) else {
            return LimitDecision::Allowed;
        };
        match record.lockout_until {
            Some(until) if until > now => LimitDecision::Denied {
                retry_after_ms: millis_until(now, until),
            },
            _ => LimitDecision::Allowed,
        }
    }

    /// Record one failed authentication from `ip`.
    ///
    /// State machine: clean → warned (failures in window) → locked. While
    /// locked, each further failure doubles the backoff multiplier (cap 32)
    /// and restarts the lockout at `auth_window × multiplier`.
    pub fn record_auth_failure(&self, ip: &str) {
        self.record_auth_failure_at(ip, Instant::now());
    }

    pub fn record_auth_failure_at(&self, ip: &str, now: Instant) {
        let mut map = lock(&self.auth);
        let window = self.config.auth_window;
        let record = map.entry(ip.to_owned()).or_default();

        if matches!(record.lockout_until, Some(until) if until > now) {
            let multiplier = record.backoff_multiplier.max(1);
            record.backoff_multiplier = (multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
            record.lockout_until = Some(now + window * record.backoff_multiplier);
            tracing::warn!(
                ip,
                multiplier = record.backoff_multiplier,
                "auth failure during lockout, extending"
            );
            return;
        }

        prune(&mut record.failures, now, window);
        record.failures.push(now);

        if record.failures.len() >= self.config.max_auth_failures as usize {
            let multiplier = record.backoff_multiplier.max(1);
            record.backoff_multiplier = multiplier;
            record.lockout_until = Some(now + window * multiplier);
            record.failures.clear();
            tracing::warn!(ip, multiplier, "auth failure threshold reached, locking out");
        }
    }

    /// Erase the IP's auth record after a successful authentication.
    pub fn clear_auth_failures(&self, ip: &str) {
        lock(&self.auth).remove(ip);
    }

    // ── janitor ─────────────────────────────────────────────────

    /// Evict expired timestamps and fully idle entries.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&self, now: Instant) {
        let conn_window = self.config.connection_window;
        lock(&self.connections).retain(|_, stamps| {
            prune(stamps, now, conn_window);
            !stamps.is_empty()
        });

        let rpc_window = self.config.rpc_window;
        lock(&self.rpc_calls).retain(|_, stamps| {
            prune(stamps, now, rpc_window);
            !stamps.is_empty()
        });

        let auth_window = self.config.auth_window;
        lock(&self.auth).retain(|_, record| {
            prune(&mut record.failures, now, auth_window);
            let locked = matches!(record.lockout_until, Some(until) if until > now);
            locked || !record.failures.is_empty()
        });
    }

    /// Spawn the periodic sweeper. The returned handle is abortable and the
    /// task never keeps the process alive.
    pub fn spawn_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = limiter.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }

    // ── introspection (tests, doctor) ───────────────────────────

    pub fn tracked_ips(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn tracked_connections(&self) -> usize {
        lock(&self.rpc_calls).len()
    }

    pub fn tracked_auth_records(&self) -> usize {
        lock(&self.auth).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn prune(stamps: &mut Vec<Instant>, now: Instant, window: Duration) {
    let cutoff = now.checked_sub(window);
    match cutoff {
        Some(cutoff) => stamps.retain(|t| *t > cutoff),
        // Process younger than the window: nothing can be expired.
        None => {}
    }
}

/// Milliseconds until the oldest timestamp in the (pruned) window expires.
fn retry_after(stamps: &[Instant], now: Instant, window: Duration) -> u64 {
    stamps
        .first()
        .map(|oldest| millis_until(now, *oldest + window))
        .unwrap_or(0)
}

fn millis_until(now: Instant, deadline: Instant) -> u64 {
    deadline.saturating_duration_since(now).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    fn small_limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_connections: 3,
            max_rpc_calls: 2,
            max_auth_failures: 2,
            ..RateLimitConfig::default()
        })
    }

    // ── connections ─────────────────────────────────────────────

    #[test]
    fn first_ten_connections_allowed_then_denied_with_retry_after() {
        let rl = limiter();
        let t0 = Instant::now();
        for i in 0..10 {
            let d = rl.check_connection_at("1.2.3.4", t0 + Duration::from_secs(i));
            assert!(d.is_allowed(), "connection {i} should pass");
        }
        for i in 10..12 {
            let now = t0 + Duration::from_secs(i);
            match rl.check_connection_at("1.2.3.4", now) {
                LimitDecision::Denied { retry_after_ms } => {
                    // oldest stamp is t0; it leaves the window at t0 + 60s.
                    let expected = (Duration::from_secs(60)
                        - now.duration_since(t0))
                    .as_millis() as u64;
                    assert_eq!(retry_after_ms, expected);
                    assert!(retry_after_ms > 0);
                }
                LimitDecision::Allowed => panic!("connection {i} should be denied"),
            }
        }
    }

    #[test]
    fn window_slides_and_frees_capacity() {
        let rl = small_limiter();
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(rl.check_connection_at("ip", t0).is_allowed());
        }
        assert!(!rl.check_connection_at("ip", t0).is_allowed());
        // 61 seconds later the whole window has expired.
        assert!(rl
            .check_connection_at("ip", t0 + Duration::from_secs(61))
            .is_allowed());
    }

    #[test]
    fn ips_are_tracked_independently() {
        let rl = small_limiter();
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(rl.check_connection_at("a", t0).is_allowed());
        }
        assert!(!rl.check_connection_at("a", t0).is_allowed());
        assert!(rl.check_connection_at("b", t0).is_allowed());
    }

    // ── RPC ─────────────────────────────────────────────────────

    #[test]
    fn rpc_window_enforced_per_connection() {
        let rl = small_limiter();
        let t0 = Instant::now();
        assert!(rl.check_rpc_call_at("conn-1", t0).is_allowed());
        assert!(rl.check_rpc_call_at("conn-1", t0).is_allowed());
        assert!(!rl.check_rpc_call_at("conn-1", t0).is_allowed());
        assert!(rl.check_rpc_call_at("conn-2", t0).is_allowed());
        // 1-second window
        assert!(rl
            .check_rpc_call_at("conn-1", t0 + Duration::from_millis(1100))
            .is_allowed());
    }

    #[test]
    fn remove_connection_drops_rpc_state() {
        let rl = small_limiter();
        let t0 = Instant::now();
        rl.check_rpc_call_at("conn-1", t0);
        assert_eq!(rl.tracked_connections(), 1);
        rl.remove_connection("conn-1");
        assert_eq!(rl.tracked_connections(), 0);
    }

    // ── auth lockout ────────────────────────────────────────────

    #[test]
    fn lockout_opens_at_threshold_and_expires() {
        let rl = small_limiter(); // threshold 2, window 300s
        let t0 = Instant::now();
        assert!(rl.check_auth_attempt_at("ip", t0).is_allowed());

        rl.record_auth_failure_at("ip", t0);
        assert!(rl.check_auth_attempt_at("ip", t0).is_allowed(), "warned, not locked");

        rl.record_auth_failure_at("ip", t0);
        match rl.check_auth_attempt_at("ip", t0) {
            LimitDecision::Denied { retry_after_ms } => {
                assert_eq!(retry_after_ms, 300_000);
            }
            LimitDecision::Allowed => panic!("should be locked"),
        }

        // Exactly at the deadline the lockout is over.
        assert!(rl
            .check_auth_attempt_at("ip", t0 + Duration::from_secs(300))
            .is_allowed());
    }

    #[test]
    fn failures_during_lockout_double_backoff_up_to_cap() {
        let rl = small_limiter();
        let t0 = Instant::now();
        rl.record_auth_failure_at("ip", t0);
        rl.record_auth_failure_at("ip", t0); // locked, multiplier 1

        // Six more failures while locked: 2, 4, 8, 16, 32, 32.
        for _ in 0..6 {
            rl.record_auth_failure_at("ip", t0);
        }
        match rl.check_auth_attempt_at("ip", t0) {
            LimitDecision::Denied { retry_after_ms } => {
                assert_eq!(retry_after_ms, 32 * 300_000);
            }
            LimitDecision::Allowed => panic!("should be locked"),
        }
    }

    #[test]
    fn clear_auth_failures_resets_to_clean() {
        let rl = small_limiter();
        let t0 = Instant::now();
        rl.record_auth_failure_at("ip", t0);
        rl.record_auth_failure_at("ip", t0);
        assert!(!rl.check_auth_attempt_at("ip", t0).is_allowed());

        rl.clear_auth_failures("ip");
        assert!(rl.check_auth_attempt_at("ip", t0).is_allowed());
        assert_eq!(rl.tracked_auth_records(), 0);
    }

    #[test]
    fn old_failures_fall_out_of_window() {
        let rl = small_limiter();
        let t0 = Instant::now();
        rl.record_auth_failure_at("ip", t0);
        // 301 seconds later the first failure no longer counts.
        rl.record_auth_failure_at("ip", t0 + Duration::from_secs(301));
        assert!(rl
            .check_auth_attempt_at("ip", t0 + Duration::from_secs(301))
            .is_allowed());
    }

    // ── janitor ─────────────────────────────────────────────────

    #[test]
    fn sweep_evicts_idle_entries_but_keeps_active_lockouts() {
        let rl = small_limiter();
        let t0 = Instant::now();
        rl.check_connection_at("idle-ip", t0);
        rl.check_rpc_call_at("conn", t0);
        rl.record_auth_failure_at("locked-ip", t0);
        rl.record_auth_failure_at("locked-ip", t0); // locked for 300s

        rl.sweep_at(t0 + Duration::from_secs(120));
        assert_eq!(rl.tracked_ips(), 0, "idle connection window evicted");
        assert_eq!(rl.tracked_connections(), 0, "idle rpc window evicted");
        assert_eq!(rl.tracked_auth_records(), 1, "active lockout survives");

        rl.sweep_at(t0 + Duration::from_secs(400));
        assert_eq!(rl.tracked_auth_records(), 0, "expired lockout evicted");
    }

    #[tokio::test]
    async fn janitor_task_is_abortable() {
        let rl = Arc::new(RateLimiter::new(RateLimitConfig {
            cleanup_interval: Duration::from_millis(10),
            ..RateLimitConfig::default()
        }));
        let handle = rl.spawn_janitor();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
