//! Token-bucket admission control over global, author, address, and
//! connection scopes.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// Rate policy applied by the limiter. Loaded from configuration at startup
/// and immutable afterwards.
#[derive(Debug, Clone)]
pub struct RatePolicy {
    /// Relay-wide publish budget, events per second.
    pub global_events_per_second: u32,
    /// Publishes per minute per remote address.
    pub events_per_minute: u32,
    /// Queries (REQ) per minute per remote address.
    pub queries_per_minute: u32,
    /// Publishes per minute per author key, across addresses.
    pub author_events_per_minute: u32,
    /// Inbound protocol messages per minute per connection.
    pub conn_messages_per_minute: u32,
    /// Concurrent connections allowed per remote address.
    pub connections_per_addr: u32,
    /// Buckets untouched for this long are evictable.
    pub idle_window: Duration,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            global_events_per_second: 500,
            events_per_minute: 60,
            queries_per_minute: 120,
            author_events_per_minute: 60,
            conn_messages_per_minute: 240,
            connections_per_addr: 10,
            idle_window: Duration::from_secs(300),
        }
    }
}

/// Which scope refused the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Author,
    Addr,
    Conn,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Global => "global",
            Scope::Author => "author",
            Scope::Addr => "address",
            Scope::Conn => "connection",
        };
        f.write_str(s)
    }
}

/// Admission refusal: which scope rejected and how long until one token is
/// available again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRejection {
    pub scope: Scope,
    pub retry_after: Duration,
}

impl fmt::Display for RateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate-limited: {} budget exhausted, retry in {}s",
            self.scope,
            self.retry_after.as_secs().max(1)
        )
    }
}

/// One token bucket. Refill happens lazily at consumption time; no timers.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Consume `cost` tokens, or report how long until one is available.
    fn try_consume(&mut self, cost: f64) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            // A zero refill rate yields an infinite wait; saturate instead
            // of letting `from_secs_f64` panic on it.
            let deficit = cost - self.tokens;
            let wait = deficit / self.refill_per_sec;
            Err(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
        }
    }
}

/// Key for a bucket: the scope plus the entity inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    Global,
    Author(String),
    AddrEvents(IpAddr),
    AddrQueries(IpAddr),
    Conn(u64),
}

/// Per-scope token-bucket rate limiter plus the per-address concurrent
/// connection counter. Consuming tokens never blocks; it only returns a
/// decision.
pub struct RateLimiter {
    policy: RatePolicy,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
    connections: Mutex<HashMap<IpAddr, u32>>,
}

impl RateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            buckets: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Admit one publish. Scopes are checked in fixed order: global, then
    /// author, then address, then connection; the first rejection
    /// short-circuits.
    pub fn admit_publish(
        &self,
        addr: IpAddr,
        conn: u64,
        author: &str,
    ) -> Result<(), RateRejection> {
        let p = &self.policy;
        let checks: [(BucketKey, Scope, f64, f64); 4] = [
            (
                BucketKey::Global,
                Scope::Global,
                p.global_events_per_second as f64,
                p.global_events_per_second as f64,
            ),
            (
                BucketKey::Author(author.to_string()),
                Scope::Author,
                p.author_events_per_minute as f64,
                p.author_events_per_minute as f64 / 60.0,
            ),
            (
                BucketKey::AddrEvents(addr),
                Scope::Addr,
                p.events_per_minute as f64,
                p.events_per_minute as f64 / 60.0,
            ),
            (
                BucketKey::Conn(conn),
                Scope::Conn,
                p.conn_messages_per_minute as f64,
                p.conn_messages_per_minute as f64 / 60.0,
            ),
        ];
        self.run_checks(&checks)
    }

    /// Admit one query (REQ). Reads are not attributable to an author, so
    /// order is global, address, connection.
    pub fn admit_query(&self, addr: IpAddr, conn: u64) -> Result<(), RateRejection> {
        let p = &self.policy;
        let checks: [(BucketKey, Scope, f64, f64); 3] = [
            (
                BucketKey::Global,
                Scope::Global,
                p.global_events_per_second as f64,
                p.global_events_per_second as f64,
            ),
            (
                BucketKey::AddrQueries(addr),
                Scope::Addr,
                p.queries_per_minute as f64,
                p.queries_per_minute as f64 / 60.0,
            ),
            (
                BucketKey::Conn(conn),
                Scope::Conn,
                p.conn_messages_per_minute as f64,
                p.conn_messages_per_minute as f64 / 60.0,
            ),
        ];
        self.run_checks(&checks)
    }

    fn run_checks(&self, checks: &[(BucketKey, Scope, f64, f64)]) -> Result<(), RateRejection> {
        let mut buckets = self.buckets.lock().unwrap();
        for (key, scope, capacity, refill) in checks {
            let bucket = buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::new(*capacity, *refill));
            if let Err(retry_after) = bucket.try_consume(1.0) {
                return Err(RateRejection {
                    scope: *scope,
                    retry_after,
                });
            }
        }
        Ok(())
    }

    /// Count one more connection from `addr`, refusing past the cap.
    pub fn acquire_connection(&self, addr: IpAddr) -> bool {
        let mut conns = self.connections.lock().unwrap();
        let count = conns.entry(addr).or_insert(0);
        if *count >= self.policy.connections_per_addr {
            return false;
        }
        *count += 1;
        true
    }

    /// Release a connection slot for an address. Used directly when the
    /// upgrade fails before a session (and connection id) ever exists.
    pub fn release_slot(&self, addr: IpAddr) {
        let mut conns = self.connections.lock().unwrap();
        if let Some(count) = conns.get_mut(&addr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                conns.remove(&addr);
            }
        }
    }

    /// Release a connection slot and drop the connection's bucket.
    pub fn release_connection(&self, addr: IpAddr, conn: u64) {
        self.release_slot(addr);
        self.buckets.lock().unwrap().remove(&BucketKey::Conn(conn));
    }

    /// Evict buckets idle longer than the policy window. Exclusive access to
    /// the map means eviction never races an active consumption.
    pub fn sweep_idle(&self) {
        let window = self.policy.idle_window;
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, b| b.last_refill.elapsed() < window);
        debug!(
            evicted = before - buckets.len(),
            remaining = buckets.len(),
            "rate limiter sweep"
        );
    }

    /// Spawn the periodic sweep task for a shared limiter.
    pub fn spawn_sweeper(limiter: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                limiter.sweep_idle();
            }
        });
    }
}
