//! The publish pipeline: admission, validation, persistence, fan-out.
//!
//! Persistence happens before fan-out, so a subscriber that reconnects and
//! replays will find every event it was ever delivered live. Fan-out runs
//! under the registry lock, which serializes concurrent broadcasts and keeps
//! delivery order identical across subscribers.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use crate::config::Settings;
use crate::event::Event;
use crate::limiter::{RateLimiter, RateRejection};
use crate::metrics::RelayMetrics;
use crate::registry::{Delivery, SubscriptionRegistry};
use crate::store::{InsertOutcome, Store};
use crate::validate::{RejectReason, Validator};

/// How a publish was resolved. Every variant maps to an `OK` frame.
#[derive(Debug)]
pub enum PublishVerdict {
    /// Event accepted; `stored` is false for ephemeral kinds.
    Accepted { stored: bool, delivered: usize },
    /// An event with this id is already stored.
    Duplicate,
    /// The payload does not deserialize into an event at all.
    Unparseable(String),
    /// Validation refused the event.
    Rejected(RejectReason),
    /// A rate limit refused the event.
    RateLimited(RateRejection),
}

/// Shared relay state threaded through the websocket and HTTP layers.
pub struct RelayCoordinator {
    pub settings: Settings,
    pub store: Store,
    pub registry: SubscriptionRegistry,
    pub limiter: Arc<RateLimiter>,
    pub validator: Validator,
    pub metrics: RelayMetrics,
    next_conn_id: AtomicU64,
}

impl RelayCoordinator {
    pub fn new(settings: Settings) -> Result<Self> {
        let store = Store::new(settings.store_root.clone());
        store.init()?;
        let limiter = Arc::new(RateLimiter::new(settings.rate_policy()));
        let validator = Validator::new(
            settings.max_past_skew_secs,
            settings.max_future_skew_secs,
            settings.verify_sig,
        );
        Ok(Self {
            store,
            registry: SubscriptionRegistry::new(),
            limiter,
            validator,
            metrics: RelayMetrics::new()?,
            next_conn_id: AtomicU64::new(1),
            settings,
        })
    }

    /// Allocate a connection id for a newly accepted socket.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one published event through the full pipeline. `conn` is the
    /// publishing connection, which is excluded from fan-out.
    pub fn accept_event(&self, addr: IpAddr, conn: u64, payload: &Value) -> Result<PublishVerdict> {
        self.metrics.events_received.inc();
        let ev: Event = match serde_json::from_value(payload.clone()) {
            Ok(ev) => ev,
            Err(e) => {
                self.metrics.events_rejected.inc();
                return Ok(PublishVerdict::Unparseable(e.to_string()));
            }
        };

        // Admission happens before signature verification; refused events
        // must not cost a Schnorr check.
        if let Err(rej) = self.limiter.admit_publish(addr, conn, &ev.pubkey) {
            self.metrics.rate_limited.inc();
            return Ok(PublishVerdict::RateLimited(rej));
        }

        if let Err(reason) = self.validator.validate(&ev) {
            self.metrics.events_rejected.inc();
            debug!(id = %ev.id, %reason, "rejected event");
            return Ok(PublishVerdict::Rejected(reason));
        }

        if ev.is_ephemeral() {
            self.metrics.events_accepted.inc();
            let delivered = self.broadcast(&ev, conn);
            return Ok(PublishVerdict::Accepted {
                stored: false,
                delivered,
            });
        }

        match self.store.insert_if_absent(&ev)? {
            InsertOutcome::AlreadyPresent => {
                self.metrics.events_duplicate.inc();
                Ok(PublishVerdict::Duplicate)
            }
            InsertOutcome::Inserted => {
                self.metrics.events_accepted.inc();
                let delivered = self.broadcast(&ev, conn);
                Ok(PublishVerdict::Accepted {
                    stored: true,
                    delivered,
                })
            }
        }
    }

    /// Fan an accepted event out to everyone but the publisher. Returns how
    /// many subscriptions received or buffered it.
    fn broadcast(&self, ev: &Event, publisher: u64) -> usize {
        let mut delivered = 0;
        for outcome in self.registry.deliver(ev, Some(publisher)) {
            match outcome {
                Delivery::Sent => {
                    self.metrics.deliveries.inc();
                    delivered += 1;
                }
                Delivery::Buffered => delivered += 1,
                Delivery::Dropped => self.metrics.deliveries_dropped.inc(),
            }
        }
        delivered
    }
}
