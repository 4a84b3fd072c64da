//! Prometheus counters and gauges for the relay, exposed at `/metrics`.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

pub struct RelayMetrics {
    registry: Registry,
    pub events_received: IntCounter,
    pub events_accepted: IntCounter,
    pub events_rejected: IntCounter,
    pub events_duplicate: IntCounter,
    pub deliveries: IntCounter,
    pub deliveries_dropped: IntCounter,
    pub rate_limited: IntCounter,
    pub replayed_events: IntCounter,
    pub connections_open: IntGauge,
    pub subscriptions_open: IntGauge,
}

impl RelayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        Ok(Self {
            events_received: counter("relay_events_received_total", "Publishes received")?,
            events_accepted: counter("relay_events_accepted_total", "Publishes stored or broadcast")?,
            events_rejected: counter("relay_events_rejected_total", "Publishes rejected by validation")?,
            events_duplicate: counter("relay_events_duplicate_total", "Publishes already stored")?,
            deliveries: counter("relay_deliveries_total", "Live events handed to subscribers")?,
            deliveries_dropped: counter(
                "relay_deliveries_dropped_total",
                "Live deliveries dropped due to a full outbound queue",
            )?,
            rate_limited: counter("relay_rate_limited_total", "Messages refused by rate limits")?,
            replayed_events: counter("relay_replayed_events_total", "Stored events sent during replay")?,
            connections_open: gauge("relay_connections_open", "Open websocket connections")?,
            subscriptions_open: gauge("relay_subscriptions_open", "Active subscriptions")?,
            registry,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_rendered_output() {
        let m = RelayMetrics::new().unwrap();
        m.events_received.inc();
        m.connections_open.set(3);
        let out = m.render().unwrap();
        assert!(out.contains("relay_events_received_total 1"));
        assert!(out.contains("relay_connections_open 3"));
    }
}
