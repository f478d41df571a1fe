use std::sync::Arc;
use std::time::Duration;

use rescue_core::{ConnectionId, Inbound, Outbound, RelayError};
use rescue_telemetry::metrics::names;
use rescue_telemetry::RelayMetrics;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::{ConnectionRegistry, SweepReport};
use crate::router::{self, RouterOptions};

/// A data frame read from a socket, in receipt order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// A binary frame that is not valid UTF-8.
    Undecodable,
}

/// Dispatches inbound frames and runs the liveness sweep. A single task owns
/// the relay, so handlers and sweeps never interleave.
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    options: RouterOptions,
}

impl Relay {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<RelayMetrics>,
        options: RouterOptions,
    ) -> Self {
        Self {
            registry,
            metrics,
            options,
        }
    }

    /// Process frames until the inbox closes or `shutdown` fires.
    pub async fn run(
        self,
        mut inbox: mpsc::Receiver<(ConnectionId, InboundFrame)>,
        heartbeat: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = inbox.recv() => match frame {
                    Some((sender, frame)) => self.handle_frame(&sender, frame),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        tracing::info!("relay stopped");
    }

    pub fn handle_frame(&self, sender: &ConnectionId, frame: InboundFrame) {
        let Some(state) = self.registry.state(sender) else {
            tracing::debug!(connection_id = %sender, "frame from closed connection dropped");
            return;
        };

        let span = tracing::info_span!(
            "ws_message",
            connection_id = %sender,
            user_id = state.user_id.as_deref(),
        );
        let _entered = span.enter();

        let parsed = match frame {
            InboundFrame::Text(text) => Inbound::parse(&text),
            InboundFrame::Undecodable => {
                Err(RelayError::InvalidFormat("binary frame is not UTF-8".into()))
            }
        };
        let message = match parsed {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    kind = err.error_kind(),
                    error = %err,
                    "malformed websocket message"
                );
                self.metrics.counter_inc(names::MESSAGES_INVALID, &[], 1);
                self.registry.send_to(sender, Outbound::error(&err).to_text());
                return;
            }
        };

        let label = match message {
            Inbound::Unrecognized { .. } => "unrecognized",
            ref known => known.kind(),
        };
        self.metrics
            .counter_inc(names::MESSAGES_RECEIVED, &[("type", label)], 1);
        tracing::debug!(kind = message.kind(), "received websocket message");

        let outcome = router::handle(&state, message, self.options);
        let delivery = router::apply(&self.registry, sender, outcome);
        for (audience, queued) in delivery.broadcasts {
            self.metrics.counter_inc(
                names::BROADCAST_DELIVERED,
                &[("audience", audience.as_str())],
                queued as u64,
            );
        }
    }

    pub fn sweep(&self) -> SweepReport {
        let report = self.registry.sweep();
        for id in &report.evicted {
            tracing::info!(connection_id = %id, "terminating inactive websocket client");
        }
        if !report.evicted.is_empty() {
            self.metrics.counter_inc(
                names::CONNECTIONS_EVICTED,
                &[],
                report.evicted.len() as u64,
            );
        }
        self.metrics
            .gauge_set(names::CONNECTIONS_ACTIVE, &[], self.registry.count() as i64);
        tracing::trace!(pinged = report.pinged, "heartbeat sweep");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outgoing;
    use serde_json::Value;

    fn relay() -> (Relay, Arc<ConnectionRegistry>, Arc<RelayMetrics>) {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let metrics = Arc::new(RelayMetrics::detached());
        let relay = Relay::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            RouterOptions::default(),
        );
        (relay, registry, metrics)
    }

    fn texts(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outgoing::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn send(relay: &Relay, from: &ConnectionId, text: &str) {
        relay.handle_frame(from, InboundFrame::Text(text.into()));
    }

    #[test]
    fn malformed_text_gets_error_and_connection_stays() {
        let (relay, registry, metrics) = relay();
        let (a, mut rx_a) = registry.register("o");
        let (_b, mut rx_b) = registry.register("o");

        send(&relay, &a, "{not json");
        relay.handle_frame(&a, InboundFrame::Undecodable);

        let replies = texts(&mut rx_a);
        assert_eq!(replies.len(), 2);
        for reply in replies {
            assert_eq!(reply["type"], "ERROR");
            assert_eq!(reply["message"], "Invalid message format");
        }
        assert!(texts(&mut rx_b).is_empty());
        assert!(registry.contains(&a));
        assert_eq!(metrics.counter_get(names::MESSAGES_INVALID, &[]), 2);
    }

    #[test]
    fn sos_scenario_reaches_only_other_rescuers() {
        let (relay, registry, metrics) = relay();
        let (a, mut rx_a) = registry.register("o");
        let (b, mut rx_b) = registry.register("o");
        let (_c, mut rx_c) = registry.register("o");

        send(&relay, &a, r#"{"type":"JOIN_RESCUE_TEAM","userId":"u1"}"#);
        send(&relay, &b, r#"{"type":"JOIN_RESCUE_TEAM","userId":"u2"}"#);
        assert_eq!(texts(&mut rx_a)[0]["type"], "JOIN_SUCCESS");
        assert_eq!(texts(&mut rx_b)[0]["type"], "JOIN_SUCCESS");

        send(&relay, &a, r#"{"type":"SOS_LOCATION_UPDATE","coordinates":[19.07,72.87]}"#);
        assert_eq!(
            texts(&mut rx_b),
            vec![serde_json::json!({"type":"SOS_LOCATION_UPDATE","coordinates":[19.07,72.87]})]
        );
        assert!(texts(&mut rx_a).is_empty());
        assert!(texts(&mut rx_c).is_empty());

        assert_eq!(
            metrics.counter_get(names::MESSAGES_RECEIVED, &[("type", "JOIN_RESCUE_TEAM")]),
            2
        );
        assert_eq!(
            metrics.counter_get(names::BROADCAST_DELIVERED, &[("audience", "rescue_team")]),
            1
        );
    }

    #[test]
    fn custom_event_reaches_everyone_else() {
        let (relay, registry, metrics) = relay();
        let (a, mut rx_a) = registry.register("o");
        let (b, mut rx_b) = registry.register("o");
        let (_c, mut rx_c) = registry.register("o");
        send(&relay, &b, r#"{"type":"JOIN_RESCUE_TEAM","userId":"u2"}"#);
        texts(&mut rx_b);

        send(&relay, &a, r#"{"type":"CUSTOM_EVENT","foo":1}"#);
        let expected = serde_json::json!({"type":"CUSTOM_EVENT","foo":1});
        assert_eq!(texts(&mut rx_b), vec![expected.clone()]);
        assert_eq!(texts(&mut rx_c), vec![expected]);
        assert!(texts(&mut rx_a).is_empty());
        assert_eq!(
            metrics.counter_get(names::MESSAGES_RECEIVED, &[("type", "unrecognized")]),
            1
        );
    }

    #[test]
    fn malformed_frame_warning_carries_sender_identity() {
        use rescue_telemetry::{LogQuery, SqliteLogLayer, SqliteLogSink};
        use tracing_subscriber::layer::SubscriberExt;

        let dir = std::env::temp_dir().join(format!("rescue-relay-logs-{}", ConnectionId::new()));
        let sink = Arc::new(SqliteLogSink::new(&dir.join("logs.db")).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink)));

        let (relay, registry, _metrics) = relay();
        let (a, mut rx_a) = registry.register("o");
        tracing::subscriber::with_default(subscriber, || {
            send(&relay, &a, r#"{"type":"JOIN_RESCUE_TEAM","userId":"u1"}"#);
            send(&relay, &a, "{not json");
        });
        assert_eq!(texts(&mut rx_a).len(), 2);

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "malformed websocket message");
        assert_eq!(rows[0].connection_id.as_deref(), Some(a.as_str()));
        assert_eq!(rows[0].user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn frames_from_unknown_connections_are_ignored() {
        let (relay, registry, _metrics) = relay();
        let (_a, mut rx_a) = registry.register("o");
        send(&relay, &ConnectionId::new(), r#"{"type":"CUSTOM_EVENT"}"#);
        assert!(texts(&mut rx_a).is_empty());
    }

    #[test]
    fn sweep_updates_metrics() {
        let (relay, registry, metrics) = relay();
        let (a, _rx_a) = registry.register("o");
        let (_b, _rx_b) = registry.register("o");

        relay.sweep();
        registry.mark_alive(&a);
        let report = relay.sweep();

        assert_eq!(report.evicted.len(), 1);
        assert_eq!(metrics.counter_get(names::CONNECTIONS_EVICTED, &[]), 1);
        assert_eq!(metrics.gauge_get(names::CONNECTIONS_ACTIVE, &[]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_dispatches_and_sweeps() {
        let (relay, registry, _metrics) = relay();
        let (a, mut rx_a) = registry.register("o");
        let (inbox_tx, inbox_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(relay.run(inbox_rx, Duration::from_secs(30), shutdown.clone()));

        inbox_tx
            .send((a.clone(), InboundFrame::Text(r#"{"type":"PING"}"#.into())))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rx_a.recv().await, Some(Outgoing::Text(r#"{"type":"PONG"}"#.into())));

        // Never answers the ping: gone after the second sweep.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(rx_a.recv().await, Some(Outgoing::Ping));
        assert!(registry.contains(&a));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!registry.contains(&a));
        assert_eq!(rx_a.recv().await, None);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
