//! # MQTT Transport
//!
//! Subscribes to the gateway feed and hands every publish to a [`MessageSink`], one message
//! at a time: the next publish is not read until the sink has returned. Connection errors are
//! retried with bounded exponential [`Backoff`]; a clean disconnect, or cancellation, ends the
//! loop without reconnecting.

use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::logutil::escape_log;

/// Largest publish accepted from the broker.
const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Receives each publish from the feed.
pub trait MessageSink: Send + Sync + 'static {
    fn deliver(&self, topic: &str, payload: &[u8]);
}

/// Exponential reconnect delay: `base * 2^n`, capped at `max`, for at most `max_attempts`
/// consecutive failures (0 means unlimited).
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(cfg: &MqttConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.reconnect_base_secs),
            Duration::from_secs(cfg.reconnect_max_secs),
            cfg.reconnect_max_attempts,
        )
    }

    /// Delay before the next attempt, or `None` when the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct MqttSubscriber {
    config: MqttConfig,
}

impl MqttSubscriber {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        opts.set_keep_alive(self.config.keepalive());
        opts.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some(user) = &self.config.username {
            opts.set_credentials(user, self.config.password.clone().unwrap_or_default());
        }
        opts
    }

    /// Run until cancelled, cleanly disconnected, or out of reconnect attempts.
    pub async fn run(&self, sink: Arc<dyn MessageSink>, cancel: CancellationToken) -> Result<(), TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 32);
        let filter = self.config.subscription();
        let mut backoff = Backoff::from_config(&self.config);
        let mut subscribe_pending = false;

        info!(
            "Connecting to MQTT broker {}:{} (subscription {})",
            self.config.host, self.config.port, filter
        );

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("MQTT subscriber cancelled; disconnecting");
                    if let Err(e) = client.try_disconnect() {
                        debug!("Disconnect request failed: {}", e);
                    }
                    return Ok(());
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("MQTT connected ({:?}); subscribing to {}", ack.code, filter);
                    backoff.reset();
                    subscribe_pending = true;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let sink = sink.clone();
                    let topic = publish.topic.clone();
                    let payload = publish.payload;
                    if let Err(e) = tokio::task::spawn_blocking(move || sink.deliver(&topic, &payload)).await {
                        error!("Message handler for {} failed: {}", escape_log(&publish.topic), e);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => debug!("Subscription acknowledged"),
                Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT session closed cleanly");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    // A reconnect brings a fresh ConnAck and a fresh subscribe.
                    subscribe_pending = false;
                    let Some(delay) = backoff.next_delay() else {
                        error!("MQTT connection lost and retry budget exhausted: {}", e);
                        return Err(TransportError::RetriesExhausted {
                            attempts: backoff.attempts(),
                            last_error: e.to_string(),
                        });
                    };
                    warn!(
                        "MQTT connection error: {}; reconnecting in {:?} (attempt {})",
                        e,
                        delay,
                        backoff.attempts()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            if subscribe_pending {
                subscribe_pending = !request_subscription(&client, &filter);
            }
        }
    }
}

/// Queue a subscribe request. A full request queue is not fatal; the caller retries after the
/// next event.
fn request_subscription(client: &AsyncClient, filter: &str) -> bool {
    match client.try_subscribe(filter, QoS::AtMostOnce) {
        Ok(()) => true,
        Err(e) => {
            warn!("Subscribe request for {} not queued: {}; will retry", escape_log(filter), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0);
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().unwrap().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn backoff_respects_attempt_budget() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 3);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
        assert_eq!(b.attempts(), 3);
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0);
        for _ in 0..100 {
            assert!(b.next_delay().unwrap() <= Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn full_request_queue_defers_subscription() {
        let options = MqttOptions::new("meshtrace-test", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 1);
        assert!(request_subscription(&client, "msh/US/#"));
        // Nothing drains the queue, so the second request cannot be queued.
        assert!(!request_subscription(&client, "msh/US/#"));
    }

    #[test]
    fn backoff_from_config() {
        let cfg = MqttConfig::default();
        let mut b = Backoff::from_config(&cfg);
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
    }
}
