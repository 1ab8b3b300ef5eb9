//! Broker transport seam.
//!
//! The session manager never talks to rumqttc directly: it asks a
//! [`Transport`] for a [`Link`] (handshake done) and then drives the link
//! through [`LinkHandle`]. Inbound traffic and connection loss come back on
//! the link's event channel. `mqtt` is the real implementation, the devkit
//! provides an in-memory broker for tests.

pub mod mqtt;

use crate::error::{ConnectionError, PublishError, SubscribeError};
use futures::future::BoxFuture;
use rumqttc::QoS;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

pub use mqtt::{MqttSettings, MqttTransport};

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Largest packet the client may write, fixed header included
pub const DEFAULT_MAX_PACKET_SIZE: usize = 10 * 1024;

/// Largest remaining length MQTT 3.1.1 can encode
pub const MQTT_MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Bytes a PUBLISH occupies on the wire, as rumqttc measures it against
/// `max_packet_size`: fixed header, topic with its length prefix, packet id
/// (QoS > 0) and payload.
pub fn publish_packet_size(topic: &str, payload_len: usize, qos: QoS) -> usize {
    let packet_id = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let remaining = 2 + topic.len() + packet_id + payload_len;
    1 + remaining_length_bytes(remaining) + remaining
}

fn remaining_length_bytes(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Where the broker lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Accepts `tcp://host:port`, `mqtt://`, `ssl://`, `tls://`, `mqtts://`,
    /// `host:port` or a bare `host`.
    pub fn parse(input: &str) -> Result<Self, ConnectionError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ConnectionError::InvalidAddress("empty broker address".into()));
        }

        let (tls, rest) = match input.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => (false, rest),
                "ssl" | "tls" | "mqtts" => (true, rest),
                other => {
                    return Err(ConnectionError::InvalidAddress(format!(
                        "unsupported scheme '{other}'"
                    )))
                }
            },
            None => (false, input),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ConnectionError::InvalidAddress(format!("invalid port in '{input}'"))
                })?;
                (host, port)
            }
            None => (rest, if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT }),
        };

        if host.is_empty() {
            return Err(ConnectionError::InvalidAddress(format!("missing host in '{input}'")));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl FromStr for BrokerAddress {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Ce que le réseau renvoie à la session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The connection is gone and will not come back on its own
    Dropped { reason: String },
}

/// Connected link, handshake already acknowledged by the broker
pub struct Link {
    pub handle: Box<dyn LinkHandle>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

pub trait LinkHandle: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> BoxFuture<'_, Result<(), PublishError>>;

    fn subscribe(&self, filter: &str, qos: QoS) -> BoxFuture<'_, Result<(), SubscribeError>>;

    fn unsubscribe(&self, filter: &str) -> BoxFuture<'_, Result<(), SubscribeError>>;

    /// Graceful disconnect. Once the future resolves, the link emits nothing more.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

pub trait Transport: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        broker: &'a BrokerAddress,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Link, ConnectionError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_packet_size() {
        // 1 (header) + 1 (remaining length) + 2 + 1 (topic) + 2 (pkid) + 7 (payload)
        assert_eq!(publish_packet_size("t", 7, QoS::AtLeastOnce), 14);
        assert_eq!(publish_packet_size("t", 7, QoS::AtMostOnce), 12);
        // la longueur restante passe sur 2 octets au-delà de 127
        assert_eq!(publish_packet_size("t", 200, QoS::AtMostOnce), 1 + 2 + 203);
        let long_topic = "t".repeat(3000);
        assert!(publish_packet_size(&long_topic, 8, QoS::AtLeastOnce) > 2048);
    }

    #[test]
    fn test_parse_public_broker_url() {
        let addr = BrokerAddress::parse("tcp://broker.hivemq.com:1883").unwrap();
        assert_eq!(addr, BrokerAddress::new("broker.hivemq.com", 1883));
        assert_eq!(addr.to_string(), "tcp://broker.hivemq.com:1883");
    }

    #[test]
    fn test_parse_schemes_and_defaults() {
        assert_eq!(BrokerAddress::parse("localhost").unwrap().port, 1883);
        assert_eq!(BrokerAddress::parse("mqtt://10.0.0.2:1884").unwrap().port, 1884);

        let tls = BrokerAddress::parse("mqtts://broker.example").unwrap();
        assert!(tls.tls);
        assert_eq!(tls.port, 8883);
        assert_eq!(tls.to_string(), "ssl://broker.example:8883");

        let ssl: BrokerAddress = "ssl://b:9000/".parse().unwrap();
        assert!(ssl.tls);
        assert_eq!(ssl.port, 9000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "   ", "http://x:80", "host:notaport", "tcp://:1883", "host:70000"] {
            assert!(
                matches!(BrokerAddress::parse(bad), Err(ConnectionError::InvalidAddress(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
