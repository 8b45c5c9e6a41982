//! Broker-neutral message envelope.

use serde::{Deserialize, Serialize};

/// One message as seen by the messaging layer.
///
/// `key` is the routing key: the broker preserves publish order among
/// messages sharing a key. `delivery_id` is assigned by the backend on
/// delivery and is what gets acknowledged; it never round-trips through
/// the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub key: String,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    #[serde(rename = "deliveryId", default)]
    pub delivery_id: String,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            delivery_id: String::new(),
        }
    }

    pub fn with_delivery_id(mut self, id: impl Into<String>) -> Self {
        self.delivery_id = id.into();
        self
    }
}

/// Payload bytes as base64 so envelopes stay printable when logged or
/// shipped through JSON-only channels.
mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let env = Envelope::new("execution-tasks", "python", b"{\"id\":\"abc\"}".to_vec());
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, env.payload);
        assert_eq!(back.topic, "execution-tasks");
        assert_eq!(back.key, "python");
    }

    #[test]
    fn payload_round_trip_uneven_lengths() {
        for len in 0..16usize {
            let data: Vec<u8> = (0..len as u8).collect();
            let env = Envelope::new("t", "k", data.clone());
            let json = serde_json::to_string(&env).unwrap();
            let back: Envelope = serde_json::from_str(&json).unwrap();
            assert_eq!(back.payload, data, "len {len}");
        }
    }
}
