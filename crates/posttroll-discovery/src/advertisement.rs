//! The Advertisement record an Address Receiver keeps per live publisher
//! (spec.md §3 "Advertisement record").

use std::time::Instant;

use posttroll_types::{Message, MessageData};

use crate::{DiscoveryError, Result};

/// One publisher's advertised endpoint, refreshed on every re-announcement
/// and evicted once it goes stale.
#[derive(Debug, Clone)]
pub struct AdvertisementRecord {
    /// Transport URI, e.g. `tcp://host:port`.
    pub address: String,
    /// Primary service name.
    pub name: String,
    /// Additional service labels this publisher also answers to.
    pub aliases: Vec<String>,
    /// Monotonic timestamp of the last refresh.
    pub last_seen: Instant,
    /// The publisher's bound port, as advertised.
    pub publish_port: u16,
    /// Whether this record arrived via a direct `have_address` request
    /// rather than multicast (tracked so the Name Service knows whether a
    /// unicast `stop_address` is expected on teardown).
    pub nameservers_requested: bool,
}

impl AdvertisementRecord {
    /// Build a record from a decoded advertisement Message's `info`-typed
    /// mapping payload: `{"URI": ..., "service": ..., "aliases": [...]}`.
    pub fn from_message(message: &Message, nameservers_requested: bool) -> Result<Self> {
        let mapping = match &message.data {
            MessageData::Mapping(value) => value,
            other => {
                return Err(DiscoveryError::MalformedAdvertisement(format!(
                    "expected a mapping payload, found {other:?}"
                )))
            }
        };
        let address = mapping
            .get("URI")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DiscoveryError::MalformedAdvertisement("missing `URI` field".to_string())
            })?
            .to_string();
        let name = mapping
            .get("service")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DiscoveryError::MalformedAdvertisement("missing `service` field".to_string())
            })?
            .to_string();
        let aliases = mapping
            .get("aliases")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let publish_port = address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            address,
            name,
            aliases,
            last_seen: Instant::now(),
            publish_port,
            nameservers_requested,
        })
    }

    /// Whether `service` names this publisher (its primary name, one of
    /// its aliases, or `""` meaning "any").
    pub fn matches_service(&self, service: &str) -> bool {
        service.is_empty() || self.name == service || self.aliases.iter().any(|a| a == service)
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_stale(&self, max_age: std::time::Duration) -> bool {
        self.last_seen.elapsed() > max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use posttroll_types::{MessageVersion};

    fn advertisement(uri: &str, service: &str, aliases: &[&str]) -> Message {
        Message::new(
            "/",
            "info",
            Some(MessageData::Mapping(serde_json::json!({
                "URI": uri,
                "service": service,
                "aliases": aliases,
                "status": true,
                "type": "pytroll-nameserver",
            }))),
            Some(MessageVersion::V1_02),
        )
        .unwrap()
    }

    #[test]
    fn parses_address_name_aliases_and_port() {
        let message = advertisement("tcp://10.0.0.1:9000", "svc", &["alias1", "alias2"]);
        let record = AdvertisementRecord::from_message(&message, false).unwrap();
        assert_eq!(record.address, "tcp://10.0.0.1:9000");
        assert_eq!(record.name, "svc");
        assert_eq!(record.aliases, vec!["alias1", "alias2"]);
        assert_eq!(record.publish_port, 9000);
        assert!(!record.nameservers_requested);
    }

    #[test]
    fn matches_service_by_name_alias_or_wildcard() {
        let message = advertisement("tcp://10.0.0.1:9000", "svc", &["alias1"]);
        let record = AdvertisementRecord::from_message(&message, false).unwrap();
        assert!(record.matches_service("svc"));
        assert!(record.matches_service("alias1"));
        assert!(record.matches_service(""));
        assert!(!record.matches_service("other"));
    }

    #[test]
    fn rejects_non_mapping_payload() {
        let message = Message::new("/", "info", None, None).unwrap();
        assert!(AdvertisementRecord::from_message(&message, false).is_err());
    }

    #[test]
    fn rejects_missing_uri() {
        let message = Message::new(
            "/",
            "info",
            Some(MessageData::Mapping(serde_json::json!({"service": "svc"}))),
            None,
        )
        .unwrap();
        assert!(AdvertisementRecord::from_message(&message, false).is_err());
    }

    #[test]
    fn is_stale_after_max_age_elapses() {
        let message = advertisement("tcp://10.0.0.1:9000", "svc", &[]);
        let record = AdvertisementRecord::from_message(&message, false).unwrap();
        assert!(!record.is_stale(std::time::Duration::from_secs(10)));
        assert!(record.is_stale(std::time::Duration::from_secs(0)));
    }
}
