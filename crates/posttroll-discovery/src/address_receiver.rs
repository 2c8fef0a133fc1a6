//! The Address Receiver (spec.md §4.D): a long-running aggregator that
//! ingests advertisements from multicast and direct pushes, maintains a
//! table of live endpoints, evicts stale entries, and answers lookups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use posttroll_transport::BroadcastReceiver;
use posttroll_types::Message;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::advertisement::AdvertisementRecord;
use crate::Result;

/// One table behind one lock, O(live entries) per operation, the same
/// shape as `ochra-dht::kademlia::RoutingTable`, keyed by address string
/// rather than XOR-bucketed since PostTroll has no distance metric.
type Table = Arc<Mutex<HashMap<String, AdvertisementRecord>>>;

/// Aggregates publisher advertisements and answers point-in-time queries.
///
/// Owns the multicast-listen task and the eviction task (spec.md §5 "The
/// Name Service owns the Address Receiver's multicast-listen thread ...
/// and eviction thread"); the reply-socket task lives in
/// `posttroll-nameserver` since it also serves `have_address` pushes that
/// don't belong to this crate's pure aggregation concern.
pub struct AddressReceiver {
    table: Table,
    max_age: Duration,
    multicast_task: Option<JoinHandle<()>>,
    eviction_task: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

impl AddressReceiver {
    /// Build a receiver with no background tasks running yet; call
    /// [`AddressReceiver::start`] to begin listening and evicting.
    pub fn new(max_age: Duration) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            max_age,
            multicast_task: None,
            eviction_task: None,
            stop_tx,
        }
    }

    /// Start the eviction sweep and, if `receiver` is given, the
    /// multicast-ingestion loop. `receiver` is `None` in `--no-multicast`
    /// mode, where only direct `register` calls from the reply socket
    /// populate the table.
    pub fn start(&mut self, receiver: Option<BroadcastReceiver>) {
        let sweep_interval = (self.max_age / 20).max(Duration::from_millis(1)).min(Duration::from_secs(1));
        let table = self.table.clone();
        let max_age = self.max_age;
        let mut stop_rx = self.stop_tx.subscribe();
        self.eviction_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let mut guard = table.lock().unwrap_or_else(|e| e.into_inner());
                        let before = guard.len();
                        guard.retain(|_, record| !record.is_stale(max_age));
                        let evicted = before - guard.len();
                        drop(guard);
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted stale advertisements");
                        }
                    }
                }
            }
        }));

        if let Some(receiver) = receiver {
            let table = self.table.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            self.multicast_task = Some(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow() {
                                break;
                            }
                        }
                        received = receiver.recv() => {
                            match received {
                                Ok((bytes, from)) => {
                                    if let Err(e) = ingest(&table, &bytes, false) {
                                        tracing::warn!(%from, error = %e, bytes = ?String::from_utf8_lossy(&bytes), "dropping malformed advertisement");
                                    }
                                }
                                Err(e) => tracing::warn!(error = %e, "multicast receive failed"),
                            }
                        }
                    }
                }
            }));
        }
    }

    /// Register or refresh an advertisement arriving via the reply
    /// socket's `have_address`/direct-push path (spec.md §4.D ingestion
    /// path 2).
    pub fn register_direct(&self, message: &Message) -> Result<()> {
        register(&self.table, message, true)
    }

    /// Evict a record immediately, e.g. on a `stop_address`/`stop`
    /// advertisement. Idempotent (spec.md §8).
    pub fn evict(&self, address: &str) {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).remove(address);
    }

    /// All live addresses whose primary name or aliases match `service`.
    /// `service == ""` returns every live address.
    pub fn get(&self, service: &str) -> Vec<AdvertisementRecord> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.matches_service(service))
            .cloned()
            .collect()
    }

    /// Every currently live address, regardless of service name.
    pub fn get_active_addresses(&self) -> Vec<AdvertisementRecord> {
        self.get("")
    }

    /// Idempotent: stop the multicast and eviction tasks. Takes `&self`
    /// (the stop signal is a `watch::Sender`) so a `NameService` can share
    /// one receiver across its serve task via `Arc`.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for AddressReceiver {
    fn drop(&mut self) {
        if let Some(task) = self.multicast_task.take() {
            task.abort();
        }
        if let Some(task) = self.eviction_task.take() {
            task.abort();
        }
    }
}

fn ingest(table: &Table, bytes: &[u8], nameservers_requested: bool) -> Result<()> {
    let raw = std::str::from_utf8(bytes)
        .map_err(|e| crate::DiscoveryError::MalformedAdvertisement(e.to_string()))?;
    let message = Message::decode(raw)?;
    register(table, &message, nameservers_requested)
}

fn register(table: &Table, message: &Message, nameservers_requested: bool) -> Result<()> {
    if message.type_ == "stop" {
        let record = AdvertisementRecord::from_message(message, nameservers_requested)?;
        table.lock().unwrap_or_else(|e| e.into_inner()).remove(&record.address);
        tracing::info!(address = %record.address, "evicted via stop advertisement");
        return Ok(());
    }
    let record = AdvertisementRecord::from_message(message, nameservers_requested)?;
    let mut guard = table.lock().unwrap_or_else(|e| e.into_inner());
    match guard.get_mut(&record.address) {
        Some(existing) => {
            // Last-writer-wins on the record under that address (spec.md
            // §9 Open Question: two publishers advertising the same
            // address with different names).
            existing.name = record.name;
            existing.aliases = record.aliases;
            existing.touch();
        }
        None => {
            guard.insert(record.address.clone(), record);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use posttroll_types::{MessageData, MessageVersion};
    use std::time::Duration;

    fn advertisement(uri: &str, service: &str, msg_type: &str) -> Message {
        Message::new(
            "/",
            msg_type,
            Some(MessageData::Mapping(serde_json::json!({
                "URI": uri,
                "service": service,
                "aliases": [],
                "status": msg_type != "stop",
                "type": "pytroll-nameserver",
            }))),
            Some(MessageVersion::V1_02),
        )
        .unwrap()
    }

    #[test]
    fn register_then_get_finds_the_address() {
        let receiver = AddressReceiver::new(Duration::from_secs(10));
        let message = advertisement("tcp://127.0.0.1:9000", "svc", "info");
        receiver.register_direct(&message).unwrap();
        let found = receiver.get("svc");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "tcp://127.0.0.1:9000");
    }

    #[test]
    fn duplicate_advertisements_do_not_create_duplicates() {
        let receiver = AddressReceiver::new(Duration::from_secs(10));
        let message = advertisement("tcp://127.0.0.1:9000", "svc", "info");
        receiver.register_direct(&message).unwrap();
        receiver.register_direct(&message).unwrap();
        assert_eq!(receiver.get_active_addresses().len(), 1);
    }

    #[test]
    fn last_writer_wins_when_name_changes_for_same_address() {
        let receiver = AddressReceiver::new(Duration::from_secs(10));
        receiver
            .register_direct(&advertisement("tcp://127.0.0.1:9000", "alpha", "info"))
            .unwrap();
        receiver
            .register_direct(&advertisement("tcp://127.0.0.1:9000", "beta", "info"))
            .unwrap();
        let all = receiver.get_active_addresses();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "beta");
    }

    #[test]
    fn stop_message_evicts_immediately() {
        let receiver = AddressReceiver::new(Duration::from_secs(10));
        receiver
            .register_direct(&advertisement("tcp://127.0.0.1:9000", "svc", "info"))
            .unwrap();
        assert_eq!(receiver.get("svc").len(), 1);
        receiver
            .register_direct(&advertisement("tcp://127.0.0.1:9000", "svc", "stop"))
            .unwrap();
        assert_eq!(receiver.get("svc").len(), 0);
    }

    #[test]
    fn evict_is_idempotent() {
        let receiver = AddressReceiver::new(Duration::from_secs(10));
        receiver.evict("tcp://127.0.0.1:9000");
        receiver.evict("tcp://127.0.0.1:9000");
    }

    #[test]
    fn empty_service_returns_all_live_addresses() {
        let receiver = AddressReceiver::new(Duration::from_secs(10));
        receiver
            .register_direct(&advertisement("tcp://127.0.0.1:9000", "alpha", "info"))
            .unwrap();
        receiver
            .register_direct(&advertisement("tcp://127.0.0.1:9001", "beta", "info"))
            .unwrap();
        assert_eq!(receiver.get("").len(), 2);
    }

    #[tokio::test]
    async fn eviction_sweep_drops_stale_records() {
        let mut receiver = AddressReceiver::new(Duration::from_millis(0));
        receiver
            .register_direct(&advertisement("tcp://127.0.0.1:9000", "svc", "info"))
            .unwrap();
        receiver.start(None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(receiver.get("svc").len(), 0);
        receiver.stop();
    }
}
