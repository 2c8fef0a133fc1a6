//! The Broadcaster (spec.md §4.C): a background task that periodically
//! advertises a publisher's endpoint and service aliases, and revokes
//! them on shutdown.

use std::time::Duration;

use posttroll_transport::BroadcastSender;
use posttroll_types::{Message, MessageData, MessageVersion};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::Result;

/// Identity a Broadcaster advertises on every tick: the publisher's
/// transport address, primary name, and alias set (spec.md §4.C payload
/// grammar).
#[derive(Clone, Debug)]
pub struct AdvertisedIdentity {
    pub address: String,
    pub name: String,
    pub aliases: Vec<String>,
}

impl AdvertisedIdentity {
    fn payload(&self, status: bool) -> MessageData {
        MessageData::Mapping(serde_json::json!({
            "URI": self.address,
            "service": self.name,
            "aliases": self.aliases,
            "status": status,
            "type": "pytroll-nameserver",
        }))
    }
}

/// Runs a `tokio::spawn`-owned task that emits the advertisement payload
/// every `interval` until [`Broadcaster::stop`] is called, then emits one
/// final `type=stop` payload so receivers can evict immediately (spec.md
/// §4.C). Mirrors `ochra-daemon`'s `shutdown_tx: broadcast::Sender<()>`
/// pattern for task-level cancellation (spec.md §4.C design note).
pub struct Broadcaster {
    task: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

impl Broadcaster {
    /// Default emission interval (spec.md §4.C).
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

    /// Start advertising `identity` over `sender` every `interval`.
    pub fn start(sender: BroadcastSender, identity: AdvertisedIdentity, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = send_advert(&sender, &identity, true).await {
                            tracing::warn!(error = %e, "failed to send advertisement");
                        }
                    }
                }
            }
            // Final stop advertisement so receivers evict immediately
            // (spec.md §4.C "On stop it emits a final stop payload").
            if let Err(e) = send_advert(&sender, &identity, false).await {
                tracing::warn!(error = %e, "failed to send stop advertisement");
            }
        });
        Self {
            task: Some(task),
            stop_tx,
        }
    }

    /// Idempotent: stop the emission loop and let the spawned task send
    /// the final stop advertisement (spec.md §8 `stop()` idempotence).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the task to emit its final stop advertisement and exit.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn send_advert(sender: &BroadcastSender, identity: &AdvertisedIdentity, status: bool) -> Result<()> {
    let type_ = if status { "info" } else { "stop" };
    let message = Message::new(
        "/",
        type_,
        Some(identity.payload(status)),
        Some(MessageVersion::V1_02),
    )?;
    sender.send(message.encode().as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use posttroll_transport::BroadcastReceiver;

    #[tokio::test]
    async fn emits_advertisements_on_a_timer_and_a_stop_on_drop() {
        let receiver = BroadcastReceiver::new(None, 0, None).unwrap();
        let addr = receiver.local_addr().unwrap();
        let sender = BroadcastSender::new(vec![addr], None).unwrap();
        let identity = AdvertisedIdentity {
            address: "tcp://127.0.0.1:9000".to_string(),
            name: "svc".to_string(),
            aliases: vec![],
        };

        let mut broadcaster = Broadcaster::start(sender, identity, Duration::from_millis(20));
        let (body, _) = receiver.recv().await.unwrap();
        let message = Message::decode(std::str::from_utf8(&body).unwrap()).unwrap();
        assert_eq!(message.type_, "info");

        broadcaster.stop();
        broadcaster.join().await;

        let (body, _) = receiver.recv().await.unwrap();
        let message = Message::decode(std::str::from_utf8(&body).unwrap()).unwrap();
        assert_eq!(message.type_, "stop");
    }
}
